// In-memory log storage used by tests, demos and the harness.
use crate::{BoxFuture, LogEvent, LogStorage, ReaderId, Result, StorageError};
use bytes::Bytes;
use rocketspeed_common::{GapType, LogId, SeqNo, TopicUUID};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing::debug;

#[derive(Debug)]
enum LogEntry {
    Record { topic: TopicUUID, payload: Bytes },
    // A gap occupies the range [start, to]; keyed by its start.
    Gap { gap_type: GapType, to: SeqNo },
}

#[derive(Debug, Default)]
struct LogData {
    // Entries keyed by their first sequence number, contiguous from 1.
    entries: BTreeMap<SeqNo, LogEntry>,
    // Next sequence number to be written; 1 on an empty log.
    next_seqno: SeqNo,
}

impl LogData {
    fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_seqno: 1,
        }
    }
}

#[derive(Debug)]
struct ReaderState {
    events: mpsc::Sender<LogEvent>,
    // Per-log pump generation; bumping it retires the running pump.
    generations: HashMap<LogId, Arc<AtomicU64>>,
}

#[derive(Debug)]
struct Inner {
    logs: Mutex<HashMap<LogId, LogData>>,
    readers: Mutex<HashMap<ReaderId, ReaderState>>,
    // Bumped on every append or gap so pumps wake without polling.
    version: watch::Sender<u64>,
    fail_find_latest: AtomicBool,
}

/// In-memory implementation of [`LogStorage`].
///
/// Each `start_reading` spawns a pump task that walks the log from the
/// requested position and delivers events into the reader's queue. Pumps
/// block on the queue when the consumer is slow, which gives the same
/// end-to-end backpressure a real storage client applies.
///
/// ```
/// use rocketspeed_storage::MemoryLogStorage;
///
/// let storage = MemoryLogStorage::new();
/// assert!(storage.can_subscribe_past_end());
/// ```
#[derive(Debug, Clone)]
pub struct MemoryLogStorage {
    inner: Arc<Inner>,
    subscribe_past_end: bool,
}

impl MemoryLogStorage {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                logs: Mutex::new(HashMap::new()),
                readers: Mutex::new(HashMap::new()),
                version,
                fail_find_latest: AtomicBool::new(false),
            }),
            subscribe_past_end: true,
        }
    }

    /// Models a backend that refuses reader positions past the tail.
    pub fn with_subscribe_past_end(mut self, allowed: bool) -> Self {
        self.subscribe_past_end = allowed;
        self
    }

    /// Appends one record and returns its sequence number.
    pub fn append(&self, log_id: LogId, topic: &TopicUUID, payload: Bytes) -> SeqNo {
        let seqno = {
            let mut logs = self.inner.logs.lock().expect("logs lock");
            let log = logs.entry(log_id).or_insert_with(LogData::new);
            let seqno = log.next_seqno;
            log.entries.insert(
                seqno,
                LogEntry::Record {
                    topic: topic.clone(),
                    payload,
                },
            );
            log.next_seqno = seqno + 1;
            seqno
        };
        self.inner.version.send_modify(|v| *v += 1);
        seqno
    }

    /// Appends a gap covering `len` sequence numbers; returns its range.
    pub fn inject_gap(&self, log_id: LogId, gap_type: GapType, len: u64) -> (SeqNo, SeqNo) {
        assert!(len > 0, "gap must cover at least one seqno");
        let range = {
            let mut logs = self.inner.logs.lock().expect("logs lock");
            let log = logs.entry(log_id).or_insert_with(LogData::new);
            let from = log.next_seqno;
            let to = from + len - 1;
            log.entries.insert(from, LogEntry::Gap { gap_type, to });
            log.next_seqno = to + 1;
            (from, to)
        };
        self.inner.version.send_modify(|v| *v += 1);
        range
    }

    /// Next sequence number to be written on a log (1 when empty).
    pub fn tail_seqno(&self, log_id: LogId) -> SeqNo {
        let logs = self.inner.logs.lock().expect("logs lock");
        logs.get(&log_id).map(|log| log.next_seqno).unwrap_or(1)
    }

    /// Makes subsequent `find_latest_seqno` calls fail.
    pub fn set_find_latest_error(&self, fail: bool) {
        self.inner.fail_find_latest.store(fail, Ordering::Relaxed);
    }

    fn bump_generation(&self, log_id: LogId, reader_id: ReaderId) -> Result<Arc<AtomicU64>> {
        let mut readers = self.inner.readers.lock().expect("readers lock");
        let reader = readers
            .get_mut(&reader_id)
            .ok_or(StorageError::UnknownReader(reader_id))?;
        let generation = reader
            .generations
            .entry(log_id)
            .or_insert_with(|| Arc::new(AtomicU64::new(0)));
        generation.fetch_add(1, Ordering::SeqCst);
        Ok(generation.clone())
    }

    fn reader_queue(&self, reader_id: ReaderId) -> Result<mpsc::Sender<LogEvent>> {
        let readers = self.inner.readers.lock().expect("readers lock");
        readers
            .get(&reader_id)
            .map(|reader| reader.events.clone())
            .ok_or(StorageError::UnknownReader(reader_id))
    }
}

impl Default for MemoryLogStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl LogStorage for MemoryLogStorage {
    fn open_reader(&self, reader_id: ReaderId, events: mpsc::Sender<LogEvent>) -> Result<()> {
        let mut readers = self.inner.readers.lock().expect("readers lock");
        readers.insert(
            reader_id,
            ReaderState {
                events,
                generations: HashMap::new(),
            },
        );
        Ok(())
    }

    fn start_reading(
        &self,
        log_id: LogId,
        from: SeqNo,
        reader_id: ReaderId,
        _first_open: bool,
    ) -> Result<()> {
        let events = self.reader_queue(reader_id)?;
        let generation = self.bump_generation(log_id, reader_id)?;
        let my_generation = generation.load(Ordering::SeqCst);
        debug!(log_id, from, reader_id, "storage reader starting");
        let inner = self.inner.clone();
        // Sentinel 0 never names a record; clamp to the first real seqno.
        let cursor = from.max(1);
        tokio::spawn(pump(
            inner,
            log_id,
            cursor,
            events,
            reader_id,
            generation,
            my_generation,
        ));
        Ok(())
    }

    fn stop_reading(&self, log_id: LogId, reader_id: ReaderId) -> Result<()> {
        debug!(log_id, reader_id, "storage reader stopping");
        self.bump_generation(log_id, reader_id)?;
        // Wake a pump parked on the version channel so it can retire.
        self.inner.version.send_modify(|v| *v += 1);
        Ok(())
    }

    fn find_latest_seqno(&self, log_id: LogId) -> BoxFuture<'static, Result<SeqNo>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            if inner.fail_find_latest.load(Ordering::Relaxed) {
                return Err(StorageError::Unavailable("find latest failed".into()));
            }
            let logs = inner.logs.lock().expect("logs lock");
            Ok(logs.get(&log_id).map(|log| log.next_seqno).unwrap_or(1))
        })
    }

    fn can_subscribe_past_end(&self) -> bool {
        self.subscribe_past_end
    }
}

/// Walks a log from `cursor`, delivering records and gaps until retired.
async fn pump(
    inner: Arc<Inner>,
    log_id: LogId,
    mut cursor: SeqNo,
    events: mpsc::Sender<LogEvent>,
    reader_id: ReaderId,
    generation: Arc<AtomicU64>,
    my_generation: u64,
) {
    let mut version = inner.version.subscribe();
    loop {
        if generation.load(Ordering::SeqCst) != my_generation {
            return;
        }
        // Mark the version seen before scanning so an append that races
        // with the scan still wakes us.
        version.borrow_and_update();
        let next = {
            let logs = inner.logs.lock().expect("logs lock");
            logs.get(&log_id)
                .and_then(|log| next_event(log, log_id, cursor, reader_id))
        };
        match next {
            Some((event, advanced)) => {
                // Blocks when the reader's queue is full; that is the
                // storage-to-room backpressure edge.
                if events.send(event).await.is_err() {
                    return;
                }
                cursor = advanced;
            }
            None => {
                if version.changed().await.is_err() {
                    return;
                }
            }
        }
    }
}

fn next_event(
    log: &LogData,
    log_id: LogId,
    cursor: SeqNo,
    reader_id: ReaderId,
) -> Option<(LogEvent, SeqNo)> {
    if cursor >= log.next_seqno {
        return None;
    }
    let (start, entry) = log.entries.range(..=cursor).next_back()?;
    match entry {
        LogEntry::Record { topic, payload } if *start == cursor => Some((
            LogEvent::Record {
                log_id,
                seqno: cursor,
                topic: topic.clone(),
                payload: payload.clone(),
                reader_id,
            },
            cursor + 1,
        )),
        LogEntry::Record { .. } => None,
        LogEntry::Gap { gap_type, to } if cursor <= *to => Some((
            LogEvent::Gap {
                log_id,
                gap_type: *gap_type,
                from: cursor,
                to: *to,
                reader_id,
            },
            *to + 1,
        )),
        LogEntry::Gap { .. } => None,
    }
}
