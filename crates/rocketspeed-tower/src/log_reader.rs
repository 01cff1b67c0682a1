// State of one reader over the underlying logs.
use rocketspeed_common::{LinkedMap, LogId, SeqNo, TopicUUID};
use rocketspeed_storage::{LogStorage, ReaderId, StorageError};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

pub type Result<T> = std::result::Result<T, ReaderError>;

#[derive(thiserror::Error, Debug)]
pub enum ReaderError {
    #[error("log {0} is not open")]
    LogNotOpen(LogId),
    #[error("out-of-order event on log {log_id}: expected {expected}, got {got}")]
    OutOfOrder {
        log_id: LogId,
        expected: SeqNo,
        got: SeqNo,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result of processing one live record.
#[derive(Debug, Clone, Copy)]
pub struct ProcessedRecord {
    /// Previous seqno tracked for the record's topic, 0 when untracked
    /// or the history was flushed.
    pub prev_seqno: SeqNo,
    /// True when the record reached the known tail estimate.
    pub is_tail: bool,
}

// Cost constants for placing a new subscription.
// Rewinding is never worth it unless nothing else can take the
// subscription; opening a fresh log has a fixed storage round-trip cost,
// so a reader slightly behind the requested seqno wins over an idle one.
const SUBSCRIPTION_COST_REWIND: u64 = u64::MAX;
const SUBSCRIPTION_COST_START: u64 = 1_000;

#[derive(Debug, Clone, Copy)]
pub(crate) struct TopicState {
    // Next expected seqno for the topic; 0 after a history flush.
    pub next_seqno: SeqNo,
}

#[derive(Debug)]
pub(crate) struct LogState {
    pub start_seqno: SeqNo,
    pub last_read: SeqNo,
    pub is_reading: bool,
    // Oldest-position topic at the front; the record just delivered moves
    // its topic to the back.
    pub topics: LinkedMap<TopicUUID, TopicState>,
}

impl LogState {
    // Minimum known topic position, used when adopting subscriptions.
    pub(crate) fn compute_start_seqno(&self) -> SeqNo {
        self.topics
            .iter()
            .map(|(_, state)| state.next_seqno)
            .filter(|&seqno| seqno != 0)
            .min()
            .unwrap_or(self.last_read + 1)
    }
}

/// Encapsulates per-log reading state for one storage reader.
///
/// A reader with no storage handle is *virtual*: it tracks subscription
/// state for logs that no real reader serves yet, and hands that state
/// over once a real reader frees up.
#[derive(Debug)]
pub struct LogReader {
    reader_id: ReaderId,
    storage: Option<Arc<dyn LogStorage>>,
    max_subscription_lag: u64,
    logs: HashMap<LogId, LogState>,
    // Tail estimates survive reseeks; dropped when the log closes here.
    tails: HashMap<LogId, SeqNo>,
}

impl LogReader {
    pub fn new(
        reader_id: ReaderId,
        storage: Option<Arc<dyn LogStorage>>,
        max_subscription_lag: u64,
    ) -> Self {
        Self {
            reader_id,
            storage,
            max_subscription_lag,
            logs: HashMap::new(),
            tails: HashMap::new(),
        }
    }

    pub fn reader_id(&self) -> ReaderId {
        self.reader_id
    }

    pub fn is_virtual(&self) -> bool {
        self.storage.is_none()
    }

    pub fn is_log_open(&self, log_id: LogId) -> bool {
        self.logs.contains_key(&log_id)
    }

    pub fn is_actively_reading(&self, log_id: LogId) -> bool {
        self.logs
            .get(&log_id)
            .is_some_and(|state| state.is_reading)
    }

    /// Next expected seqno for a log, or 0 when the log is not open.
    pub fn next_seqno(&self, log_id: LogId) -> SeqNo {
        self.logs
            .get(&log_id)
            .map(|state| state.last_read + 1)
            .unwrap_or(0)
    }

    pub fn last_read(&self, log_id: LogId) -> Option<SeqNo> {
        self.logs.get(&log_id).map(|state| state.last_read)
    }

    pub fn num_open_logs(&self) -> usize {
        self.logs.len()
    }

    /// Registers a subscription's topic and position, opening or
    /// reseeking the underlying log when the position requires it.
    pub fn start_reading(&mut self, topic: &TopicUUID, log_id: LogId, seqno: SeqNo) -> Result<()> {
        let first_open = !self.logs.contains_key(&log_id);
        let state = self.logs.entry(log_id).or_insert_with(|| LogState {
            start_seqno: seqno,
            last_read: seqno.saturating_sub(1),
            is_reading: false,
            topics: LinkedMap::new(),
        });

        let mut reseek;
        match state.topics.get_mut(topic) {
            None => {
                // New topics start at the front: they carry the oldest
                // known position.
                state
                    .topics
                    .insert_front(topic.clone(), TopicState { next_seqno: seqno });
                reseek = true;
            }
            Some(topic_state) => {
                if topic_state.next_seqno == 0 {
                    topic_state.next_seqno = seqno;
                    reseek = true;
                } else {
                    reseek = seqno < topic_state.next_seqno;
                    topic_state.next_seqno = topic_state.next_seqno.min(seqno);
                }
                state.topics.move_to_front(topic);
            }
        }

        if !first_open && reseek {
            // No rewind needed while the position is still ahead of us.
            reseek = seqno <= state.last_read;
        }

        if reseek {
            if first_open {
                info!(
                    reader_id = self.reader_id,
                    virtual_reader = self.storage.is_none(),
                    log_id,
                    seqno,
                    topic = %topic,
                    "reader now reading log"
                );
            } else {
                info!(
                    reader_id = self.reader_id,
                    log_id,
                    from = state.last_read + 1,
                    to = seqno,
                    topic = %topic,
                    "reader rewinding log"
                );
            }
            state.start_seqno = state.start_seqno.min(seqno);
            Self::start_log_reader(&self.storage, self.reader_id, log_id, state, seqno)?;
        }
        Ok(())
    }

    /// Drops a topic entirely; closes the log once no topics remain.
    pub fn stop_reading(&mut self, topic: &TopicUUID, log_id: LogId) -> Result<()> {
        let Some(state) = self.logs.get_mut(&log_id) else {
            return Ok(());
        };
        if state.topics.remove(topic).is_none() {
            return Ok(());
        }
        info!(
            reader_id = self.reader_id,
            log_id,
            topic = %topic,
            "no more subscribers on topic"
        );
        if state.topics.is_empty() {
            Self::stop_log_reader(&self.storage, self.reader_id, log_id, state)?;
            self.logs.remove(&log_id);
            self.tails.remove(&log_id);
        }
        Ok(())
    }

    /// Stops log delivery without discarding state. Idempotent.
    pub fn pause_reading(&mut self, log_id: LogId) -> Result<()> {
        if let Some(state) = self.logs.get_mut(&log_id) {
            Self::stop_log_reader(&self.storage, self.reader_id, log_id, state)?;
        }
        Ok(())
    }

    /// Re-issues the read from the current position, even when already
    /// reading. Gives the storage layer a chance to rebalance.
    pub fn restart_reading(&mut self, log_id: LogId) -> Result<()> {
        let state = self
            .logs
            .get_mut(&log_id)
            .ok_or(ReaderError::LogNotOpen(log_id))?;
        state.is_reading = true;
        if let Some(storage) = &self.storage {
            storage.start_reading(log_id, state.last_read + 1, self.reader_id, false)?;
        }
        Ok(())
    }

    /// Updates state on a live record. Strictly ordered: anything other
    /// than `last_read + 1` is rejected.
    pub fn process_record(
        &mut self,
        log_id: LogId,
        seqno: SeqNo,
        topic: &TopicUUID,
    ) -> Result<ProcessedRecord> {
        let state = self
            .logs
            .get_mut(&log_id)
            .ok_or(ReaderError::LogNotOpen(log_id))?;
        let expected = state.last_read + 1;
        if seqno != expected {
            return Err(ReaderError::OutOfOrder {
                log_id,
                expected,
                got: seqno,
            });
        }
        state.last_read = seqno;
        let prev_seqno = Self::advance_topic(state, topic, seqno);
        let is_tail = self.advance_tail(log_id, seqno);
        Ok(ProcessedRecord { prev_seqno, is_tail })
    }

    /// Updates state on a record replayed from the cache; the position
    /// may fast-forward but never rewind.
    pub fn process_cache_record(
        &mut self,
        log_id: LogId,
        seqno: SeqNo,
        topic: &TopicUUID,
    ) -> Result<SeqNo> {
        let state = self
            .logs
            .get_mut(&log_id)
            .ok_or(ReaderError::LogNotOpen(log_id))?;
        if seqno <= state.last_read {
            return Err(ReaderError::OutOfOrder {
                log_id,
                expected: state.last_read + 1,
                got: seqno,
            });
        }
        state.last_read = seqno;
        Ok(Self::advance_topic(state, topic, seqno))
    }

    fn advance_topic(state: &mut LogState, topic: &TopicUUID, seqno: SeqNo) -> SeqNo {
        match state.topics.get_mut(topic) {
            Some(topic_state) => {
                let prev_seqno = topic_state.next_seqno;
                topic_state.next_seqno = seqno + 1;
                state.topics.move_to_back(topic);
                prev_seqno
            }
            None => 0,
        }
    }

    fn advance_tail(&mut self, log_id: LogId, seqno: SeqNo) -> bool {
        match self.tails.get_mut(&log_id) {
            // An unset estimate stays unset; only suggest_tail_seqno
            // seeds it.
            Some(tail) if *tail != 0 && *tail <= seqno => {
                *tail = seqno + 1;
                true
            }
            _ => false,
        }
    }

    /// A gap is only valid when it continues the log exactly.
    pub fn validate_gap(&self, log_id: LogId, from: SeqNo) -> bool {
        self.logs
            .get(&log_id)
            .is_some_and(|state| state.last_read + 1 == from)
    }

    /// Advances a topic across a gap; returns the previous tracked seqno
    /// (0 when untracked).
    pub fn process_gap(&mut self, log_id: LogId, topic: &TopicUUID, to: SeqNo) -> SeqNo {
        let prev_seqno = match self.logs.get_mut(&log_id) {
            Some(state) => match state.topics.get_mut(topic) {
                Some(topic_state) => {
                    let prev_seqno = topic_state.next_seqno;
                    topic_state.next_seqno = to + 1;
                    state.topics.move_to_back(topic);
                    prev_seqno
                }
                None => 0,
            },
            None => 0,
        };
        if let Some(tail) = self.tails.get_mut(&log_id) {
            if *tail != 0 && *tail <= to {
                *tail = to + 1;
            }
        }
        prev_seqno
    }

    /// Advances past a benign gap without touching topics.
    pub fn process_benign_gap(&mut self, log_id: LogId, _from: SeqNo, to: SeqNo) {
        if let Some(state) = self.logs.get_mut(&log_id) {
            state.last_read = to;
        }
    }

    /// Drops per-topic history after a malignant gap; the next record on
    /// each topic reads as a first record.
    pub fn flush_history(&mut self, log_id: LogId, seqno: SeqNo) {
        let Some(state) = self.logs.get_mut(&log_id) else {
            return;
        };
        state.last_read = seqno.saturating_sub(1);
        state.start_seqno = seqno;
        let topics: Vec<TopicUUID> = state.topics.iter().map(|(topic, _)| topic.clone()).collect();
        for topic in topics {
            if let Some(topic_state) = state.topics.get_mut(&topic) {
                topic_state.next_seqno = 0;
            }
        }
    }

    /// Raises the tail estimate toward `max(last_read + 1, seqno)`.
    pub fn suggest_tail_seqno(&mut self, log_id: LogId, seqno: SeqNo) {
        let floor = self
            .logs
            .get(&log_id)
            .map(|state| state.last_read + 1)
            .unwrap_or(0);
        let candidate = seqno.max(floor);
        let tail = self.tails.entry(log_id).or_insert(0);
        *tail = (*tail).max(candidate);
    }

    /// Tail estimate for a log; 0 when unknown.
    pub fn tail_seqno_estimate(&self, log_id: LogId) -> SeqNo {
        self.tails.get(&log_id).copied().unwrap_or(0)
    }

    pub fn forget_tail(&mut self, log_id: LogId) {
        self.tails.remove(&log_id);
    }

    /// While the oldest topic lags more than `max_subscription_lag`
    /// behind `now`, reports it through `on_bump` and advances it to
    /// `now + 1`. Topics with flushed history are rotated silently.
    pub fn bump_lagging(
        &mut self,
        log_id: LogId,
        now: SeqNo,
        mut on_bump: impl FnMut(&TopicUUID, SeqNo),
    ) {
        let Some(state) = self.logs.get_mut(&log_id) else {
            return;
        };
        for _ in 0..state.topics.len() {
            let Some((topic, topic_state)) = state.topics.front() else {
                break;
            };
            let topic_seqno = topic_state.next_seqno;
            if topic_seqno == 0 {
                // No known position to bump from; keep it rotating so it
                // cannot wedge the queue.
                let topic = topic.clone();
                state.topics.move_to_back(&topic);
                continue;
            }
            if topic_seqno + self.max_subscription_lag >= now {
                break;
            }
            let topic = topic.clone();
            debug!(
                reader_id = self.reader_id,
                log_id,
                topic = %topic,
                from = topic_seqno,
                to = now,
                "bumping lagging topic"
            );
            on_bump(&topic, topic_seqno);
            if let Some(topic_state) = state.topics.get_mut(&topic) {
                topic_state.next_seqno = now + 1;
            }
            state.topics.move_to_back(&topic);
        }
    }

    /// Cost of accepting a new subscription on this reader; lower wins.
    pub fn subscription_cost(&self, topic: &TopicUUID, log_id: LogId, seqno: SeqNo) -> u64 {
        match self.logs.get(&log_id) {
            Some(state) => {
                if state.last_read < seqno {
                    // Cost is the distance until the reader gets there.
                    return seqno - state.last_read;
                }
                match state.topics.get(topic) {
                    None => SUBSCRIPTION_COST_REWIND,
                    Some(topic_state) => {
                        if topic_state.next_seqno == 0 || seqno < topic_state.next_seqno {
                            SUBSCRIPTION_COST_REWIND
                        } else {
                            0
                        }
                    }
                }
            }
            None => SUBSCRIPTION_COST_START,
        }
    }

    /// Removes and returns all state for a log, stopping the underlying
    /// reader if it was active. Used by merges.
    pub(crate) fn remove_log_state(&mut self, log_id: LogId) -> Result<Option<LogState>> {
        let Some(mut state) = self.logs.remove(&log_id) else {
            return Ok(None);
        };
        self.tails.remove(&log_id);
        Self::stop_log_reader(&self.storage, self.reader_id, log_id, &mut state)?;
        Ok(Some(state))
    }

    /// Folds another reader's topic table for a log into this one,
    /// keeping the older position per topic.
    pub(crate) fn absorb_subscriptions(
        &mut self,
        log_id: LogId,
        mut topics: LinkedMap<TopicUUID, TopicState>,
    ) {
        let Some(state) = self.logs.get_mut(&log_id) else {
            return;
        };
        while let Some((topic, incoming)) = topics.pop_front() {
            match state.topics.get_mut(&topic) {
                Some(existing) => {
                    existing.next_seqno = if existing.next_seqno == 0 || incoming.next_seqno == 0 {
                        0
                    } else {
                        existing.next_seqno.min(incoming.next_seqno)
                    };
                }
                None => {
                    state.topics.insert_back(topic, incoming);
                }
            }
        }
    }

    /// Takes over a virtual reader's subscriptions for a log and starts
    /// reading at their oldest position.
    pub(crate) fn adopt_subscriptions(&mut self, log_id: LogId, state: LogState) -> Result<()> {
        let start_seqno = state.compute_start_seqno();
        if let Some(storage) = &self.storage {
            storage.start_reading(log_id, start_seqno, self.reader_id, true)?;
        }
        info!(
            reader_id = self.reader_id,
            log_id, start_seqno, "reader adopting pending subscriptions"
        );
        self.logs.insert(
            log_id,
            LogState {
                start_seqno,
                last_read: start_seqno.saturating_sub(1),
                is_reading: true,
                topics: state.topics,
            },
        );
        Ok(())
    }

    pub fn log_info(&self, log_id: LogId) -> String {
        match self.logs.get(&log_id) {
            Some(state) => format!(
                "Log({}).reader[{}].last_read: {}\nLog({}).reader[{}].num_topics_subscribed: {}\n",
                log_id,
                self.reader_id,
                state.last_read,
                log_id,
                self.reader_id,
                state.topics.len()
            ),
            None => format!(
                "Log({}).reader[{}] not currently reading\n",
                log_id, self.reader_id
            ),
        }
    }

    fn start_log_reader(
        storage: &Option<Arc<dyn LogStorage>>,
        reader_id: ReaderId,
        log_id: LogId,
        state: &mut LogState,
        seqno: SeqNo,
    ) -> Result<()> {
        if state.last_read != seqno.saturating_sub(1) || !state.is_reading {
            let first_open = !state.is_reading;
            state.last_read = seqno.saturating_sub(1);
            state.is_reading = true;
            if let Some(storage) = storage {
                storage.start_reading(log_id, seqno, reader_id, first_open)?;
            }
        }
        Ok(())
    }

    fn stop_log_reader(
        storage: &Option<Arc<dyn LogStorage>>,
        reader_id: ReaderId,
        log_id: LogId,
        state: &mut LogState,
    ) -> Result<()> {
        if state.is_reading {
            state.is_reading = false;
            if let Some(storage) = storage {
                storage.stop_reading(log_id, reader_id)?;
            }
        }
        Ok(())
    }
}
