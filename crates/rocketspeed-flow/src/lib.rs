// Backpressure primitives shared by the worker event loops.
//
// A source produces items for a worker; a sink accepts items and may
// refuse when saturated. Writes from a source to a sink go through a
// `Flow`, and a refused write pauses the responsible source until the
// sink drains. Nothing is dropped: a refused value is buffered by the
// sink and flushed once capacity returns.
use std::collections::HashSet;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Poll;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

pub mod observable_map;
pub mod rate_limiter;
pub mod retry_later;

pub use observable_map::ObservableMap;
pub use rate_limiter::RateLimiterSink;
pub use retry_later::{RetryDecision, RetryLaterSink};

pub type ReadyFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Handle for a registered source; indexes into the flow controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(usize);

/// Process-unique identity of a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkId(u64);

static NEXT_SINK_ID: AtomicU64 = AtomicU64::new(0);

pub fn allocate_sink_id() -> SinkId {
    SinkId(NEXT_SINK_ID.fetch_add(1, Ordering::Relaxed))
}

/// Type-erased view of a sink used for backpressure bookkeeping.
pub trait ManagedSink: Send {
    fn sink_id(&self) -> SinkId;
    fn sink_name(&self) -> &str;
    /// Drains buffered writes; true when nothing remains pending.
    fn flush_pending(&self) -> bool;
    /// Resolves when the sink may have room again.
    fn ready(&self) -> ReadyFuture;
    fn boxed_clone(&self) -> Box<dyn ManagedSink>;
}

/// A sink accepting values of one type.
pub trait Sink<T>: ManagedSink {
    /// Writes or buffers the value. Returns false when the sink is
    /// saturated and the source should back off; the value itself is
    /// retained and flushed later.
    fn write(&self, value: T) -> bool;
}

/// Sink over a bounded queue. Refused writes land in a pending list that
/// is flushed when the queue regains capacity.
pub struct QueueSink<T> {
    shared: Arc<QueueShared<T>>,
}

struct QueueShared<T> {
    id: SinkId,
    name: String,
    tx: mpsc::Sender<T>,
    pending: Mutex<VecDeque<T>>,
}

impl<T: Send + 'static> QueueSink<T> {
    pub fn new(name: impl Into<String>, tx: mpsc::Sender<T>) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                id: allocate_sink_id(),
                name: name.into(),
                tx,
                pending: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.shared.pending.lock().expect("pending lock").len()
    }
}

impl<T> Clone for QueueSink<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + 'static> Sink<T> for QueueSink<T> {
    fn write(&self, value: T) -> bool {
        let mut pending = self.shared.pending.lock().expect("pending lock");
        if !pending.is_empty() {
            // Preserve order behind the values already waiting.
            pending.push_back(value);
            return false;
        }
        match self.shared.tx.try_send(value) {
            Ok(()) => true,
            Err(TrySendError::Full(value)) => {
                pending.push_back(value);
                false
            }
            Err(TrySendError::Closed(_)) => {
                // Receiver is gone; accept and drop so the worker never
                // wedges on a departed consumer.
                debug!(sink = %self.shared.name, "write to closed sink dropped");
                true
            }
        }
    }
}

impl<T: Send + 'static> ManagedSink for QueueSink<T> {
    fn sink_id(&self) -> SinkId {
        self.shared.id
    }

    fn sink_name(&self) -> &str {
        &self.shared.name
    }

    fn flush_pending(&self) -> bool {
        let mut pending = self.shared.pending.lock().expect("pending lock");
        while let Some(value) = pending.pop_front() {
            match self.shared.tx.try_send(value) {
                Ok(()) => continue,
                Err(TrySendError::Full(value)) => {
                    pending.push_front(value);
                    return false;
                }
                Err(TrySendError::Closed(_)) => {
                    pending.clear();
                    return true;
                }
            }
        }
        true
    }

    fn ready(&self) -> ReadyFuture {
        let tx = self.shared.tx.clone();
        Box::pin(async move {
            // A reserved permit is dropped immediately; we only wanted
            // the capacity signal.
            let _ = tx.reserve().await;
        })
    }

    fn boxed_clone(&self) -> Box<dyn ManagedSink> {
        Box::new(self.clone())
    }
}

#[derive(Debug, Clone, Default)]
pub struct FlowStats {
    pub backpressure_applied: u64,
    pub backpressure_lifted: u64,
}

struct SourceState {
    name: String,
    enabled: bool,
    blockers: usize,
    blocked_since: Option<Instant>,
}

struct BlockedSink {
    sink: Box<dyn ManagedSink>,
    sources: HashSet<SourceId>,
}

/// Event-loop-scoped backpressure registry.
///
/// Tracks which sinks are saturated and which sources they block. The
/// owning loop asks `ready_wait` for the next sink with room, then calls
/// `on_sink_ready` to flush it and resume its paused sources.
pub struct FlowControl {
    sources: Vec<SourceState>,
    blocked: Vec<BlockedSink>,
    warn_after: Duration,
    stats: FlowStats,
}

impl FlowControl {
    pub fn new(warn_after: Duration) -> Self {
        Self {
            sources: Vec::new(),
            blocked: Vec::new(),
            warn_after,
            stats: FlowStats::default(),
        }
    }

    pub fn register_source(&mut self, name: impl Into<String>) -> SourceId {
        self.sources.push(SourceState {
            name: name.into(),
            enabled: true,
            blockers: 0,
            blocked_since: None,
        });
        SourceId(self.sources.len() - 1)
    }

    pub fn is_read_enabled(&self, source: SourceId) -> bool {
        self.sources[source.0].enabled
    }

    pub fn has_blocked_sinks(&self) -> bool {
        !self.blocked.is_empty()
    }

    pub fn stats(&self) -> FlowStats {
        self.stats.clone()
    }

    /// Records a refused write: remembers the sink and pauses the source.
    pub fn block(&mut self, sink: &dyn ManagedSink, source: Option<SourceId>) {
        let sink_id = sink.sink_id();
        let idx = match self
            .blocked
            .iter()
            .position(|entry| entry.sink.sink_id() == sink_id)
        {
            Some(idx) => idx,
            None => {
                self.blocked.push(BlockedSink {
                    sink: sink.boxed_clone(),
                    sources: HashSet::new(),
                });
                self.blocked.len() - 1
            }
        };
        let Some(source) = source else {
            return;
        };
        // The same sink may be hit twice by one fan-out; count the edge
        // only once.
        if self.blocked[idx].sources.insert(source) {
            let state = &mut self.sources[source.0];
            if state.blockers == 0 {
                state.blocked_since = Some(Instant::now());
            }
            state.blockers += 1;
            state.enabled = false;
            self.stats.backpressure_applied += 1;
            metrics::counter!("flow_backpressure_applied").increment(1);
            debug!(
                source = %state.name,
                sink = %sink.sink_name(),
                "backpressure applied"
            );
        }
    }

    /// Resolves with the id of a blocked sink that may have room again.
    /// Pends forever while nothing is blocked.
    pub fn ready_wait(&self) -> impl Future<Output = SinkId> + Send + 'static {
        let mut waiters: Vec<(SinkId, ReadyFuture)> = self
            .blocked
            .iter()
            .map(|entry| (entry.sink.sink_id(), entry.sink.ready()))
            .collect();
        async move {
            if waiters.is_empty() {
                return std::future::pending().await;
            }
            std::future::poll_fn(move |cx| {
                for (id, fut) in waiters.iter_mut() {
                    if fut.as_mut().poll(cx).is_ready() {
                        return Poll::Ready(*id);
                    }
                }
                Poll::Pending
            })
            .await
        }
    }

    /// Flushes a sink that signalled readiness; when its pending writes
    /// drain, every source it blocked is resumed.
    pub fn on_sink_ready(&mut self, sink_id: SinkId) {
        let Some(idx) = self
            .blocked
            .iter()
            .position(|entry| entry.sink.sink_id() == sink_id)
        else {
            return;
        };
        if !self.blocked[idx].sink.flush_pending() {
            // Still saturated; keep waiting.
            return;
        }
        let entry = self.blocked.swap_remove(idx);
        for source in entry.sources {
            let state = &mut self.sources[source.0];
            state.blockers = state.blockers.saturating_sub(1);
            if state.blockers == 0 {
                state.enabled = true;
                state.blocked_since = None;
                self.stats.backpressure_lifted += 1;
                metrics::counter!("flow_backpressure_lifted").increment(1);
                debug!(source = %state.name, "backpressure lifted");
            }
        }
    }

    /// Reports sources that have been paused for too long.
    pub fn warn_blocked(&self) {
        let now = Instant::now();
        for state in &self.sources {
            if let Some(since) = state.blocked_since {
                let blocked_for = now.duration_since(since);
                if blocked_for >= self.warn_after {
                    warn!(
                        source = %state.name,
                        blocked_ms = blocked_for.as_millis() as u64,
                        "source has been blocked by backpressure"
                    );
                }
            }
        }
    }
}

/// Write interface handed to event handlers. Failed writes are remembered
/// so a handler can stop early and let the loop resume it later.
pub struct Flow<'a> {
    flow_control: &'a mut FlowControl,
    source: Option<SourceId>,
    write_failed: bool,
}

impl<'a> Flow<'a> {
    pub fn new(flow_control: &'a mut FlowControl, source: SourceId) -> Self {
        Self {
            flow_control,
            source: Some(source),
            write_failed: false,
        }
    }

    /// A flow with no source to pause; used where backpressure is bounded
    /// by other means (for example one message per subscription).
    pub fn sourceless(flow_control: &'a mut FlowControl) -> Self {
        Self {
            flow_control,
            source: None,
            write_failed: false,
        }
    }

    pub fn write<T, S: Sink<T>>(&mut self, sink: &S, value: T) -> bool {
        if !sink.write(value) {
            self.flow_control.block(sink, self.source);
            self.write_failed = true;
        }
        !self.write_failed
    }

    pub fn write_has_failed(&self) -> bool {
        self.write_failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn writes_pass_through_until_full() {
        let mut fc = FlowControl::new(Duration::from_secs(1));
        let src = fc.register_source("test");
        let (tx, mut rx) = mpsc::channel(2);
        let sink = QueueSink::new("out", tx);

        let mut flow = Flow::new(&mut fc, src);
        assert!(flow.write(&sink, 1));
        assert!(flow.write(&sink, 2));
        assert!(!flow.write_has_failed());
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
    }

    #[tokio::test]
    async fn backpressure_pauses_and_resumes_source() {
        let mut fc = FlowControl::new(Duration::from_secs(1));
        let src = fc.register_source("test");
        let (tx, mut rx) = mpsc::channel(1);
        let sink = QueueSink::new("out", tx);

        {
            let mut flow = Flow::new(&mut fc, src);
            assert!(flow.write(&sink, 1));
            assert!(!flow.write(&sink, 2));
            assert!(flow.write_has_failed());
        }
        assert!(!fc.is_read_enabled(src));
        assert!(fc.has_blocked_sinks());
        assert_eq!(sink.pending_len(), 1);

        // Drain one slot; the sink signals ready and flushes its pending
        // value, which resumes the source.
        assert_eq!(rx.recv().await, Some(1));
        let sink_id = fc.ready_wait().await;
        fc.on_sink_ready(sink_id);
        assert!(fc.is_read_enabled(src));
        assert!(!fc.has_blocked_sinks());
        assert_eq!(rx.recv().await, Some(2));

        let stats = fc.stats();
        assert_eq!(stats.backpressure_applied, 1);
        assert_eq!(stats.backpressure_lifted, 1);
    }

    #[tokio::test]
    async fn flush_keeps_sink_blocked_while_still_full() {
        let mut fc = FlowControl::new(Duration::from_secs(1));
        let src = fc.register_source("test");
        let (tx, mut rx) = mpsc::channel(1);
        let sink = QueueSink::new("out", tx);

        let mut flow = Flow::new(&mut fc, src);
        flow.write(&sink, 1);
        flow.write(&sink, 2);
        flow.write(&sink, 3);
        drop(flow);
        assert_eq!(sink.pending_len(), 2);

        assert_eq!(rx.recv().await, Some(1));
        let sink_id = fc.ready_wait().await;
        fc.on_sink_ready(sink_id);
        // Only one pending value fits; the source stays paused.
        assert!(!fc.is_read_enabled(src));
        assert_eq!(rx.recv().await, Some(2));
        let sink_id = fc.ready_wait().await;
        fc.on_sink_ready(sink_id);
        assert!(fc.is_read_enabled(src));
        assert_eq!(rx.recv().await, Some(3));
    }

    #[tokio::test]
    async fn closed_receiver_never_wedges_the_writer() {
        let mut fc = FlowControl::new(Duration::from_secs(1));
        let src = fc.register_source("test");
        let (tx, rx) = mpsc::channel(1);
        let sink = QueueSink::new("out", tx);
        drop(rx);
        let mut flow = Flow::new(&mut fc, src);
        assert!(flow.write(&sink, 1));
        assert!(!flow.write_has_failed());
    }

    #[tokio::test]
    async fn sourceless_flow_records_failure_without_pausing() {
        let mut fc = FlowControl::new(Duration::from_secs(1));
        let (tx, _rx) = mpsc::channel(1);
        let sink = QueueSink::new("out", tx);
        let mut flow = Flow::sourceless(&mut fc);
        assert!(flow.write(&sink, 1));
        assert!(!flow.write(&sink, 2));
        drop(flow);
        // The sink is tracked for flushing, but no source was paused.
        assert!(fc.has_blocked_sinks());
        assert_eq!(fc.stats().backpressure_applied, 0);
    }
}
