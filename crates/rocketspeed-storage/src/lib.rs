// Interface to the log storage service consumed by the control tower.
use bytes::Bytes;
use rocketspeed_common::{GapType, LogId, SeqNo, TopicUUID};
use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;

pub mod memory;
pub use memory::MemoryLogStorage;

pub type Result<T> = std::result::Result<T, StorageError>;
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Identifies one open reader on the storage client. Events are delivered
/// tagged with the reader that requested them.
pub type ReaderId = usize;

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("reader {0} is not registered")]
    UnknownReader(ReaderId),
    #[error("log {0} not found")]
    LogNotFound(LogId),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Events delivered by the storage client on a reader's event queue.
#[derive(Debug, Clone)]
pub enum LogEvent {
    Record {
        log_id: LogId,
        seqno: SeqNo,
        topic: TopicUUID,
        payload: Bytes,
        reader_id: ReaderId,
    },
    Gap {
        log_id: LogId,
        gap_type: GapType,
        from: SeqNo,
        to: SeqNo,
        reader_id: ReaderId,
    },
}

impl LogEvent {
    pub fn reader_id(&self) -> ReaderId {
        match self {
            LogEvent::Record { reader_id, .. } => *reader_id,
            LogEvent::Gap { reader_id, .. } => *reader_id,
        }
    }

    pub fn log_id(&self) -> LogId {
        match self {
            LogEvent::Record { log_id, .. } => *log_id,
            LogEvent::Gap { log_id, .. } => *log_id,
        }
    }
}

/// A client of the log storage service.
///
/// The client is thread safe. Events for a reader are delivered in log
/// order on the queue registered with `open_reader`, which lets a worker
/// own all state for the logs its readers cover.
pub trait LogStorage: Debug + Send + Sync {
    /// Registers the event queue that the storage calls back on for a
    /// reader. Must be called before `start_reading` with the same id.
    fn open_reader(&self, reader_id: ReaderId, events: mpsc::Sender<LogEvent>) -> Result<()>;

    /// Opens the log at `from` for the reader, or reseeks an open log.
    fn start_reading(
        &self,
        log_id: LogId,
        from: SeqNo,
        reader_id: ReaderId,
        first_open: bool,
    ) -> Result<()>;

    /// Stops delivery for the log on this reader. One event already in
    /// flight may still arrive after this returns.
    fn stop_reading(&self, log_id: LogId, reader_id: ReaderId) -> Result<()>;

    /// Asynchronously finds the next sequence number to be written.
    fn find_latest_seqno(&self, log_id: LogId) -> BoxFuture<'static, Result<SeqNo>>;

    /// Whether readers may be positioned past the current end of a log.
    fn can_subscribe_past_end(&self) -> bool;
}
