// Control tower core: turns raw log tailing into topic-oriented,
// fan-out, seek-anywhere subscriptions.
use rocketspeed_common::{Delivery, LogId, SeqNo, StreamId, SubscriberId, TopicUUID};
use rocketspeed_router::{LogRouter, RouterError};
use rocketspeed_storage::{LogStorage, StorageError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

mod bloom;
mod data_cache;
mod log_reader;
mod options;
mod room;
mod stats;
mod subscription_map;
mod tailer;
mod topic_map;

pub use data_cache::{CacheRead, DataCache};
pub use log_reader::{LogReader, ProcessedRecord, ReaderError};
pub use options::TowerOptions;
pub use stats::{CacheStats, TailerStats, TowerStatistics};
pub use subscription_map::SubscriptionMap;
pub use topic_map::{TopicManager, TopicSubscription};

use room::{Room, RoomCommand};

pub type Result<T> = std::result::Result<T, TowerError>;

#[derive(thiserror::Error, Debug)]
pub enum TowerError {
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("unknown subscription {0}")]
    UnknownSubscription(SubscriberId),
    #[error("invalid options: {0}")]
    InvalidOptions(String),
    #[error("room is unavailable")]
    RoomUnavailable,
}

struct RoomHandle {
    commands: mpsc::Sender<RoomCommand>,
    join: JoinHandle<()>,
}

/// The control tower's topic-tailing service.
///
/// Owns one room (worker task) per configured slot; every log is served
/// by exactly one room, chosen by log id, so all state for a log is
/// mutated on a single task. Deliveries come back on the per-room
/// receivers returned by [`ControlTower::new`].
///
/// ```
/// use rocketspeed_common::{SubscriberId, TopicUUID};
/// use rocketspeed_router::LogRouter;
/// use rocketspeed_storage::MemoryLogStorage;
/// use rocketspeed_tower::{ControlTower, TowerOptions};
/// use std::sync::Arc;
///
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let storage = Arc::new(MemoryLogStorage::new());
///     let router = Arc::new(LogRouter::new(1, 16));
///     let (tower, _deliveries) =
///         ControlTower::new(TowerOptions::default(), storage, router).expect("tower");
///     let topic = TopicUUID::new("guest", "orders");
///     tower
///         .subscribe(SubscriberId::new(1, 1), topic, 1)
///         .await
///         .expect("subscribe");
/// });
/// ```
pub struct ControlTower {
    router: Arc<LogRouter>,
    rooms: Vec<RoomHandle>,
    // Where each live subscription was placed, so unsubscribes route
    // without re-resolving the topic.
    placements: Mutex<HashMap<SubscriberId, usize>>,
}

impl ControlTower {
    /// Spawns the rooms and returns the tower plus one delivery receiver
    /// per room. Must be called within a tokio runtime.
    pub fn new(
        options: TowerOptions,
        storage: Arc<dyn LogStorage>,
        router: Arc<LogRouter>,
    ) -> Result<(Self, Vec<mpsc::Receiver<Delivery>>)> {
        options
            .validate()
            .map_err(|err| TowerError::InvalidOptions(err.to_string()))?;
        let options = Arc::new(options);
        let mut rooms = Vec::with_capacity(options.num_rooms);
        let mut receivers = Vec::with_capacity(options.num_rooms);
        for room_index in 0..options.num_rooms {
            let (client_tx, client_rx) = mpsc::channel(options.room_to_client_queue_size);
            let (room, commands) = Room::new(
                room_index,
                options.clone(),
                storage.clone(),
                router.clone(),
                client_tx,
            )?;
            let join = tokio::spawn(room.run());
            rooms.push(RoomHandle { commands, join });
            receivers.push(client_rx);
        }
        Ok((
            Self {
                router,
                rooms,
                placements: Mutex::new(HashMap::new()),
            },
            receivers,
        ))
    }

    fn room_for_log(&self, log_id: LogId) -> usize {
        (log_id % self.rooms.len() as u64) as usize
    }

    async fn send(&self, room: usize, command: RoomCommand) -> Result<()> {
        self.rooms[room]
            .commands
            .send(command)
            .await
            .map_err(|_| TowerError::RoomUnavailable)
    }

    /// Subscribes `sub_id` to a topic from `start` (0 means the tail).
    /// Fails synchronously when no log serves the topic.
    pub async fn subscribe(
        &self,
        sub_id: SubscriberId,
        topic: TopicUUID,
        start: SeqNo,
    ) -> Result<()> {
        let log_id = self.router.route(&topic)?;
        let room = self.room_for_log(log_id);
        self.placements
            .lock()
            .expect("placements lock")
            .insert(sub_id, room);
        self.send(
            room,
            RoomCommand::Subscribe {
                sub_id,
                topic,
                start,
            },
        )
        .await
    }

    pub async fn unsubscribe(&self, sub_id: SubscriberId) -> Result<()> {
        let room = self
            .placements
            .lock()
            .expect("placements lock")
            .remove(&sub_id)
            .ok_or(TowerError::UnknownSubscription(sub_id))?;
        self.send(room, RoomCommand::Unsubscribe { sub_id }).await
    }

    /// Tears down every subscription belonging to a stream.
    pub async fn unsubscribe_stream(&self, stream_id: StreamId) -> Result<()> {
        self.placements
            .lock()
            .expect("placements lock")
            .retain(|id, _| id.stream_id != stream_id);
        for room in 0..self.rooms.len() {
            self.send(room, RoomCommand::UnsubscribeStream { stream_id })
                .await?;
        }
        Ok(())
    }

    /// Forces a round of time-based processing on every room. Rooms also
    /// tick themselves on `timer_interval`.
    pub async fn tick(&self) -> Result<()> {
        for room in 0..self.rooms.len() {
            self.send(room, RoomCommand::Tick).await?;
        }
        Ok(())
    }

    /// Counters aggregated across all rooms.
    pub async fn statistics(&self) -> Result<TowerStatistics> {
        let mut merged = TowerStatistics::default();
        for room in 0..self.rooms.len() {
            let (reply, rx) = oneshot::channel();
            self.send(room, RoomCommand::Statistics { reply }).await?;
            let stats = rx.await.map_err(|_| TowerError::RoomUnavailable)?;
            merged.merge(&stats);
        }
        Ok(merged)
    }

    /// Human-readable state of one log on its owning room.
    pub async fn log_info(&self, log_id: LogId) -> Result<String> {
        let room = self.room_for_log(log_id);
        let (reply, rx) = oneshot::channel();
        self.send(room, RoomCommand::LogInfo { log_id, reply }).await?;
        rx.await.map_err(|_| TowerError::RoomUnavailable)
    }

    /// Total cache bytes in use across rooms.
    pub async fn cache_usage(&self) -> Result<usize> {
        let mut total = 0;
        for room in 0..self.rooms.len() {
            let (reply, rx) = oneshot::channel();
            self.send(room, RoomCommand::CacheUsage { reply }).await?;
            total += rx.await.map_err(|_| TowerError::RoomUnavailable)?;
        }
        Ok(total)
    }

    /// Applies a new per-room cache budget; 0 disables caching.
    pub async fn set_cache_capacity(&self, bytes: usize) -> Result<()> {
        for room in 0..self.rooms.len() {
            self.send(room, RoomCommand::SetCacheCapacity { bytes })
                .await?;
        }
        Ok(())
    }

    pub async fn clear_cache(&self) -> Result<()> {
        for room in 0..self.rooms.len() {
            self.send(room, RoomCommand::ClearCache).await?;
        }
        Ok(())
    }

    /// Stops all rooms and waits for them to finish.
    pub async fn shutdown(self) {
        let ControlTower { rooms, .. } = self;
        let mut joins = Vec::with_capacity(rooms.len());
        for handle in rooms {
            drop(handle.commands);
            joins.push(handle.join);
        }
        for join in joins {
            let _ = join.await;
        }
    }
}
