// One worker: a single task owning the tailer state for its logs.
//
// All mutations of a log's reader, topic table and subscriptions happen
// here. Cross-task traffic arrives through bounded queues that double as
// flow-control sources; when a downstream sink saturates, the loop stops
// polling the sources that fed it until the sink drains.
use crate::tailer::{CacheReaderKey, FindLatestSeqnoResponse, PendingSubscription, TopicTailer};
use crate::options::TowerOptions;
use crate::stats::TowerStatistics;
use crate::TowerError;
use rocketspeed_common::{Delivery, LogId, SeqNo, StreamId, SubscriberId, TopicUUID};
use rocketspeed_flow::{Flow, FlowControl, ObservableMap, QueueSink, SourceId};
use rocketspeed_router::LogRouter;
use rocketspeed_storage::{LogEvent, LogStorage};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::warn;

const COMMAND_QUEUE_SIZE: usize = 1_024;

#[derive(Debug)]
pub(crate) enum RoomCommand {
    Subscribe {
        sub_id: SubscriberId,
        topic: TopicUUID,
        start: SeqNo,
    },
    Unsubscribe {
        sub_id: SubscriberId,
    },
    UnsubscribeStream {
        stream_id: StreamId,
    },
    Tick,
    Statistics {
        reply: oneshot::Sender<TowerStatistics>,
    },
    LogInfo {
        log_id: LogId,
        reply: oneshot::Sender<String>,
    },
    CacheUsage {
        reply: oneshot::Sender<usize>,
    },
    SetCacheCapacity {
        bytes: usize,
    },
    ClearCache,
}

pub(crate) struct Room {
    tailer: TopicTailer,
    flow_control: FlowControl,
    commands: mpsc::Receiver<RoomCommand>,
    storage_events: mpsc::Receiver<LogEvent>,
    find_responses: mpsc::Receiver<FindLatestSeqnoResponse>,
    cache_readers: ObservableMap<SubscriberId, PendingSubscription>,
    reentry_readers: ObservableMap<CacheReaderKey, ()>,
    src_commands: SourceId,
    src_storage: SourceId,
    src_find: SourceId,
    src_cache: SourceId,
    src_reentry: SourceId,
    timer_interval: std::time::Duration,
}

impl Room {
    pub(crate) fn new(
        room_index: usize,
        options: Arc<TowerOptions>,
        storage: Arc<dyn LogStorage>,
        router: Arc<LogRouter>,
        client_tx: mpsc::Sender<Delivery>,
    ) -> Result<(Self, mpsc::Sender<RoomCommand>), TowerError> {
        let (command_tx, commands) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let (event_tx, storage_events) = mpsc::channel(options.storage_to_room_queue_size);
        let (find_tx, find_responses) = mpsc::channel(options.max_find_time_requests);

        // Storage calls back on this room's event queue for its readers.
        let base_reader_id = room_index * options.readers_per_room;
        for k in 0..options.readers_per_room {
            storage.open_reader(base_reader_id + k, event_tx.clone())?;
        }

        let mut flow_control = FlowControl::new(options.flow_blocked_warn_duration);
        let src_commands = flow_control.register_source(format!("room-{room_index}.commands"));
        let src_storage = flow_control.register_source(format!("room-{room_index}.storage"));
        let src_find = flow_control.register_source(format!("room-{room_index}.find-latest"));
        let src_cache = flow_control.register_source(format!("room-{room_index}.cache-readers"));
        let src_reentry = flow_control.register_source(format!("room-{room_index}.cache-reentry"));

        let cache_readers = ObservableMap::new(format!("room-{room_index}.cache-readers"));
        let reentry_readers = ObservableMap::new(format!("room-{room_index}.cache-reentry"));
        let client_sink = QueueSink::new(format!("room-{room_index}.client"), client_tx);

        let timer_interval = options.timer_interval;
        let tailer = TopicTailer::new(
            room_index,
            options,
            storage,
            router,
            client_sink,
            find_tx,
            cache_readers.clone(),
            reentry_readers.clone(),
        );
        Ok((
            Self {
                tailer,
                flow_control,
                commands,
                storage_events,
                find_responses,
                cache_readers,
                reentry_readers,
                src_commands,
                src_storage,
                src_find,
                src_cache,
                src_reentry,
                timer_interval,
            },
            command_tx,
        ))
    }

    pub(crate) async fn run(mut self) {
        let mut tick = tokio::time::interval(self.timer_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let sink_ready = self.flow_control.ready_wait();
            tokio::select! {
                biased;

                sink_id = sink_ready => {
                    self.flow_control.on_sink_ready(sink_id);
                }

                command = self.commands.recv(),
                    if self.flow_control.is_read_enabled(self.src_commands) =>
                {
                    match command {
                        Some(command) => self.handle_command(command),
                        // Tower dropped; shut the room down.
                        None => break,
                    }
                }

                Some(response) = self.find_responses.recv(),
                    if self.flow_control.is_read_enabled(self.src_find) =>
                {
                    let mut flow = Flow::new(&mut self.flow_control, self.src_find);
                    self.tailer.on_find_latest_response(&mut flow, response);
                }

                Some(event) = self.storage_events.recv(),
                    if self.flow_control.is_read_enabled(self.src_storage) =>
                {
                    let mut flow = Flow::new(&mut self.flow_control, self.src_storage);
                    self.tailer.on_log_event(&mut flow, event);
                }

                _ = self.cache_readers.readable(),
                    if self.flow_control.is_read_enabled(self.src_cache) =>
                {
                    let mut flow = Flow::new(&mut self.flow_control, self.src_cache);
                    while let Some((id, pending)) = self.cache_readers.pop() {
                        self.tailer.on_pending_subscription(&mut flow, id, pending);
                        if flow.write_has_failed() {
                            break;
                        }
                    }
                }

                _ = self.reentry_readers.readable(),
                    if self.flow_control.is_read_enabled(self.src_reentry) =>
                {
                    let mut flow = Flow::new(&mut self.flow_control, self.src_reentry);
                    while let Some((key, ())) = self.reentry_readers.pop() {
                        self.tailer.on_cache_reentry(&mut flow, key);
                        if flow.write_has_failed() {
                            break;
                        }
                    }
                }

                _ = tick.tick() => {
                    self.tailer.tick();
                    self.flow_control.warn_blocked();
                }
            }
        }
    }

    fn handle_command(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::Subscribe {
                sub_id,
                topic,
                start,
            } => {
                let mut flow = Flow::new(&mut self.flow_control, self.src_commands);
                if let Err(err) = self.tailer.subscribe(&mut flow, topic, start, sub_id) {
                    warn!(subscriber = %sub_id, %err, "subscribe failed");
                }
            }
            RoomCommand::Unsubscribe { sub_id } => {
                // Unknown ids are already reported by the tailer.
                let _ = self.tailer.remove_subscriber(sub_id);
            }
            RoomCommand::UnsubscribeStream { stream_id } => {
                self.tailer.remove_stream(stream_id);
            }
            RoomCommand::Tick => {
                self.tailer.tick();
            }
            RoomCommand::Statistics { reply } => {
                let _ = reply.send(self.tailer.statistics(self.flow_control.stats()));
            }
            RoomCommand::LogInfo { log_id, reply } => {
                let _ = reply.send(self.tailer.log_info(log_id));
            }
            RoomCommand::CacheUsage { reply } => {
                let _ = reply.send(self.tailer.cache_usage());
            }
            RoomCommand::SetCacheCapacity { bytes } => {
                self.tailer.set_cache_capacity(bytes);
            }
            RoomCommand::ClearCache => {
                self.tailer.clear_cache();
            }
        }
    }
}
