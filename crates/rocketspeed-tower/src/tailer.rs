// Topic tailing for one room: multiplexes topic subscriptions onto a
// small pool of log readers, serves backlog from the cache, and fans
// records and gaps out to subscriber sets.
use crate::data_cache::{CacheRead, DataCache};
use crate::log_reader::LogReader;
use crate::options::TowerOptions;
use crate::stats::{TailerStats, TowerStatistics};
use crate::subscription_map::SubscriptionMap;
use crate::topic_map::TopicManager;
use crate::TowerError;
use bytes::Bytes;
use rand::Rng;
use rocketspeed_common::{
    Delivery, GapType, LogId, Message, SeqNo, StatusCode, StreamId, SubscriberId, TopicUUID,
};
use rocketspeed_flow::{Flow, FlowStats, ObservableMap, QueueSink};
use rocketspeed_router::LogRouter;
use rocketspeed_storage::{LogEvent, LogStorage, ReaderId};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Response to an asynchronous find-latest-seqno request.
#[derive(Debug)]
pub(crate) struct FindLatestSeqnoResponse {
    pub log_id: LogId,
    pub result: rocketspeed_storage::Result<SeqNo>,
}

/// A subscription waiting to be placed on a reader, possibly mid-way
/// through a cache replay.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingSubscription {
    pub log_id: LogId,
    pub seqno: SeqNo,
}

/// Key for the cache-reentry queue: a reader paused on a log because the
/// cache holds its next records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct CacheReaderKey {
    pub log_id: LogId,
    pub reader: usize,
}

enum CacheDelivery {
    /// Cache exhausted; subscribe from `next_seqno`. `delivered` is the
    /// last record seqno sent, which seeds the subscriber's chain.
    Complete {
        next_seqno: SeqNo,
        delivered: Option<SeqNo>,
    },
    /// Backpressure hit mid-replay; retry later from `next_seqno`.
    Backoff { next_seqno: SeqNo },
}

pub(crate) struct TopicTailer {
    room_index: usize,
    options: Arc<TowerOptions>,
    storage: Arc<dyn LogStorage>,
    router: Arc<LogRouter>,
    // Real readers, indexed 0..readers_per_room.
    readers: Vec<LogReader>,
    // Virtual reader holding subscriptions no real reader serves yet.
    pending_reader: LogReader,
    base_reader_id: ReaderId,
    topic_map: HashMap<LogId, TopicManager>,
    data_cache: DataCache,
    stream_subscriptions: SubscriptionMap<TopicUUID>,
    client_sink: QueueSink<Delivery>,
    find_resp_tx: tokio::sync::mpsc::Sender<FindLatestSeqnoResponse>,
    // Subscribers awaiting a find-latest response, per log.
    pending_find_responses: HashMap<LogId, Vec<SubscriberId>>,
    // Logs whose find-latest request is deferred by the in-flight cap.
    queued_find_requests: rocketspeed_common::LinkedMap<LogId, ()>,
    cache_readers: ObservableMap<SubscriberId, PendingSubscription>,
    reentry_cache_readers: ObservableMap<CacheReaderKey, ()>,
    // Scheduled reader restarts, ordered by fire time.
    restart_events: BTreeMap<(Instant, u64), (usize, LogId)>,
    restart_scheduled: HashSet<(usize, LogId)>,
    restart_counter: u64,
    stats: TailerStats,
}

impl TopicTailer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        room_index: usize,
        options: Arc<TowerOptions>,
        storage: Arc<dyn LogStorage>,
        router: Arc<LogRouter>,
        client_sink: QueueSink<Delivery>,
        find_resp_tx: tokio::sync::mpsc::Sender<FindLatestSeqnoResponse>,
        cache_readers: ObservableMap<SubscriberId, PendingSubscription>,
        reentry_cache_readers: ObservableMap<CacheReaderKey, ()>,
    ) -> Self {
        let base_reader_id = room_index * options.readers_per_room;
        let readers = (0..options.readers_per_room)
            .map(|k| {
                LogReader::new(
                    base_reader_id + k,
                    Some(storage.clone()),
                    options.max_subscription_lag,
                )
            })
            .collect();
        let pending_reader = LogReader::new(
            base_reader_id + options.readers_per_room,
            None,
            options.max_subscription_lag,
        );
        let data_cache = DataCache::new(
            options.cache_size,
            options.cache_data_from_system_namespaces,
            options.bloom_bits_per_msg,
            options.cache_block_size,
        );
        Self {
            room_index,
            options,
            storage,
            router,
            readers,
            pending_reader,
            base_reader_id,
            topic_map: HashMap::new(),
            data_cache,
            stream_subscriptions: SubscriptionMap::new(),
            client_sink,
            find_resp_tx,
            pending_find_responses: HashMap::new(),
            queued_find_requests: rocketspeed_common::LinkedMap::new(),
            cache_readers,
            reentry_cache_readers,
            restart_events: BTreeMap::new(),
            restart_scheduled: HashSet::new(),
            restart_counter: 0,
            stats: TailerStats::default(),
        }
    }

    // ---- subscription management -------------------------------------

    pub(crate) fn subscribe(
        &mut self,
        flow: &mut Flow<'_>,
        topic: TopicUUID,
        start: SeqNo,
        id: SubscriberId,
    ) -> Result<(), TowerError> {
        self.stats.add_subscriber_requests += 1;
        let log_id = self.router.route(&topic)?;

        if start != 0 {
            self.add_subscriber_internal(topic, id, log_id, start);
            return Ok(());
        }

        // Tail subscription: a concrete position has to come from the
        // storage, unless a recent estimate is already at hand.
        self.stats.add_subscriber_requests_at_tail += 1;
        let tail = self.tail_seqno_estimate(log_id);
        if tail != 0 {
            self.stats.add_subscriber_requests_at_tail_fast += 1;
            self.add_tail_subscriber(flow, topic, id, log_id, tail);
            return Ok(());
        }
        self.stats.add_subscriber_requests_at_tail_slow += 1;

        // Record the subscription first so an unsubscribe arriving before
        // the response can cancel it.
        self.stream_subscriptions
            .insert(id.stream_id, id.sub_id, topic);
        let in_flight = self.in_flight_find_requests();
        let waiting = self.pending_find_responses.entry(log_id).or_default();
        waiting.push(id);
        if waiting.len() > 1 {
            // A request for this log is already in flight; share its
            // response.
            debug!(log_id, subscriber = %id, "piggy-backing find-latest request");
        } else if in_flight < self.options.max_find_time_requests {
            self.send_find_latest_request(log_id);
        } else if !self.queued_find_requests.contains_key(&log_id) {
            self.queued_find_requests.insert_back(log_id, ());
        }
        Ok(())
    }

    pub(crate) fn remove_subscriber(&mut self, id: SubscriberId) -> Result<(), TowerError> {
        self.stats.remove_subscriber_requests += 1;
        let Some(topic) = self.stream_subscriptions.move_out(id.stream_id, id.sub_id) else {
            warn!(subscriber = %id, "cannot remove unknown subscription");
            return Err(TowerError::UnknownSubscription(id));
        };
        let log_id = self.router.route(&topic)?;
        debug!(subscriber = %id, topic = %topic, "unsubscribed");
        self.remove_subscriber_internal(&topic, id, log_id);
        Ok(())
    }

    pub(crate) fn remove_stream(&mut self, stream_id: StreamId) {
        let Some(subs) = self.stream_subscriptions.remove_stream(stream_id) else {
            return;
        };
        debug!(stream_id, "stream unsubscribed from all topics");
        for (sub_id, topic) in subs {
            let id = SubscriberId::new(stream_id, sub_id);
            match self.router.route(&topic) {
                Ok(log_id) => self.remove_subscriber_internal(&topic, id, log_id),
                Err(err) => warn!(topic = %topic, %err, "route lost during stream teardown"),
            }
        }
    }

    fn add_subscriber_internal(
        &mut self,
        topic: TopicUUID,
        id: SubscriberId,
        log_id: LogId,
        seqno: SeqNo,
    ) {
        debug_assert!(seqno != 0);
        self.cache_readers
            .write(id, PendingSubscription { log_id, seqno });
        self.stream_subscriptions
            .insert(id.stream_id, id.sub_id, topic);
    }

    fn remove_subscriber_internal(&mut self, topic: &TopicUUID, id: SubscriberId, log_id: LogId) {
        if let Some(topic_manager) = self.topic_map.get_mut(&log_id) {
            let removed = topic_manager.remove_subscriber(topic, id);
            if removed && !topic_manager.has_subscribers(topic) {
                // Last subscriber on this topic; let every reader drop it.
                for reader in &mut self.readers {
                    if let Err(err) = reader.stop_reading(topic, log_id) {
                        warn!(log_id, %err, "failed to stop reading");
                    }
                }
                let _ = self.pending_reader.stop_reading(topic, log_id);

                let closed_everywhere = self
                    .readers
                    .iter()
                    .all(|reader| !reader.is_log_open(log_id))
                    && !self.pending_reader.is_log_open(log_id);
                if closed_everywhere {
                    // Tail estimates are no longer refreshed for this log.
                    for reader in &mut self.readers {
                        reader.forget_tail(log_id);
                    }
                    self.pending_reader.forget_tail(log_id);
                }
            }
            if topic_manager.is_empty() {
                self.topic_map.remove(&log_id);
            }
        }
        self.cache_readers.remove(&id);
    }

    fn add_tail_subscriber(
        &mut self,
        flow: &mut Flow<'_>,
        topic: TopicUUID,
        id: SubscriberId,
        log_id: LogId,
        tail: SeqNo,
    ) {
        // Tell the subscriber where the log currently ends so its cursor
        // has a concrete starting point.
        debug!(topic = %topic, log_id, tail, subscriber = %id, "sending tail gap");
        let gap = Message::Gap {
            topic: topic.clone(),
            gap_type: GapType::Benign,
            from: 0,
            to: tail.saturating_sub(1),
        };
        flow.write(&self.client_sink, Delivery::new(vec![id], gap));

        let start = if self.storage.can_subscribe_past_end() {
            tail
        } else {
            tail.saturating_sub(1).max(1)
        };
        self.add_subscriber_internal(topic, id, log_id, start);
    }

    // ---- find-latest-seqno plumbing ----------------------------------

    fn in_flight_find_requests(&self) -> usize {
        self.pending_find_responses.len() - self.queued_find_requests.len()
    }

    fn send_find_latest_request(&mut self, log_id: LogId) {
        let future = self.storage.find_latest_seqno(log_id);
        let tx = self.find_resp_tx.clone();
        tokio::spawn(async move {
            let result = future.await;
            let _ = tx.send(FindLatestSeqnoResponse { log_id, result }).await;
        });
        info!(log_id, "sent find-latest-seqno request");
    }

    pub(crate) fn on_find_latest_response(
        &mut self,
        flow: &mut Flow<'_>,
        response: FindLatestSeqnoResponse,
    ) {
        let log_id = response.log_id;
        let waiting = self
            .pending_find_responses
            .remove(&log_id)
            .unwrap_or_default();
        match response.result {
            Ok(tail) => {
                for id in waiting {
                    // The subscriber may have unsubscribed while the
                    // request was in flight.
                    let Some(topic) = self
                        .stream_subscriptions
                        .find(id.stream_id, id.sub_id)
                        .cloned()
                    else {
                        debug!(subscriber = %id, "unsubscribed before find-latest response");
                        continue;
                    };
                    self.add_tail_subscriber(flow, topic, id, log_id, tail);
                }
                info!(log_id, tail, "suggesting tail seqno");
                self.suggest_tail(log_id, tail);
            }
            Err(err) => {
                warn!(log_id, %err, "find-latest-seqno failed");
                for id in waiting {
                    let Some(topic) =
                        self.stream_subscriptions.move_out(id.stream_id, id.sub_id)
                    else {
                        continue;
                    };
                    let message = Message::SubscriptionStatus {
                        topic,
                        sub_id: id,
                        status: StatusCode::NotFound,
                    };
                    flow.write(&self.client_sink, Delivery::new(vec![id], message));
                }
            }
        }
        // One request retired; kick a deferred log if any.
        if let Some((next_log, ())) = self.queued_find_requests.pop_front() {
            self.send_find_latest_request(next_log);
        }
    }

    fn suggest_tail(&mut self, log_id: LogId, seqno: SeqNo) {
        for reader in &mut self.readers {
            reader.suggest_tail_seqno(log_id, seqno);
        }
        self.pending_reader.suggest_tail_seqno(log_id, seqno);
    }

    pub(crate) fn tail_seqno_estimate(&self, log_id: LogId) -> SeqNo {
        self.readers
            .iter()
            .map(|reader| reader.tail_seqno_estimate(log_id))
            .chain(std::iter::once(
                self.pending_reader.tail_seqno_estimate(log_id),
            ))
            .max()
            .unwrap_or(0)
    }

    // ---- pending subscriptions and cache-first delivery --------------

    pub(crate) fn on_pending_subscription(
        &mut self,
        flow: &mut Flow<'_>,
        id: SubscriberId,
        pending: PendingSubscription,
    ) {
        let Some(topic) = self
            .stream_subscriptions
            .find(id.stream_id, id.sub_id)
            .cloned()
        else {
            return;
        };
        match self.deliver_from_cache(flow, &topic, id, pending.log_id, pending.seqno) {
            CacheDelivery::Complete {
                next_seqno,
                delivered,
            } => {
                let reader_idx = self.reader_for_new_subscription(&topic, pending.log_id, next_seqno);
                let start_result = match reader_idx {
                    Some(idx) => {
                        let result = self.readers[idx].start_reading(&topic, pending.log_id, next_seqno);
                        self.schedule_restart(idx, pending.log_id);
                        result
                    }
                    None => self
                        .pending_reader
                        .start_reading(&topic, pending.log_id, next_seqno),
                };
                if let Err(err) = start_result {
                    warn!(log_id = pending.log_id, %err, "failed to start reading");
                }
                let was_added = self
                    .topic_map
                    .entry(pending.log_id)
                    .or_default()
                    .add_subscriber(&topic, next_seqno, id, delivered);
                if was_added {
                    self.stats.updated_subscriptions += 1;
                }
                debug!(
                    subscriber = %id,
                    topic = %topic,
                    seqno = next_seqno,
                    new = was_added,
                    pending_reader = reader_idx.is_none(),
                    "subscription placed"
                );
            }
            CacheDelivery::Backoff { next_seqno } => {
                // Retry once the backpressure lifts, resuming where the
                // replay stopped.
                self.cache_readers.write(
                    id,
                    PendingSubscription {
                        log_id: pending.log_id,
                        seqno: next_seqno,
                    },
                );
                self.stats.cache_reader_backoff += 1;
                info!(
                    subscriber = %id,
                    topic = %topic,
                    seqno = next_seqno,
                    "cache replay backed off, will retry"
                );
            }
        }
    }

    fn deliver_from_cache(
        &mut self,
        flow: &mut Flow<'_>,
        topic: &TopicUUID,
        id: SubscriberId,
        log_id: LogId,
        seqno: SeqNo,
    ) -> CacheDelivery {
        let mut delivered: Option<SeqNo> = None;
        let outcome = {
            let cache = &mut self.data_cache;
            let stats = &mut self.stats;
            let sink = &self.client_sink;
            cache.read(log_id, seqno, Some(topic), |record_seqno, record_topic, payload| {
                let message = Message::Deliver {
                    topic: record_topic.clone(),
                    prev_seqno: delivered.unwrap_or(0),
                    seqno: record_seqno,
                    payload: payload.clone(),
                };
                delivered = Some(record_seqno);
                stats.records_served_from_cache += 1;
                flow.write(sink, Delivery::new(vec![id], message))
            })
        };
        match outcome {
            CacheRead::ReadBackoff(next_seqno) => CacheDelivery::Backoff { next_seqno },
            CacheRead::NoneRead => CacheDelivery::Complete {
                next_seqno: seqno,
                delivered: None,
            },
            CacheRead::ReadContinue(next_seqno) => {
                // Cover the stretch the cache skipped (records of other
                // topics) with one benign gap so the cursor lands at the
                // handoff position.
                let gap_from = delivered.map(|d| d + 1).unwrap_or(seqno);
                if next_seqno > gap_from {
                    let gap = Message::Gap {
                        topic: topic.clone(),
                        gap_type: GapType::Benign,
                        from: gap_from,
                        to: next_seqno - 1,
                    };
                    flow.write(&self.client_sink, Delivery::new(vec![id], gap));
                }
                debug!(
                    subscriber = %id,
                    topic = %topic,
                    from = seqno,
                    to = next_seqno,
                    "subscription fast-forwarded by cache"
                );
                CacheDelivery::Complete {
                    next_seqno,
                    delivered,
                }
            }
        }
    }

    /// Picks the reader for a new subscription: cheapest by the
    /// subscription-cost heuristic, or the virtual pending reader when
    /// every real reader would have to rewind.
    fn reader_for_new_subscription(
        &self,
        topic: &TopicUUID,
        log_id: LogId,
        seqno: SeqNo,
    ) -> Option<usize> {
        if self.readers.len() == 1 {
            // With a single reader there is nothing to merge into later,
            // so rewinding now is the only option.
            return Some(0);
        }
        let mut best = None;
        let mut best_cost = u64::MAX;
        for (idx, reader) in self.readers.iter().enumerate() {
            let cost = reader.subscription_cost(topic, log_id, seqno);
            if cost < best_cost {
                best = Some(idx);
                best_cost = cost;
            }
        }
        best
    }

    // ---- record and gap dispatch -------------------------------------

    pub(crate) fn on_log_event(&mut self, flow: &mut Flow<'_>, event: LogEvent) {
        match event {
            LogEvent::Record {
                log_id,
                seqno,
                topic,
                payload,
                reader_id,
            } => self.send_log_record(flow, log_id, seqno, topic, payload, reader_id),
            LogEvent::Gap {
                log_id,
                gap_type,
                from,
                to,
                reader_id,
            } => self.send_gap_record(flow, log_id, gap_type, from, to, reader_id),
        }
    }

    fn reader_index(&self, reader_id: ReaderId) -> Option<usize> {
        let idx = reader_id.checked_sub(self.base_reader_id)?;
        (idx < self.readers.len()).then_some(idx)
    }

    fn send_log_record(
        &mut self,
        flow: &mut Flow<'_>,
        log_id: LogId,
        seqno: SeqNo,
        topic: TopicUUID,
        payload: Bytes,
        reader_id: ReaderId,
    ) {
        self.stats.log_records_received += 1;
        self.stats.log_records_payload_bytes += payload.len() as u64;
        metrics::counter!("tower_log_records_received").increment(1);
        let Some(idx) = self.reader_index(reader_id) else {
            warn!(reader_id, log_id, "record for unknown reader dropped");
            return;
        };

        self.data_cache.store(log_id, seqno, &topic, payload.clone());

        let processed = match self.readers[idx].process_record(log_id, seqno, &topic) {
            Ok(processed) => processed,
            Err(err) => {
                self.stats.log_records_out_of_order += 1;
                warn!(log_id, seqno, %err, "dropping out-of-order record");
                return;
            }
        };
        if processed.is_tail {
            self.stats.tail_records_received += 1;
        } else {
            self.stats.backlog_records_received += 1;
        }

        // Group recipients by their own chain position; subscribers of
        // the same record can carry different prev_seqnos.
        let mut groups: BTreeMap<SeqNo, Vec<SubscriberId>> = BTreeMap::new();
        let mut tail_recipients = 0u64;
        if let Some(topic_manager) = self.topic_map.get_mut(&log_id) {
            topic_manager.visit_subscribers(&topic, 1, seqno, |sub| {
                groups.entry(sub.prev_seqno()).or_default().push(sub.id());
                sub.record_delivery(seqno);
            });
            if processed.is_tail {
                // Tail subscriptions waiting at the sentinel take a copy
                // with no history at all.
                topic_manager.visit_subscribers(&topic, 0, 0, |sub| {
                    groups.entry(sub.prev_seqno()).or_default().push(sub.id());
                    sub.record_delivery(seqno);
                    tail_recipients += 1;
                });
            }
        }
        self.stats.new_tail_records_sent += tail_recipients;

        if groups.is_empty() {
            self.stats.log_records_without_subscriptions += 1;
            debug!(log_id, seqno, topic = %topic, "record had no subscribers");
        } else {
            self.stats.log_records_with_subscriptions += 1;
            for (prev_seqno, recipients) in groups {
                let message = Message::Deliver {
                    topic: topic.clone(),
                    prev_seqno,
                    seqno,
                    payload: payload.clone(),
                };
                flow.write(&self.client_sink, Delivery::new(recipients, message));
            }
        }

        self.bump_lagging_on(flow, idx, log_id, seqno);

        // If the cache already holds what comes next, replay from it
        // instead of paying for storage reads.
        let next_seqno = self.readers[idx].next_seqno(log_id);
        if next_seqno != 0 && self.data_cache.has_entry(log_id, next_seqno) {
            if let Err(err) = self.readers[idx].pause_reading(log_id) {
                warn!(log_id, %err, "failed to pause reader for cache replay");
            }
            self.reentry_cache_readers
                .write(CacheReaderKey { log_id, reader: idx }, ());
        } else {
            self.attempt_reader_merges(idx, log_id);
        }
    }

    fn bump_lagging_on(&mut self, flow: &mut Flow<'_>, idx: usize, log_id: LogId, now: SeqNo) {
        let mut bumps: Vec<(TopicUUID, SeqNo)> = Vec::new();
        self.readers[idx].bump_lagging(log_id, now, |topic, from| {
            bumps.push((topic.clone(), from));
        });
        for (topic, bump_from) in bumps {
            let Some(topic_manager) = self.topic_map.get_mut(&log_id) else {
                continue;
            };
            let mut recipients = Vec::new();
            topic_manager.visit_subscribers(&topic, bump_from, now, |sub| {
                recipients.push(sub.id());
                sub.advance_to(now + 1);
            });
            if recipients.is_empty() {
                continue;
            }
            self.stats.bumped_subscriptions += recipients.len() as u64;
            let gap = Message::Gap {
                topic,
                gap_type: GapType::Benign,
                from: bump_from,
                to: now,
            };
            flow.write(&self.client_sink, Delivery::new(recipients, gap));
        }
    }

    fn send_gap_record(
        &mut self,
        flow: &mut Flow<'_>,
        log_id: LogId,
        gap_type: GapType,
        from: SeqNo,
        to: SeqNo,
        reader_id: ReaderId,
    ) {
        self.stats.gap_records_received += 1;
        let Some(idx) = self.reader_index(reader_id) else {
            warn!(reader_id, log_id, "gap for unknown reader dropped");
            return;
        };
        if !self.readers[idx].validate_gap(log_id, from) {
            self.stats.gap_records_out_of_order += 1;
            warn!(log_id, from, to, "dropping out-of-order gap");
            return;
        }

        let topics: Vec<TopicUUID> = self
            .topic_map
            .get(&log_id)
            .map(|topic_manager| topic_manager.subscribed_topics())
            .unwrap_or_default();
        for topic in topics {
            let prev = self.readers[idx].process_gap(log_id, &topic, to);
            // An untracked topic only owns the gap's own range; anything
            // earlier belongs to another reader.
            let visit_from = if prev == 0 { from } else { prev };
            let Some(topic_manager) = self.topic_map.get_mut(&log_id) else {
                continue;
            };
            let mut recipients = Vec::new();
            topic_manager.visit_subscribers(&topic, visit_from, to, |sub| {
                recipients.push(sub.id());
                sub.advance_to(to + 1);
                if gap_type.is_malignant() {
                    sub.reset_history();
                }
            });
            if recipients.is_empty() {
                self.stats.gap_records_without_subscriptions += 1;
                continue;
            }
            self.stats.gap_records_with_subscriptions += 1;
            let message = Message::Gap {
                topic: topic.clone(),
                gap_type,
                from: visit_from,
                to,
            };
            flow.write(&self.client_sink, Delivery::new(recipients, message));
        }

        if gap_type.is_malignant() {
            // The log's history is gone; the reader must not claim to
            // know anything about topics before the gap.
            self.stats.malignant_gaps_received += 1;
            self.readers[idx].flush_history(log_id, to + 1);
        } else {
            self.stats.benign_gaps_received += 1;
            self.readers[idx].process_benign_gap(log_id, from, to);
        }

        self.attempt_reader_merges(idx, log_id);
    }

    // ---- cache reentry for live readers ------------------------------

    pub(crate) fn on_cache_reentry(&mut self, flow: &mut Flow<'_>, key: CacheReaderKey) {
        if !self.readers[key.reader].is_log_open(key.log_id) {
            return;
        }
        match self.advance_reader_from_cache(flow, key.log_id, key.reader) {
            CacheRead::ReadContinue(_) | CacheRead::NoneRead => {
                if !self.attempt_reader_merges(key.reader, key.log_id) {
                    info!(
                        log_id = key.log_id,
                        seqno = self.readers[key.reader].next_seqno(key.log_id),
                        "restarting reader after cache replay"
                    );
                    if let Err(err) = self.readers[key.reader].restart_reading(key.log_id) {
                        warn!(log_id = key.log_id, %err, "failed to restart reader");
                    }
                    self.schedule_restart(key.reader, key.log_id);
                }
            }
            CacheRead::ReadBackoff(seqno) => {
                info!(
                    log_id = key.log_id,
                    seqno, "backing off mid cache replay"
                );
                self.reentry_cache_readers.write(key, ());
            }
        }
    }

    fn advance_reader_from_cache(
        &mut self,
        flow: &mut Flow<'_>,
        log_id: LogId,
        idx: usize,
    ) -> CacheRead {
        let start = self.readers[idx].next_seqno(log_id);
        if start == 0 {
            return CacheRead::NoneRead;
        }
        // With exactly one subscribed topic the block blooms can skip
        // whole blocks; otherwise every record has to be scanned.
        let single_topic = self
            .topic_map
            .get(&log_id)
            .and_then(|topic_manager| topic_manager.single_topic());

        let cache = &mut self.data_cache;
        let reader = &mut self.readers[idx];
        let topic_map = &mut self.topic_map;
        let stats = &mut self.stats;
        let sink = &self.client_sink;
        let outcome = cache.read(
            log_id,
            start,
            single_topic.as_ref(),
            |seqno, topic, payload| {
                if let Err(err) = reader.process_cache_record(log_id, seqno, topic) {
                    warn!(log_id, seqno, %err, "cache replay out of order");
                    return false;
                }
                let mut groups: BTreeMap<SeqNo, Vec<SubscriberId>> = BTreeMap::new();
                if let Some(topic_manager) = topic_map.get_mut(&log_id) {
                    topic_manager.visit_subscribers(topic, 1, seqno, |sub| {
                        groups.entry(sub.prev_seqno()).or_default().push(sub.id());
                        sub.record_delivery(seqno);
                    });
                }
                if groups.is_empty() {
                    return true;
                }
                stats.records_served_from_cache += 1;
                let mut accepted = true;
                for (prev_seqno, recipients) in groups {
                    let message = Message::Deliver {
                        topic: topic.clone(),
                        prev_seqno,
                        seqno,
                        payload: payload.clone(),
                    };
                    accepted &= flow.write(sink, Delivery::new(recipients, message));
                }
                accepted
            },
        );
        if !matches!(outcome, CacheRead::NoneRead) {
            self.stats.cache_reentries += 1;
        }
        outcome
    }

    // ---- reader merging ----------------------------------------------

    /// Tries to fold `src`'s state for a log into another reader at the
    /// same position. On success the freed reader adopts any pending
    /// (virtual) subscriptions for the log.
    fn attempt_reader_merges(&mut self, src_idx: usize, log_id: LogId) -> bool {
        let Some(src_last_read) = self.readers[src_idx].last_read(log_id) else {
            return false;
        };
        let dest_idx = (0..self.readers.len()).find(|&idx| {
            idx != src_idx && self.readers[idx].last_read(log_id) == Some(src_last_read)
        });
        let Some(dest_idx) = dest_idx else {
            return false;
        };
        info!(
            src = self.readers[src_idx].reader_id(),
            dest = self.readers[dest_idx].reader_id(),
            log_id,
            at = src_last_read + 1,
            "merging readers"
        );
        let state = match self.readers[src_idx].remove_log_state(log_id) {
            Ok(Some(state)) => state,
            Ok(None) => return false,
            Err(err) => {
                warn!(log_id, %err, "failed to stop reader during merge");
                return false;
            }
        };
        self.readers[dest_idx].absorb_subscriptions(log_id, state.topics);
        self.stats.reader_merges += 1;
        metrics::counter!("tower_reader_merges").increment(1);

        if self.pending_reader.is_log_open(log_id) {
            if let Ok(Some(pending_state)) = self.pending_reader.remove_log_state(log_id) {
                match self.readers[src_idx].adopt_subscriptions(log_id, pending_state) {
                    Ok(()) => self.schedule_restart(src_idx, log_id),
                    Err(err) => warn!(log_id, %err, "failed to adopt pending subscriptions"),
                }
            }
        }
        true
    }

    // ---- periodic work -----------------------------------------------

    fn schedule_restart(&mut self, idx: usize, log_id: LogId) {
        if !self.restart_scheduled.insert((idx, log_id)) {
            return;
        }
        let min = self.options.min_reader_restart_duration;
        let max = self.options.max_reader_restart_duration;
        let jitter = if max > min {
            let span = (max - min).as_millis() as u64;
            min + std::time::Duration::from_millis(rand::thread_rng().gen_range(0..=span))
        } else {
            min
        };
        self.restart_counter += 1;
        self.restart_events
            .insert((Instant::now() + jitter, self.restart_counter), (idx, log_id));
    }

    pub(crate) fn tick(&mut self) {
        let now = Instant::now();
        loop {
            let due = match self.restart_events.first_key_value() {
                Some((&(at, _), _)) if at <= now => true,
                _ => false,
            };
            if !due {
                break;
            }
            let (_, (idx, log_id)) = self.restart_events.pop_first().expect("due event");
            self.restart_scheduled.remove(&(idx, log_id));
            if !self.readers[idx].is_actively_reading(log_id) {
                continue;
            }
            self.stats.reader_restarts += 1;
            info!(
                reader_id = self.readers[idx].reader_id(),
                log_id, "restarting reader to rebalance storage load"
            );
            if let Err(err) = self.readers[idx].restart_reading(log_id) {
                warn!(log_id, %err, "reader restart failed");
            }
            self.schedule_restart(idx, log_id);
        }
    }

    // ---- observability -----------------------------------------------

    pub(crate) fn statistics(&self, flow: FlowStats) -> TowerStatistics {
        TowerStatistics {
            tailer: self.stats.clone(),
            cache: self.data_cache.stats(),
            flow,
        }
    }

    pub(crate) fn log_info(&self, log_id: LogId) -> String {
        let mut info = format!(
            "Log({}).room[{}].tail_seqno_estimate: {}\n",
            log_id,
            self.room_index,
            self.tail_seqno_estimate(log_id)
        );
        for reader in &self.readers {
            info.push_str(&reader.log_info(log_id));
        }
        info.push_str(&self.pending_reader.log_info(log_id));
        info
    }

    pub(crate) fn cache_usage(&self) -> usize {
        self.data_cache.usage()
    }

    pub(crate) fn set_cache_capacity(&mut self, bytes: usize) {
        info!(room = self.room_index, bytes, "setting cache capacity");
        self.data_cache.set_capacity(bytes);
    }

    pub(crate) fn clear_cache(&mut self) {
        info!(room = self.room_index, "clearing cache");
        self.data_cache.clear();
    }
}
