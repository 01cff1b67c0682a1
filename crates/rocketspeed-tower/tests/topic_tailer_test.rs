// End-to-end scenarios for the topic tailer over in-memory storage.
use bytes::Bytes;
use rocketspeed_common::{GapType, SeqNo, StatusCode, SubscriberId, TopicUUID};
use rocketspeed_router::{LogRouter, RouterError};
use rocketspeed_storage::MemoryLogStorage;
use rocketspeed_tower::{ControlTower, TowerError, TowerOptions};
use std::sync::Arc;
use std::time::Duration;
use test_harness::{start_raw, TestCluster};
use tokio::time::timeout;

fn fast_options() -> TowerOptions {
    TowerOptions {
        timer_interval: Duration::from_millis(20),
        ..TowerOptions::default()
    }
}

fn topic(name: &str) -> TopicUUID {
    TopicUUID::new("guest", name)
}

fn chain(records: &[(SeqNo, SeqNo, Bytes)]) -> Vec<(SeqNo, SeqNo)> {
    records.iter().map(|(prev, seqno, _)| (*prev, *seqno)).collect()
}

#[tokio::test]
async fn fan_out_on_one_log_chains_per_subscriber() {
    let cluster = TestCluster::start(fast_options());
    let publisher = cluster.publisher();
    let t = topic("orders");
    let a = SubscriberId::new(1, 1);
    let b = SubscriberId::new(1, 2);

    cluster.tower.subscribe(a, t.clone(), 1).await.expect("subscribe a");
    cluster.tower.subscribe(b, t.clone(), 5).await.expect("subscribe b");
    publisher.publish_many(&t, 10).expect("publish");

    cluster
        .deliveries
        .wait_until("both subscribers caught up", |log| {
            log.records_for(a).len() == 10 && log.records_for(b).len() == 6
        })
        .await
        .expect("deliveries");

    let expected_a: Vec<(SeqNo, SeqNo)> = (1..=10).map(|s| (s - 1, s)).collect();
    assert_eq!(chain(&cluster.deliveries.records_for(a)), expected_a);

    let mut expected_b = vec![(0, 5)];
    expected_b.extend((6..=10).map(|s| (s - 1, s)));
    assert_eq!(chain(&cluster.deliveries.records_for(b)), expected_b);
}

#[tokio::test]
async fn one_record_per_topic_arrives_with_no_history() {
    let cluster = TestCluster::start(fast_options());
    let publisher = cluster.publisher();

    let mut subs = Vec::new();
    for i in 0..5u64 {
        let t = topic(&format!("topic-{i}"));
        let id = SubscriberId::new(1, i);
        cluster.tower.subscribe(id, t.clone(), 1).await.expect("subscribe");
        subs.push((id, t));
    }
    for (_, t) in &subs {
        publisher.publish(t, "x").expect("publish");
    }

    cluster
        .deliveries
        .wait_until("each subscriber got its record", |log| {
            subs.iter().all(|(id, _)| log.records_for(*id).len() == 1)
        })
        .await
        .expect("deliveries");

    let mut seqnos = Vec::new();
    for (id, _) in &subs {
        let records = cluster.deliveries.records_for(*id);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, 0, "first record must carry no history");
        seqnos.push(records[0].1);
    }
    seqnos.sort_unstable();
    assert_eq!(seqnos, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn subscribe_at_tail_of_empty_log_yields_one_gap() {
    let cluster = TestCluster::start(fast_options());
    let a = SubscriberId::new(1, 1);
    let t = topic("quiet");

    cluster.tower.subscribe(a, t.clone(), 0).await.expect("subscribe");
    cluster
        .deliveries
        .wait_until("tail gap", |log| !log.gaps_for(a).is_empty())
        .await
        .expect("gap");
    assert_eq!(cluster.deliveries.gaps_for(a), vec![(GapType::Benign, 0, 0)]);

    // Nothing else arrives while the topic stays silent.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(cluster.deliveries.count_for(a), 1);

    // The first publish reaches the tail subscriber as a first record.
    cluster.publisher().publish(&t, "x").expect("publish");
    cluster
        .deliveries
        .wait_until("record after tail gap", |log| log.records_for(a).len() == 1)
        .await
        .expect("record");
    assert_eq!(chain(&cluster.deliveries.records_for(a)), vec![(0, 1)]);
}

#[tokio::test]
async fn resubscribing_replays_identical_deliveries() {
    let cluster = TestCluster::start(fast_options());
    let publisher = cluster.publisher();
    let t = topic("replay");
    let a = SubscriberId::new(1, 1);

    publisher.publish_many(&t, 5).expect("publish");
    cluster.tower.subscribe(a, t.clone(), 1).await.expect("subscribe");
    cluster
        .deliveries
        .wait_until("first pass", |log| log.records_for(a).len() == 5)
        .await
        .expect("first pass");
    let first = chain(&cluster.deliveries.records_for(a));

    cluster.tower.unsubscribe(a).await.expect("unsubscribe");
    cluster.tower.subscribe(a, t.clone(), 1).await.expect("resubscribe");
    cluster
        .deliveries
        .wait_until("second pass", |log| log.records_for(a).len() == 10)
        .await
        .expect("second pass");

    let all = chain(&cluster.deliveries.records_for(a));
    assert_eq!(all[..5], first[..]);
    assert_eq!(all[5..], first[..]);
    assert_eq!(first, (1..=5).map(|s| (s - 1, s)).collect::<Vec<_>>());
}

#[tokio::test]
async fn lagging_topic_is_bumped_with_a_benign_gap() {
    let mut options = fast_options();
    options.max_subscription_lag = 100;
    let cluster = TestCluster::start(options);
    let publisher = cluster.publisher();
    let slow = topic("slow");
    let busy = topic("busy");
    let a = SubscriberId::new(1, 1);

    cluster.tower.subscribe(a, slow.clone(), 1).await.expect("subscribe");
    publisher.publish_many(&busy, 200).expect("publish");

    cluster
        .deliveries
        .wait_until("bump gap", |log| !log.gaps_for(a).is_empty())
        .await
        .expect("bump");

    // The slow topic never had records, only the cursor advanced.
    assert_eq!(cluster.deliveries.gaps_for(a), vec![(GapType::Benign, 1, 102)]);
    assert!(cluster.deliveries.records_for(a).is_empty());

    let stats = cluster.tower.statistics().await.expect("stats");
    assert_eq!(stats.tailer.bumped_subscriptions, 1);
}

#[tokio::test]
async fn data_loss_gap_flushes_topic_history() {
    let cluster = TestCluster::start(fast_options());
    let publisher = cluster.publisher();
    let t = topic("fragile");
    let other = topic("other");
    let a = SubscriberId::new(1, 1);

    cluster.tower.subscribe(a, t.clone(), 10).await.expect("subscribe");
    publisher.publish_many(&other, 9).expect("publish backlog");
    let (from, to) = publisher
        .inject_gap(&t, GapType::DataLoss, 11)
        .expect("inject gap");
    assert_eq!((from, to), (10, 20));
    publisher.publish(&t, "after-loss").expect("publish");

    cluster
        .deliveries
        .wait_until("gap and record", |log| {
            !log.gaps_for(a).is_empty() && !log.records_for(a).is_empty()
        })
        .await
        .expect("deliveries");

    assert_eq!(cluster.deliveries.gaps_for(a), vec![(GapType::DataLoss, 10, 20)]);
    // History was flushed, so the next record carries prev_seqno 0.
    assert_eq!(chain(&cluster.deliveries.records_for(a)), vec![(0, 21)]);
}

#[tokio::test]
async fn readers_merge_once_positions_converge() {
    let cluster = TestCluster::start(fast_options());
    let publisher = cluster.publisher();
    let t1 = topic("first");
    let t2 = topic("second");
    let a = SubscriberId::new(1, 1);
    let b = SubscriberId::new(1, 2);

    cluster.tower.subscribe(a, t1.clone(), 1).await.expect("subscribe a");
    publisher.publish_many(&t1, 5).expect("publish");
    cluster
        .deliveries
        .wait_until("a caught up", |log| log.records_for(a).len() == 5)
        .await
        .expect("a records");

    // b wants old data on another topic; only a second reader can serve
    // it without rewinding the first.
    cluster.tower.subscribe(b, t2.clone(), 1).await.expect("subscribe b");
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        let stats = cluster.tower.statistics().await.expect("stats");
        if stats.tailer.reader_merges >= 1 {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "readers never merged");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // After the merge a single reader serves both topics.
    publisher.publish(&t2, "x").expect("publish t2");
    publisher.publish(&t1, "y").expect("publish t1");
    cluster
        .deliveries
        .wait_until("post-merge records", |log| {
            log.records_for(b).len() == 1 && log.records_for(a).len() == 6
        })
        .await
        .expect("post-merge");

    assert_eq!(chain(&cluster.deliveries.records_for(b)), vec![(0, 6)]);
    assert_eq!(chain(&cluster.deliveries.records_for(a)).last(), Some(&(5, 7)));
}

#[tokio::test]
async fn cache_serves_backlog_and_hands_off_seamlessly() {
    let mut options = fast_options();
    options.cache_size = 10 << 20;
    let cluster = TestCluster::start(options);
    let publisher = cluster.publisher();
    let t = topic("cached");
    let warm = SubscriberId::new(1, 1);
    let late = SubscriberId::new(2, 1);

    cluster.tower.subscribe(warm, t.clone(), 1).await.expect("subscribe warm");
    publisher.publish_many(&t, 100).expect("publish");
    cluster
        .deliveries
        .wait_until("warm subscriber caught up", |log| {
            log.records_for(warm).len() == 100
        })
        .await
        .expect("warm records");

    cluster.tower.subscribe(late, t.clone(), 50).await.expect("subscribe late");
    cluster
        .deliveries
        .wait_until("late subscriber served from cache", |log| {
            log.records_for(late).len() == 51
        })
        .await
        .expect("late records");

    let late_records = chain(&cluster.deliveries.records_for(late));
    let mut expected = vec![(0, 50)];
    expected.extend((51..=100).map(|s| (s - 1, s)));
    assert_eq!(late_records, expected);

    let stats = cluster.tower.statistics().await.expect("stats");
    assert_eq!(stats.tailer.records_served_from_cache, 51);
    assert!(stats.cache.cache_hits >= 51);

    // The live record continues the chain without a seam.
    publisher.publish(&t, "live").expect("publish live");
    cluster
        .deliveries
        .wait_until("live record", |log| log.records_for(late).len() == 52)
        .await
        .expect("live record");
    assert_eq!(
        chain(&cluster.deliveries.records_for(late)).last(),
        Some(&(100, 101))
    );
    assert_eq!(
        chain(&cluster.deliveries.records_for(warm)).last(),
        Some(&(100, 101))
    );
}

#[tokio::test]
async fn slow_subscriber_applies_backpressure_without_loss() {
    let mut options = fast_options();
    options.room_to_client_queue_size = 8;
    options.storage_to_room_queue_size = 8;
    let (tower, storage, router, mut receivers) = start_raw(options, 1);
    let mut rx = receivers.remove(0);
    let t = topic("firehose");
    let a = SubscriberId::new(1, 1);

    tower.subscribe(a, t.clone(), 1).await.expect("subscribe");
    let log_id = router.route(&t).expect("route");
    for i in 0..300 {
        storage.append(log_id, &t, Bytes::from(format!("m{i}")));
    }

    // Drain slowly; every record must still arrive, in order.
    let mut records = Vec::new();
    while records.len() < 300 {
        let delivery = timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("delivery in time")
            .expect("channel open");
        if let rocketspeed_common::Message::Deliver { prev_seqno, seqno, .. } = delivery.message {
            if delivery.recipients.contains(&a) {
                records.push((prev_seqno, seqno));
            }
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let expected: Vec<(SeqNo, SeqNo)> = (1..=300).map(|s| (s - 1, s)).collect();
    assert_eq!(records, expected);

    let stats = tower.statistics().await.expect("stats");
    assert!(stats.flow.backpressure_applied >= 1, "no backpressure applied");
    assert!(stats.flow.backpressure_lifted >= 1, "backpressure never lifted");
}

#[tokio::test]
async fn second_tail_subscriber_uses_the_cached_estimate() {
    let cluster = TestCluster::start(fast_options());
    let publisher = cluster.publisher();
    let t = topic("tailers");
    let first = SubscriberId::new(1, 1);
    let second = SubscriberId::new(1, 2);

    publisher.publish_many(&t, 3).expect("publish");
    cluster.tower.subscribe(first, t.clone(), 0).await.expect("subscribe first");
    cluster
        .deliveries
        .wait_until("first tail gap", |log| !log.gaps_for(first).is_empty())
        .await
        .expect("first gap");
    assert_eq!(cluster.deliveries.gaps_for(first), vec![(GapType::Benign, 0, 3)]);

    cluster.tower.subscribe(second, t.clone(), 0).await.expect("subscribe second");
    cluster
        .deliveries
        .wait_until("second tail gap", |log| !log.gaps_for(second).is_empty())
        .await
        .expect("second gap");
    assert_eq!(cluster.deliveries.gaps_for(second), vec![(GapType::Benign, 0, 3)]);

    publisher.publish(&t, "next").expect("publish");
    cluster
        .deliveries
        .wait_until("both got the live record", |log| {
            log.records_for(first).len() == 1 && log.records_for(second).len() == 1
        })
        .await
        .expect("records");
    assert_eq!(chain(&cluster.deliveries.records_for(first)), vec![(0, 4)]);
    assert_eq!(chain(&cluster.deliveries.records_for(second)), vec![(0, 4)]);

    let stats = cluster.tower.statistics().await.expect("stats");
    assert!(stats.tailer.add_subscriber_requests_at_tail_slow >= 1);
    assert!(stats.tailer.add_subscriber_requests_at_tail_fast >= 1);
    assert!(stats.tailer.tail_records_received >= 1);
}

#[tokio::test]
async fn failed_find_latest_reports_subscription_not_found() {
    let cluster = TestCluster::start(fast_options());
    cluster.storage.set_find_latest_error(true);
    let a = SubscriberId::new(1, 1);

    cluster
        .tower
        .subscribe(a, topic("doomed"), 0)
        .await
        .expect("subscribe");
    cluster
        .deliveries
        .wait_until("status", |log| !log.statuses_for(a).is_empty())
        .await
        .expect("status");
    assert_eq!(cluster.deliveries.statuses_for(a), vec![StatusCode::NotFound]);
    assert!(cluster.deliveries.records_for(a).is_empty());
}

#[tokio::test]
async fn stream_teardown_removes_every_subscription() {
    let cluster = TestCluster::start(fast_options());
    let publisher = cluster.publisher();
    let t1 = topic("one");
    let t2 = topic("two");
    let doomed_a = SubscriberId::new(7, 1);
    let doomed_b = SubscriberId::new(7, 2);
    let survivor = SubscriberId::new(8, 1);

    cluster.tower.subscribe(doomed_a, t1.clone(), 1).await.expect("subscribe");
    cluster.tower.subscribe(doomed_b, t2.clone(), 1).await.expect("subscribe");
    cluster.tower.subscribe(survivor, t1.clone(), 1).await.expect("subscribe");

    publisher.publish(&t1, "x").expect("publish");
    publisher.publish(&t2, "y").expect("publish");
    cluster
        .deliveries
        .wait_until("everyone got a record", |log| {
            log.records_for(doomed_a).len() == 1
                && log.records_for(doomed_b).len() == 1
                && log.records_for(survivor).len() == 1
        })
        .await
        .expect("records");

    cluster.tower.unsubscribe_stream(7).await.expect("teardown");
    // A statistics round trip doubles as a barrier: the teardown command
    // is processed before the next publish.
    cluster.tower.statistics().await.expect("barrier");

    publisher.publish(&t1, "z").expect("publish");
    cluster
        .deliveries
        .wait_until("survivor gets the record", |log| {
            log.records_for(survivor).len() == 2
        })
        .await
        .expect("survivor");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(cluster.deliveries.records_for(doomed_a).len(), 1);
    assert_eq!(cluster.deliveries.records_for(doomed_b).len(), 1);
}

#[tokio::test]
async fn readers_restart_periodically_without_duplicates() {
    let mut options = fast_options();
    options.min_reader_restart_duration = Duration::from_millis(50);
    options.max_reader_restart_duration = Duration::from_millis(100);
    let cluster = TestCluster::start(options);
    let publisher = cluster.publisher();
    let t = topic("steady");
    let a = SubscriberId::new(1, 1);

    cluster.tower.subscribe(a, t.clone(), 1).await.expect("subscribe");
    publisher.publish_many(&t, 5).expect("publish");
    cluster
        .deliveries
        .wait_until("first batch", |log| log.records_for(a).len() == 5)
        .await
        .expect("first batch");

    // Let at least one restart fire.
    tokio::time::sleep(Duration::from_millis(400)).await;
    publisher.publish_many(&t, 5).expect("publish");
    cluster
        .deliveries
        .wait_until("second batch", |log| log.records_for(a).len() == 10)
        .await
        .expect("second batch");

    let expected: Vec<(SeqNo, SeqNo)> = (1..=10).map(|s| (s - 1, s)).collect();
    assert_eq!(chain(&cluster.deliveries.records_for(a)), expected);

    let stats = cluster.tower.statistics().await.expect("stats");
    assert!(stats.tailer.reader_restarts >= 1, "no reader restart happened");
}

#[tokio::test]
async fn router_miss_rejects_the_subscription_synchronously() {
    let storage = Arc::new(MemoryLogStorage::new());
    let router = Arc::new(LogRouter::new(1, 0));
    let (tower, _receivers) =
        ControlTower::new(fast_options(), storage, router).expect("tower");
    let err = tower
        .subscribe(SubscriberId::new(1, 1), topic("nowhere"), 1)
        .await
        .expect_err("router miss");
    assert!(matches!(
        err,
        TowerError::Router(RouterError::NoLogForTopic(_))
    ));
}

#[tokio::test]
async fn unsubscribing_an_unknown_id_is_an_error() {
    let cluster = TestCluster::start(fast_options());
    let err = cluster
        .tower
        .unsubscribe(SubscriberId::new(9, 9))
        .await
        .expect_err("unknown");
    assert!(matches!(err, TowerError::UnknownSubscription(_)));
}

#[tokio::test]
async fn cache_controls_are_exposed_through_the_facade() {
    let mut options = fast_options();
    options.cache_size = 1 << 20;
    let cluster = TestCluster::start(options);
    let publisher = cluster.publisher();
    let t = topic("inspect");
    let a = SubscriberId::new(1, 1);

    cluster.tower.subscribe(a, t.clone(), 1).await.expect("subscribe");
    publisher.publish_many(&t, 10).expect("publish");
    cluster
        .deliveries
        .wait_until("records", |log| log.records_for(a).len() == 10)
        .await
        .expect("records");

    let usage = cluster.tower.cache_usage().await.expect("usage");
    assert!(usage > 0, "cache should hold the published records");

    let info = cluster.tower.log_info(1).await.expect("log info");
    assert!(info.contains("last_read"));

    cluster.tower.clear_cache().await.expect("clear");
    cluster.tower.statistics().await.expect("barrier");
    assert_eq!(cluster.tower.cache_usage().await.expect("usage"), 0);
}
