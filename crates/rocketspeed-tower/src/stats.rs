// Per-room counters, snapshotted and merged by the tower facade.
use rocketspeed_flow::FlowStats;

/// Counters owned by one room's tailer. Everything is mutated on the room
/// task only; queries ship a clone back to the caller.
#[derive(Debug, Clone, Default)]
pub struct TailerStats {
    pub log_records_received: u64,
    pub log_records_payload_bytes: u64,
    pub backlog_records_received: u64,
    pub tail_records_received: u64,
    pub new_tail_records_sent: u64,
    pub log_records_with_subscriptions: u64,
    pub log_records_without_subscriptions: u64,
    pub log_records_out_of_order: u64,
    pub bumped_subscriptions: u64,
    pub gap_records_received: u64,
    pub gap_records_out_of_order: u64,
    pub gap_records_with_subscriptions: u64,
    pub gap_records_without_subscriptions: u64,
    pub benign_gaps_received: u64,
    pub malignant_gaps_received: u64,
    pub add_subscriber_requests: u64,
    pub add_subscriber_requests_at_tail: u64,
    pub add_subscriber_requests_at_tail_fast: u64,
    pub add_subscriber_requests_at_tail_slow: u64,
    pub updated_subscriptions: u64,
    pub remove_subscriber_requests: u64,
    pub records_served_from_cache: u64,
    pub cache_reader_backoff: u64,
    pub cache_reentries: u64,
    pub reader_restarts: u64,
    pub reader_merges: u64,
}

impl TailerStats {
    pub fn merge(&mut self, other: &TailerStats) {
        self.log_records_received += other.log_records_received;
        self.log_records_payload_bytes += other.log_records_payload_bytes;
        self.backlog_records_received += other.backlog_records_received;
        self.tail_records_received += other.tail_records_received;
        self.new_tail_records_sent += other.new_tail_records_sent;
        self.log_records_with_subscriptions += other.log_records_with_subscriptions;
        self.log_records_without_subscriptions += other.log_records_without_subscriptions;
        self.log_records_out_of_order += other.log_records_out_of_order;
        self.bumped_subscriptions += other.bumped_subscriptions;
        self.gap_records_received += other.gap_records_received;
        self.gap_records_out_of_order += other.gap_records_out_of_order;
        self.gap_records_with_subscriptions += other.gap_records_with_subscriptions;
        self.gap_records_without_subscriptions += other.gap_records_without_subscriptions;
        self.benign_gaps_received += other.benign_gaps_received;
        self.malignant_gaps_received += other.malignant_gaps_received;
        self.add_subscriber_requests += other.add_subscriber_requests;
        self.add_subscriber_requests_at_tail += other.add_subscriber_requests_at_tail;
        self.add_subscriber_requests_at_tail_fast += other.add_subscriber_requests_at_tail_fast;
        self.add_subscriber_requests_at_tail_slow += other.add_subscriber_requests_at_tail_slow;
        self.updated_subscriptions += other.updated_subscriptions;
        self.remove_subscriber_requests += other.remove_subscriber_requests;
        self.records_served_from_cache += other.records_served_from_cache;
        self.cache_reader_backoff += other.cache_reader_backoff;
        self.cache_reentries += other.cache_reentries;
        self.reader_restarts += other.reader_restarts;
        self.reader_merges += other.reader_merges;
    }
}

/// Cache lookup counters.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_inserts: u64,
    pub bloom_hits: u64,
    pub bloom_misses: u64,
    pub bloom_inserts: u64,
    pub bloom_false_positives: u64,
}

impl CacheStats {
    pub fn merge(&mut self, other: &CacheStats) {
        self.cache_hits += other.cache_hits;
        self.cache_misses += other.cache_misses;
        self.cache_inserts += other.cache_inserts;
        self.bloom_hits += other.bloom_hits;
        self.bloom_misses += other.bloom_misses;
        self.bloom_inserts += other.bloom_inserts;
        self.bloom_false_positives += other.bloom_false_positives;
    }
}

/// Aggregated view across all of a tower's rooms.
#[derive(Debug, Clone, Default)]
pub struct TowerStatistics {
    pub tailer: TailerStats,
    pub cache: CacheStats,
    pub flow: FlowStats,
}

impl TowerStatistics {
    pub fn merge(&mut self, other: &TowerStatistics) {
        self.tailer.merge(&other.tailer);
        self.cache.merge(&other.cache);
        self.flow.backpressure_applied += other.flow.backpressure_applied;
        self.flow.backpressure_lifted += other.flow.backpressure_lifted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_sums_counters() {
        let mut a = TowerStatistics::default();
        a.tailer.log_records_received = 3;
        a.cache.cache_hits = 1;
        a.flow.backpressure_applied = 2;
        let mut b = TowerStatistics::default();
        b.tailer.log_records_received = 4;
        b.cache.cache_hits = 5;
        b.flow.backpressure_applied = 1;
        a.merge(&b);
        assert_eq!(a.tailer.log_records_received, 7);
        assert_eq!(a.cache.cache_hits, 6);
        assert_eq!(a.flow.backpressure_applied, 3);
    }
}
