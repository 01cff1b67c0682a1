// Block-structured cache of recently seen log records.
//
// Records are grouped into fixed-size blocks keyed by (log, aligned
// seqno); the LRU order is at block granularity so the eviction map stays
// small. Each block carries a bloom filter over its topics so a
// single-topic read can skip blocks without scanning them.
use crate::bloom::BloomFilter;
use crate::stats::CacheStats;
use bytes::Bytes;
use rocketspeed_common::{LinkedMap, LogId, SeqNo, TopicUUID};

/// Outcome of a cache read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheRead {
    /// Nothing cached at the requested position.
    NoneRead,
    /// Served up to the end of cached data; resume at the carried seqno.
    ReadContinue(SeqNo),
    /// The visitor applied backpressure; retry later from the carried
    /// seqno.
    ReadBackoff(SeqNo),
}

#[derive(Debug)]
struct CachedRecord {
    topic: TopicUUID,
    payload: Bytes,
}

#[derive(Debug)]
struct CacheBlock {
    records: Vec<Option<CachedRecord>>,
    bloom: BloomFilter,
    // Bytes charged against the cache budget, block overhead included.
    charge: usize,
}

const RECORD_OVERHEAD: usize = 64;
const BLOCK_OVERHEAD: usize = 64;

impl CacheBlock {
    fn new(block_size: usize, bloom_bits_per_msg: usize) -> Self {
        let mut records = Vec::new();
        records.resize_with(block_size, || None);
        let bloom = BloomFilter::with_bits_per_key(bloom_bits_per_msg, block_size);
        let charge = block_size * std::mem::size_of::<Option<CachedRecord>>()
            + bloom.charge()
            + BLOCK_OVERHEAD;
        Self {
            records,
            bloom,
            charge,
        }
    }

    // First empty slot at or after `offset`; records are only useful
    // while contiguous from the requested position.
    fn contiguous_end(&self, offset: usize) -> usize {
        let mut idx = offset;
        while idx < self.records.len() && self.records[idx].is_some() {
            idx += 1;
        }
        idx
    }
}

fn record_charge(topic: &TopicUUID, payload: &Bytes) -> usize {
    RECORD_OVERHEAD + topic.namespace_id().len() + topic.topic_name().len() + payload.len()
}

fn topic_key(topic: &TopicUUID) -> [u8; 8] {
    topic.routing_hash().to_le_bytes()
}

/// Byte-budgeted LRU cache of log records for one room.
#[derive(Debug)]
pub struct DataCache {
    capacity: usize,
    usage: usize,
    block_size: usize,
    bloom_bits_per_msg: usize,
    store_system_namespaces: bool,
    blocks: LinkedMap<(LogId, SeqNo), CacheBlock>,
    stats: CacheStats,
}

impl DataCache {
    pub fn new(
        capacity: usize,
        store_system_namespaces: bool,
        bloom_bits_per_msg: usize,
        block_size: usize,
    ) -> Self {
        Self {
            capacity,
            usage: 0,
            block_size,
            bloom_bits_per_msg,
            store_system_namespaces,
            blocks: LinkedMap::new(),
            stats: CacheStats::default(),
        }
    }

    fn block_start(&self, seqno: SeqNo) -> SeqNo {
        seqno / self.block_size as u64 * self.block_size as u64
    }

    /// Stores one record; idempotent on `(log, seqno)`.
    pub fn store(&mut self, log_id: LogId, seqno: SeqNo, topic: &TopicUUID, payload: Bytes) {
        if self.capacity == 0 || seqno == 0 {
            return;
        }
        if topic.is_system_namespace() && !self.store_system_namespaces {
            return;
        }
        let key = (log_id, self.block_start(seqno));
        if self.blocks.contains_key(&key) {
            self.blocks.move_to_back(&key);
        } else {
            let block = CacheBlock::new(self.block_size, self.bloom_bits_per_msg);
            self.usage += block.charge;
            self.blocks.insert_back(key, block);
        }
        let block = self.blocks.get_mut(&key).expect("cache block");
        let offset = (seqno - key.1) as usize;
        if block.records[offset].is_some() {
            return;
        }
        let charge = record_charge(topic, &payload);
        block.bloom.insert(&topic_key(topic));
        block.records[offset] = Some(CachedRecord {
            topic: topic.clone(),
            payload,
        });
        block.charge += charge;
        self.usage += charge;
        self.stats.cache_inserts += 1;
        self.stats.bloom_inserts += 1;
        self.evict_to_capacity();
    }

    /// Scans cached records forward from `start`, invoking `on_record`
    /// for each one (restricted to the filter topic when given). The
    /// visitor returns false to apply backpressure.
    pub fn read(
        &mut self,
        log_id: LogId,
        start: SeqNo,
        topic_filter: Option<&TopicUUID>,
        mut on_record: impl FnMut(SeqNo, &TopicUUID, &Bytes) -> bool,
    ) -> CacheRead {
        if self.capacity == 0 {
            return CacheRead::NoneRead;
        }
        let start = start.max(1);
        let mut cursor = start;
        let mut stopped = false;
        'blocks: loop {
            let key = (log_id, self.block_start(cursor));
            if !self.blocks.contains_key(&key) {
                break;
            }
            self.blocks.move_to_back(&key);
            let block = self.blocks.get(&key).expect("cache block");
            let offset = (cursor - key.1) as usize;
            let end = block.contiguous_end(offset);
            if end == offset {
                break;
            }
            let scan = match topic_filter {
                Some(topic) => {
                    if block.bloom.contains(&topic_key(topic)) {
                        self.stats.bloom_misses += 1;
                        true
                    } else {
                        self.stats.bloom_hits += 1;
                        false
                    }
                }
                None => true,
            };
            if scan {
                let mut matched = false;
                for idx in offset..end {
                    let record = block.records[idx].as_ref().expect("contiguous record");
                    if topic_filter.is_some_and(|topic| topic != &record.topic) {
                        continue;
                    }
                    matched = true;
                    self.stats.cache_hits += 1;
                    let seqno = key.1 + idx as u64;
                    if !on_record(seqno, &record.topic, &record.payload) {
                        stopped = true;
                        cursor = seqno + 1;
                        break 'blocks;
                    }
                }
                if topic_filter.is_some() && !matched {
                    self.stats.bloom_false_positives += 1;
                }
            }
            cursor = key.1 + end as u64;
            if end < self.block_size {
                break;
            }
        }
        if stopped {
            CacheRead::ReadBackoff(cursor)
        } else if cursor > start {
            CacheRead::ReadContinue(cursor)
        } else {
            self.stats.cache_misses += 1;
            CacheRead::NoneRead
        }
    }

    pub fn has_entry(&self, log_id: LogId, seqno: SeqNo) -> bool {
        let key = (log_id, self.block_start(seqno));
        match self.blocks.get(&key) {
            Some(block) => block.records[(seqno - key.1) as usize].is_some(),
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
        self.usage = 0;
    }

    /// Sets a new byte budget; 0 disables the cache entirely.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        if capacity == 0 {
            self.clear();
        } else {
            self.evict_to_capacity();
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn usage(&self) -> usize {
        self.usage
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.clone()
    }

    fn evict_to_capacity(&mut self) {
        while self.usage > self.capacity {
            match self.blocks.pop_front() {
                Some((_, block)) => self.usage -= block.charge,
                None => {
                    self.usage = 0;
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(name: &str) -> TopicUUID {
        TopicUUID::new("guest", name)
    }

    fn cache(capacity: usize, block_size: usize) -> DataCache {
        DataCache::new(capacity, false, 10, block_size)
    }

    #[test]
    fn serves_stored_records_in_order() {
        let mut cache = cache(1 << 20, 4);
        for seqno in 1..=10 {
            cache.store(1, seqno, &topic("t"), Bytes::from(format!("m{seqno}")));
        }
        let mut seen = Vec::new();
        let result = cache.read(1, 1, None, |seqno, _, _| {
            seen.push(seqno);
            true
        });
        assert_eq!(seen, (1..=10).collect::<Vec<_>>());
        assert_eq!(result, CacheRead::ReadContinue(11));
    }

    #[test]
    fn store_is_idempotent() {
        let mut cache = cache(1 << 20, 4);
        cache.store(1, 1, &topic("t"), Bytes::from_static(b"first"));
        cache.store(1, 1, &topic("t"), Bytes::from_static(b"second"));
        assert_eq!(cache.stats().cache_inserts, 1);
        let mut payloads = Vec::new();
        cache.read(1, 1, None, |_, _, payload| {
            payloads.push(payload.clone());
            true
        });
        assert_eq!(payloads, vec![Bytes::from_static(b"first")]);
    }

    #[test]
    fn read_stops_at_a_hole() {
        let mut cache = cache(1 << 20, 8);
        cache.store(1, 1, &topic("t"), Bytes::from_static(b"a"));
        cache.store(1, 2, &topic("t"), Bytes::from_static(b"b"));
        cache.store(1, 4, &topic("t"), Bytes::from_static(b"d"));
        let mut seen = Vec::new();
        let result = cache.read(1, 1, None, |seqno, _, _| {
            seen.push(seqno);
            true
        });
        assert_eq!(seen, vec![1, 2]);
        assert_eq!(result, CacheRead::ReadContinue(3));
        assert_eq!(cache.read(1, 3, None, |_, _, _| true), CacheRead::NoneRead);
    }

    #[test]
    fn topic_filter_visits_only_matches_but_advances_over_all() {
        let mut cache = cache(1 << 20, 8);
        for seqno in 1..=6 {
            let name = if seqno % 2 == 1 { "a" } else { "b" };
            cache.store(1, seqno, &topic(name), Bytes::from_static(b"x"));
        }
        let wanted = topic("a");
        let mut seen = Vec::new();
        let result = cache.read(1, 1, Some(&wanted), |seqno, t, _| {
            assert_eq!(t, &wanted);
            seen.push(seqno);
            true
        });
        assert_eq!(seen, vec![1, 3, 5]);
        assert_eq!(result, CacheRead::ReadContinue(7));
    }

    #[test]
    fn bloom_skips_blocks_without_the_topic() {
        let mut cache = cache(1 << 20, 4);
        // Block [0..3] holds only topic a; block [4..7] only topic b.
        for seqno in 1..=3 {
            cache.store(1, seqno, &topic("a"), Bytes::from_static(b"x"));
        }
        for seqno in 4..=7 {
            cache.store(1, seqno, &topic("b"), Bytes::from_static(b"x"));
        }
        let wanted = topic("b");
        let mut seen = Vec::new();
        let result = cache.read(1, 1, Some(&wanted), |seqno, _, _| {
            seen.push(seqno);
            true
        });
        assert_eq!(seen, vec![4, 5, 6, 7]);
        assert_eq!(result, CacheRead::ReadContinue(8));
        assert!(cache.stats().bloom_hits >= 1, "filter never skipped a block");
    }

    #[test]
    fn visitor_backpressure_reports_backoff() {
        let mut cache = cache(1 << 20, 8);
        for seqno in 1..=5 {
            cache.store(1, seqno, &topic("t"), Bytes::from_static(b"x"));
        }
        let mut seen = 0;
        let result = cache.read(1, 1, None, |_, _, _| {
            seen += 1;
            seen < 2
        });
        assert_eq!(seen, 2);
        assert_eq!(result, CacheRead::ReadBackoff(3));
    }

    #[test]
    fn capacity_evicts_oldest_blocks() {
        let mut cache = cache(1_500, 4);
        for seqno in 1..=40 {
            cache.store(1, seqno, &topic("t"), Bytes::from(vec![0u8; 100]));
        }
        assert!(cache.usage() <= cache.capacity());
        assert!(!cache.has_entry(1, 1), "oldest block survived eviction");
        assert!(cache.has_entry(1, 40));
    }

    #[test]
    fn system_namespace_records_are_skipped_by_default() {
        let mut cache = cache(1 << 20, 4);
        cache.store(1, 1, &TopicUUID::new("_system", "t"), Bytes::from_static(b"x"));
        assert!(!cache.has_entry(1, 1));

        let mut system_cache = DataCache::new(1 << 20, true, 10, 4);
        system_cache.store(1, 1, &TopicUUID::new("_system", "t"), Bytes::from_static(b"x"));
        assert!(system_cache.has_entry(1, 1));
    }

    #[test]
    fn disabled_cache_accepts_and_serves_nothing() {
        let mut cache = cache(0, 4);
        cache.store(1, 1, &topic("t"), Bytes::from_static(b"x"));
        assert_eq!(cache.read(1, 1, None, |_, _, _| true), CacheRead::NoneRead);
        assert_eq!(cache.usage(), 0);
    }

    #[test]
    fn clear_and_resize() {
        let mut cache = cache(1 << 20, 4);
        cache.store(1, 1, &topic("t"), Bytes::from_static(b"x"));
        assert!(cache.usage() > 0);
        cache.clear();
        assert_eq!(cache.usage(), 0);
        assert!(!cache.has_entry(1, 1));

        cache.store(1, 1, &topic("t"), Bytes::from_static(b"x"));
        cache.set_capacity(0);
        assert_eq!(cache.usage(), 0);
        cache.store(1, 2, &topic("t"), Bytes::from_static(b"x"));
        assert!(!cache.has_entry(1, 2));
    }
}
