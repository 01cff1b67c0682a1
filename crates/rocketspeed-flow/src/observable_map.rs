// Coalescing key-value source for hot keys.
use rocketspeed_common::LinkedMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Map of keys to values that a worker loop can wait on.
///
/// If two writes to a key happen before the first is read, the writes are
/// merged and the reader sees only the latest value, so at most one value
/// is pending per key. Entries are read in insertion order (not update
/// order) to stay fair when only a few can be drained at once.
///
/// ```
/// use rocketspeed_flow::ObservableMap;
///
/// let map = ObservableMap::new("pending");
/// map.write("k", 1);
/// map.write("k", 2);
/// assert_eq!(map.pop(), Some(("k", 2)));
/// assert_eq!(map.pop(), None);
/// ```
pub struct ObservableMap<K, V> {
    shared: Arc<MapShared<K, V>>,
}

struct MapShared<K, V> {
    name: String,
    entries: Mutex<LinkedMap<K, V>>,
    notify: Notify,
}

impl<K: Eq + Hash + Clone, V> ObservableMap<K, V> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(MapShared {
                name: name.into(),
                entries: Mutex::new(LinkedMap::new()),
                notify: Notify::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Writes or coalesces; always accepted.
    pub fn write(&self, key: K, value: V) {
        let mut entries = self.shared.entries.lock().expect("map lock");
        entries.insert_back(key, value);
        drop(entries);
        self.shared.notify.notify_one();
    }

    /// Oldest pending entry, if any.
    pub fn pop(&self) -> Option<(K, V)> {
        self.shared.entries.lock().expect("map lock").pop_front()
    }

    /// Drops a pending entry for a key.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.shared.entries.lock().expect("map lock").remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.shared.entries.lock().expect("map lock").is_empty()
    }

    pub fn len(&self) -> usize {
        self.shared.entries.lock().expect("map lock").len()
    }

    /// Waits until at least one entry is pending.
    pub async fn readable(&self) {
        loop {
            let notified = self.shared.notify.notified();
            if !self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

impl<K, V> Clone for ObservableMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}
