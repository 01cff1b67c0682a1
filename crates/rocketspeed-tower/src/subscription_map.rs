// Stream -> subscription lookup, optimized for whole-stream teardown.
use rocketspeed_common::{StreamId, SubscriptionId};
use std::collections::HashMap;

/// Maps a `(stream, subscription)` pair to any value.
#[derive(Debug)]
pub struct SubscriptionMap<T> {
    map: HashMap<StreamId, HashMap<SubscriptionId, T>>,
}

impl<T> SubscriptionMap<T> {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    pub fn find(&self, stream_id: StreamId, sub_id: SubscriptionId) -> Option<&T> {
        self.map.get(&stream_id)?.get(&sub_id)
    }

    pub fn insert(&mut self, stream_id: StreamId, sub_id: SubscriptionId, value: T) {
        self.map.entry(stream_id).or_default().insert(sub_id, value);
    }

    /// Removes and returns one subscription's value.
    pub fn move_out(&mut self, stream_id: StreamId, sub_id: SubscriptionId) -> Option<T> {
        let subs = self.map.get_mut(&stream_id)?;
        let value = subs.remove(&sub_id)?;
        if subs.is_empty() {
            self.map.remove(&stream_id);
        }
        Some(value)
    }

    /// Removes a whole stream, returning its subscriptions.
    pub fn remove_stream(&mut self, stream_id: StreamId) -> Option<HashMap<SubscriptionId, T>> {
        self.map.remove(&stream_id)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl<T> Default for SubscriptionMap<T> {
    fn default() -> Self {
        Self::new()
    }
}
