// Shared data types and small helpers used across crates.
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use xxhash_rust::xxh3::Xxh3;

pub mod linked_map;
pub use linked_map::LinkedMap;

/// Identifier of one append-only log in the storage service.
pub type LogId = u64;

/// Per-log sequence number. `0` is a sentinel for "the current tail" and
/// never appears on a real record.
pub type SeqNo = u64;

/// Identifier of one client stream on the transport layer.
pub type StreamId = u64;

/// Identifier of one subscription within a stream.
pub type SubscriptionId = u64;

/// Uniquely identifies one subscription: a `(stream, subscription)` pair.
///
/// ```
/// use rocketspeed_common::SubscriberId;
///
/// let id = SubscriberId::new(3, 7);
/// assert_eq!(id.stream_id, 3);
/// assert_eq!(id.to_string(), "Stream(3)::Sub(7)");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId {
    pub stream_id: StreamId,
    pub sub_id: SubscriptionId,
}

impl SubscriberId {
    pub fn new(stream_id: StreamId, sub_id: SubscriptionId) -> Self {
        Self { stream_id, sub_id }
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Stream({})::Sub({})", self.stream_id, self.sub_id)
    }
}

/// Canonical `(namespace, topic)` pair.
///
/// Equality and hashing are defined over both components. The routing hash
/// is stable across processes and platforms so that topic placement does
/// not change between hosts or restarts.
///
/// ```
/// use rocketspeed_common::TopicUUID;
///
/// let a = TopicUUID::new("guest", "orders");
/// let b = TopicUUID::new("guest", "orders");
/// assert_eq!(a, b);
/// assert_eq!(a.routing_hash(), b.routing_hash());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicUUID {
    namespace_id: String,
    topic_name: String,
}

impl TopicUUID {
    pub fn new(namespace_id: impl Into<String>, topic_name: impl Into<String>) -> Self {
        Self {
            namespace_id: namespace_id.into(),
            topic_name: topic_name.into(),
        }
    }

    pub fn namespace_id(&self) -> &str {
        &self.namespace_id
    }

    pub fn topic_name(&self) -> &str {
        &self.topic_name
    }

    // Namespaces beginning with an underscore are reserved for the system.
    pub fn is_system_namespace(&self) -> bool {
        self.namespace_id.starts_with('_')
    }

    /// Stable 64-bit hash used for routing topics to logs.
    pub fn routing_hash(&self) -> u64 {
        // Length-prefix the namespace so that (ab, c) and (a, bc) differ.
        let mut hasher = Xxh3::new();
        hasher.update(&(self.namespace_id.len() as u32).to_le_bytes());
        hasher.update(self.namespace_id.as_bytes());
        hasher.update(self.topic_name.as_bytes());
        hasher.digest()
    }
}

impl fmt::Display for TopicUUID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({}, {})", self.namespace_id, self.topic_name)
    }
}

/// Classifies a range of absent sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GapType {
    // No records were written in the range.
    Benign,
    // Records fell off the retention horizon.
    Retention,
    // Records were irrecoverably lost.
    DataLoss,
}

impl GapType {
    pub fn is_malignant(&self) -> bool {
        !matches!(self, GapType::Benign)
    }
}

impl fmt::Display for GapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GapType::Benign => "benign",
            GapType::Retention => "retention",
            GapType::DataLoss => "data loss",
        };
        write!(f, "{name}")
    }
}

/// Outcome reported on a subscription status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    NotFound,
}

/// Messages produced for subscribers on the transport layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A record on a topic. `prev_seqno` is the seqno of the previous
    /// record this subscriber received on the topic, or `0` for the first.
    Deliver {
        topic: TopicUUID,
        prev_seqno: SeqNo,
        seqno: SeqNo,
        payload: Bytes,
    },
    /// A range of sequence numbers with no records for the topic.
    Gap {
        topic: TopicUUID,
        gap_type: GapType,
        from: SeqNo,
        to: SeqNo,
    },
    /// Resolution of a subscription request that could not be served.
    SubscriptionStatus {
        topic: TopicUUID,
        sub_id: SubscriberId,
        status: StatusCode,
    },
}

impl Message {
    pub fn topic(&self) -> &TopicUUID {
        match self {
            Message::Deliver { topic, .. } => topic,
            Message::Gap { topic, .. } => topic,
            Message::SubscriptionStatus { topic, .. } => topic,
        }
    }
}

/// One outgoing transmission: a message plus its recipient set.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub recipients: Vec<SubscriberId>,
    pub message: Message,
}

impl Delivery {
    pub fn new(recipients: Vec<SubscriberId>, message: Message) -> Self {
        Self {
            recipients,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_hash_is_stable_and_component_sensitive() {
        let topic = TopicUUID::new("guest", "orders");
        // Stable across instances.
        assert_eq!(
            topic.routing_hash(),
            TopicUUID::new("guest", "orders").routing_hash()
        );
        // Length prefixing keeps shifted boundaries apart.
        assert_ne!(
            TopicUUID::new("ab", "c").routing_hash(),
            TopicUUID::new("a", "bc").routing_hash()
        );
    }

    #[test]
    fn system_namespace_detection() {
        assert!(TopicUUID::new("_checkpoints", "t").is_system_namespace());
        assert!(!TopicUUID::new("guest", "t").is_system_namespace());
    }

    #[test]
    fn subscriber_id_display() {
        let id = SubscriberId::new(10, 42);
        assert_eq!(id.to_string(), "Stream(10)::Sub(42)");
    }

    #[test]
    fn gap_type_malignancy() {
        assert!(!GapType::Benign.is_malignant());
        assert!(GapType::Retention.is_malignant());
        assert!(GapType::DataLoss.is_malignant());
    }

    #[test]
    fn message_topic_accessor() {
        let topic = TopicUUID::new("guest", "orders");
        let message = Message::Gap {
            topic: topic.clone(),
            gap_type: GapType::Benign,
            from: 1,
            to: 5,
        };
        assert_eq!(message.topic(), &topic);
    }
}
