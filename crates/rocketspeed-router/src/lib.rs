// Deterministic topic-to-log routing over a contiguous log range.
use rocketspeed_common::{LogId, TopicUUID};

pub type Result<T> = std::result::Result<T, RouterError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    #[error("no log available for topic {0}")]
    NoLogForTopic(String),
}

/// Maps topics onto a fixed range of logs using the topic's routing hash.
///
/// Many topics share one log; the mapping is stable across processes so
/// that every host resolves a topic to the same log.
///
/// ```
/// use rocketspeed_common::TopicUUID;
/// use rocketspeed_router::LogRouter;
///
/// let router = LogRouter::new(1, 16);
/// let topic = TopicUUID::new("guest", "orders");
/// let log = router.route(&topic).expect("route");
/// assert!((1..17).contains(&log));
/// assert_eq!(router.route(&topic).expect("route"), log);
/// ```
#[derive(Debug, Clone)]
pub struct LogRouter {
    // First log in the assigned range.
    first_log: LogId,
    // Number of logs in the range.
    num_logs: u64,
    // Bumped on reconfiguration so stale routes can be detected.
    version: u64,
}

impl LogRouter {
    pub fn new(first_log: LogId, num_logs: u64) -> Self {
        Self {
            first_log,
            num_logs,
            version: 0,
        }
    }

    /// Resolves the log serving a topic.
    pub fn route(&self, topic: &TopicUUID) -> Result<LogId> {
        if self.num_logs == 0 {
            return Err(RouterError::NoLogForTopic(topic.to_string()));
        }
        Ok(self.first_log + topic.routing_hash() % self.num_logs)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn num_logs(&self) -> u64 {
        self.num_logs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_within_range() {
        let router = LogRouter::new(100, 8);
        for i in 0..64 {
            let topic = TopicUUID::new("guest", format!("topic-{i}"));
            let log = router.route(&topic).expect("route");
            assert!((100..108).contains(&log));
        }
    }

    #[test]
    fn routing_is_deterministic() {
        let a = LogRouter::new(1, 32);
        let b = LogRouter::new(1, 32);
        let topic = TopicUUID::new("guest", "orders");
        assert_eq!(a.route(&topic).expect("route"), b.route(&topic).expect("route"));
    }

    #[test]
    fn empty_range_is_a_miss() {
        let router = LogRouter::new(1, 0);
        let topic = TopicUUID::new("guest", "orders");
        assert!(matches!(
            router.route(&topic),
            Err(RouterError::NoLogForTopic(_))
        ));
    }

    #[test]
    fn single_log_routes_everything_together() {
        let router = LogRouter::new(7, 1);
        assert_eq!(
            router.route(&TopicUUID::new("guest", "a")).expect("route"),
            7
        );
        assert_eq!(
            router.route(&TopicUUID::new("guest", "b")).expect("route"),
            7
        );
    }
}
