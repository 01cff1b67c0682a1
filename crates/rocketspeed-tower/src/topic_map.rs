// Topic-to-subscriber bookkeeping for one log.
use rocketspeed_common::{SeqNo, SubscriberId, TopicUUID};
use std::collections::HashMap;

/// One subscription on a topic.
///
/// `next_seqno` is the next sequence number the subscriber is waiting
/// for; `0` marks a tail subscription with no concrete position yet.
/// `delivered` is the seqno of the last record actually sent to this
/// subscriber on the topic, which is what the next record's `prev_seqno`
/// chains from. Two subscribers of the same record can therefore carry
/// different `prev_seqno`s.
#[derive(Debug, Clone)]
pub struct TopicSubscription {
    id: SubscriberId,
    next_seqno: SeqNo,
    delivered: Option<SeqNo>,
}

impl TopicSubscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn next_seqno(&self) -> SeqNo {
        self.next_seqno
    }

    /// Chain value for the next record delivered to this subscriber.
    pub fn prev_seqno(&self) -> SeqNo {
        self.delivered.unwrap_or(0)
    }

    /// Advances the cursor without delivering a record (gaps, bumps).
    pub fn advance_to(&mut self, next_seqno: SeqNo) {
        self.next_seqno = next_seqno;
    }

    /// Marks a record delivery at `seqno`.
    pub fn record_delivery(&mut self, seqno: SeqNo) {
        self.delivered = Some(seqno);
        self.next_seqno = seqno + 1;
    }

    /// Forgets the chain; the next record is reported as a first record.
    pub fn reset_history(&mut self) {
        self.delivered = None;
    }
}

/// Tracks the subscriber set of every topic on one log.
#[derive(Debug, Default)]
pub struct TopicManager {
    topics: HashMap<TopicUUID, Vec<TopicSubscription>>,
}

impl TopicManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or repositions a subscription. `delivered` seeds the chain
    /// for subscriptions handed off from the cache. Returns true when the
    /// subscriber was new on this topic.
    pub fn add_subscriber(
        &mut self,
        topic: &TopicUUID,
        seqno: SeqNo,
        id: SubscriberId,
        delivered: Option<SeqNo>,
    ) -> bool {
        let subs = self.topics.entry(topic.clone()).or_default();
        for sub in subs.iter_mut() {
            if sub.id == id {
                sub.next_seqno = seqno;
                sub.delivered = delivered;
                return false;
            }
        }
        subs.push(TopicSubscription {
            id,
            next_seqno: seqno,
            delivered,
        });
        true
    }

    /// Removes a subscription; true when it was present.
    pub fn remove_subscriber(&mut self, topic: &TopicUUID, id: SubscriberId) -> bool {
        let Some(subs) = self.topics.get_mut(topic) else {
            return false;
        };
        let Some(pos) = subs.iter().position(|sub| sub.id == id) else {
            return false;
        };
        subs.remove(pos);
        if subs.is_empty() {
            self.topics.remove(topic);
        }
        true
    }

    pub fn has_subscribers(&self, topic: &TopicUUID) -> bool {
        self.topics.get(topic).is_some_and(|subs| !subs.is_empty())
    }

    /// Invokes `visit` once for every subscriber whose `next_seqno` lies
    /// in `[from, to]`. A tail subscription (`next_seqno == 0`) matches
    /// only the exact visit `from == to == 0`.
    pub fn visit_subscribers(
        &mut self,
        topic: &TopicUUID,
        from: SeqNo,
        to: SeqNo,
        mut visit: impl FnMut(&mut TopicSubscription),
    ) {
        let Some(subs) = self.topics.get_mut(topic) else {
            return;
        };
        for sub in subs.iter_mut() {
            let matches = if sub.next_seqno == 0 {
                from == 0 && to == 0
            } else {
                from <= sub.next_seqno && sub.next_seqno <= to
            };
            if matches {
                visit(sub);
            }
        }
    }

    /// Enumerates topics with at least one subscriber; `visit` returns
    /// false to stop early.
    pub fn visit_topics(&self, mut visit: impl FnMut(&TopicUUID) -> bool) {
        for topic in self.topics.keys() {
            if !visit(topic) {
                break;
            }
        }
    }

    pub fn subscribed_topics(&self) -> Vec<TopicUUID> {
        self.topics.keys().cloned().collect()
    }

    /// The only subscribed topic, when there is exactly one. Used to arm
    /// the cache's bloom lookups.
    pub fn single_topic(&self) -> Option<TopicUUID> {
        if self.topics.len() == 1 {
            self.topics.keys().next().cloned()
        } else {
            None
        }
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}
