// Append-side helper standing in for the publish path.
use anyhow::Result;
use bytes::Bytes;
use rocketspeed_common::{GapType, SeqNo, TopicUUID};
use rocketspeed_router::LogRouter;
use rocketspeed_storage::MemoryLogStorage;
use std::sync::Arc;

/// Publishes records into the log a topic routes to.
pub struct Publisher {
    storage: Arc<MemoryLogStorage>,
    router: Arc<LogRouter>,
}

impl Publisher {
    pub fn new(storage: Arc<MemoryLogStorage>, router: Arc<LogRouter>) -> Self {
        Self { storage, router }
    }

    pub fn publish(&self, topic: &TopicUUID, payload: impl Into<Bytes>) -> Result<SeqNo> {
        let log_id = self.router.route(topic)?;
        Ok(self.storage.append(log_id, topic, payload.into()))
    }

    /// Publishes `count` records, returning the first and last seqno.
    pub fn publish_many(&self, topic: &TopicUUID, count: usize) -> Result<(SeqNo, SeqNo)> {
        let mut first = 0;
        let mut last = 0;
        for i in 0..count {
            let seqno = self.publish(topic, format!("payload-{i}"))?;
            if first == 0 {
                first = seqno;
            }
            last = seqno;
        }
        Ok((first, last))
    }

    /// Injects a storage gap into the topic's log.
    pub fn inject_gap(
        &self,
        topic: &TopicUUID,
        gap_type: GapType,
        len: u64,
    ) -> Result<(SeqNo, SeqNo)> {
        let log_id = self.router.route(topic)?;
        Ok(self.storage.inject_gap(log_id, gap_type, len))
    }
}
