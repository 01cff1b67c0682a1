// Collects deliveries from the tower's client queues for assertions.
use bytes::Bytes;
use rocketspeed_common::{Delivery, GapType, Message, SeqNo, StatusCode, SubscriberId};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Everything the tower has sent so far, in arrival order.
#[derive(Clone)]
pub struct DeliveryLog {
    entries: Arc<Mutex<Vec<Delivery>>>,
}

impl DeliveryLog {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Spawns a drain task per receiver.
    pub fn collect(receivers: Vec<mpsc::Receiver<Delivery>>) -> Self {
        let log = Self::new();
        for mut receiver in receivers {
            let log = log.clone();
            tokio::spawn(async move {
                while let Some(delivery) = receiver.recv().await {
                    log.push(delivery);
                }
            });
        }
        log
    }

    pub fn push(&self, delivery: Delivery) {
        self.entries.lock().expect("delivery log").push(delivery);
    }

    pub fn snapshot(&self) -> Vec<Delivery> {
        self.entries.lock().expect("delivery log").clone()
    }

    /// `(prev_seqno, seqno, payload)` of every record a subscriber got.
    pub fn records_for(&self, id: SubscriberId) -> Vec<(SeqNo, SeqNo, Bytes)> {
        self.snapshot()
            .into_iter()
            .filter(|delivery| delivery.recipients.contains(&id))
            .filter_map(|delivery| match delivery.message {
                Message::Deliver {
                    prev_seqno,
                    seqno,
                    payload,
                    ..
                } => Some((prev_seqno, seqno, payload)),
                _ => None,
            })
            .collect()
    }

    /// `(type, from, to)` of every gap a subscriber got.
    pub fn gaps_for(&self, id: SubscriberId) -> Vec<(GapType, SeqNo, SeqNo)> {
        self.snapshot()
            .into_iter()
            .filter(|delivery| delivery.recipients.contains(&id))
            .filter_map(|delivery| match delivery.message {
                Message::Gap {
                    gap_type, from, to, ..
                } => Some((gap_type, from, to)),
                _ => None,
            })
            .collect()
    }

    pub fn statuses_for(&self, id: SubscriberId) -> Vec<StatusCode> {
        self.snapshot()
            .into_iter()
            .filter(|delivery| delivery.recipients.contains(&id))
            .filter_map(|delivery| match delivery.message {
                Message::SubscriptionStatus { status, .. } => Some(status),
                _ => None,
            })
            .collect()
    }

    pub fn count_for(&self, id: SubscriberId) -> usize {
        self.snapshot()
            .iter()
            .filter(|delivery| delivery.recipients.contains(&id))
            .count()
    }

    /// Polls until `predicate` holds or a timeout expires.
    pub async fn wait_until(
        &self,
        what: &str,
        predicate: impl Fn(&DeliveryLog) -> bool,
    ) -> anyhow::Result<()> {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if predicate(self) {
                return Ok(());
            }
            if Instant::now() > deadline {
                anyhow::bail!("timed out waiting for {what}");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl Default for DeliveryLog {
    fn default() -> Self {
        Self::new()
    }
}
