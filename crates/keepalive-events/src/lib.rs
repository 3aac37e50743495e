//! In-process notifications from the keep-alive core.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

pub mod topics;

/// One published notification. `seq` increases by one per publish on a bus.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Envelope {
    pub seq: u64,
    /// RFC3339, millisecond precision.
    pub time: String,
    pub kind: String,
    pub payload: Value,
}

impl Envelope {
    pub fn is(&self, topic: &str) -> bool {
        self.kind == topic
    }
}

/// Fan-out of supervisor notifications to any number of listeners.
///
/// Publishing never blocks and never fails: with no subscribers the
/// envelope is dropped, and slow subscribers observe `Lagged`.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Envelope>,
    published: Arc<AtomicU64>,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            published: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Envelopes published so far, delivered or not.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Publishes `payload` under `kind`; returns how many subscribers got it.
    pub fn publish<T: Serialize>(&self, kind: &str, payload: &T) -> usize {
        let payload = serde_json::to_value(payload)
            .unwrap_or_else(|err| serde_json::json!({ "error": err.to_string() }));
        let envelope = Envelope {
            seq: self.published.fetch_add(1, Ordering::Relaxed) + 1,
            time: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            kind: kind.to_string(),
            payload,
        };
        self.tx.send(envelope).unwrap_or(0)
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("subscribers", &self.tx.receiver_count())
            .field("published", &self.published())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribers_receive_numbered_envelopes() {
        let bus = Bus::new(8);
        let mut rx = bus.subscribe();
        assert_eq!(
            bus.publish(topics::TOPIC_STATE_CHANGED, &json!({"from": "idle", "to": "running"})),
            1
        );
        bus.publish(topics::TOPIC_POLICY_CHANGED, &json!({"to": "high"}));

        let first = rx.recv().await.expect("envelope");
        assert!(first.is(topics::TOPIC_STATE_CHANGED));
        assert_eq!(first.seq, 1);
        assert_eq!(first.payload["to"], "running");
        assert!(first.time.ends_with('Z'));
        assert_eq!(rx.recv().await.expect("envelope").seq, 2);
    }

    #[test]
    fn publishing_without_subscribers_still_counts() {
        let bus = Bus::new(0);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.publish(topics::TOPIC_HEARTBEAT_RECORDED, &json!({"seq": 1})), 0);
        assert_eq!(bus.published(), 1);
    }

    #[test]
    fn clones_share_the_channel() {
        let bus = Bus::new(4);
        let other = bus.clone();
        let mut rx = bus.subscribe();
        other.publish(topics::TOPIC_LOGS_CLEARED, &json!({"removed": 3}));
        let env = rx.try_recv().expect("envelope");
        assert_eq!(env.payload["removed"], 3);
        assert_eq!(bus.published(), 1);
    }
}
