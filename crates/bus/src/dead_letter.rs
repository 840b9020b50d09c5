use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

use crate::{BusMessage, BusProducer, Result};

/// Routes messages whose processing permanently failed to a quarantine
/// topic.
///
/// The original payload is wrapped in an envelope recording where the
/// message came from and why it failed, so operators can inspect and
/// replay it later. Connection lifecycle mirrors the wrapped producer.
pub struct DeadLetterQueue<P> {
    producer: P,
    topic: String,
    sent: Arc<AtomicU64>,
}

impl<P: Clone> Clone for DeadLetterQueue<P> {
    fn clone(&self) -> Self {
        Self {
            producer: self.producer.clone(),
            topic: self.topic.clone(),
            sent: Arc::clone(&self.sent),
        }
    }
}

impl<P: BusProducer> DeadLetterQueue<P> {
    /// Creates a queue publishing to `topic` via `producer`.
    pub fn new(producer: P, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
            sent: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The quarantine topic name.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Number of messages quarantined through this queue.
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }

    /// Connects the underlying producer.
    pub async fn connect(&self) -> Result<()> {
        self.producer.connect().await
    }

    /// Disconnects the underlying producer.
    pub async fn disconnect(&self) -> Result<()> {
        self.producer.disconnect().await
    }

    /// Whether the underlying producer is connected.
    pub fn is_connected(&self) -> bool {
        self.producer.is_connected()
    }

    /// Quarantines `message`, recording the failure reason.
    ///
    /// Returns the offset assigned on the quarantine topic.
    pub async fn send(&self, message: &BusMessage, error: &str) -> Result<i64> {
        let mut builder = BusMessage::builder(&self.topic)
            .payload_raw(serde_json::json!({
                "originalTopic": message.topic,
                "originalOffset": message.offset,
                "errorMessage": error,
                "failedAt": Utc::now().to_rfc3339(),
                "originalMessage": message.payload,
            }))
            .header("dlq-original-topic", &message.topic)
            .header("dlq-error", error);
        // Keep the partition key so replays preserve per-key ordering.
        if let Some(key) = &message.key {
            builder = builder.key(key);
        }

        let offset = self.producer.publish(builder.build()).await?;
        self.sent.fetch_add(1, Ordering::SeqCst);
        tracing::warn!(
            original_topic = %message.topic,
            dlq_topic = %self.topic,
            offset,
            error,
            "message quarantined"
        );
        Ok(offset)
    }
}
