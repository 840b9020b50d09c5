use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc};

use crate::{BusError, BusMessage, BusProducer, Result};

/// In-memory message bus for testing.
///
/// Stores published messages per topic, assigns sequential offsets, and
/// can be told to fail publishes to exercise error paths. Clones share
/// the same underlying state.
#[derive(Clone)]
pub struct InMemoryBus {
    inner: Arc<BusInner>,
}

#[derive(Default)]
struct BusInner {
    connected: AtomicBool,
    fail_on_publish: AtomicBool,
    topics: RwLock<HashMap<String, Vec<BusMessage>>>,
    subscribers: RwLock<HashMap<String, Vec<mpsc::UnboundedSender<BusMessage>>>>,
}

impl InMemoryBus {
    /// Creates a bus that starts connected.
    pub fn new() -> Self {
        let bus = Self {
            inner: Arc::new(BusInner::default()),
        };
        bus.inner.connected.store(true, Ordering::SeqCst);
        bus
    }

    /// Creates a bus that must be connected before use.
    pub fn disconnected() -> Self {
        Self {
            inner: Arc::new(BusInner::default()),
        }
    }

    /// Makes subsequent publishes fail with a broker error.
    pub fn set_fail_on_publish(&self, fail: bool) {
        self.inner.fail_on_publish.store(fail, Ordering::SeqCst);
    }

    /// Returns all messages published to `topic`, in publish order.
    pub async fn published(&self, topic: &str) -> Vec<BusMessage> {
        self.inner
            .topics
            .read()
            .await
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Total number of messages across all topics.
    pub async fn published_count(&self) -> usize {
        self.inner.topics.read().await.values().map(Vec::len).sum()
    }

    /// Subscribes to a topic; every subsequent publish to it is
    /// forwarded to the returned channel.
    pub async fn subscribe(&self, topic: &str) -> mpsc::UnboundedReceiver<BusMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .subscribers
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Clears all stored messages.
    pub async fn clear(&self) {
        self.inner.topics.write().await.clear();
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BusProducer for InMemoryBus {
    async fn connect(&self) -> Result<()> {
        self.inner.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, message: BusMessage) -> Result<i64> {
        if !self.inner.connected.load(Ordering::SeqCst) {
            return Err(BusError::NotConnected);
        }
        if self.inner.fail_on_publish.load(Ordering::SeqCst) {
            return Err(BusError::Publish {
                topic: message.topic.clone(),
                message: "simulated publish failure".to_string(),
            });
        }

        let mut stored = message;
        let offset = {
            let mut topics = self.inner.topics.write().await;
            let entries = topics.entry(stored.topic.clone()).or_default();
            let offset = entries.len() as i64;
            stored.offset = Some(offset);
            entries.push(stored.clone());
            offset
        };

        let subscribers = self.inner.subscribers.read().await;
        if let Some(senders) = subscribers.get(&stored.topic) {
            for sender in senders {
                // Dropped receivers are fine; the message is still stored.
                let _ = sender.send(stored.clone());
            }
        }

        Ok(offset)
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}
