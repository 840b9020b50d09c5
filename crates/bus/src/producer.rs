use async_trait::async_trait;

use crate::{BusMessage, Result};

/// Port for publishing messages to a broker.
///
/// Implementations wrap a concrete transport. Tests use
/// [`InMemoryBus`](crate::InMemoryBus); deployments plug in a real
/// broker client behind the same interface.
#[async_trait]
pub trait BusProducer: Send + Sync {
    /// Establishes the connection to the broker.
    async fn connect(&self) -> Result<()>;

    /// Flushes pending messages and tears down the connection.
    async fn disconnect(&self) -> Result<()>;

    /// Publishes one message, returning the offset the broker assigned.
    async fn publish(&self, message: BusMessage) -> Result<i64>;

    /// Whether the producer currently holds a connection.
    fn is_connected(&self) -> bool;
}
