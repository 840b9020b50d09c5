//! Saga event observers.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::events::SagaEvent;

/// Result type for listener callbacks.
pub type ListenerResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Observes saga lifecycle events.
///
/// The orchestrator notifies every registered listener after an event
/// is published. Listener errors are logged and never affect saga
/// execution or the other listeners.
#[async_trait]
pub trait SagaListener: Send + Sync {
    async fn on_event(&self, event: &SagaEvent) -> ListenerResult;

    /// Name used in logs when the listener fails.
    fn name(&self) -> &str {
        "listener"
    }
}

/// Logs every saga event at info level.
#[derive(Debug, Default)]
pub struct LoggingListener;

#[async_trait]
impl SagaListener for LoggingListener {
    async fn on_event(&self, event: &SagaEvent) -> ListenerResult {
        tracing::info!(
            kind = %event.kind,
            saga_id = %event.saga_id,
            definition = %event.definition_id,
            step = event.step_id.as_deref(),
            "saga event"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "logging"
    }
}

/// Forwards every saga event into an unbounded channel.
///
/// Useful in tests and consumers that want to await specific lifecycle
/// points without polling.
pub struct ChannelListener {
    sender: mpsc::UnboundedSender<SagaEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SagaEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl SagaListener for ChannelListener {
    async fn on_event(&self, event: &SagaEvent) -> ListenerResult {
        self.sender.send(event.clone())?;
        Ok(())
    }

    fn name(&self) -> &str {
        "channel"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::SagaId;

    #[tokio::test]
    async fn test_channel_listener_forwards_events() {
        let (listener, mut receiver) = ChannelListener::new();
        let event = SagaEvent::saga_started(SagaId::new(), "order");

        listener.on_event(&event).await.unwrap();

        let forwarded = receiver.recv().await.unwrap();
        assert_eq!(forwarded.kind, event.kind);
        assert_eq!(forwarded.saga_id, event.saga_id);
    }

    #[tokio::test]
    async fn test_channel_listener_errors_once_receiver_is_dropped() {
        let (listener, receiver) = ChannelListener::new();
        drop(receiver);

        let event = SagaEvent::saga_started(SagaId::new(), "order");
        assert!(listener.on_event(&event).await.is_err());
    }
}
