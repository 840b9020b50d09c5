use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A message published to a bus topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    /// Topic the message is published to.
    pub topic: String,

    /// Partitioning key, when per-key ordering matters.
    pub key: Option<String>,

    /// The message payload as JSON.
    pub payload: serde_json::Value,

    /// Transport headers.
    pub headers: HashMap<String, String>,

    /// Offset assigned by the broker, once published.
    pub offset: Option<i64>,
}

impl BusMessage {
    /// Creates a new message builder for the given topic.
    pub fn builder(topic: impl Into<String>) -> BusMessageBuilder {
        BusMessageBuilder {
            topic: topic.into(),
            key: None,
            payload: None,
            headers: HashMap::new(),
        }
    }

    /// Creates a message with just a topic and payload.
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::builder(topic).payload_raw(payload).build()
    }

    /// Returns a header value by name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Builder for constructing bus messages.
#[derive(Debug)]
pub struct BusMessageBuilder {
    topic: String,
    key: Option<String>,
    payload: Option<serde_json::Value>,
    headers: HashMap<String, String>,
}

impl BusMessageBuilder {
    /// Sets the partitioning key.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Sets the payload from a serializable value.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    /// Sets the payload from a raw JSON value.
    pub fn payload_raw(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Adds a transport header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Builds the message. A missing payload becomes JSON null.
    pub fn build(self) -> BusMessage {
        BusMessage {
            topic: self.topic,
            key: self.key,
            payload: self.payload.unwrap_or(serde_json::Value::Null),
            headers: self.headers,
            offset: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_all_fields() {
        let message = BusMessage::builder("saga-events")
            .key("saga-123")
            .payload_raw(serde_json::json!({"kind": "saga_started"}))
            .header("event-type", "saga_started")
            .build();

        assert_eq!(message.topic, "saga-events");
        assert_eq!(message.key.as_deref(), Some("saga-123"));
        assert_eq!(message.payload["kind"], "saga_started");
        assert_eq!(message.header("event-type"), Some("saga_started"));
        assert_eq!(message.offset, None);
    }

    #[test]
    fn payload_serializes_typed_values() {
        #[derive(Serialize)]
        struct Command {
            action: &'static str,
        }

        let message = BusMessage::builder("saga-commands")
            .payload(&Command { action: "reserve" })
            .unwrap()
            .build();

        assert_eq!(message.payload["action"], "reserve");
    }

    #[test]
    fn missing_payload_defaults_to_null() {
        let message = BusMessage::builder("saga-events").build();
        assert!(message.payload.is_null());
    }

    #[test]
    fn message_serialization_roundtrip() {
        let message = BusMessage::new("orders", serde_json::json!({"id": 1}));
        let json = serde_json::to_string(&message).unwrap();
        let back: BusMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.topic, "orders");
        assert_eq!(back.payload, message.payload);
    }
}
