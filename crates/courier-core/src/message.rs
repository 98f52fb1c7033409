//! Message types for Courier.
//!
//! A [`Message`] is created by a publisher, stamped with an id when it is
//! appended to a topic's store, and never changed afterwards.

use bytes::Bytes;
use std::time::{SystemTime, UNIX_EPOCH};

/// A message identifier, unique and increasing within one topic.
pub type MessageId = u64;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// A published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Id assigned by the topic store. Zero until stored.
    pub id: MessageId,
    /// Identity of the producer.
    pub source: String,
    /// Topic key.
    pub key: String,
    /// Opaque payload.
    pub value: Bytes,
    /// Command correlation id, if this message carries a command.
    pub command_id: Option<String>,
    /// Whether the producer waits for an acknowledgment.
    pub wait_for_ack: bool,
    /// Creation time in milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl Message {
    /// Create a new message.
    #[must_use]
    pub fn new(source: impl Into<String>, key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            id: 0,
            source: source.into(),
            key: key.into(),
            value: value.into(),
            command_id: None,
            wait_for_ack: false,
            timestamp: now_millis(),
        }
    }

    /// Attach a command correlation id.
    #[must_use]
    pub fn with_command_id(mut self, command_id: impl Into<String>) -> Self {
        self.command_id = Some(command_id.into());
        self
    }

    /// Request an acknowledgment for this message.
    #[must_use]
    pub fn with_ack(mut self) -> Self {
        self.wait_for_ack = true;
        self
    }

    /// Whether this message carries a command.
    #[must_use]
    pub fn is_command(&self) -> bool {
        self.command_id.is_some()
    }

    /// Get the payload bytes.
    #[must_use]
    pub fn value(&self) -> &Bytes {
        &self.value
    }

    /// Get the payload size in bytes.
    #[must_use]
    pub fn value_size(&self) -> usize {
        self.value.len()
    }

    pub(crate) fn stamped(mut self, id: MessageId) -> Self {
        self.id = id;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_creation() {
        let msg = Message::new("server", "chat", b"hello".to_vec());
        assert_eq!(msg.id, 0);
        assert_eq!(msg.source, "server");
        assert_eq!(msg.key, "chat");
        assert_eq!(&msg.value[..], b"hello");
        assert_eq!(msg.value_size(), 5);
        assert!(!msg.is_command());
        assert!(!msg.wait_for_ack);
        assert!(msg.timestamp > 0);
    }

    #[test]
    fn test_message_with_command() {
        let msg = Message::new("conn-1", "hub", "payload")
            .with_command_id("cmd-7")
            .with_ack();

        assert!(msg.is_command());
        assert_eq!(msg.command_id.as_deref(), Some("cmd-7"));
        assert!(msg.wait_for_ack);
    }

    #[test]
    fn test_stamped_keeps_content() {
        let msg = Message::new("a", "b", "c");
        let stamped = msg.clone().stamped(9);
        assert_eq!(stamped.id, 9);
        assert_eq!(stamped.value, msg.value);
    }
}
