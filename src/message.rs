use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::ops::Deref;
use std::time::{Duration, Instant};

/// Identifier carried by a message for correlation and duplicate detection.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(String);

impl MessageId {
    fn random() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }
}

impl Deref for MessageId {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::random()
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<MessageId> for String {
    fn from(value: MessageId) -> Self {
        value.0
    }
}

/// An outbound message queued for delivery to the hub.
#[derive(Debug, Clone)]
pub struct Message {
    id: Option<MessageId>,
    payload: Bytes,
    created_at: Instant,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            id: None,
            payload: payload.into(),
            created_at: Instant::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<MessageId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn id(&self) -> Option<&MessageId> {
        self.id.as_ref()
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Time elapsed since the message was created.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Outcome a handler chooses for an inbound message.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// The message was processed and must not be redelivered.
    Complete,
    /// The message is unprocessable and must not be redelivered.
    Reject,
    /// Processing did not happen. The hub may redeliver.
    Abandon,
}

impl Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Disposition::Complete => f.write_str("complete"),
            Disposition::Reject => f.write_str("reject"),
            Disposition::Abandon => f.write_str("abandon"),
        }
    }
}

/// Lifecycle of an inbound message on the device side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryState {
    #[default]
    Pending,
    Completed,
    Rejected,
    Abandoned,
}

impl Display for DeliveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryState::Pending => f.write_str("pending"),
            DeliveryState::Completed => f.write_str("completed"),
            DeliveryState::Rejected => f.write_str("rejected"),
            DeliveryState::Abandoned => f.write_str("abandoned"),
        }
    }
}

impl From<Disposition> for DeliveryState {
    fn from(disposition: Disposition) -> Self {
        match disposition {
            Disposition::Complete => DeliveryState::Completed,
            Disposition::Reject => DeliveryState::Rejected,
            Disposition::Abandon => DeliveryState::Abandoned,
        }
    }
}

/// A message received from the hub, handed to the registered handler.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    id: MessageId,
    payload: Bytes,
    state: DeliveryState,
}

impl InboundMessage {
    pub(crate) fn new(id: MessageId, payload: Bytes) -> Self {
        Self {
            id,
            payload,
            state: DeliveryState::Pending,
        }
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn state(&self) -> DeliveryState {
        self.state
    }

    pub(crate) fn settle(&mut self, disposition: Disposition) {
        self.state = disposition.into();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_message_id_defaults_to_random() {
        let a = MessageId::default();
        let b = MessageId::default();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn test_message_with_id() {
        let message = Message::new("hello").with_id("m-1");
        assert_eq!(message.id(), Some(&MessageId::from("m-1")));
        assert_eq!(message.payload().as_ref(), b"hello");
    }

    #[test]
    fn test_message_without_id() {
        let message = Message::new("hello");
        assert_eq!(message.id(), None);
    }

    #[test]
    fn test_age_tracks_time_since_creation() {
        let message = Message::new("hello");
        assert!(message.age() < Duration::from_secs(1));
        std::thread::sleep(Duration::from_millis(10));
        assert!(message.age() >= Duration::from_millis(10));
    }

    #[test]
    fn test_settle_tracks_disposition() {
        let mut message = InboundMessage::new("m-1".into(), Bytes::from_static(b"{}"));
        assert_eq!(message.state(), DeliveryState::Pending);
        message.settle(Disposition::Complete);
        assert_eq!(message.state(), DeliveryState::Completed);
    }
}
