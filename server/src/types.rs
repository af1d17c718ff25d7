//! Message types flowing through the Huddle hub.
//!
//! [`Message`] is the internal model. It is immutable once built and is shared
//! between mailboxes as `Arc<Message>`. [`InboundFrame`] and [`OutboundFrame`]
//! are the JSON shapes exchanged with WebSocket clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Generated by the hub (join/leave notices).
    System,
    /// Sent to every member of a room.
    Broadcast,
    /// Sent from one identity to another.
    Direct,
}

impl MessageKind {
    /// The `type` value used on the wire for this kind.
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Broadcast => "message",
            Self::Direct => "private",
        }
    }
}

/// A single chat message.
///
/// Built only through [`Message::system`], [`Message::broadcast`] and
/// [`Message::direct`], which guarantee that `recipient` is set iff the kind is
/// [`MessageKind::Direct`] and `room` is set iff the kind is
/// [`MessageKind::Broadcast`]. Blank bodies never produce a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    kind: MessageKind,
    sender: String,
    recipient: Option<String>,
    room: Option<String>,
    body: String,
    timestamp: DateTime<Utc>,
}

impl Message {
    /// Creates a hub-generated notice about `subject` (e.g. "joined room lobby").
    pub fn system(subject: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::System,
            sender: subject.into(),
            recipient: None,
            room: None,
            body: text.into(),
            timestamp: Utc::now(),
        }
    }

    /// Creates a room broadcast, or `None` if `text` is blank.
    ///
    /// # Example
    ///
    /// ```rust
    /// use huddle_server::types::{Message, MessageKind};
    ///
    /// let msg = Message::broadcast("alice", "lobby", "  hi  ").unwrap();
    /// assert_eq!(msg.kind(), MessageKind::Broadcast);
    /// assert_eq!(msg.body(), "hi");
    /// assert_eq!(msg.room(), Some("lobby"));
    ///
    /// assert!(Message::broadcast("alice", "lobby", "   ").is_none());
    /// ```
    pub fn broadcast(sender: &str, room: &str, text: &str) -> Option<Self> {
        let body = non_blank(text)?;
        Some(Self {
            kind: MessageKind::Broadcast,
            sender: sender.trim().to_string(),
            recipient: None,
            room: Some(room.to_string()),
            body,
            timestamp: Utc::now(),
        })
    }

    /// Creates a direct message, or `None` if `text` or `recipient` is blank.
    pub fn direct(sender: &str, recipient: &str, text: &str) -> Option<Self> {
        let body = non_blank(text)?;
        let recipient = non_blank(recipient)?;
        Some(Self {
            kind: MessageKind::Direct,
            sender: sender.trim().to_string(),
            recipient: Some(recipient),
            room: None,
            body,
            timestamp: Utc::now(),
        })
    }

    /// Returns the same message stamped with `timestamp`.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn recipient(&self) -> Option<&str> {
        self.recipient.as_deref()
    }

    pub fn room(&self) -> Option<&str> {
        self.room.as_deref()
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Serializes the message into its outbound JSON representation.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&OutboundFrame::from(self))
    }
}

fn non_blank(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// A message as received from a client.
///
/// `type` is advisory only: routing is decided by the presence of `to`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundFrame {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default)]
    pub text: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

impl InboundFrame {
    /// Converts the frame into a message from `sender` in `room`.
    ///
    /// A non-blank `to` makes it a direct message; otherwise it is broadcast to
    /// `room`. Returns `None` for blank text.
    pub fn into_message(self, sender: &str, room: &str) -> Option<Message> {
        match self.to.as_deref().map(str::trim).filter(|to| !to.is_empty()) {
            Some(to) => Message::direct(sender, to, &self.text),
            None => Message::broadcast(sender, room, &self.text),
        }
    }
}

/// A message as delivered to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundFrame {
    #[serde(rename = "type")]
    pub kind: String,

    pub from: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,

    pub text: String,

    /// Unix timestamp in seconds.
    pub timestamp: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
}

impl From<&Message> for OutboundFrame {
    fn from(msg: &Message) -> Self {
        Self {
            kind: msg.kind.wire_name().to_string(),
            from: msg.sender.clone(),
            to: msg.recipient.clone(),
            text: msg.body.clone(),
            timestamp: msg.timestamp.timestamp(),
            room: msg.room.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn broadcast_sets_room_and_no_recipient() {
        let msg = Message::broadcast("alice", "lobby", "hello").unwrap();
        assert_eq!(msg.kind(), MessageKind::Broadcast);
        assert_eq!(msg.room(), Some("lobby"));
        assert_eq!(msg.recipient(), None);
        assert_eq!(msg.sender(), "alice");
    }

    #[test]
    fn direct_sets_recipient_and_no_room() {
        let msg = Message::direct("alice", " bob ", "psst").unwrap();
        assert_eq!(msg.kind(), MessageKind::Direct);
        assert_eq!(msg.recipient(), Some("bob"));
        assert_eq!(msg.room(), None);
    }

    #[test]
    fn system_has_neither_room_nor_recipient() {
        let msg = Message::system("alice", "joined room lobby");
        assert_eq!(msg.kind(), MessageKind::System);
        assert_eq!(msg.room(), None);
        assert_eq!(msg.recipient(), None);
    }

    #[test]
    fn blank_text_produces_no_message() {
        assert!(Message::broadcast("alice", "lobby", "").is_none());
        assert!(Message::broadcast("alice", "lobby", " \t\n ").is_none());
        assert!(Message::direct("alice", "bob", "   ").is_none());
    }

    #[test]
    fn blank_recipient_produces_no_direct_message() {
        assert!(Message::direct("alice", "  ", "hi").is_none());
    }

    #[test]
    fn inbound_with_to_becomes_direct_regardless_of_type() {
        let frame: InboundFrame =
            serde_json::from_str(r#"{"type":"message","text":"hi","to":"bob"}"#).unwrap();
        let msg = frame.into_message("alice", "lobby").unwrap();
        assert_eq!(msg.kind(), MessageKind::Direct);
        assert_eq!(msg.recipient(), Some("bob"));
    }

    #[test]
    fn inbound_with_blank_to_becomes_broadcast() {
        let frame: InboundFrame = serde_json::from_str(r#"{"text":"hi","to":"  "}"#).unwrap();
        let msg = frame.into_message("alice", "lobby").unwrap();
        assert_eq!(msg.kind(), MessageKind::Broadcast);
        assert_eq!(msg.room(), Some("lobby"));
    }

    #[test]
    fn inbound_missing_fields_defaults_to_blank() {
        let frame: InboundFrame = serde_json::from_str("{}").unwrap();
        assert!(frame.into_message("alice", "lobby").is_none());
    }

    #[test]
    fn outbound_broadcast_json_shape() {
        let ts = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let msg = Message::broadcast("alice", "lobby", "hi")
            .unwrap()
            .with_timestamp(ts);

        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "type": "message",
                "from": "alice",
                "text": "hi",
                "timestamp": 1_700_000_000,
                "room": "lobby"
            })
        );
    }

    #[test]
    fn outbound_direct_json_has_to_and_no_room() {
        let msg = Message::direct("alice", "bob", "secret").unwrap();
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "private");
        assert_eq!(value["to"], "bob");
        assert!(value.get("room").is_none());
    }
}
