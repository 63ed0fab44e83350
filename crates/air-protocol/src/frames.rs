//! Frame types for the Air protocol.
//!
//! Everything the relay writes to a connection is an [`Envelope`] encoded as a
//! JSON text frame, except inline errors which use [`ErrorFrame`]. Frames sent
//! by clients are not modelled as a struct: they are classified field by field
//! in [`crate::codec::decode_client`] because clients may send arbitrary extra
//! keys.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message type tags carried in the `type` field of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Room-wide chat message.
    Message,
    /// Message addressed to a single user.
    Direct,
    /// Typing indicator.
    Typing,
    /// A user joined the room.
    Join,
    /// A user left the room.
    Leave,
    /// Current participants of the room.
    Userlist,
}

impl MessageType {
    /// The wire name of this type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Message => "message",
            MessageType::Direct => "direct",
            MessageType::Typing => "typing",
            MessageType::Join => "join",
            MessageType::Leave => "leave",
            MessageType::Userlist => "userlist",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A participant as listed in a `userlist` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserInfo {
    /// Caller-supplied user id.
    pub id: String,
    /// Display name.
    pub name: String,
}

impl UserInfo {
    /// Create a new user entry.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// A relay-produced frame.
///
/// `from` and `sender` are always stamped by the relay from the registered
/// identity of the originating connection; they are never copied from client
/// input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type.
    #[serde(rename = "type")]
    pub kind: MessageType,

    /// Opaque application payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Target user id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,

    /// Originating user id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    /// Originating display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,

    /// Participants, only on `userlist`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users: Option<Vec<UserInfo>>,
}

impl Envelope {
    fn stamped(kind: MessageType, from: &str, sender: &str) -> Self {
        Self {
            kind,
            data: None,
            to: None,
            from: Some(from.to_string()),
            sender: Some(sender.to_string()),
            users: None,
        }
    }

    /// Create a room-wide `message` envelope.
    #[must_use]
    pub fn message(from: &str, sender: &str, data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::stamped(MessageType::Message, from, sender)
        }
    }

    /// Create a `direct` envelope.
    #[must_use]
    pub fn direct(from: &str, sender: &str, data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::stamped(MessageType::Direct, from, sender)
        }
    }

    /// Create a `typing` envelope.
    #[must_use]
    pub fn typing(from: &str, sender: &str) -> Self {
        Self::stamped(MessageType::Typing, from, sender)
    }

    /// Create a `join` envelope.
    #[must_use]
    pub fn join(from: &str, sender: &str) -> Self {
        Self::stamped(MessageType::Join, from, sender)
    }

    /// Create a `leave` envelope.
    #[must_use]
    pub fn leave(from: &str, sender: &str) -> Self {
        Self::stamped(MessageType::Leave, from, sender)
    }

    /// Create a `userlist` envelope.
    ///
    /// `users` is serialized even when empty.
    #[must_use]
    pub fn userlist(users: Vec<UserInfo>) -> Self {
        Self {
            kind: MessageType::Userlist,
            data: None,
            to: None,
            from: None,
            sender: None,
            users: Some(users),
        }
    }
}

/// Inline error sent back to a single connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    /// Human-readable error message.
    pub error: String,
}

impl ErrorFrame {
    /// Create a new error frame.
    #[must_use]
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}
