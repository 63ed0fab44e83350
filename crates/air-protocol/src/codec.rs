//! Codec for Air frames.
//!
//! Frames are JSON text. Outbound envelopes are encoded once into [`Bytes`]
//! so the dispatcher can hand the same buffer to every recipient. Inbound
//! client frames are decoded into a [`ClientAction`] after checking them
//! against the room the connection is bound to.

use bytes::Bytes;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::frames::{Envelope, ErrorFrame, MessageType};

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame is not valid JSON.
    #[error("Decoding error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Frame is valid JSON but not an object.
    #[error("Frame is not a JSON object")]
    NotAnObject,

    /// A required field is absent or has the wrong JSON type.
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    /// Frame addresses a room other than the connection's own.
    #[error("Frame for room {got} sent on a connection bound to {expected}")]
    WrongChannel {
        /// Room the connection is bound to.
        expected: String,
        /// Room named in the frame.
        got: String,
    },

    /// Serialized payload exceeds the room limit.
    #[error("Message size {size} bytes exceeds room limit of {limit} bytes")]
    TooLarge {
        /// Serialized size in bytes.
        size: usize,
        /// Room limit in bytes.
        limit: u64,
    },

    /// Encoding failed.
    #[error("Encoding error: {0}")]
    Encode(serde_json::Error),
}

/// What a valid client frame asks the relay to do.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientAction {
    /// Broadcast `data` to the rest of the room.
    Message {
        /// Application payload.
        data: Value,
    },
    /// Deliver `data` to the user with id `to`.
    Direct {
        /// Target user id.
        to: String,
        /// Application payload.
        data: Value,
    },
    /// Announce that the sender is typing.
    Typing,
}

impl ClientAction {
    /// The envelope type this action produces.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            ClientAction::Message { .. } => MessageType::Message,
            ClientAction::Direct { .. } => MessageType::Direct,
            ClientAction::Typing => MessageType::Typing,
        }
    }
}

/// Encode an envelope to bytes.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(envelope: &Envelope) -> Result<Bytes, ProtocolError> {
    let data = serde_json::to_vec(envelope).map_err(ProtocolError::Encode)?;
    Ok(Bytes::from(data))
}

/// Encode an inline error frame.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_error(message: impl Into<String>) -> Result<Bytes, ProtocolError> {
    let data = serde_json::to_vec(&ErrorFrame::new(message)).map_err(ProtocolError::Encode)?;
    Ok(Bytes::from(data))
}

/// Re-serialize an arbitrary JSON object for a server-originated broadcast.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_object(object: &Map<String, Value>) -> Result<Bytes, ProtocolError> {
    let data = serde_json::to_vec(object).map_err(ProtocolError::Encode)?;
    Ok(Bytes::from(data))
}

/// Decode and classify a text frame sent by a connection bound to `room`.
///
/// The `type` field defaults to `message`; anything other than `typing` and
/// `direct` is treated as `message`.
///
/// # Errors
///
/// Returns an error if the frame is not a JSON object, names another room,
/// or lacks a field its type requires.
pub fn decode_client(text: &str, room: &str) -> Result<ClientAction, ProtocolError> {
    let value: Value = serde_json::from_str(text)?;
    let Value::Object(mut object) = value else {
        return Err(ProtocolError::NotAnObject);
    };

    let channel = object
        .get("channel")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingField("channel"))?;
    if channel != room {
        return Err(ProtocolError::WrongChannel {
            expected: room.to_string(),
            got: channel.to_string(),
        });
    }

    let kind = object
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("message")
        .to_string();

    match kind.as_str() {
        "typing" => Ok(ClientAction::Typing),
        "direct" => {
            let to = object
                .get("to")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or(ProtocolError::MissingField("to"))?;
            let data = object
                .remove("data")
                .ok_or(ProtocolError::MissingField("data"))?;
            Ok(ClientAction::Direct { to, data })
        }
        _ => {
            let data = object
                .remove("data")
                .ok_or(ProtocolError::MissingField("data"))?;
            Ok(ClientAction::Message { data })
        }
    }
}

/// Check a serialized payload length against a room limit.
///
/// A payload of exactly `limit` bytes is accepted.
///
/// # Errors
///
/// Returns [`ProtocolError::TooLarge`] if `size` is strictly greater than `limit`.
pub fn check_size(size: usize, limit: u64) -> Result<(), ProtocolError> {
    if size as u64 > limit {
        return Err(ProtocolError::TooLarge { size, limit });
    }
    Ok(())
}
