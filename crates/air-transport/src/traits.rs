//! Transport abstraction traits for Air.
//!
//! A live connection is split into a [`FrameSink`], shared between the
//! dispatcher and the connection's own session, and a [`FrameSource`], owned
//! exclusively by the session's read loop.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
///
/// This is the relay's own handle for a connection, distinct from the
/// caller-supplied user id: two connections may carry the same user id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a process-unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let n = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}", n))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Outbound frame is not valid UTF-8 text.
    #[error("Frame is not valid UTF-8")]
    InvalidText,
}

/// One unit read from a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A complete text frame.
    Text(String),
    /// A ping control frame the session must answer.
    Ping(Bytes),
    /// The peer asked to close the connection.
    Close,
}

/// The write half of a connection.
///
/// Implementations serialize concurrent writers internally; every method
/// takes `&self` so the sink can be shared behind an `Arc`.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Write a text frame.
    async fn send_text(&self, data: Bytes) -> Result<(), TransportError>;

    /// Answer a ping with a pong carrying the same payload.
    async fn send_pong(&self, payload: Bytes) -> Result<(), TransportError>;

    /// Close the connection. Closing twice is a no-op.
    async fn close(&self) -> Result<(), TransportError>;

    /// Check if the connection is still open for writing.
    fn is_open(&self) -> bool;
}

/// The read half of a connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Receive the next inbound unit.
    ///
    /// Returns `Ok(None)` when the stream ends without a close frame. Binary
    /// frames and pongs are consumed and skipped by implementations, as are
    /// pings when the underlying protocol answers them automatically.
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError>;
}
