//! In-memory transport.
//!
//! [`pair`] returns the relay-side halves of a connection together with a
//! [`MemoryPeer`] that plays the client. Used by the test suites and by
//! embedders that bridge the relay to something other than a socket.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

use crate::traits::{FrameSink, FrameSource, Inbound, TransportError};

/// A frame written by the relay, as seen by the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Text frame.
    Text(Bytes),
    /// Pong reply.
    Pong(Bytes),
    /// The relay closed the connection.
    Close,
}

impl Outbound {
    /// The text payload, if this is a text frame.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Outbound::Text(data) => std::str::from_utf8(data).ok(),
            _ => None,
        }
    }
}

/// Create a connected sink/source pair and the peer driving it.
#[must_use]
pub fn pair() -> (MemorySink, MemorySource, MemoryPeer) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    (
        MemorySink {
            tx: out_tx,
            is_open: AtomicBool::new(true),
        },
        MemorySource { rx: in_rx },
        MemoryPeer {
            tx: in_tx,
            rx: out_rx,
        },
    )
}

/// Relay-side write half.
pub struct MemorySink {
    tx: mpsc::UnboundedSender<Outbound>,
    is_open: AtomicBool,
}

impl MemorySink {
    fn push(&self, frame: Outbound) -> Result<(), TransportError> {
        if !self.is_open.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        self.tx
            .send(frame)
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_text(&self, data: Bytes) -> Result<(), TransportError> {
        self.push(Outbound::Text(data))
    }

    async fn send_pong(&self, payload: Bytes) -> Result<(), TransportError> {
        self.push(Outbound::Pong(payload))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.is_open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        // The peer may already be gone.
        let _ = self.tx.send(Outbound::Close);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst) && !self.tx.is_closed()
    }
}

/// Relay-side read half.
pub struct MemorySource {
    rx: mpsc::UnboundedReceiver<Result<Inbound, String>>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
        match self.rx.recv().await {
            Some(Ok(inbound)) => Ok(Some(inbound)),
            Some(Err(reason)) => Err(TransportError::ReceiveFailed(reason)),
            None => Ok(None),
        }
    }
}

/// The client end of an in-memory connection.
///
/// Dropping the peer ends the relay's read stream and makes every later
/// write to the sink fail.
pub struct MemoryPeer {
    tx: mpsc::UnboundedSender<Result<Inbound, String>>,
    rx: mpsc::UnboundedReceiver<Outbound>,
}

impl MemoryPeer {
    /// Send a text frame to the relay.
    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.tx.send(Ok(Inbound::Text(text.into())));
    }

    /// Send a ping to the relay.
    pub fn ping(&self, payload: impl Into<Bytes>) {
        let _ = self.tx.send(Ok(Inbound::Ping(payload.into())));
    }

    /// Send a close frame to the relay.
    pub fn close(&self) {
        let _ = self.tx.send(Ok(Inbound::Close));
    }

    /// Make the relay's next read fail with a transport error.
    pub fn fail(&self, reason: impl Into<String>) {
        let _ = self.tx.send(Err(reason.into()));
    }

    /// Wait for the next frame written by the relay.
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.rx.recv().await
    }

    /// Take the next frame written by the relay, if one is already queued.
    pub fn try_recv(&mut self) -> Option<Outbound> {
        self.rx.try_recv().ok()
    }
}
