//! WebSocket transport implementation.
//!
//! Adapts an upgraded axum [`WebSocket`] into the [`FrameSink`] /
//! [`FrameSource`] halves the relay works with.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::traits::{FrameSink, FrameSource, Inbound, TransportError};

/// Split an upgraded socket into its write and read halves.
#[must_use]
pub fn split(socket: WebSocket) -> (WebSocketSink, WebSocketSource) {
    let (sink, stream) = socket.split();
    (
        WebSocketSink {
            sink: Mutex::new(sink),
            is_open: AtomicBool::new(true),
        },
        WebSocketSource { stream },
    )
}

/// Write half of a WebSocket connection.
pub struct WebSocketSink {
    sink: Mutex<SplitSink<WebSocket, Message>>,
    is_open: AtomicBool,
}

impl WebSocketSink {
    async fn send_message(&self, message: Message) -> Result<(), TransportError> {
        if !self.is_open.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        let mut sink = self.sink.lock().await;
        sink.send(message).await.map_err(|e| {
            self.is_open.store(false, Ordering::SeqCst);
            TransportError::SendFailed(e.to_string())
        })
    }
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send_text(&self, data: Bytes) -> Result<(), TransportError> {
        let text = String::from_utf8(data.to_vec()).map_err(|_| TransportError::InvalidText)?;
        self.send_message(Message::Text(text)).await
    }

    async fn send_pong(&self, payload: Bytes) -> Result<(), TransportError> {
        self.send_message(Message::Pong(payload.to_vec())).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.is_open.swap(false, Ordering::SeqCst) {
            return Ok(()); // Already closed
        }

        let mut sink = self.sink.lock().await;
        sink.close()
            .await
            .map_err(|e| TransportError::SendFailed(format!("Failed to close: {}", e)))
    }

    fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }
}

/// Read half of a WebSocket connection.
pub struct WebSocketSource {
    stream: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameSource for WebSocketSource {
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(Inbound::Text(text))),
                Some(Ok(Message::Ping(data))) => {
                    // tungstenite queues the pong itself.
                    trace!(bytes = data.len(), "Ping answered by protocol layer");
                }
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame");
                    return Ok(Some(Inbound::Close));
                }
                Some(Ok(Message::Binary(data))) => {
                    trace!(bytes = data.len(), "Ignoring binary frame");
                }
                Some(Ok(Message::Pong(_))) => {
                    // Ignore pong messages
                }
                Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
                None => {
                    debug!("WebSocket stream ended");
                    return Ok(None);
                }
            }
        }
    }
}
