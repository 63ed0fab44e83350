//! # air-transport
//!
//! Transport abstraction layer for the Air realtime relay.
//!
//! The relay never touches a socket directly. Every live connection is split
//! into two halves:
//!
//! - **[`FrameSink`]** - shared write half, used by the dispatcher for fan-out
//!   and by the session for pongs and inline errors
//! - **[`FrameSource`]** - exclusive read half, drained by the session
//!
//! Two transports are provided:
//!
//! - **WebSocket** - axum upgrade adapter (feature `websocket`, on by default)
//! - **Memory** - channel-backed pair for tests and embedding
//!
//! ```rust,ignore
//! use air_transport::{FrameSource, Inbound};
//!
//! async fn drain(mut source: impl FrameSource) {
//!     while let Ok(Some(unit)) = source.recv().await {
//!         if unit == Inbound::Close {
//!             break;
//!         }
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{ConnectionId, FrameSink, FrameSource, Inbound, TransportError};
