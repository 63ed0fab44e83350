//! # air-protocol
//!
//! Wire protocol definitions for the Air realtime relay.
//!
//! Every frame is a JSON text frame. The relay writes [`Envelope`]s tagged
//! with a [`MessageType`]; clients send loosely-typed objects that are
//! classified into a [`ClientAction`] by [`codec::decode_client`].
//!
//! ## Message Types
//!
//! - `message` - Room-wide broadcast
//! - `direct` - Delivered to a single user
//! - `typing` - Typing indicator
//! - `join` / `leave` - Membership notifications
//! - `userlist` - Current participants
//!
//! ## Example
//!
//! ```rust
//! use air_protocol::{codec, ClientAction};
//!
//! let action = codec::decode_client(r#"{"channel":"lobby","data":"hi"}"#, "lobby").unwrap();
//! assert!(matches!(action, ClientAction::Message { .. }));
//! ```

pub mod codec;
pub mod frames;

pub use codec::{check_size, decode_client, encode, ClientAction, ProtocolError};
pub use frames::{Envelope, ErrorFrame, MessageType, UserInfo};
