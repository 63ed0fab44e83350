//! # air-core
//!
//! Rooms, sessions and message routing for the Air relay.
//!
//! - **Access** - room, origin and token validation over an [`AccessStore`]
//! - **Registry** - live connections partitioned by room
//! - **Dispatcher** - single serialized fan-out queue
//! - **Session** - per-connection lifecycle and inbound frame handling
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Session   │────▶│ Dispatcher  │────▶│  Registry   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        │                   ▲
//!        ▼                   │
//! ┌─────────────┐     ┌─────────────┐
//! │   Access    │     │ Publish API │
//! └─────────────┘     └─────────────┘
//! ```

pub mod access;
pub mod dispatcher;
pub mod registry;
pub mod session;
pub mod store;

pub use access::{AccessError, AccessStore, AccessValidator, ApiToken, Room, StoreError};
pub use dispatcher::{
    DispatchError, DispatchHandle, DispatchRequest, DispatchStats, Dispatcher,
    DEFAULT_QUEUE_CAPACITY,
};
pub use registry::{ConnectionHandle, Identity, Registry, RegistryError, RegistryStats};
pub use session::{Admission, AdmitError, ConnectParams, Session, SessionState};
pub use store::MemoryAccessStore;
