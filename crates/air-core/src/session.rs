//! Per-connection session lifecycle.
//!
//! ```text
//! Connecting ──▶ Validating ──▶ Active ──▶ Closing ──▶ Terminated
//!                    │                                     ▲
//!                    └────────── rejected ─────────────────┘
//! ```
//!
//! [`Session::admit`] covers `Connecting`/`Validating` and runs before the
//! transport upgrade so rejections can still be answered over HTTP.
//! [`Session::start`] registers the connection and announces it;
//! [`Session::run`] drives the read loop and always finishes with cleanup.

use air_protocol::{codec, ClientAction, Envelope};
use air_transport::{FrameSink, FrameSource, Inbound};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::access::{AccessError, AccessValidator, Room};
use crate::dispatcher::{DispatchError, DispatchHandle, DispatchRequest};
use crate::registry::{ConnectionHandle, Identity, Registry, RegistryError};

/// Session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Request received, nothing checked yet.
    Connecting,
    /// Checking room, identity and origin.
    Validating,
    /// Registered and relaying frames.
    Active,
    /// Read loop finished, cleanup pending.
    Closing,
    /// Unregistered and closed.
    Terminated,
}

/// Connection parameters as supplied by the client.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectParams {
    /// Room name.
    pub channel: Option<String>,
    /// User id.
    pub id: Option<String>,
    /// Display name.
    pub name: Option<String>,
}

/// Why a connection was refused before upgrade.
#[derive(Debug, Error)]
pub enum AdmitError {
    /// No room name given.
    #[error("channel query parameter required")]
    MissingChannel,

    /// No user id or display name given.
    #[error("id and name query parameters required")]
    MissingIdentity,

    /// Origin is not whitelisted for the room.
    #[error("Origin not allowed")]
    OriginNotAllowed,

    /// Room lookup failed or the store is unavailable.
    #[error(transparent)]
    Access(#[from] AccessError),
}

/// A connection that passed validation and may be upgraded.
#[derive(Debug, Clone)]
pub struct Admission {
    /// The resolved room.
    pub room: Room,
    /// The caller's identity.
    pub identity: Identity,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

/// A registered, active connection.
pub struct Session {
    state: SessionState,
    room: Room,
    handle: Arc<ConnectionHandle>,
    registry: Arc<Registry>,
    dispatch: DispatchHandle,
}

impl Session {
    /// Validate connection parameters and origin.
    ///
    /// # Errors
    ///
    /// Returns an [`AdmitError`] describing the rejection.
    pub async fn admit(
        validator: &AccessValidator,
        params: ConnectParams,
        origin: &str,
    ) -> Result<Admission, AdmitError> {
        let channel = non_empty(params.channel).ok_or(AdmitError::MissingChannel)?;
        let (user_id, name) = match (non_empty(params.id), non_empty(params.name)) {
            (Some(id), Some(name)) => (id, name),
            _ => return Err(AdmitError::MissingIdentity),
        };

        let state = transition(SessionState::Connecting, SessionState::Validating, &channel);
        let room = validator.validate_room(&channel).await?;
        if !validator.validate_origin(room.id, origin).await? {
            transition(state, SessionState::Terminated, &channel);
            warn!(room = %channel, origin = %origin, "Origin not allowed");
            return Err(AdmitError::OriginNotAllowed);
        }

        Ok(Admission {
            room,
            identity: Identity::new(user_id, name),
        })
    }

    /// Register an admitted connection and announce it to its room.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is already registered.
    pub async fn start(
        admission: Admission,
        sink: Arc<dyn FrameSink>,
        registry: Arc<Registry>,
        dispatch: DispatchHandle,
    ) -> Result<Self, RegistryError> {
        let Admission { room, identity } = admission;
        let handle = Arc::new(ConnectionHandle::new(room.name.clone(), identity, sink));
        registry.register(Arc::clone(&handle))?;

        let mut session = Self {
            state: SessionState::Validating,
            room,
            handle,
            registry,
            dispatch,
        };
        session.set_state(SessionState::Active);

        info!(
            room = %session.room.name,
            connection = %session.handle.id(),
            user = %session.handle.identity().user_id,
            "Connection established"
        );

        let identity = session.handle.identity();
        match codec::encode(&Envelope::join(&identity.user_id, &identity.name)) {
            Ok(payload) => {
                let join = DispatchRequest::Broadcast {
                    room: session.room.name.clone(),
                    payload,
                    sender: Some(session.handle.id().clone()),
                };
                if let Err(e) = session.dispatch.submit(join).await {
                    error!(error = %e, "Failed to announce join");
                }
            }
            Err(e) => error!(error = %e, "Failed to encode join"),
        }
        let userlist = DispatchRequest::UserList {
            room: session.room.name.clone(),
        };
        if let Err(e) = session.dispatch.submit(userlist).await {
            error!(error = %e, "Failed to refresh user list");
        }

        Ok(session)
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The registered connection.
    #[must_use]
    pub fn handle(&self) -> &Arc<ConnectionHandle> {
        &self.handle
    }

    fn set_state(&mut self, next: SessionState) {
        self.state = transition(self.state, next, &self.room.name);
    }

    /// Drive the read loop until the connection ends, then clean up.
    ///
    /// Returns the final state, which is always [`SessionState::Terminated`].
    pub async fn run<S: FrameSource>(mut self, mut source: S) -> SessionState {
        loop {
            match source.recv().await {
                Ok(Some(Inbound::Text(text))) => {
                    if let Err(e) = self.handle_text(&text).await {
                        warn!(connection = %self.handle.id(), error = %e, "Dispatcher unavailable");
                        break;
                    }
                }
                // Transports that answer pings themselves never yield them.
                Ok(Some(Inbound::Ping(payload))) => {
                    if let Err(e) = self.handle.pong(payload).await {
                        debug!(connection = %self.handle.id(), error = %e, "Failed to answer ping");
                        break;
                    }
                }
                Ok(Some(Inbound::Close)) => {
                    debug!(connection = %self.handle.id(), "Received close frame");
                    break;
                }
                Ok(None) => {
                    debug!(connection = %self.handle.id(), "Stream ended");
                    break;
                }
                Err(e) => {
                    debug!(connection = %self.handle.id(), error = %e, "Transport error");
                    break;
                }
            }
        }

        self.set_state(SessionState::Closing);
        self.terminate().await;
        self.state
    }

    async fn handle_text(&self, text: &str) -> Result<(), DispatchError> {
        let room = &self.room.name;
        let action = match codec::decode_client(text, room) {
            Ok(action) => action,
            Err(e) => {
                trace!(connection = %self.handle.id(), error = %e, "Dropping frame");
                return Ok(());
            }
        };

        let identity = self.handle.identity();
        let request = match action {
            ClientAction::Typing => {
                let Some(payload) = encode(&Envelope::typing(&identity.user_id, &identity.name))
                else {
                    return Ok(());
                };
                DispatchRequest::Typing {
                    room: room.clone(),
                    payload,
                    sender: self.handle.id().clone(),
                }
            }
            ClientAction::Direct { to, data } => {
                let Some(target) = self.registry.find_by_room_and_id(room, &to) else {
                    trace!(connection = %self.handle.id(), to = %to, "Direct target not found");
                    return Ok(());
                };
                let Some(payload) =
                    encode(&Envelope::direct(&identity.user_id, &identity.name, data))
                else {
                    return Ok(());
                };
                if !self.within_limit(payload.len()).await {
                    return Ok(());
                }
                DispatchRequest::Direct {
                    room: room.clone(),
                    payload,
                    sender: self.handle.id().clone(),
                    target: target.id().clone(),
                }
            }
            ClientAction::Message { data } => {
                let Some(payload) =
                    encode(&Envelope::message(&identity.user_id, &identity.name, data))
                else {
                    return Ok(());
                };
                if !self.within_limit(payload.len()).await {
                    return Ok(());
                }
                DispatchRequest::Broadcast {
                    room: room.clone(),
                    payload,
                    sender: Some(self.handle.id().clone()),
                }
            }
        };

        self.dispatch.submit(request).await
    }

    /// Check a payload against the room limit, answering the sender inline
    /// when it is too large.
    async fn within_limit(&self, size: usize) -> bool {
        let Err(e) = codec::check_size(size, self.room.max_payload_size) else {
            return true;
        };

        debug!(connection = %self.handle.id(), size, limit = self.room.max_payload_size, "Payload too large");
        match codec::encode_error(e.to_string()) {
            Ok(frame) => {
                if let Err(e) = self.handle.send(frame).await {
                    debug!(connection = %self.handle.id(), error = %e, "Failed to send error frame");
                }
            }
            Err(e) => error!(error = %e, "Failed to encode error frame"),
        }
        false
    }

    /// Requests announcing this connection's departure.
    fn farewell(&self) -> Vec<DispatchRequest> {
        let identity = self.handle.identity();
        let mut requests = Vec::with_capacity(2);
        if let Some(payload) = encode(&Envelope::leave(&identity.user_id, &identity.name)) {
            requests.push(DispatchRequest::Broadcast {
                room: self.room.name.clone(),
                payload,
                sender: None,
            });
        }
        requests.push(DispatchRequest::UserList {
            room: self.room.name.clone(),
        });
        requests
    }

    async fn terminate(&mut self) {
        self.registry.unregister(&self.handle);

        for request in self.farewell() {
            if let Err(e) = self.dispatch.submit(request).await {
                warn!(room = %self.room.name, error = %e, "Failed to announce departure");
            }
        }

        if let Err(e) = self.handle.close().await {
            trace!(connection = %self.handle.id(), error = %e, "Close failed");
        }

        self.set_state(SessionState::Terminated);
        info!(
            room = %self.room.name,
            connection = %self.handle.id(),
            user = %self.handle.identity().user_id,
            duration_ms = self.handle.age().as_millis() as u64,
            "Connection terminated"
        );
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state == SessionState::Terminated {
            return;
        }

        // The read loop was cancelled before cleanup finished. If the
        // connection is already gone, the departure was announced.
        warn!(connection = %self.handle.id(), "Session dropped while {:?}", self.state);
        if !self.registry.unregister(&self.handle) {
            return;
        }
        let requests = self.farewell();
        let dispatch = self.dispatch.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                for request in requests {
                    let _ = dispatch.submit(request).await;
                }
            });
        }
    }
}

fn transition(from: SessionState, to: SessionState, room: &str) -> SessionState {
    trace!(room = %room, "Session {:?} -> {:?}", from, to);
    to
}

fn encode(envelope: &Envelope) -> Option<bytes::Bytes> {
    codec::encode(envelope)
        .map_err(|e| error!(kind = %envelope.kind, error = %e, "Failed to encode envelope"))
        .ok()
}
