//! Room and token access validation.
//!
//! Rooms, their whitelisted origins and API tokens live in an external store
//! behind the [`AccessStore`] trait. The [`AccessValidator`] applies the
//! relay's rules on top of it: token expiry, the best-effort "last used"
//! update, and origin normalization. Nothing here is cached; every call goes
//! to the store so policy changes apply to the next connect or publish.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

/// A room as resolved from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    /// Store identifier.
    pub id: i64,
    /// Routing key.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Largest accepted serialized payload, in bytes.
    pub max_payload_size: u64,
    /// Inactive rooms never resolve.
    pub active: bool,
}

/// An API token record, joined with the name of the room it is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiToken {
    /// Store identifier.
    pub id: i64,
    /// The bearer credential.
    pub token: String,
    /// Bound room id.
    pub room_id: i64,
    /// Bound room name.
    pub room_name: String,
    /// Label for operators.
    pub name: String,
    /// Active flag.
    pub active: bool,
    /// Optional expiry.
    pub expires_at: Option<DateTime<Utc>>,
    /// Last successful validation.
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ApiToken {
    /// Whether the token has expired at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| expires < now)
    }
}

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not answer.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Persistent lookup of rooms, origins and tokens.
#[async_trait]
pub trait AccessStore: Send + Sync {
    /// Find an active token bound to an active room.
    async fn find_token(&self, token: &str) -> Result<Option<ApiToken>, StoreError>;

    /// Find an active room by name.
    async fn find_active_room(&self, name: &str) -> Result<Option<Room>, StoreError>;

    /// Whether `hostname` is whitelisted for the room.
    async fn room_allows_origin(&self, room_id: i64, hostname: &str) -> Result<bool, StoreError>;

    /// Whether `hostname` is whitelisted for any room.
    async fn any_room_allows_origin(&self, hostname: &str) -> Result<bool, StoreError>;

    /// Record that a token was used.
    async fn touch_token(&self, token_id: i64, at: DateTime<Utc>) -> Result<(), StoreError>;
}

/// Access validation errors.
#[derive(Debug, Error)]
pub enum AccessError {
    /// No active token with an active room matches.
    #[error("Token not found")]
    TokenNotFound,

    /// Token matched but its expiry is in the past.
    #[error("Token expired")]
    TokenExpired,

    /// No active room with this name.
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Reduce an `Origin` or `Referer` header value to a bare hostname.
///
/// Strips everything up to and including `://`, then everything from the
/// first `/`, then everything from the first `:`.
///
/// ```
/// use air_core::access::normalize_origin;
///
/// assert_eq!(normalize_origin("https://example.com:3000/path"), "example.com");
/// assert_eq!(normalize_origin("http://localhost:8282"), "localhost");
/// ```
#[must_use]
pub fn normalize_origin(origin: &str) -> &str {
    let mut hostname = origin;
    if let Some(idx) = hostname.find("://") {
        hostname = &hostname[idx + 3..];
    }
    if let Some(idx) = hostname.find('/') {
        hostname = &hostname[..idx];
    }
    if let Some(idx) = hostname.find(':') {
        hostname = &hostname[..idx];
    }
    hostname
}

/// Applies the relay's access rules on top of an [`AccessStore`].
#[derive(Clone)]
pub struct AccessValidator {
    store: Arc<dyn AccessStore>,
}

impl AccessValidator {
    /// Create a validator over a store.
    #[must_use]
    pub fn new(store: Arc<dyn AccessStore>) -> Self {
        Self { store }
    }

    /// Validate a bearer token.
    ///
    /// On success a detached task records the "last used" timestamp; its
    /// outcome never affects the caller.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::TokenNotFound`], [`AccessError::TokenExpired`],
    /// or a store error.
    pub async fn validate_token(&self, token: &str) -> Result<ApiToken, AccessError> {
        let api_token = self
            .store
            .find_token(token)
            .await?
            .ok_or(AccessError::TokenNotFound)?;

        let now = Utc::now();
        if api_token.is_expired_at(now) {
            debug!(token_id = api_token.id, "Rejecting expired token");
            return Err(AccessError::TokenExpired);
        }

        let store = Arc::clone(&self.store);
        let token_id = api_token.id;
        tokio::spawn(async move {
            if let Err(e) = store.touch_token(token_id, now).await {
                debug!(token_id, error = %e, "Failed to record token use");
            }
        });

        Ok(api_token)
    }

    /// Resolve an active room by name.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::RoomNotFound`] or a store error.
    pub async fn validate_room(&self, name: &str) -> Result<Room, AccessError> {
        self.store
            .find_active_room(name)
            .await?
            .ok_or_else(|| AccessError::RoomNotFound(name.to_string()))
    }

    /// Check an `Origin` header against a room's whitelist.
    ///
    /// An empty origin is always rejected.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn validate_origin(&self, room_id: i64, origin: &str) -> Result<bool, AccessError> {
        let hostname = normalize_origin(origin);
        if hostname.is_empty() {
            trace!(room_id, "Rejecting empty origin");
            return Ok(false);
        }
        Ok(self.store.room_allows_origin(room_id, hostname).await?)
    }

    /// Check an `Origin`/`Referer` header against every room's whitelist.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn validate_any_origin(&self, origin: &str) -> Result<bool, AccessError> {
        let hostname = normalize_origin(origin);
        if hostname.is_empty() {
            return Ok(false);
        }
        Ok(self.store.any_room_allows_origin(hostname).await?)
    }
}
