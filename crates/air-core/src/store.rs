//! In-memory [`AccessStore`].
//!
//! Backs the test suites and the server's `memory` store backend, where
//! rooms, origins and tokens are seeded from configuration.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::debug;

use crate::access::{AccessStore, ApiToken, Room, StoreError};

/// Rooms, whitelisted origins and tokens held in memory.
#[derive(Debug)]
pub struct MemoryAccessStore {
    rooms: DashMap<String, Room>,
    origins: DashMap<i64, HashSet<String>>,
    tokens: DashMap<String, ApiToken>,
    next_id: AtomicI64,
}

impl MemoryAccessStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            origins: DashMap::new(),
            tokens: DashMap::new(),
            next_id: AtomicI64::new(1),
        }
    }

    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Add an active room, replacing any room with the same name.
    pub fn add_room(&self, name: &str, max_payload_size: u64) -> Room {
        let room = Room {
            id: self.next_id(),
            name: name.to_string(),
            description: String::new(),
            max_payload_size,
            active: true,
        };
        self.rooms.insert(name.to_string(), room.clone());
        debug!(room = %name, "Seeded room");
        room
    }

    /// Activate or deactivate a room. Returns `false` if it does not exist.
    pub fn set_room_active(&self, name: &str, active: bool) -> bool {
        match self.rooms.get_mut(name) {
            Some(mut room) => {
                room.active = active;
                true
            }
            None => false,
        }
    }

    /// Whitelist a hostname for a room. Returns `false` if the room does not exist.
    pub fn allow_origin(&self, room_name: &str, hostname: &str) -> bool {
        let Some(room_id) = self.rooms.get(room_name).map(|r| r.id) else {
            return false;
        };
        self.origins
            .entry(room_id)
            .or_default()
            .insert(hostname.to_string());
        true
    }

    /// Add an active token bound to a room. Returns `None` if the room does not exist.
    pub fn add_token(
        &self,
        token: &str,
        room_name: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Option<ApiToken> {
        let room_id = self.rooms.get(room_name)?.id;
        let api_token = ApiToken {
            id: self.next_id(),
            token: token.to_string(),
            room_id,
            room_name: room_name.to_string(),
            name: token.to_string(),
            active: true,
            expires_at,
            last_used_at: None,
        };
        self.tokens.insert(token.to_string(), api_token.clone());
        Some(api_token)
    }

    /// Activate or deactivate a token. Returns `false` if it does not exist.
    pub fn set_token_active(&self, token: &str, active: bool) -> bool {
        match self.tokens.get_mut(token) {
            Some(mut t) => {
                t.active = active;
                true
            }
            None => false,
        }
    }

    /// Last recorded use of a token.
    #[must_use]
    pub fn last_used(&self, token: &str) -> Option<DateTime<Utc>> {
        self.tokens.get(token).and_then(|t| t.last_used_at)
    }

    fn room_by_id(&self, id: i64) -> Option<Room> {
        self.rooms
            .iter()
            .find(|r| r.id == id)
            .map(|r| r.value().clone())
    }
}

impl Default for MemoryAccessStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AccessStore for MemoryAccessStore {
    async fn find_token(&self, token: &str) -> Result<Option<ApiToken>, StoreError> {
        let Some(api_token) = self.tokens.get(token).map(|t| t.value().clone()) else {
            return Ok(None);
        };
        if !api_token.active {
            return Ok(None);
        }
        // Join with the room so renames and deactivation are picked up.
        match self.room_by_id(api_token.room_id) {
            Some(room) if room.active => Ok(Some(ApiToken {
                room_name: room.name,
                ..api_token
            })),
            _ => Ok(None),
        }
    }

    async fn find_active_room(&self, name: &str) -> Result<Option<Room>, StoreError> {
        Ok(self
            .rooms
            .get(name)
            .filter(|r| r.active)
            .map(|r| r.value().clone()))
    }

    async fn room_allows_origin(&self, room_id: i64, hostname: &str) -> Result<bool, StoreError> {
        Ok(self
            .origins
            .get(&room_id)
            .is_some_and(|hosts| hosts.contains(hostname)))
    }

    async fn any_room_allows_origin(&self, hostname: &str) -> Result<bool, StoreError> {
        Ok(self.origins.iter().any(|hosts| hosts.contains(hostname)))
    }

    async fn touch_token(&self, token_id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(mut t) = self.tokens.iter_mut().find(|t| t.id == token_id) {
            t.last_used_at = Some(at);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_room_lookup_respects_active_flag() {
        let store = MemoryAccessStore::new();
        store.add_room("lobby", 512);

        let room = store.find_active_room("lobby").await.unwrap().unwrap();
        assert_eq!(room.max_payload_size, 512);

        store.set_room_active("lobby", false);
        assert!(store.find_active_room("lobby").await.unwrap().is_none());
        assert!(store.find_active_room("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_inactive_token_not_found() {
        let store = MemoryAccessStore::new();
        store.add_room("lobby", 512);
        store.add_token("tok", "lobby", None).unwrap();
        assert!(store.find_token("tok").await.unwrap().is_some());

        store.set_token_active("tok", false);
        assert!(store.find_token("tok").await.unwrap().is_none());
    }

    #[test]
    fn test_seeding_unknown_room() {
        let store = MemoryAccessStore::new();
        assert!(!store.allow_origin("nope", "example.com"));
        assert!(store.add_token("tok", "nope", None).is_none());
    }
}
