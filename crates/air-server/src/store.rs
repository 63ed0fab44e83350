//! Access store backends.
//!
//! `mysql` reads the `air_rooms`, `air_room_domains` and `air_api_tokens`
//! tables on every call; `memory` is seeded once from configuration.

use air_core::{AccessStore, ApiToken, MemoryAccessStore, Room, StoreError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::Row;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{DatabaseConfig, StoreBackend, StoreConfig};

/// MySQL-backed [`AccessStore`].
#[derive(Clone)]
pub struct MySqlAccessStore {
    pool: MySqlPool,
}

impl MySqlAccessStore {
    /// Connect a pool from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be reached.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, sqlx::Error> {
        let pool = MySqlPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.connection_url())
            .await?;

        info!(
            host = %config.host,
            database = %config.name,
            pool_size = config.max_connections,
            "MySQL connection pool created"
        );
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

fn unavailable(e: sqlx::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn utc(value: Option<NaiveDateTime>) -> Option<DateTime<Utc>> {
    value.map(|v| v.and_utc())
}

fn token_from_row(row: &MySqlRow) -> Result<ApiToken, sqlx::Error> {
    Ok(ApiToken {
        id: row.try_get("id")?,
        token: row.try_get("token")?,
        room_id: row.try_get("room_id")?,
        room_name: row.try_get("room_name")?,
        name: row.try_get("name")?,
        active: row.try_get("is_active")?,
        expires_at: utc(row.try_get("expires_at")?),
        last_used_at: utc(row.try_get("last_used_at")?),
    })
}

fn room_from_row(row: &MySqlRow) -> Result<Room, sqlx::Error> {
    let description: Option<String> = row.try_get("description")?;
    let max_payload_size: i64 = row.try_get("max_buffer_size")?;
    Ok(Room {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: description.unwrap_or_default(),
        max_payload_size: u64::try_from(max_payload_size).unwrap_or(0),
        active: row.try_get("is_active")?,
    })
}

#[async_trait]
impl AccessStore for MySqlAccessStore {
    async fn find_token(&self, token: &str) -> Result<Option<ApiToken>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT t.id, t.token, t.room_id, r.name AS room_name, t.name, t.is_active,
                   t.expires_at, t.last_used_at
            FROM air_api_tokens t
            JOIN air_rooms r ON t.room_id = r.id
            WHERE t.token = ? AND t.is_active = TRUE AND r.is_active = TRUE
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        row.as_ref()
            .map(token_from_row)
            .transpose()
            .map_err(unavailable)
    }

    async fn find_active_room(&self, name: &str) -> Result<Option<Room>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, description, max_buffer_size, is_active
            FROM air_rooms
            WHERE name = ? AND is_active = TRUE
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        row.as_ref()
            .map(room_from_row)
            .transpose()
            .map_err(unavailable)
    }

    async fn room_allows_origin(&self, room_id: i64, hostname: &str) -> Result<bool, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM air_room_domains WHERE room_id = ? AND domain = ?",
        )
        .bind(room_id)
        .bind(hostname)
        .fetch_one(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(count > 0)
    }

    async fn any_room_allows_origin(&self, hostname: &str) -> Result<bool, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM air_room_domains WHERE domain = ?")
            .bind(hostname)
            .fetch_one(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(count > 0)
    }

    async fn touch_token(&self, token_id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE air_api_tokens SET last_used_at = ? WHERE id = ?")
            .bind(at.naive_utc())
            .bind(token_id)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}

/// Build a memory store from configured room seeds.
#[must_use]
pub fn seeded_memory_store(config: &StoreConfig) -> MemoryAccessStore {
    let store = MemoryAccessStore::new();
    for seed in &config.rooms {
        store.add_room(&seed.name, seed.max_payload_size);
        for domain in &seed.domains {
            store.allow_origin(&seed.name, domain);
        }
        for token in &seed.tokens {
            store.add_token(&token.token, &seed.name, token.expires_at);
        }
    }
    store
}

/// Create the configured access store.
///
/// # Errors
///
/// Returns an error if the `mysql` backend cannot connect.
pub async fn create_store(
    store: &StoreConfig,
    database: &DatabaseConfig,
) -> Result<Arc<dyn AccessStore>> {
    match store.backend {
        StoreBackend::Mysql => {
            let mysql = MySqlAccessStore::connect(database)
                .await
                .context("Failed to connect to database")?;
            Ok(Arc::new(mysql))
        }
        StoreBackend::Memory => {
            if store.rooms.is_empty() {
                warn!("Memory store has no rooms configured");
            }
            info!(rooms = store.rooms.len(), "Using memory access store");
            Ok(Arc::new(seeded_memory_store(store)))
        }
    }
}
