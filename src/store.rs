//! Key-value backing store
//!
//! Sessions and jobs live in separate keyspaces (`session:`, `job:`) of one
//! TTL-capable store. Records are JSON text.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Corrupt record at {key}: {message}")]
    Corrupt { key: String, message: String },
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Live value at `key`, if any
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Write `value`, replacing any previous value and expiry.
    /// `ttl = None` keeps the record until deleted.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Reset the expiry of a live key. Returns false if absent.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Returns false if there was nothing to delete.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// All live entries whose key starts with `prefix`
    async fn scan(&self, prefix: &str) -> StoreResult<Vec<(String, String)>>;

    /// Drop expired records. Returns how many were removed.
    async fn purge_expired(&self) -> StoreResult<usize>;
}

pub async fn get_json<T: DeserializeOwned>(store: &dyn KvStore, key: &str) -> StoreResult<Option<T>> {
    let Some(raw) = store.get(key).await? else {
        return Ok(None);
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            message: e.to_string(),
        })
}

pub async fn set_json<T: Serialize + Sync>(
    store: &dyn KvStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> StoreResult<()> {
    let raw = serde_json::to_string(value).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        message: e.to_string(),
    })?;
    store.set(key, &raw, ttl).await
}
