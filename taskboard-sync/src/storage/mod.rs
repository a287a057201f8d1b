//! Durable local storage for offline state.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐   JSON bytes   ┌──────────────────────────────────┐
//! │ ActionQueue  │ ─────────────► │ Namespace::Actions               │
//! └──────────────┘                │   "offline_pending_actions"      │
//! ┌──────────────┐   JSON bytes   ├──────────────────────────────────┤
//! │ SnapshotCache│ ─────────────► │ Namespace::Snapshots (LZ4)       │
//! └──────────────┘                │   "offline_data"                 │
//!                                 └──────────────────────────────────┘
//!                                   MemoryStore | RocksStore
//! ```
//!
//! Both records are loadable and saveable independently. Readers treat a
//! record that fails to load or decode as absent, so a damaged store never
//! prevents startup.

pub mod rocks;

pub use rocks::{RocksStore, StoreConfig};

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

/// Logical partition of the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Pending offline actions.
    Actions,
    /// Cached board/user snapshots.
    Snapshots,
}

impl Namespace {
    pub fn name(self) -> &'static str {
        match self {
            Namespace::Actions => "actions",
            Namespace::Snapshots => "snapshots",
        }
    }
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("corrupt record '{key}': {reason}")]
    Corrupt { key: String, reason: String },
}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

/// Byte-oriented key/value persistence.
pub trait LocalStore: Send + Sync {
    fn load(&self, ns: Namespace, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    fn save(&self, ns: Namespace, key: &str, value: &[u8]) -> Result<(), StorageError>;
    fn remove(&self, ns: Namespace, key: &str) -> Result<(), StorageError>;
}

/// Volatile store, used when no storage path is configured and in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<(Namespace, String), Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LocalStore for MemoryStore {
    fn load(&self, ns: Namespace, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.get(&(ns, key.to_string())).cloned())
    }

    fn save(&self, ns: Namespace, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.insert((ns, key.to_string()), value.to_vec());
        Ok(())
    }

    fn remove(&self, ns: Namespace, key: &str) -> Result<(), StorageError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.remove(&(ns, key.to_string()));
        Ok(())
    }
}

/// Load and decode a JSON record, degrading to `None` on any failure.
pub(crate) fn load_json<T: serde::de::DeserializeOwned>(
    store: &dyn LocalStore,
    ns: Namespace,
    key: &str,
) -> Option<T> {
    let bytes = match store.load(ns, key) {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return None,
        Err(e) => {
            log::error!("Failed to read '{key}' from {} storage: {e}", ns.name());
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!("Discarding unreadable '{key}' record in {} storage: {e}", ns.name());
            None
        }
    }
}

pub(crate) fn save_json<T: serde::Serialize>(
    store: &dyn LocalStore,
    ns: Namespace,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let bytes =
        serde_json::to_vec(value).map_err(|e| StorageError::Serialization(e.to_string()))?;
    store.save(ns, key, &bytes)
}
