//! Time-limited cache of named snapshots (last known board state, user
//! profile). Entries older than the TTL read as absent.

use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use taskboard_core::{BoardId, BoardSnapshot};

use crate::storage::{self, LocalStore, Namespace, StorageError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl CacheEntry {
    fn is_fresh(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.timestamp) < ttl
    }
}

pub struct SnapshotCache {
    store: Arc<dyn LocalStore>,
    entries: IndexMap<String, CacheEntry>,
    ttl: Duration,
}

impl SnapshotCache {
    pub const STORAGE_KEY: &'static str = "offline_data";
    pub const USER_KEY: &'static str = "user";

    /// Load the cache. Unreadable data yields an empty cache.
    pub fn load(store: Arc<dyn LocalStore>, ttl: std::time::Duration) -> Self {
        let entries = storage::load_json(store.as_ref(), Namespace::Snapshots, Self::STORAGE_KEY)
            .unwrap_or_default();
        let ttl = Duration::from_std(ttl).unwrap_or_else(|_| Duration::weeks(52 * 100));
        Self {
            store,
            entries,
            ttl,
        }
    }

    pub fn board_key(board_id: &BoardId) -> String {
        format!("board_{board_id}")
    }

    pub fn put<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), StorageError> {
        self.put_at(key, value, Utc::now())
    }

    pub fn put_at<T: Serialize>(
        &mut self,
        key: &str,
        value: &T,
        timestamp: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let data =
            serde_json::to_value(value).map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.entries
            .insert(key.to_string(), CacheEntry { data, timestamp });
        self.persist()
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_at(key, Utc::now())
    }

    /// Read `key` as of `now`. Stale or undecodable entries are `None`.
    pub fn get_at<T: DeserializeOwned>(&self, key: &str, now: DateTime<Utc>) -> Option<T> {
        let entry = self.entries.get(key)?;
        if !entry.is_fresh(self.ttl, now) {
            log::debug!("Cached '{key}' is older than the freshness window");
            return None;
        }
        match serde_json::from_value(entry.data.clone()) {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!("Ignoring cached '{key}': {e}");
                None
            }
        }
    }

    pub fn save_board(
        &mut self,
        board_id: &BoardId,
        snapshot: &BoardSnapshot,
    ) -> Result<(), StorageError> {
        self.put(&Self::board_key(board_id), snapshot)
    }

    pub fn board(&self, board_id: &BoardId) -> Option<BoardSnapshot> {
        self.get(&Self::board_key(board_id))
    }

    pub fn save_user<T: Serialize>(&mut self, profile: &T) -> Result<(), StorageError> {
        self.put(Self::USER_KEY, profile)
    }

    pub fn user<T: DeserializeOwned>(&self) -> Option<T> {
        self.get(Self::USER_KEY)
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn clear(&mut self) -> Result<(), StorageError> {
        self.entries.clear();
        self.store.remove(Namespace::Snapshots, Self::STORAGE_KEY)
    }

    fn persist(&self) -> Result<(), StorageError> {
        storage::save_json(
            self.store.as_ref(),
            Namespace::Snapshots,
            Self::STORAGE_KEY,
            &self.entries,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use taskboard_core::Board;

    const DAY: std::time::Duration = std::time::Duration::from_secs(24 * 60 * 60);

    #[test]
    fn test_fresh_and_stale_reads() {
        let mut cache = SnapshotCache::load(Arc::new(MemoryStore::new()), DAY);
        let written = Utc::now();
        cache.put_at("user", &serde_json::json!({"name": "Ada"}), written).unwrap();

        let fresh: Option<serde_json::Value> = cache.get_at("user", written + Duration::hours(23));
        assert_eq!(fresh.unwrap()["name"], "Ada");

        let stale: Option<serde_json::Value> = cache.get_at("user", written + Duration::hours(24));
        assert!(stale.is_none());
        assert_eq!(cache.keys(), vec!["user".to_string()]);
    }

    #[test]
    fn test_board_snapshot_survives_reload() {
        let store: Arc<dyn LocalStore> = Arc::new(MemoryStore::new());
        let board = Board::new("b1", "Sprint", "owner");
        let snapshot = BoardSnapshot::new(board, Vec::new());
        {
            let mut cache = SnapshotCache::load(store.clone(), DAY);
            cache.save_board(&BoardId::new("b1"), &snapshot).unwrap();
        }
        let cache = SnapshotCache::load(store, DAY);
        assert_eq!(cache.keys(), vec!["board_b1".to_string()]);
        assert_eq!(cache.board(&BoardId::new("b1")), Some(snapshot));
        assert_eq!(cache.board(&BoardId::new("b2")), None);
    }

    #[test]
    fn test_corrupt_cache_loads_empty_and_clear() {
        let store: Arc<dyn LocalStore> = Arc::new(MemoryStore::new());
        store
            .save(Namespace::Snapshots, SnapshotCache::STORAGE_KEY, b"\x00\x01garbage")
            .unwrap();
        let mut cache = SnapshotCache::load(store.clone(), DAY);
        assert!(cache.keys().is_empty());

        cache.save_user(&"Ada").unwrap();
        assert_eq!(cache.user::<String>().as_deref(), Some("Ada"));
        cache.clear().unwrap();
        assert!(cache.user::<String>().is_none());
        assert!(store
            .load(Namespace::Snapshots, SnapshotCache::STORAGE_KEY)
            .unwrap()
            .is_none());
    }
}
