//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Sync engine configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// REST service root
    pub api_base_url: String,
    /// Realtime channel endpoint
    pub channel_url: String,
    /// Channel connection attempts before reporting offline
    pub reconnect_attempts: u32,
    /// Fixed delay between connection attempts
    pub reconnect_delay: Duration,
    /// Snapshot cache freshness threshold
    pub snapshot_ttl: Duration,
    /// Buffer for channel events and store change notifications
    pub event_buffer: usize,
    /// Entries kept by the activity feed
    pub activity_capacity: usize,
    /// Confirmed local action ids remembered for echo suppression
    pub echo_window: usize,
    /// RocksDB directory for offline state; in-memory when `None`
    pub storage_path: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:5000/api".to_string(),
            channel_url: "ws://localhost:5000/realtime".to_string(),
            reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(1),
            snapshot_ttl: Duration::from_secs(24 * 60 * 60),
            event_buffer: 256,
            activity_capacity: 10,
            echo_window: 128,
            storage_path: None,
        }
    }
}

impl SyncConfig {
    /// Config for testing (fast reconnects, in-memory storage).
    pub fn for_testing() -> Self {
        Self {
            reconnect_delay: Duration::from_millis(10),
            event_buffer: 64,
            ..Self::default()
        }
    }

    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = Some(path.into());
        self
    }
}
