//! Offline queue manager.
//!
//! ```text
//!             set_online(false)
//!   ┌────────┐ ───────────────► ┌─────────┐
//!   │ online │                  │ offline │ ── dispatch ──► ActionQueue (durable FIFO)
//!   └────────┘ ◄─────────────── └─────────┘
//!        │       set_online(true)
//!        ▼
//!   replay(executor): one action at a time, in queue order
//!     Ok(effect)          → remove; retarget temp ids on create
//!     Err(Rejected)       → keep, block later actions for that card
//!     Err(Connectivity)   → stop, back to offline
//! ```
//!
//! The manager has no notion of HTTP. Execution is delegated to an
//! [`ActionExecutor`] supplied by the owner; delivery is at-least-once, so
//! every replayed call carries its [`ActionId`] as an idempotency key.

pub mod cache;
pub mod queue;

pub use cache::{CacheEntry, SnapshotCache};
pub use queue::{ActionId, ActionKind, ActionPayload, ActionQueue, PendingAction};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use taskboard_core::{BoardId, BoardSnapshot, CardId};
use tokio::sync::{Mutex, watch};

use crate::error::SyncError;
use crate::storage::{LocalStore, StorageError};

/// What a successfully replayed action did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayEffect {
    Applied,
    /// A queued create received its permanent id.
    Created { temp_id: CardId, card_id: CardId },
    /// The service had already applied it, or the target is gone.
    AlreadyApplied,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayError {
    /// Still unreachable. Replay stops and the action stays queued.
    Connectivity(String),
    /// Refused by the service. The action stays queued and blocks later
    /// actions for the same card.
    Rejected(SyncError),
}

/// Executes queued actions against the service.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, action: &PendingAction) -> Result<ReplayEffect, ReplayError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub executed: Vec<ActionId>,
    /// Skipped because an earlier action for the same card failed.
    pub halted: Vec<ActionId>,
    pub failures: Vec<(ActionId, SyncError)>,
    pub remaining: usize,
    /// Replay stopped early on a connectivity failure.
    pub interrupted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineStatus {
    pub is_online: bool,
    pub pending_actions_count: usize,
    pub offline_data_keys: Vec<String>,
}

pub struct OfflineManager {
    online: watch::Sender<bool>,
    queue: Mutex<ActionQueue>,
    cache: Mutex<SnapshotCache>,
    replay_lock: Mutex<()>,
}

impl OfflineManager {
    pub fn new(store: Arc<dyn LocalStore>, snapshot_ttl: Duration, online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self {
            online: tx,
            queue: Mutex::new(ActionQueue::load(store.clone())),
            cache: Mutex::new(SnapshotCache::load(store, snapshot_ttl)),
            replay_lock: Mutex::new(()),
        }
    }

    // ─── Connectivity ────────────────────────────────────────────────

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Record a connectivity signal. Returns `true` on an offline → online
    /// transition, after which the owner should call [`replay`](Self::replay).
    pub fn set_online(&self, online: bool) -> bool {
        let previous = self.online.send_replace(online);
        if previous != online {
            log::info!("Connectivity changed: {}", if online { "online" } else { "offline" });
        }
        online && !previous
    }

    pub fn watch_online(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }

    // ─── Queue ───────────────────────────────────────────────────────

    pub async fn next_action_id(&self) -> ActionId {
        self.queue.lock().await.next_id()
    }

    pub async fn enqueue(&self, action: PendingAction) -> Result<(), StorageError> {
        let id = action.id;
        let kind = action.kind();
        let mut queue = self.queue.lock().await;
        queue.push(action)?;
        log::info!("Queued {kind:?} action {id} ({} pending)", queue.len());
        Ok(())
    }

    pub async fn has_pending_for(&self, card: &CardId) -> bool {
        self.queue.lock().await.has_pending_for(card)
    }

    pub async fn pending(&self) -> Vec<PendingAction> {
        self.queue.lock().await.iter().cloned().collect()
    }

    /// Drop a queued action without executing it.
    pub async fn discard(&self, id: ActionId) -> Result<Option<PendingAction>, StorageError> {
        let removed = self.queue.lock().await.remove(id)?;
        if removed.is_some() {
            log::info!("Discarded queued action {id}");
        }
        Ok(removed)
    }

    /// Replay the queue strictly in order, awaiting each action before the
    /// next. Concurrent calls are serialized.
    pub async fn replay(&self, executor: &dyn ActionExecutor) -> ReplayReport {
        let _guard = self.replay_lock.lock().await;
        let mut report = ReplayReport::default();
        let mut visited: HashSet<ActionId> = HashSet::new();
        let mut blocked: HashSet<CardId> = HashSet::new();

        loop {
            if !self.is_online() {
                report.interrupted = true;
                break;
            }
            // Re-read after every step: retargeting rewrites later actions
            // and dispatches may append while a replay is running.
            let next = {
                let queue = self.queue.lock().await;
                let next = queue.iter().find(|a| !visited.contains(&a.id)).cloned();
                next
            };
            let Some(action) = next else { break };
            visited.insert(action.id);

            if let Some(key) = action.target_key() {
                if blocked.contains(key) {
                    log::debug!("Holding action {} behind a failed action for {key}", action.id);
                    report.halted.push(action.id);
                    continue;
                }
            }

            match executor.execute(&action).await {
                Ok(effect) => {
                    let mut queue = self.queue.lock().await;
                    if let Err(e) = queue.remove(action.id) {
                        log::error!("Failed to persist removal of action {}: {e}", action.id);
                    }
                    if let ReplayEffect::Created { temp_id, card_id } = &effect {
                        if let Err(e) = queue.retarget(temp_id, card_id) {
                            log::error!("Failed to persist retarget {temp_id} -> {card_id}: {e}");
                        }
                    }
                    log::debug!("Replayed action {} ({effect:?})", action.id);
                    report.executed.push(action.id);
                }
                Err(ReplayError::Connectivity(msg)) => {
                    log::warn!("Replay interrupted at action {}: {msg}", action.id);
                    self.set_online(false);
                    report.interrupted = true;
                    break;
                }
                Err(ReplayError::Rejected(err)) => {
                    log::warn!("Queued action {} rejected: {err}", action.id);
                    if let Err(e) = self.queue.lock().await.record_attempt(action.id) {
                        log::error!("Failed to persist attempt count: {e}");
                    }
                    if let Some(key) = action.target_key() {
                        blocked.insert(key.clone());
                    }
                    report.failures.push((action.id, err));
                }
            }
        }

        report.remaining = self.queue.lock().await.len();
        if !report.executed.is_empty() || report.remaining > 0 {
            log::info!(
                "Replay finished: {} executed, {} failed, {} held, {} remaining",
                report.executed.len(),
                report.failures.len(),
                report.halted.len(),
                report.remaining
            );
        }
        report
    }

    // ─── Snapshot cache ──────────────────────────────────────────────

    pub async fn save_board(&self, board_id: &BoardId, snapshot: &BoardSnapshot) {
        if let Err(e) = self.cache.lock().await.save_board(board_id, snapshot) {
            log::warn!("Failed to cache board {board_id}: {e}");
        }
    }

    pub async fn cached_board(&self, board_id: &BoardId) -> Option<BoardSnapshot> {
        self.cache.lock().await.board(board_id)
    }

    pub async fn save_user<T: Serialize + Sync>(&self, profile: &T) -> Result<(), StorageError> {
        self.cache.lock().await.save_user(profile)
    }

    pub async fn cached_user<T: DeserializeOwned>(&self) -> Option<T> {
        self.cache.lock().await.user()
    }

    // ─── Status ──────────────────────────────────────────────────────

    pub async fn status(&self) -> OfflineStatus {
        OfflineStatus {
            is_online: self.is_online(),
            pending_actions_count: self.queue.lock().await.len(),
            offline_data_keys: self.cache.lock().await.keys(),
        }
    }

    /// Wipe queue and cache, in memory and on disk.
    pub async fn clear(&self) -> Result<(), StorageError> {
        self.queue.lock().await.clear()?;
        self.cache.lock().await.clear()?;
        log::info!("Cleared offline queue and snapshot cache");
        Ok(())
    }
}
