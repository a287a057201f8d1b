//! Coalesced full-board refetch.
//!
//! Structural changes (creates, reorders) are settled by refetching the
//! whole board rather than patching positions locally. Bursts collapse:
//! while one fetch is in flight, any number of further requests schedule
//! exactly one follow-up fetch.
//!
//! ```text
//!  request ──► idle?  ── yes ──► fetch ──► pending? ── yes ──► fetch again
//!                │                              └─ no ──► idle
//!                └─ no ──► mark pending, return Coalesced
//! ```

use std::sync::{Arc, Mutex, PoisonError};

use crate::error::SyncError;
use crate::offline::OfflineManager;
use crate::service::BoardService;
use crate::store::SharedStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefetchOutcome {
    Refreshed,
    /// Folded into a fetch that is already running.
    Coalesced,
    /// The board context changed before the response arrived.
    Stale,
    Failed(SyncError),
}

#[derive(Debug, Default)]
struct RefetchState {
    in_flight: bool,
    pending: bool,
}

/// Resets the in-flight flag even if the fetching task is cancelled.
struct InFlight<'a>(&'a Mutex<RefetchState>);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        state.in_flight = false;
        state.pending = false;
    }
}

pub struct RefetchCoalescer {
    store: SharedStore,
    service: Arc<dyn BoardService>,
    offline: Option<Arc<OfflineManager>>,
    state: Mutex<RefetchState>,
}

impl RefetchCoalescer {
    pub fn new(
        store: SharedStore,
        service: Arc<dyn BoardService>,
        offline: Option<Arc<OfflineManager>>,
    ) -> Self {
        Self {
            store,
            service,
            offline,
            state: Mutex::new(RefetchState::default()),
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .in_flight
    }

    pub async fn request(&self) -> RefetchOutcome {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.in_flight {
                state.pending = true;
                log::debug!("Board refetch coalesced into running fetch");
                return RefetchOutcome::Coalesced;
            }
            state.in_flight = true;
        }
        let _in_flight = InFlight(&self.state);

        loop {
            let outcome = self.fetch_once().await;
            let again = {
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                let again = state.pending && outcome == RefetchOutcome::Refreshed;
                state.pending = false;
                again
            };
            if !again {
                return outcome;
            }
        }
    }

    async fn fetch_once(&self) -> RefetchOutcome {
        let Some(scope) = self.store.read().await.scope() else {
            return RefetchOutcome::Stale;
        };
        let snapshot = match self.service.get_board(&scope.board_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::warn!("Refetch of board {} failed: {e}", scope.board_id);
                return RefetchOutcome::Failed(e.into());
            }
        };
        {
            let mut store = self.store.write().await;
            if !store.is_current(&scope) {
                log::debug!("Discarding refetch of board {}; context changed", scope.board_id);
                return RefetchOutcome::Stale;
            }
            store.replace_snapshot(snapshot.clone());
        }
        if let Some(offline) = &self.offline {
            offline.save_board(&scope.board_id, &snapshot).await;
        }
        RefetchOutcome::Refreshed
    }
}
