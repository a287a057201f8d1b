//! Event Reconciler.
//!
//! Merges peer events from the realtime channel into the board store,
//! the presence registry and the activity feed.
//!
//! ```text
//!   Subscription ──► board matches? ──► own echo? ──► card update/delete ──► merge_foreign
//!                                                  ├► card create/reorder ──► coalesced refetch
//!                                                  ├► member added ────────► board metadata
//!                                                  └► presence ────────────► PresenceRegistry
//! ```
//!
//! Events are dropped once the board they were subscribed for is no longer
//! in context. When the subscription reports lost events (a lagging
//! receiver, or a channel that re-joined after a dropped link) the board is
//! refetched instead.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::activity::{Activity, ActivityFeed};
use crate::broadcast::{Delivery, Subscription};
use crate::offline::ActionId;
use crate::presence::PresenceRegistry;
use crate::protocol::{Actor, ChannelEvent};
use crate::refetch::RefetchCoalescer;
use crate::store::{BoardScope, ForeignChange, MergeOutcome, SharedStore};

// ───────────────────────────────────────────────────────────────────
// Echo ledger
// ───────────────────────────────────────────────────────────────────

/// Remembers which events this client caused.
///
/// An event is our own echo when its actor carries our client id. Relays
/// that strip the client id still pass the action id through, so recently
/// confirmed action ids are matched as a fallback. Events from the same
/// user on another client are never echoes.
pub struct EchoLedger {
    client_id: Uuid,
    recent: Mutex<VecDeque<ActionId>>,
    capacity: usize,
}

impl EchoLedger {
    pub fn new(client_id: Uuid, capacity: usize) -> Self {
        Self {
            client_id,
            recent: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, action_id: ActionId) {
        let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        if recent.len() == self.capacity {
            recent.pop_front();
        }
        recent.push_back(action_id);
    }

    pub fn is_echo(&self, actor: &Actor) -> bool {
        match (actor.client_id, actor.action_id) {
            (Some(client), _) => client == self.client_id,
            (None, Some(action)) => self
                .recent
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(&action),
            (None, None) => false,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Reconciler
// ───────────────────────────────────────────────────────────────────

/// What the reconciler did with one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// For another board, or the board is no longer in context.
    Ignored,
    Echo,
    Merged(MergeOutcome),
    RefetchScheduled,
    MembersUpdated,
    Presence { changed: bool },
}

pub struct EventReconciler {
    scope: BoardScope,
    store: SharedStore,
    presence: Arc<RwLock<PresenceRegistry>>,
    activity: Arc<RwLock<ActivityFeed>>,
    echoes: Arc<EchoLedger>,
    refetch: Arc<RefetchCoalescer>,
}

impl EventReconciler {
    pub fn new(
        scope: BoardScope,
        store: SharedStore,
        presence: Arc<RwLock<PresenceRegistry>>,
        activity: Arc<RwLock<ActivityFeed>>,
        echoes: Arc<EchoLedger>,
        refetch: Arc<RefetchCoalescer>,
    ) -> Self {
        Self {
            scope,
            store,
            presence,
            activity,
            echoes,
            refetch,
        }
    }

    /// Consume events until the subscription is disposed.
    pub async fn run(self, mut subscription: Subscription) {
        log::info!("Reconciler started for board {}", self.scope.board_id);
        while let Some(delivery) = subscription.recv().await {
            match delivery {
                Delivery::Event(event) => {
                    let result = self.handle(&event).await;
                    log::debug!("{:?} event: {result:?}", event.category());
                }
                Delivery::Lagged(missed) => {
                    log::warn!("Missed {missed} events for board {}", self.scope.board_id);
                    self.resynchronize().await;
                }
                Delivery::Resync => {
                    self.resynchronize().await;
                }
            }
        }
        log::info!("Reconciler stopped for board {}", self.scope.board_id);
    }

    pub async fn handle(&self, event: &ChannelEvent) -> Reconciled {
        if event.board_id() != &self.scope.board_id
            || !self.store.read().await.is_current(&self.scope)
        {
            return Reconciled::Ignored;
        }
        if event.actor().is_some_and(|actor| self.echoes.is_echo(actor)) {
            return Reconciled::Echo;
        }
        if let Some(activity) = Activity::from_event(event) {
            self.activity.write().await.record(activity);
        }

        match event {
            ChannelEvent::CardUpdated(e) => self.merge(ForeignChange::Upsert(e.card.clone())).await,
            ChannelEvent::CardDeleted(e) => {
                self.merge(ForeignChange::Removed(e.card_id.clone())).await
            }
            ChannelEvent::CardCreated(_) | ChannelEvent::CardReordered(_) => {
                self.schedule_refetch();
                Reconciled::RefetchScheduled
            }
            ChannelEvent::MemberAdded(e) => {
                let Some(member) = &e.member else {
                    self.schedule_refetch();
                    return Reconciled::RefetchScheduled;
                };
                let mut store = self.store.write().await;
                if !store.is_current(&self.scope) {
                    return Reconciled::Ignored;
                }
                let Some(mut board) = store.board().cloned() else {
                    return Reconciled::Ignored;
                };
                board.upsert_member(member.user_id.clone(), member.role);
                store.replace_board(board);
                Reconciled::MembersUpdated
            }
            _ => {
                let changed = self.presence.write().await.handle(event);
                Reconciled::Presence { changed }
            }
        }
    }

    /// Catch up after events were lost by refetching the whole board.
    pub async fn resynchronize(&self) -> Reconciled {
        if !self.store.read().await.is_current(&self.scope) {
            return Reconciled::Ignored;
        }
        self.schedule_refetch();
        Reconciled::RefetchScheduled
    }

    async fn merge(&self, change: ForeignChange) -> Reconciled {
        let outcome = {
            let mut store = self.store.write().await;
            if !store.is_current(&self.scope) {
                return Reconciled::Ignored;
            }
            store.merge_foreign(change)
        };
        if outcome == MergeOutcome::NeedsRefetch {
            self.schedule_refetch();
        }
        Reconciled::Merged(outcome)
    }

    fn schedule_refetch(&self) {
        let refetch = self.refetch.clone();
        tokio::spawn(async move {
            refetch.request().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskboard_core::UserId;

    fn actor(client: Option<Uuid>, action: Option<u64>) -> Actor {
        Actor {
            user_id: UserId::new("u1"),
            user_name: Some("Ada".into()),
            client_id: client,
            action_id: action.map(ActionId),
        }
    }

    #[test]
    fn test_own_client_is_echo() {
        let me = Uuid::new_v4();
        let ledger = EchoLedger::new(me, 8);
        assert!(ledger.is_echo(&actor(Some(me), None)));
    }

    #[test]
    fn test_same_user_other_client_is_not_echo() {
        let ledger = EchoLedger::new(Uuid::new_v4(), 8);
        ledger.record(ActionId(7));
        // Another tab of the same user, even with a colliding action id.
        assert!(!ledger.is_echo(&actor(Some(Uuid::new_v4()), Some(7))));
    }

    #[test]
    fn test_action_id_fallback() {
        let ledger = EchoLedger::new(Uuid::new_v4(), 2);
        ledger.record(ActionId(1));
        assert!(ledger.is_echo(&actor(None, Some(1))));
        assert!(!ledger.is_echo(&actor(None, Some(2))));
        assert!(!ledger.is_echo(&actor(None, None)));

        ledger.record(ActionId(2));
        ledger.record(ActionId(3));
        assert!(!ledger.is_echo(&actor(None, Some(1))), "evicted beyond capacity");
    }
}
