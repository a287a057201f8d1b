//! Mutation Dispatcher.
//!
//! Public entry point for card mutations. Every operation runs the same
//! pipeline:
//!
//! ```text
//!  validate ──► optimistic layer ──► offline? ──yes──► queue (durable)
//!                                       │
//!                                       no
//!                                       ▼
//!                              service call (action id = idempotency key)
//!                 ┌─────────────┬───────┴───────┬──────────────────┐
//!                 ▼             ▼               ▼                  ▼
//!               Ok          Connectivity     NotFound           other
//!          confirm layer    queue, go       remove card,      rollback,
//!          publish event    offline         no-op result      typed error
//! ```
//!
//! Validation failures return before any state is touched. The store's
//! write lock is held for each synchronous step, never across an await.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use taskboard_core::{
    resolve_drop, BoardId, Card, CardDraft, CardId, CardPatch, DropResolution, DropSignal,
    ModelError,
};
use uuid::Uuid;

use crate::client::ChannelClient;
use crate::error::{ServiceError, SyncError};
use crate::offline::{
    ActionExecutor, ActionId, ActionPayload, OfflineManager, PendingAction, ReplayEffect,
    ReplayError,
};
use crate::protocol::{
    CardDeletedEvent, CardEvent, CardReorderedEvent, ChannelEvent, ClientIdentity,
};
use crate::reconciler::EchoLedger;
use crate::refetch::RefetchCoalescer;
use crate::service::{BoardService, ReorderRequest};
use crate::store::{BoardScope, BoardStore, Mutation, RollbackToken, SharedStore};

/// Successful result of a dispatcher operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The service accepted the change; this is its authoritative value.
    Confirmed(Card),
    /// The service assigned a permanent id to a new card.
    Created { temp_id: CardId, card: Card },
    Deleted(CardId),
    /// Stored for replay; the optimistic value stays visible.
    Queued { action_id: ActionId, card_id: CardId },
    /// The card is already in the destination column; nothing was sent.
    NoMoveNeeded { card_id: CardId, column: String },
    /// The card no longer exists on the service; it was removed locally.
    RemovedRemotely(CardId),
}

enum ServiceResult {
    Card(Card),
    Deleted,
}

pub struct MutationDispatcher {
    identity: ClientIdentity,
    store: SharedStore,
    service: Arc<dyn BoardService>,
    offline: Arc<OfflineManager>,
    channel: Arc<ChannelClient>,
    echoes: Arc<EchoLedger>,
    refetch: Arc<RefetchCoalescer>,
    /// Overlay layers owned by queued or in-flight actions.
    pending_tokens: Mutex<HashMap<ActionId, RollbackToken>>,
}

impl MutationDispatcher {
    pub fn new(
        identity: ClientIdentity,
        store: SharedStore,
        service: Arc<dyn BoardService>,
        offline: Arc<OfflineManager>,
        channel: Arc<ChannelClient>,
        echoes: Arc<EchoLedger>,
        refetch: Arc<RefetchCoalescer>,
    ) -> Self {
        Self {
            identity,
            store,
            service,
            offline,
            channel,
            echoes,
            refetch,
            pending_tokens: Mutex::new(HashMap::new()),
        }
    }

    fn tokens(&self) -> std::sync::MutexGuard<'_, HashMap<ActionId, RollbackToken>> {
        self.pending_tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ─── Operations ──────────────────────────────────────────────────

    pub async fn create(
        &self,
        board_id: &BoardId,
        draft: CardDraft,
    ) -> Result<DispatchOutcome, SyncError> {
        let action_id = self.offline.next_action_id().await;
        let temp_id = CardId::new(format!("{}{}", CardId::TEMP_PREFIX, Uuid::new_v4()));

        let (token, scope) = {
            let mut store = self.store.write().await;
            let board = store.board().ok_or(SyncError::NoBoard)?;
            if &board.id != board_id {
                return Err(SyncError::Stale(board_id.clone()));
            }
            if !board.can_edit(&self.identity.user_id) {
                return Err(SyncError::Permission(format!(
                    "viewers cannot add cards to board {board_id}"
                )));
            }
            draft.validate(board)?;
            let card = draft.to_card(temp_id.clone(), board_id.clone(), Utc::now());
            let token = store.apply_optimistic(&temp_id, Mutation::Upsert(card))?;
            (token, store.scope().ok_or(SyncError::NoBoard)?)
        };

        let action = PendingAction {
            id: action_id,
            board_id: board_id.clone(),
            target: None,
            payload: ActionPayload::Create { temp_id, draft },
            created_at: Utc::now(),
            attempts: 0,
        };
        self.submit(action, token, scope).await
    }

    pub async fn update(
        &self,
        card_id: &CardId,
        patch: CardPatch,
    ) -> Result<DispatchOutcome, SyncError> {
        self.check_identity_settled(card_id).await?;
        let action_id = self.offline.next_action_id().await;
        let (token, scope) = {
            let mut store = self.store.write().await;
            let board = store.board().ok_or(SyncError::NoBoard)?;
            if !board.can_edit(&self.identity.user_id) {
                return Err(SyncError::read_only(card_id));
            }
            patch.validate(board)?;
            let Some(current) = store.card(card_id) else {
                return removed_or_unknown(&store, card_id);
            };

            let mut proposed = patch.apply_to(&current);
            proposed.updated_at = Utc::now();
            let token = store.apply_optimistic(card_id, Mutation::Upsert(proposed))?;
            (token, store.scope().ok_or(SyncError::NoBoard)?)
        };

        let action = PendingAction {
            id: action_id,
            board_id: scope.board_id.clone(),
            target: Some(card_id.clone()),
            payload: ActionPayload::Update { patch },
            created_at: Utc::now(),
            attempts: 0,
        };
        self.submit(action, token, scope).await
    }

    pub async fn delete(&self, card_id: &CardId) -> Result<DispatchOutcome, SyncError> {
        self.check_identity_settled(card_id).await?;
        let action_id = self.offline.next_action_id().await;
        let (token, scope, title) = {
            let mut store = self.store.write().await;
            let board = store.board().ok_or(SyncError::NoBoard)?;
            if !board.can_edit(&self.identity.user_id) {
                return Err(SyncError::read_only(card_id));
            }
            let Some(current) = store.card(card_id) else {
                return removed_or_unknown(&store, card_id);
            };

            let token = store.apply_optimistic(card_id, Mutation::Remove)?;
            (token, store.scope().ok_or(SyncError::NoBoard)?, current.title)
        };

        let action = PendingAction {
            id: action_id,
            board_id: scope.board_id.clone(),
            target: Some(card_id.clone()),
            payload: ActionPayload::Delete { title },
            created_at: Utc::now(),
            attempts: 0,
        };
        self.submit(action, token, scope).await
    }

    /// Move a card to another column. The service decides its position; a
    /// successful move is followed by a coalesced board refetch.
    pub async fn reorder(
        &self,
        card_id: &CardId,
        source_column: &str,
        destination_column: &str,
    ) -> Result<DispatchOutcome, SyncError> {
        self.check_identity_settled(card_id).await?;
        let action_id = self.offline.next_action_id().await;
        let (token, scope) = {
            let mut store = self.store.write().await;
            let board = store.board().ok_or(SyncError::NoBoard)?;
            if !board.can_edit(&self.identity.user_id) {
                return Err(SyncError::read_only(card_id));
            }
            board.check_column(destination_column)?;
            let Some(current) = store.card(card_id) else {
                return removed_or_unknown(&store, card_id);
            };
            if current.column == destination_column {
                return Ok(DispatchOutcome::NoMoveNeeded {
                    card_id: card_id.clone(),
                    column: current.column,
                });
            }
            if current.column != source_column {
                log::debug!(
                    "Reorder of {card_id} names source '{source_column}' but card is in '{}'",
                    current.column
                );
            }

            let mut proposed = current;
            proposed.column = destination_column.to_string();
            proposed.updated_at = Utc::now();
            let token = store.apply_optimistic(card_id, Mutation::Upsert(proposed))?;
            (token, store.scope().ok_or(SyncError::NoBoard)?)
        };

        let action = PendingAction {
            id: action_id,
            board_id: scope.board_id.clone(),
            target: Some(card_id.clone()),
            payload: ActionPayload::Reorder {
                source_column: source_column.to_string(),
                destination_column: destination_column.to_string(),
            },
            created_at: Utc::now(),
            attempts: 0,
        };
        self.submit(action, token, scope).await
    }

    /// Resolve a drop gesture and move the card. Nothing is touched unless
    /// a destination column is found.
    pub async fn move_card_by_drop(
        &self,
        card_id: &CardId,
        signals: &[DropSignal],
    ) -> Result<DispatchOutcome, SyncError> {
        let snapshot = self
            .store
            .read()
            .await
            .snapshot()
            .ok_or(SyncError::NoBoard)?;
        match resolve_drop(card_id, &snapshot, signals)? {
            DropResolution::NoMoveNeeded { card_id, column } => {
                Ok(DispatchOutcome::NoMoveNeeded { card_id, column })
            }
            DropResolution::Move { card_id, from, to } => self.reorder(&card_id, &from, &to).await,
        }
    }

    /// A temporary id can only be targeted once its create is known to the
    /// queue; an in-flight online create has no id to address yet.
    async fn check_identity_settled(&self, card_id: &CardId) -> Result<(), SyncError> {
        if card_id.is_temporary()
            && self.offline.is_online()
            && !self.offline.has_pending_for(card_id).await
        {
            return Err(SyncError::Conflict(format!(
                "card {card_id} is still being created"
            )));
        }
        Ok(())
    }

    // ─── Pipeline ────────────────────────────────────────────────────

    async fn submit(
        &self,
        action: PendingAction,
        token: RollbackToken,
        scope: BoardScope,
    ) -> Result<DispatchOutcome, SyncError> {
        let must_queue = match action.target_key() {
            _ if !self.offline.is_online() => true,
            // Keep per-card order behind actions still waiting in the queue.
            Some(key) => self.offline.has_pending_for(key).await,
            None => false,
        };
        if must_queue {
            return self.enqueue(action, token).await;
        }

        match self.call_service(&action).await {
            Ok(result) => self.reconcile(&action, &token, &scope, result).await,
            Err(e) if e.is_connectivity() => {
                log::warn!("Service unreachable for action {}: {e}", action.id);
                self.offline.set_online(false);
                self.enqueue(action, token).await
            }
            Err(ServiceError::NotFound(msg)) if action.target.is_some() => {
                let card_id = token.entity.clone();
                log::info!("Card {card_id} is gone on the service ({msg}); removing locally");
                let mut store = self.store.write().await;
                if store.is_current(&scope) {
                    store.rollback(&token);
                    store.confirm_removed(&card_id);
                }
                Ok(DispatchOutcome::RemovedRemotely(card_id))
            }
            Err(e) => {
                log::warn!("Action {} rejected: {e}", action.id);
                self.store.write().await.rollback(&token);
                Err(e.into())
            }
        }
    }

    async fn enqueue(
        &self,
        action: PendingAction,
        token: RollbackToken,
    ) -> Result<DispatchOutcome, SyncError> {
        let action_id = action.id;
        let card_id = token.entity.clone();
        self.tokens().insert(action_id, token.clone());
        if let Err(e) = self.offline.enqueue(action).await {
            self.tokens().remove(&action_id);
            self.store.write().await.rollback(&token);
            return Err(e.into());
        }
        Ok(DispatchOutcome::Queued { action_id, card_id })
    }

    async fn call_service(&self, action: &PendingAction) -> Result<ServiceResult, ServiceError> {
        let service = self.service.as_ref();
        match (&action.payload, &action.target) {
            (ActionPayload::Create { draft, .. }, _) => service
                .create_card(&action.board_id, draft, action.id)
                .await
                .map(ServiceResult::Card),
            (ActionPayload::Update { patch }, Some(target)) => service
                .update_card(target, patch, action.id)
                .await
                .map(ServiceResult::Card),
            (ActionPayload::Delete { .. }, Some(target)) => service
                .delete_card(target, action.id)
                .await
                .map(|_| ServiceResult::Deleted),
            (
                ActionPayload::Reorder {
                    source_column,
                    destination_column,
                },
                Some(target),
            ) => {
                let request = ReorderRequest::new(
                    action.board_id.clone(),
                    target.clone(),
                    source_column.clone(),
                    destination_column.clone(),
                );
                service
                    .reorder_card(&request, action.id)
                    .await
                    .map(ServiceResult::Card)
            }
            (payload, None) => Err(ServiceError::Validation(format!(
                "{:?} action {} has no target",
                payload.kind(),
                action.id
            ))),
        }
    }

    /// Apply a successful response and announce it to peers.
    async fn reconcile(
        &self,
        action: &PendingAction,
        token: &RollbackToken,
        scope: &BoardScope,
        result: ServiceResult,
    ) -> Result<DispatchOutcome, SyncError> {
        let outcome = {
            let mut store = self.store.write().await;
            let current = store.is_current(scope);
            match (&action.payload, result) {
                (ActionPayload::Create { temp_id, .. }, ServiceResult::Card(card)) => {
                    if current {
                        store.confirm_created(temp_id, card.clone(), Some(token));
                    }
                    DispatchOutcome::Created {
                        temp_id: temp_id.clone(),
                        card,
                    }
                }
                (_, ServiceResult::Card(card)) => {
                    if current && !store.apply_confirmed(card.clone(), Some(token)) {
                        DispatchOutcome::RemovedRemotely(card.id)
                    } else {
                        DispatchOutcome::Confirmed(card)
                    }
                }
                (_, ServiceResult::Deleted) => {
                    if current {
                        store.confirm_removed(&token.entity);
                    }
                    DispatchOutcome::Deleted(token.entity.clone())
                }
            }
        };

        self.announce(action, &outcome).await;

        if !self.store.read().await.is_current(scope) {
            log::info!(
                "Response for action {} arrived after leaving board {}",
                action.id,
                scope.board_id
            );
            return Err(SyncError::Stale(scope.board_id.clone()));
        }
        if matches!(action.payload, ActionPayload::Reorder { .. }) {
            let refreshed = self.refetch.request().await;
            log::debug!("Post-reorder refetch: {refreshed:?}");
        }
        Ok(outcome)
    }

    /// Publish the outbound channel event for a confirmed action.
    async fn announce(&self, action: &PendingAction, outcome: &DispatchOutcome) {
        let actor = Some(self.identity.actor(Some(action.id)));
        let board_id = action.board_id.clone();
        let timestamp = Utc::now();
        let event = match (&action.payload, outcome) {
            (ActionPayload::Create { .. }, DispatchOutcome::Created { card, .. }) => {
                ChannelEvent::CardCreated(CardEvent {
                    board_id,
                    card: card.clone(),
                    actor,
                    timestamp,
                })
            }
            (ActionPayload::Update { .. }, DispatchOutcome::Confirmed(card)) => {
                ChannelEvent::CardUpdated(CardEvent {
                    board_id,
                    card: card.clone(),
                    actor,
                    timestamp,
                })
            }
            (ActionPayload::Delete { title }, DispatchOutcome::Deleted(card_id)) => {
                ChannelEvent::CardDeleted(CardDeletedEvent {
                    board_id,
                    card_id: card_id.clone(),
                    card_title: Some(title.clone()),
                    actor,
                    timestamp,
                })
            }
            (
                ActionPayload::Reorder {
                    source_column,
                    destination_column,
                },
                DispatchOutcome::Confirmed(card),
            ) => ChannelEvent::CardReordered(CardReorderedEvent {
                board_id,
                card_id: card.id.clone(),
                source_column: source_column.clone(),
                destination_column: destination_column.clone(),
                source_index: 0,
                destination_index: 0,
                actor,
                timestamp,
            }),
            _ => return,
        };
        self.echoes.record(action.id);
        if let Err(e) = self.channel.publish(event).await {
            log::debug!("Outbound event for action {} not sent: {e}", action.id);
        }
    }

    // ─── Queue integration ───────────────────────────────────────────

    /// Re-apply queued actions for a freshly loaded board so their
    /// optimistic values stay visible until replay.
    pub async fn restore_overlays(&self, board_id: &BoardId) {
        let pending = self.offline.pending().await;
        let mut store = self.store.write().await;
        for action in pending.iter().filter(|a| &a.board_id == board_id) {
            let (card_id, mutation) = match (&action.payload, &action.target) {
                (ActionPayload::Create { temp_id, draft }, _) => (
                    temp_id.clone(),
                    Mutation::Upsert(draft.to_card(
                        temp_id.clone(),
                        board_id.clone(),
                        action.created_at,
                    )),
                ),
                (ActionPayload::Update { patch }, Some(target)) => match store.card(target) {
                    Some(card) => (target.clone(), Mutation::Upsert(patch.apply_to(&card))),
                    None => continue,
                },
                (ActionPayload::Delete { .. }, Some(target)) => (target.clone(), Mutation::Remove),
                (ActionPayload::Reorder { destination_column, .. }, Some(target)) => {
                    match store.card(target) {
                        Some(mut card) => {
                            card.column = destination_column.clone();
                            (target.clone(), Mutation::Upsert(card))
                        }
                        None => continue,
                    }
                }
                _ => continue,
            };
            match store.apply_optimistic(&card_id, mutation) {
                Ok(token) => {
                    self.tokens().insert(action.id, token);
                }
                Err(e) => log::warn!("Queued action {} no longer applies: {e}", action.id),
            }
        }
    }

    /// Drop a queued action and undo its optimistic layer.
    pub async fn discard(&self, action_id: ActionId) -> Result<Option<PendingAction>, SyncError> {
        let removed = self.offline.discard(action_id).await?;
        let token = self.tokens().remove(&action_id);
        if let Some(token) = token {
            self.store.write().await.rollback(&token);
        }
        Ok(removed)
    }

    pub fn pending_token_count(&self) -> usize {
        self.tokens().len()
    }
}

/// A card missing from the store was either deleted by a peer, which is
/// not a failure, or never existed.
fn removed_or_unknown(store: &BoardStore, card_id: &CardId) -> Result<DispatchOutcome, SyncError> {
    if store.is_tombstoned(card_id) {
        log::debug!("Card {card_id} was deleted remotely; nothing to send");
        return Ok(DispatchOutcome::RemovedRemotely(card_id.clone()));
    }
    Err(ModelError::UnknownCard(card_id.clone()).into())
}

#[async_trait]
impl ActionExecutor for MutationDispatcher {
    async fn execute(&self, action: &PendingAction) -> Result<ReplayEffect, ReplayError> {
        let token = self.tokens().get(&action.id).cloned();
        let result = match self.call_service(action).await {
            Ok(result) => result,
            Err(e) if e.is_connectivity() => return Err(ReplayError::Connectivity(e.to_string())),
            Err(ServiceError::NotFound(msg)) if action.target.is_some() => {
                self.tokens().remove(&action.id);
                if let Some(target) = &action.target {
                    let mut store = self.store.write().await;
                    if store.board_id() == Some(&action.board_id) {
                        if let Some(token) = &token {
                            store.rollback(token);
                        }
                        store.confirm_removed(target);
                    }
                    log::info!("Replayed action {} found {target} gone: {msg}", action.id);
                }
                return Ok(ReplayEffect::AlreadyApplied);
            }
            Err(e) => return Err(ReplayError::Rejected(e.into())),
        };
        self.tokens().remove(&action.id);

        let (outcome, effect) = {
            let mut store = self.store.write().await;
            let current = store.board_id() == Some(&action.board_id);
            match (&action.payload, result) {
                (ActionPayload::Create { temp_id, .. }, ServiceResult::Card(card)) => {
                    if current {
                        store.confirm_created(temp_id, card.clone(), token.as_ref());
                    }
                    let effect = ReplayEffect::Created {
                        temp_id: temp_id.clone(),
                        card_id: card.id.clone(),
                    };
                    (
                        DispatchOutcome::Created {
                            temp_id: temp_id.clone(),
                            card,
                        },
                        effect,
                    )
                }
                (_, ServiceResult::Card(card)) => {
                    if current {
                        store.apply_confirmed(card.clone(), token.as_ref());
                    }
                    (DispatchOutcome::Confirmed(card), ReplayEffect::Applied)
                }
                (_, ServiceResult::Deleted) => {
                    let target = action.target.clone().unwrap_or_else(|| CardId::new(""));
                    if current {
                        store.confirm_removed(&target);
                    }
                    (DispatchOutcome::Deleted(target), ReplayEffect::Applied)
                }
            }
        };

        self.announce(action, &outcome).await;
        if matches!(action.payload, ActionPayload::Reorder { .. } | ActionPayload::Create { .. })
            && self.store.read().await.board_id() == Some(&action.board_id)
        {
            self.refetch.request().await;
        }
        Ok(effect)
    }
}
