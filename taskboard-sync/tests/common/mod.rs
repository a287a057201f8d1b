//! Shared fixtures: an in-memory board service and an engine harness.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use indexmap::IndexMap;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use taskboard_core::{
    Board, BoardId, BoardSnapshot, Card, CardDraft, CardId, CardPatch, Role, UserId,
};
use taskboard_sync::{
    ActionId, BoardDraft, BoardPatch, BoardService, ClientIdentity, LocalStore, LoopbackConnector,
    MemoryStore, ReorderRequest, ServiceError, SyncConfig, SyncEngine,
};
use tokio::sync::OwnedMutexGuard;

pub const BOARD: &str = "b1";
pub const OWNER: &str = "u1";

#[derive(Debug, Clone)]
enum Applied {
    Card(Card),
    Deleted,
}

#[derive(Default)]
struct ServiceState {
    boards: IndexMap<BoardId, Board>,
    cards: IndexMap<CardId, Card>,
    next_id: u64,
    applied: HashMap<ActionId, Applied>,
    calls: Vec<String>,
    duplicates: usize,
    fail_next: VecDeque<ServiceError>,
}

/// Board service double. Honors the idempotency key: a repeated action id
/// returns the first result without applying the change again.
pub struct ScriptedService {
    state: Mutex<ServiceState>,
    reachable: AtomicBool,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl ScriptedService {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ServiceState {
                next_id: 100,
                ..ServiceState::default()
            }),
            reachable: AtomicBool::new(true),
            gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn with_board(board: Board, cards: Vec<Card>) -> Self {
        let service = Self::new();
        {
            let mut state = service.state.lock().unwrap();
            for card in cards {
                state.cards.insert(card.id.clone(), card);
            }
            state.boards.insert(board.id.clone(), board);
        }
        service
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// The next card mutation fails with `error`.
    pub fn fail_next(&self, error: ServiceError) {
        self.state.lock().unwrap().fail_next.push_back(error);
    }

    /// Hold every call until the returned guard is dropped.
    pub async fn pause(&self) -> OwnedMutexGuard<()> {
        self.gate.clone().lock_owned().await
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn mutation_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| !c.starts_with("get:") && !c.starts_with("list"))
            .collect()
    }

    pub fn duplicate_hits(&self) -> usize {
        self.state.lock().unwrap().duplicates
    }

    pub fn card(&self, card_id: &str) -> Option<Card> {
        self.state.lock().unwrap().cards.get(&CardId::new(card_id)).cloned()
    }

    pub fn cards(&self) -> Vec<Card> {
        self.state.lock().unwrap().cards.values().cloned().collect()
    }

    pub fn board(&self, board_id: &str) -> Option<Board> {
        self.state.lock().unwrap().boards.get(&BoardId::new(board_id)).cloned()
    }

    /// A peer changes a card directly on the service.
    pub fn remote_upsert(&self, card: Card) {
        self.state.lock().unwrap().cards.insert(card.id.clone(), card);
    }

    pub fn remote_delete(&self, card_id: &str) {
        self.state.lock().unwrap().cards.shift_remove(&CardId::new(card_id));
    }

    async fn enter(&self, call: String) -> Result<(), ServiceError> {
        drop(self.gate.lock().await);
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(ServiceError::Connectivity("connection refused".into()));
        }
        self.state.lock().unwrap().calls.push(call);
        Ok(())
    }

    fn mutate<F>(&self, action: ActionId, apply: F) -> Result<Applied, ServiceError>
    where
        F: FnOnce(&mut ServiceState) -> Result<Applied, ServiceError>,
    {
        let mut state = self.state.lock().unwrap();
        if let Some(previous) = state.applied.get(&action).cloned() {
            state.duplicates += 1;
            return Ok(previous);
        }
        if let Some(error) = state.fail_next.pop_front() {
            return Err(error);
        }
        let applied = apply(&mut state)?;
        state.applied.insert(action, applied.clone());
        Ok(applied)
    }
}

fn not_found(what: impl std::fmt::Display) -> ServiceError {
    ServiceError::NotFound(format!("{what} not found"))
}

fn into_card(applied: Applied) -> Result<Card, ServiceError> {
    match applied {
        Applied::Card(card) => Ok(card),
        Applied::Deleted => Err(ServiceError::Conflict("action already deleted the card".into())),
    }
}

#[async_trait]
impl BoardService for ScriptedService {
    async fn list_boards(&self) -> Result<Vec<Board>, ServiceError> {
        self.enter("list".into()).await?;
        Ok(self.state.lock().unwrap().boards.values().cloned().collect())
    }

    async fn create_board(&self, draft: &BoardDraft) -> Result<Board, ServiceError> {
        self.enter(format!("create_board:{}", draft.title)).await?;
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let mut board = Board::new(format!("b{}", state.next_id), draft.title.clone(), OWNER);
        if !draft.columns.is_empty() {
            board.columns = draft.columns.clone();
        }
        state.boards.insert(board.id.clone(), board.clone());
        Ok(board)
    }

    async fn get_board(&self, board_id: &BoardId) -> Result<BoardSnapshot, ServiceError> {
        self.enter(format!("get:{board_id}")).await?;
        let state = self.state.lock().unwrap();
        let board = state.boards.get(board_id).cloned().ok_or_else(|| not_found(board_id))?;
        let cards = state
            .cards
            .values()
            .filter(|c| &c.board_id == board_id)
            .cloned()
            .collect();
        Ok(BoardSnapshot::new(board, cards))
    }

    async fn update_board(
        &self,
        board_id: &BoardId,
        patch: &BoardPatch,
    ) -> Result<Board, ServiceError> {
        self.enter(format!("update_board:{board_id}")).await?;
        let mut state = self.state.lock().unwrap();
        let board = state.boards.get_mut(board_id).ok_or_else(|| not_found(board_id))?;
        if let Some(title) = &patch.title {
            board.title = title.clone();
        }
        if let Some(columns) = &patch.columns {
            board.columns = columns.clone();
        }
        Ok(board.clone())
    }

    async fn delete_board(&self, board_id: &BoardId) -> Result<(), ServiceError> {
        self.enter(format!("delete_board:{board_id}")).await?;
        let mut state = self.state.lock().unwrap();
        state.boards.shift_remove(board_id).ok_or_else(|| not_found(board_id))?;
        state.cards.retain(|_, c| &c.board_id != board_id);
        Ok(())
    }

    async fn add_member(
        &self,
        board_id: &BoardId,
        user_id: &UserId,
        role: Role,
    ) -> Result<Board, ServiceError> {
        self.enter(format!("add_member:{user_id}")).await?;
        let mut state = self.state.lock().unwrap();
        let board = state.boards.get_mut(board_id).ok_or_else(|| not_found(board_id))?;
        board.upsert_member(user_id.clone(), role);
        Ok(board.clone())
    }

    async fn remove_member(
        &self,
        board_id: &BoardId,
        user_id: &UserId,
    ) -> Result<Board, ServiceError> {
        self.enter(format!("remove_member:{user_id}")).await?;
        let mut state = self.state.lock().unwrap();
        let board = state.boards.get_mut(board_id).ok_or_else(|| not_found(board_id))?;
        if !board.remove_member(user_id) {
            return Err(not_found(user_id));
        }
        Ok(board.clone())
    }

    async fn update_member_role(
        &self,
        board_id: &BoardId,
        user_id: &UserId,
        role: Role,
    ) -> Result<Board, ServiceError> {
        self.enter(format!("update_member_role:{user_id}")).await?;
        let mut state = self.state.lock().unwrap();
        let board = state.boards.get_mut(board_id).ok_or_else(|| not_found(board_id))?;
        board.upsert_member(user_id.clone(), role);
        Ok(board.clone())
    }

    async fn create_card(
        &self,
        board_id: &BoardId,
        draft: &CardDraft,
        action: ActionId,
    ) -> Result<Card, ServiceError> {
        self.enter(format!("create:{}", draft.title)).await?;
        let applied = self.mutate(action, |state| {
            let board = state.boards.get(board_id).ok_or_else(|| not_found(board_id))?;
            if !board.has_column(&draft.column) {
                return Err(ServiceError::Validation(format!("unknown column {}", draft.column)));
            }
            state.next_id += 1;
            let card = draft.to_card(
                CardId::new(format!("c{}", state.next_id)),
                board_id.clone(),
                Utc::now(),
            );
            state.cards.insert(card.id.clone(), card.clone());
            Ok(Applied::Card(card))
        })?;
        into_card(applied)
    }

    async fn update_card(
        &self,
        card_id: &CardId,
        patch: &CardPatch,
        action: ActionId,
    ) -> Result<Card, ServiceError> {
        self.enter(format!("update:{card_id}")).await?;
        let applied = self.mutate(action, |state| {
            let current = state.cards.get(card_id).ok_or_else(|| not_found(card_id))?;
            let mut next = patch.apply_to(current);
            next.updated_at = Utc::now();
            state.cards.insert(card_id.clone(), next.clone());
            Ok(Applied::Card(next))
        })?;
        into_card(applied)
    }

    async fn delete_card(&self, card_id: &CardId, action: ActionId) -> Result<(), ServiceError> {
        self.enter(format!("delete:{card_id}")).await?;
        self.mutate(action, |state| {
            state.cards.shift_remove(card_id).ok_or_else(|| not_found(card_id))?;
            Ok(Applied::Deleted)
        })?;
        Ok(())
    }

    async fn reorder_card(
        &self,
        request: &ReorderRequest,
        action: ActionId,
    ) -> Result<Card, ServiceError> {
        self.enter(format!(
            "reorder:{}:{}",
            request.card_id, request.destination_column
        ))
        .await?;
        let applied = self.mutate(action, |state| {
            let card = state
                .cards
                .get_mut(&request.card_id)
                .ok_or_else(|| not_found(&request.card_id))?;
            card.column = request.destination_column.clone();
            card.updated_at = Utc::now();
            Ok(Applied::Card(card.clone()))
        })?;
        into_card(applied)
    }
}

// ───────────────────────────────────────────────────────────────────
// Fixtures
// ───────────────────────────────────────────────────────────────────

pub fn card(id: &str, title: &str, column: &str) -> Card {
    CardDraft::new(title, column).to_card(CardId::new(id), BoardId::new(BOARD), Utc::now())
}

/// Board `b1` owned by `u1`, with `u3` as a viewer, and two cards.
pub fn seeded_service() -> Arc<ScriptedService> {
    let mut board = Board::new(BOARD, "Sprint", OWNER);
    board.upsert_member(UserId::new("u2"), Role::Editor);
    board.upsert_member(UserId::new("u3"), Role::Viewer);
    Arc::new(ScriptedService::with_board(
        board,
        vec![card("c1", "Write docs", "To Do"), card("c2", "Fix login", "In Progress")],
    ))
}

pub struct Harness {
    pub engine: SyncEngine,
    pub service: Arc<ScriptedService>,
    pub connector: Arc<LoopbackConnector>,
    pub local: Arc<MemoryStore>,
}

impl Harness {
    pub fn new(service: Arc<ScriptedService>, identity: ClientIdentity) -> Self {
        Self::with_store(service, identity, Arc::new(MemoryStore::new()))
    }

    pub fn with_store(
        service: Arc<ScriptedService>,
        identity: ClientIdentity,
        local: Arc<MemoryStore>,
    ) -> Self {
        let connector = Arc::new(LoopbackConnector::new());
        let local_store: Arc<dyn LocalStore> = local.clone();
        let engine = SyncEngine::new(
            &SyncConfig::for_testing(),
            identity,
            service.clone(),
            connector.clone(),
            local_store,
        );
        Self {
            engine,
            service,
            connector,
            local,
        }
    }

    /// Owner `u1`, seeded board entered.
    pub async fn owner() -> Self {
        let harness = Self::new(seeded_service(), ClientIdentity::new(OWNER, "Ada"));
        harness.engine.enter_board(&BoardId::new(BOARD)).await.unwrap();
        harness
    }
}

pub fn id(s: &str) -> CardId {
    CardId::new(s)
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}
