//! Sync engine.
//!
//! Owns every component and the lifecycle of one board context at a time.
//!
//! ```text
//!   enter_board(id)
//!     ├─ fetch snapshot (or cached copy when offline)
//!     ├─ load store, restore queued overlays
//!     ├─ subscribe bus ──► reconciler task
//!     └─ join channel room, request presence
//!
//!   leave_board()
//!     ├─ dispose subscription (synchronous), stop reconciler
//!     ├─ clear store, presence, activity
//!     └─ leave channel room
//! ```

use std::sync::Arc;
use taskboard_core::{
    Board, BoardId, BoardSnapshot, Card, CardDraft, CardId, CardPatch, DropSignal, Role, UserId,
};
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::activity::{Activity, ActivityFeed};
use crate::broadcast::{EventBus, SubscriptionHandle};
use crate::client::{ChannelClient, ConnectionState, Connector, WsConnector};
use crate::config::SyncConfig;
use crate::dispatcher::{DispatchOutcome, MutationDispatcher};
use crate::error::SyncError;
use crate::offline::{ActionId, OfflineManager, OfflineStatus, PendingAction, ReplayReport};
use crate::presence::{OnlineUser, PresenceRegistry};
use crate::protocol::{ClientIdentity, EventCategory};
use crate::reconciler::{EchoLedger, EventReconciler};
use crate::refetch::{RefetchCoalescer, RefetchOutcome};
use crate::rest::RestBoardService;
use crate::service::{BoardDraft, BoardPatch, BoardService};
use crate::storage::{LocalStore, MemoryStore, RocksStore, StoreConfig};
use crate::store::{BoardStore, SharedStore, StoreChange};

struct BoardSession {
    board_id: BoardId,
    subscription: SubscriptionHandle,
    reconciler: JoinHandle<()>,
}

pub struct SyncEngine {
    identity: ClientIdentity,
    service: Arc<dyn BoardService>,
    store: SharedStore,
    offline: Arc<OfflineManager>,
    bus: Arc<EventBus>,
    channel: Arc<ChannelClient>,
    presence: Arc<RwLock<PresenceRegistry>>,
    activity: Arc<RwLock<ActivityFeed>>,
    echoes: Arc<EchoLedger>,
    refetch: Arc<RefetchCoalescer>,
    dispatcher: Arc<MutationDispatcher>,
    session: Mutex<Option<BoardSession>>,
}

impl SyncEngine {
    pub fn new(
        config: &SyncConfig,
        identity: ClientIdentity,
        service: Arc<dyn BoardService>,
        connector: Arc<dyn Connector>,
        local_store: Arc<dyn LocalStore>,
    ) -> Self {
        let store = BoardStore::shared(config.event_buffer);
        let offline = Arc::new(OfflineManager::new(local_store, config.snapshot_ttl, true));
        let bus = Arc::new(EventBus::new(config.event_buffer));
        let channel = Arc::new(ChannelClient::new(
            connector,
            bus.clone(),
            config.reconnect_attempts,
            config.reconnect_delay,
        ));
        let echoes = Arc::new(EchoLedger::new(identity.client_id, config.echo_window));
        let refetch = Arc::new(RefetchCoalescer::new(
            store.clone(),
            service.clone(),
            Some(offline.clone()),
        ));
        let dispatcher = Arc::new(MutationDispatcher::new(
            identity.clone(),
            store.clone(),
            service.clone(),
            offline.clone(),
            channel.clone(),
            echoes.clone(),
            refetch.clone(),
        ));

        Self {
            identity,
            service,
            store,
            offline,
            bus,
            channel,
            presence: Arc::new(RwLock::new(PresenceRegistry::new())),
            activity: Arc::new(RwLock::new(ActivityFeed::new(config.activity_capacity))),
            echoes,
            refetch,
            dispatcher,
            session: Mutex::new(None),
        }
    }

    /// Engine over the REST service and WebSocket channel. Offline state
    /// lives in RocksDB when `storage_path` is set, in memory otherwise.
    pub fn open(
        config: &SyncConfig,
        identity: ClientIdentity,
        token: &str,
    ) -> Result<Self, SyncError> {
        let service = Arc::new(RestBoardService::new(config.api_base_url.clone(), token)?);
        let connector = Arc::new(WsConnector::new(
            config.channel_url.clone(),
            Some(token.to_string()),
        ));
        let local_store: Arc<dyn LocalStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksStore::open(StoreConfig::at(path))?),
            None => Arc::new(MemoryStore::new()),
        };
        log::info!(
            "Opening sync engine for {} ({})",
            identity.user_name,
            identity.client_id
        );
        Ok(Self::new(config, identity, service, connector, local_store))
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    // ─── Channel ─────────────────────────────────────────────────────

    pub async fn connect(&self) -> Result<(), SyncError> {
        self.channel.connect().await.map_err(SyncError::from)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.channel.state()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.channel.watch_state()
    }

    pub async fn shutdown(&self) {
        self.leave_board().await;
        self.channel.disconnect().await;
    }

    // ─── Board context ───────────────────────────────────────────────

    /// Make a board the current context. Any previous board is left first.
    pub async fn enter_board(&self, board_id: &BoardId) -> Result<BoardSnapshot, SyncError> {
        let mut session = self.session.lock().await;
        self.end_session(&mut session).await;

        let snapshot = self.fetch_for_entry(board_id).await?;
        let scope = {
            let mut store = self.store.write().await;
            store.load(snapshot);
            store.scope().ok_or(SyncError::NoBoard)?
        };
        self.dispatcher.restore_overlays(board_id).await;

        let subscription = self.bus.subscribe(&EventCategory::ALL);
        let handle = subscription.handle();
        let reconciler = EventReconciler::new(
            scope,
            self.store.clone(),
            self.presence.clone(),
            self.activity.clone(),
            self.echoes.clone(),
            self.refetch.clone(),
        );
        *session = Some(BoardSession {
            board_id: board_id.clone(),
            subscription: handle,
            reconciler: tokio::spawn(reconciler.run(subscription)),
        });

        if let Err(e) = self.channel.join_board(board_id).await {
            log::debug!("Join of board {board_id} deferred: {e}");
        } else if let Err(e) = self.channel.request_online_users(board_id).await {
            log::debug!("Presence request for {board_id} failed: {e}");
        }

        self.store.read().await.snapshot().ok_or(SyncError::NoBoard)
    }

    async fn fetch_for_entry(&self, board_id: &BoardId) -> Result<BoardSnapshot, SyncError> {
        if self.offline.is_online() {
            match self.service.get_board(board_id).await {
                Ok(snapshot) => {
                    self.offline.save_board(board_id, &snapshot).await;
                    return Ok(snapshot);
                }
                Err(e) if e.is_connectivity() => {
                    log::warn!("Board {board_id} unreachable, trying cached copy: {e}");
                    self.offline.set_online(false);
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.offline
            .cached_board(board_id)
            .await
            .ok_or_else(|| SyncError::Connectivity(format!("no cached copy of board {board_id}")))
    }

    pub async fn leave_board(&self) {
        let mut session = self.session.lock().await;
        self.end_session(&mut session).await;
    }

    async fn end_session(&self, session: &mut Option<BoardSession>) {
        let Some(ended) = session.take() else {
            return;
        };
        ended.subscription.dispose();
        ended.reconciler.abort();
        self.store.write().await.clear();
        self.presence.write().await.clear();
        self.activity.write().await.clear();
        if let Err(e) = self.channel.leave_board(&ended.board_id).await {
            log::debug!("Leave of board {} not sent: {e}", ended.board_id);
        }
        log::info!("Left board {}", ended.board_id);
    }

    pub async fn current_board_id(&self) -> Option<BoardId> {
        self.store.read().await.board_id().cloned()
    }

    async fn require_board_id(&self) -> Result<BoardId, SyncError> {
        self.current_board_id().await.ok_or(SyncError::NoBoard)
    }

    pub async fn refresh_board(&self) -> RefetchOutcome {
        self.refetch.request().await
    }

    // ─── Card mutations ──────────────────────────────────────────────

    pub async fn create_card(
        &self,
        board_id: &BoardId,
        draft: CardDraft,
    ) -> Result<DispatchOutcome, SyncError> {
        self.dispatcher.create(board_id, draft).await
    }

    pub async fn update_card(
        &self,
        card_id: &CardId,
        patch: CardPatch,
    ) -> Result<DispatchOutcome, SyncError> {
        self.dispatcher.update(card_id, patch).await
    }

    pub async fn delete_card(&self, card_id: &CardId) -> Result<DispatchOutcome, SyncError> {
        self.dispatcher.delete(card_id).await
    }

    pub async fn reorder_card(
        &self,
        card_id: &CardId,
        source_column: &str,
        destination_column: &str,
    ) -> Result<DispatchOutcome, SyncError> {
        self.dispatcher
            .reorder(card_id, source_column, destination_column)
            .await
    }

    pub async fn move_card_by_drop(
        &self,
        card_id: &CardId,
        signals: &[DropSignal],
    ) -> Result<DispatchOutcome, SyncError> {
        self.dispatcher.move_card_by_drop(card_id, signals).await
    }

    // ─── Offline ─────────────────────────────────────────────────────

    /// Record a connectivity signal. Coming back online replays the queue
    /// and then refreshes the current board.
    pub async fn set_online(&self, online: bool) -> Option<ReplayReport> {
        if !self.offline.set_online(online) {
            return None;
        }
        Some(self.sync_pending().await)
    }

    pub async fn sync_pending(&self) -> ReplayReport {
        let report = self.offline.replay(self.dispatcher.as_ref()).await;
        if report.interrupted {
            log::warn!("Replay interrupted with {} actions queued", report.remaining);
        } else if self.current_board_id().await.is_some() {
            self.refetch.request().await;
        }
        report
    }

    pub fn is_online(&self) -> bool {
        self.offline.is_online()
    }

    pub fn watch_online(&self) -> watch::Receiver<bool> {
        self.offline.watch_online()
    }

    pub async fn offline_status(&self) -> OfflineStatus {
        self.offline.status().await
    }

    pub async fn pending_actions(&self) -> Vec<PendingAction> {
        self.offline.pending().await
    }

    /// Drop a queued action and roll back its optimistic change.
    pub async fn discard_action(
        &self,
        action_id: ActionId,
    ) -> Result<Option<PendingAction>, SyncError> {
        self.dispatcher.discard(action_id).await
    }

    /// Remove every queued action and cached snapshot.
    pub async fn clear_offline_data(&self) -> Result<(), SyncError> {
        for action in self.offline.pending().await {
            self.dispatcher.discard(action.id).await?;
        }
        self.offline.clear().await.map_err(SyncError::from)
    }

    // ─── Views ───────────────────────────────────────────────────────

    /// Visible board: confirmed state with pending local changes applied.
    pub async fn board(&self) -> Option<BoardSnapshot> {
        self.store.read().await.snapshot()
    }

    pub async fn card(&self, card_id: &CardId) -> Option<Card> {
        self.store.read().await.card(card_id)
    }

    pub async fn cards_in_column(&self, column: &str) -> Vec<Card> {
        self.store.read().await.cards_in_column(column)
    }

    pub async fn has_pending_change(&self, card_id: &CardId) -> bool {
        self.store.read().await.has_overlay(card_id)
    }

    pub async fn subscribe_changes(&self) -> broadcast::Receiver<StoreChange> {
        self.store.read().await.subscribe()
    }

    pub async fn online_users(&self) -> Vec<OnlineUser> {
        self.presence.read().await.users()
    }

    pub async fn editors_of(&self, card_id: &CardId) -> Vec<OnlineUser> {
        self.presence
            .read()
            .await
            .editors_of(card_id)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn activity(&self) -> Vec<Activity> {
        self.activity.read().await.entries()
    }

    // ─── Editing presence ────────────────────────────────────────────

    pub async fn start_editing(&self, card_id: &CardId) -> Result<(), SyncError> {
        let board_id = self.require_board_id().await?;
        self.channel
            .start_editing(&board_id, card_id)
            .await
            .map_err(SyncError::from)
    }

    pub async fn stop_editing(&self, card_id: &CardId) -> Result<(), SyncError> {
        let board_id = self.require_board_id().await?;
        self.channel
            .stop_editing(&board_id, card_id)
            .await
            .map_err(SyncError::from)
    }

    // ─── Boards and members ──────────────────────────────────────────

    pub async fn list_boards(&self) -> Result<Vec<Board>, SyncError> {
        Ok(self.service.list_boards().await?)
    }

    pub async fn create_board(&self, draft: &BoardDraft) -> Result<Board, SyncError> {
        Ok(self.service.create_board(draft).await?)
    }

    pub async fn update_board(
        &self,
        board_id: &BoardId,
        patch: &BoardPatch,
    ) -> Result<Board, SyncError> {
        let board = self.service.update_board(board_id, patch).await?;
        self.adopt_board(board.clone()).await;
        Ok(board)
    }

    pub async fn delete_board(&self, board_id: &BoardId) -> Result<(), SyncError> {
        self.service.delete_board(board_id).await?;
        if self.current_board_id().await.as_ref() == Some(board_id) {
            self.leave_board().await;
        }
        Ok(())
    }

    pub async fn add_member(
        &self,
        board_id: &BoardId,
        user_id: &UserId,
        role: Role,
    ) -> Result<Board, SyncError> {
        let board = self.service.add_member(board_id, user_id, role).await?;
        self.adopt_board(board.clone()).await;
        Ok(board)
    }

    pub async fn remove_member(
        &self,
        board_id: &BoardId,
        user_id: &UserId,
    ) -> Result<Board, SyncError> {
        let board = self.service.remove_member(board_id, user_id).await?;
        self.adopt_board(board.clone()).await;
        Ok(board)
    }

    pub async fn update_member_role(
        &self,
        board_id: &BoardId,
        user_id: &UserId,
        role: Role,
    ) -> Result<Board, SyncError> {
        let board = self.service.update_member_role(board_id, user_id, role).await?;
        self.adopt_board(board.clone()).await;
        Ok(board)
    }

    async fn adopt_board(&self, board: Board) {
        if self.store.write().await.replace_board(board.clone()) {
            if let Some(snapshot) = self.store.read().await.confirmed_snapshot() {
                self.offline.save_board(&board.id, &snapshot).await;
            }
        }
    }
}
