//! # taskboard-sync — Client synchronization engine for Taskboard
//!
//! Keeps a local view of one kanban board consistent with the board
//! service while the user edits it, peers edit it concurrently, and the
//! network comes and goes.
//!
//! ## Architecture
//!
//! ```text
//!  caller ──► SyncEngine ──► MutationDispatcher ──► BoardService (REST)
//!                 │                │      │
//!                 │                │      └──queue──► OfflineManager ──► LocalStore
//!                 │                ▼                      (replay)       (RocksDB)
//!                 │           BoardStore  ◄── confirmed / optimistic / foreign
//!                 │                ▲
//!                 │                │ merge_foreign, refetch
//!                 │          EventReconciler ◄── Subscription ◄── EventBus
//!                 │                │                                 ▲
//!                 │                └──► PresenceRegistry, ActivityFeed│
//!                 │                                                   │
//!                 └──► ChannelClient (WebSocket) ──── decoded events ─┘
//! ```
//!
//! ## Modules
//!
//! - [`engine`] — Owns the components and the board context lifecycle
//! - [`dispatcher`] — Validate, apply optimistically, confirm or roll back
//! - [`store`] — Confirmed state plus layered optimistic overlay
//! - [`reconciler`] — Merges peer events; echo suppression
//! - [`refetch`] — Coalesced full-board refresh
//! - [`offline`] — Durable action queue, snapshot cache, replay
//! - [`client`] — Realtime channel with bounded reconnect
//! - [`broadcast`] — Typed event bus with disposable subscriptions
//! - [`presence`] — Who is on the board and what they edit
//! - [`activity`] — Recent peer activity feed
//! - [`protocol`] — Channel frames, events and commands
//! - [`service`] / [`rest`] — Board service boundary and its HTTP client
//! - [`storage`] — Local key-value persistence
//!
//! Validation errors are detected before any state is touched; every other
//! failure either queues the change, rolls it back, or reports a typed
//! [`SyncError`].

pub mod activity;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod offline;
pub mod presence;
pub mod protocol;
pub mod reconciler;
pub mod refetch;
pub mod rest;
pub mod service;
pub mod storage;
pub mod store;

// Re-exports for convenience
pub use activity::{Activity, ActivityFeed};
pub use broadcast::{BusStats, Delivery, EventBus, Subscription, SubscriptionHandle};
pub use client::{
    ChannelClient, ChannelLink, ConnectionState, Connector, LoopbackConnector, LoopbackRemote,
    WsConnector,
};
pub use config::SyncConfig;
pub use dispatcher::{DispatchOutcome, MutationDispatcher};
pub use engine::SyncEngine;
pub use error::{ChannelError, ErrorKind, ServiceError, SyncError};
pub use offline::{
    ActionId, ActionKind, ActionPayload, OfflineManager, OfflineStatus, PendingAction, ReplayReport,
};
pub use presence::{OnlineUser, PresenceRegistry, PresenceStatus};
pub use protocol::{
    Actor, ChannelCommand, ChannelEvent, ChannelFrame, ClientIdentity, EventCategory,
};
pub use reconciler::{EchoLedger, EventReconciler, Reconciled};
pub use refetch::{RefetchCoalescer, RefetchOutcome};
pub use rest::RestBoardService;
pub use service::{BoardDraft, BoardPatch, BoardService, ReorderRequest};
pub use storage::{LocalStore, MemoryStore, RocksStore, StorageError, StoreConfig};
pub use store::{BoardStore, ChangeSource, MergeOutcome, StoreChange};
