//! # taskboard-core — Board model and drop resolution for Taskboard
//!
//! Pure data model shared by every Taskboard client: boards, columns,
//! cards, members, and the draft/patch types used to describe edits.
//! Nothing in this crate performs I/O or awaits; the networked engine
//! lives in `taskboard-sync`.
//!
//! ## Modules
//!
//! - [`model`] — Board, Card, Member, enums, drafts and patches
//! - [`drag`] — Deterministic destination-column resolution for drops
//! - [`error`] — Model and drag errors
//!
//! ```text
//! ┌──────────────┐   columns    ┌──────────────┐
//! │ Board        │ ───────────► │ Column       │ ◄── card.column
//! │ members      │              │ (title = key)│
//! │ settings     │              └──────────────┘
//! └──────┬───────┘
//!        │ owns
//!        ▼
//! ┌──────────────┐  CardPatch   ┌──────────────┐
//! │ Card         │ ───────────► │ Card'        │
//! └──────────────┘  (pure)      └──────────────┘
//! ```

pub mod drag;
pub mod error;
pub mod model;

pub use drag::{resolve_drop, DropResolution, DropSignal, DropTarget};
pub use error::{DragError, ModelError};
pub use model::{
    Board, BoardId, BoardSettings, BoardSnapshot, Card, CardDraft, CardId, CardPatch, CardStatus,
    Column, Comment, Member, Priority, Role, UserId,
};
