//! Destination-column resolution for card drops.
//!
//! A drop gesture yields up to four positional signals, each extracted by
//! the UI layer before it reaches this module:
//!
//! ```text
//!   drop target node ──── data-column? ──────────► ExplicitAttribute
//!        │
//!        ├── nearest droppable ancestor ─────────► AncestorAttribute
//!        │      data-column?
//!        ├── enclosing sortable list id ─────────► ContainerId
//!        │
//!        └── node's own id ──────────────────────► DirectId
//! ```
//!
//! Signals are ranked in exactly that order. The first one whose value is a
//! column title of the board wins, regardless of the order in which the
//! signals were supplied. Resolution is pure: identical inputs always give
//! identical outputs, and nothing is mutated.

use serde::{Deserialize, Serialize};

use crate::error::DragError;
use crate::model::{BoardSnapshot, CardId};

/// One positional hint about where a card was dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DropSignal {
    /// The drop target itself declares a column.
    ExplicitAttribute(String),
    /// The nearest enclosing droppable ancestor declares a column.
    AncestorAttribute(String),
    /// The identifier of the sortable list that encloses the drop target.
    ContainerId(String),
    /// The drop target's own identifier.
    DirectId(String),
}

impl DropSignal {
    /// Lower rank wins.
    pub fn rank(&self) -> u8 {
        match self {
            DropSignal::ExplicitAttribute(_) => 0,
            DropSignal::AncestorAttribute(_) => 1,
            DropSignal::ContainerId(_) => 2,
            DropSignal::DirectId(_) => 3,
        }
    }

    pub fn value(&self) -> &str {
        match self {
            DropSignal::ExplicitAttribute(v)
            | DropSignal::AncestorAttribute(v)
            | DropSignal::ContainerId(v)
            | DropSignal::DirectId(v) => v,
        }
    }
}

/// Signals extracted from a drop target, each optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropTarget {
    pub explicit_column: Option<String>,
    pub ancestor_column: Option<String>,
    pub container_id: Option<String>,
    pub direct_id: Option<String>,
}

impl DropTarget {
    pub fn signals(&self) -> Vec<DropSignal> {
        let mut signals = Vec::with_capacity(4);
        if let Some(v) = &self.explicit_column {
            signals.push(DropSignal::ExplicitAttribute(v.clone()));
        }
        if let Some(v) = &self.ancestor_column {
            signals.push(DropSignal::AncestorAttribute(v.clone()));
        }
        if let Some(v) = &self.container_id {
            signals.push(DropSignal::ContainerId(v.clone()));
        }
        if let Some(v) = &self.direct_id {
            signals.push(DropSignal::DirectId(v.clone()));
        }
        signals
    }
}

/// Outcome of a successful resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropResolution {
    /// The card should move between columns.
    Move {
        card_id: CardId,
        from: String,
        to: String,
    },
    /// The card was dropped onto the column it is already in.
    NoMoveNeeded { card_id: CardId, column: String },
}

impl DropResolution {
    pub fn destination(&self) -> &str {
        match self {
            DropResolution::Move { to, .. } => to,
            DropResolution::NoMoveNeeded { column, .. } => column,
        }
    }
}

/// Resolve the destination column of a dragged card.
pub fn resolve_drop(
    card_id: &CardId,
    snapshot: &BoardSnapshot,
    signals: &[DropSignal],
) -> Result<DropResolution, DragError> {
    let card = snapshot
        .card(card_id)
        .ok_or_else(|| DragError::UnknownCard(card_id.clone()))?;

    let mut ranked: Vec<&DropSignal> = signals.iter().collect();
    ranked.sort_by_key(|s| s.rank());

    let destination = ranked
        .into_iter()
        .map(DropSignal::value)
        .find(|value| !value.is_empty() && snapshot.board.has_column(value));

    match destination {
        Some(column) if column == card.column => Ok(DropResolution::NoMoveNeeded {
            card_id: card_id.clone(),
            column: column.to_string(),
        }),
        Some(column) => Ok(DropResolution::Move {
            card_id: card_id.clone(),
            from: card.column.clone(),
            to: column.to_string(),
        }),
        None => {
            log::debug!("No drop signal for {card_id} matched a column: {signals:?}");
            Err(DragError::ResolutionFailed {
                card_id: card_id.clone(),
                offered: signals.to_vec(),
            })
        }
    }
}
