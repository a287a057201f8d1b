//! Errors raised by model validation and drop resolution.

use thiserror::Error;

use crate::drag::DropSignal;
use crate::model::CardId;

/// Client-side validation failures.
///
/// These are detected before any state is touched; a caller receiving one
/// can be sure nothing was applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("card title must not be empty")]
    EmptyTitle,

    #[error("column '{column}' does not exist on this board")]
    UnknownColumn { column: String },

    #[error("'{0}' is not a valid card status")]
    InvalidStatus(String),

    #[error("'{0}' is not a valid priority")]
    InvalidPriority(String),

    #[error("'{0}' is not a valid member role")]
    InvalidRole(String),

    #[error("card {0} is not on this board")]
    UnknownCard(CardId),
}

/// Drop resolution failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DragError {
    /// None of the offered signals named a column of the board.
    #[error("could not resolve a destination column for card {card_id}")]
    ResolutionFailed {
        card_id: CardId,
        offered: Vec<DropSignal>,
    },

    #[error("dragged card {0} is not on this board")]
    UnknownCard(CardId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_error_display() {
        let err = ModelError::UnknownColumn {
            column: "Archive".into(),
        };
        assert!(err.to_string().contains("Archive"));

        let err = ModelError::InvalidStatus("paused".into());
        assert!(err.to_string().contains("paused"));
    }

    #[test]
    fn test_drag_error_display() {
        let err = DragError::ResolutionFailed {
            card_id: CardId::new("c1"),
            offered: vec![DropSignal::DirectId("nowhere".into())],
        };
        assert!(err.to_string().contains("c1"));
    }
}
