//! Error taxonomy for the synchronization engine.
//!
//! The engine classifies failures; it never decides how they are presented.

use taskboard_core::{BoardId, CardId, DragError, ModelError};
use thiserror::Error;

use crate::storage::StorageError;

/// Failure reported by the service boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// The request never reached the service, or its response was lost.
    #[error("service unreachable: {0}")]
    Connectivity(String),

    #[error("rejected by service: {0}")]
    Validation(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("service error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("malformed service response: {0}")]
    Decode(String),
}

impl ServiceError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, ServiceError::Connectivity(_))
    }
}

/// Realtime channel failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    #[error("gave up after {attempts} connection attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("channel is not connected")]
    NotConnected,

    #[error("connection closed")]
    Closed,

    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

/// Coarse classification of a [`SyncError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Connectivity,
    Permission,
    Conflict,
    NotFound,
    Stale,
    Internal,
}

/// Error returned by every engine and dispatcher operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Detected locally; nothing was applied.
    #[error(transparent)]
    Validation(#[from] ModelError),

    #[error("offline: {0}")]
    Connectivity(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A response arrived for a board that is no longer in context.
    #[error("response for board {0} discarded; board context changed")]
    Stale(BoardId),

    #[error("no board is loaded")]
    NoBoard,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Unclassified service failure (server error, undecodable response).
    #[error(transparent)]
    Service(ServiceError),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Validation(_) => ErrorKind::Validation,
            SyncError::Connectivity(_) | SyncError::Channel(_) => ErrorKind::Connectivity,
            SyncError::Permission(_) => ErrorKind::Permission,
            SyncError::Conflict(_) => ErrorKind::Conflict,
            SyncError::NotFound(_) => ErrorKind::NotFound,
            SyncError::Stale(_) => ErrorKind::Stale,
            SyncError::NoBoard | SyncError::Storage(_) => ErrorKind::Internal,
            SyncError::Service(ServiceError::Validation(_)) => ErrorKind::Validation,
            SyncError::Service(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn read_only(card: &CardId) -> Self {
        SyncError::Permission(format!("viewers cannot modify card {card}"))
    }
}

impl From<ServiceError> for SyncError {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::Connectivity(msg) => SyncError::Connectivity(msg),
            ServiceError::Permission(msg) => SyncError::Permission(msg),
            ServiceError::Conflict(msg) => SyncError::Conflict(msg),
            ServiceError::NotFound(msg) => SyncError::NotFound(msg),
            other => SyncError::Service(other),
        }
    }
}

impl From<DragError> for SyncError {
    fn from(e: DragError) -> Self {
        match e {
            DragError::ResolutionFailed { .. } => SyncError::Conflict(e.to_string()),
            DragError::UnknownCard(id) => SyncError::Validation(ModelError::UnknownCard(id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskboard_core::DropSignal;

    #[test]
    fn test_service_error_mapping() {
        let err: SyncError = ServiceError::Connectivity("timeout".into()).into();
        assert_eq!(err.kind(), ErrorKind::Connectivity);

        let err: SyncError = ServiceError::Permission("viewer".into()).into();
        assert_eq!(err.kind(), ErrorKind::Permission);

        let err: SyncError = ServiceError::Validation("bad column".into()).into();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err: SyncError = ServiceError::Server {
            status: 500,
            message: "boom".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_unresolved_drop_is_conflict() {
        let err: SyncError = DragError::ResolutionFailed {
            card_id: CardId::new("c1"),
            offered: vec![DropSignal::DirectId("x".into())],
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let err: SyncError = DragError::UnknownCard(CardId::new("c9")).into();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_model_error_is_validation() {
        let err: SyncError = ModelError::EmptyTitle.into();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.to_string(), "card title must not be empty");
    }
}
