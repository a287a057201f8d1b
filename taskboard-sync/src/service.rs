//! The authoritative board service, as seen by the engine.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use taskboard_core::{
    Board, BoardId, BoardSettings, BoardSnapshot, Card, CardDraft, CardId, CardPatch, Column, Role,
    UserId,
};

use crate::error::ServiceError;
use crate::offline::ActionId;

/// Move a card between columns. Indexes are advisory; the service decides
/// the final position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReorderRequest {
    pub board_id: BoardId,
    pub card_id: CardId,
    pub source_column: String,
    pub destination_column: String,
    #[serde(default)]
    pub source_index: usize,
    #[serde(default)]
    pub destination_index: usize,
}

impl ReorderRequest {
    pub fn new(
        board_id: BoardId,
        card_id: CardId,
        source_column: impl Into<String>,
        destination_column: impl Into<String>,
    ) -> Self {
        Self {
            board_id,
            card_id,
            source_column: source_column.into(),
            destination_column: destination_column.into(),
            source_index: 0,
            destination_index: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardDraft {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<Column>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<BoardSettings>,
}

impl BoardDraft {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            columns: Vec::new(),
            settings: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<Column>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<BoardSettings>,
}

/// Board service operations. Every call is authenticated by the
/// implementation; card mutations carry the client action id so that a
/// replayed call can be deduplicated.
#[async_trait]
pub trait BoardService: Send + Sync {
    async fn list_boards(&self) -> Result<Vec<Board>, ServiceError>;
    async fn create_board(&self, draft: &BoardDraft) -> Result<Board, ServiceError>;
    async fn get_board(&self, board_id: &BoardId) -> Result<BoardSnapshot, ServiceError>;
    async fn update_board(
        &self,
        board_id: &BoardId,
        patch: &BoardPatch,
    ) -> Result<Board, ServiceError>;
    async fn delete_board(&self, board_id: &BoardId) -> Result<(), ServiceError>;

    async fn add_member(
        &self,
        board_id: &BoardId,
        user_id: &UserId,
        role: Role,
    ) -> Result<Board, ServiceError>;
    async fn remove_member(
        &self,
        board_id: &BoardId,
        user_id: &UserId,
    ) -> Result<Board, ServiceError>;
    async fn update_member_role(
        &self,
        board_id: &BoardId,
        user_id: &UserId,
        role: Role,
    ) -> Result<Board, ServiceError>;

    async fn create_card(
        &self,
        board_id: &BoardId,
        draft: &CardDraft,
        action: ActionId,
    ) -> Result<Card, ServiceError>;
    async fn update_card(
        &self,
        card_id: &CardId,
        patch: &CardPatch,
        action: ActionId,
    ) -> Result<Card, ServiceError>;
    async fn delete_card(&self, card_id: &CardId, action: ActionId) -> Result<(), ServiceError>;
    async fn reorder_card(
        &self,
        request: &ReorderRequest,
        action: ActionId,
    ) -> Result<Card, ServiceError>;
}
