//! HTTP implementation of [`BoardService`].
//!
//! ```text
//! GET    /boards                          → { boards }
//! POST   /boards                          → { board }
//! GET    /boards/{id}                     → { board, cards }
//! PUT    /boards/{id}                     → { board }
//! DELETE /boards/{id}
//! POST   /boards/{id}/members             → { board }
//! DELETE /boards/{id}/members/{user}      → { board }
//! PUT    /boards/{id}/members/{user}/role → { board }
//! POST   /cards                           → { card }
//! PUT    /cards/{id}                      → { card }
//! DELETE /cards/{id}
//! POST   /cards/reorder                   → { card }
//! ```
//!
//! Card mutations send the action id in an `Idempotency-Key` header.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use taskboard_core::{
    Board, BoardId, BoardSnapshot, Card, CardDraft, CardId, CardPatch, Role, UserId,
};

use crate::error::ServiceError;
use crate::offline::ActionId;
use crate::service::{BoardDraft, BoardPatch, BoardService, ReorderRequest};

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Deserialize)]
struct BoardsEnvelope {
    boards: Vec<Board>,
}

#[derive(Deserialize)]
struct BoardEnvelope {
    board: Board,
}

#[derive(Deserialize)]
struct CardEnvelope {
    card: Card,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NewCard<'a> {
    #[serde(flatten)]
    draft: &'a CardDraft,
    board_id: &'a BoardId,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NewMember<'a> {
    user_id: &'a UserId,
    role: Role,
}

#[derive(Serialize)]
struct RoleChange {
    role: Role,
}

/// Map an HTTP failure status onto the service error taxonomy.
pub fn classify(status: StatusCode, message: String) -> ServiceError {
    match status.as_u16() {
        400 | 422 => ServiceError::Validation(message),
        401 | 403 => ServiceError::Permission(message),
        404 => ServiceError::NotFound(message),
        409 => ServiceError::Conflict(message),
        code => ServiceError::Server {
            status: code,
            message,
        },
    }
}

fn transport_error(e: reqwest::Error) -> ServiceError {
    // Connect, timeout, and body-send failures all mean the service was not
    // reached or its answer was lost.
    if e.is_decode() {
        ServiceError::Decode(e.to_string())
    } else {
        ServiceError::Connectivity(e.to_string())
    }
}

/// Pull `message` out of a JSON error body, falling back to the raw text.
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

pub struct RestBoardService {
    client: Client,
    base_url: String,
    token: String,
}

impl RestBoardService {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
    ) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ServiceError::Connectivity(e.to_string()))?;
        Ok(Self::with_client(client, base_url, token))
    }

    pub fn with_client(
        client: Client,
        base_url: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, self.url(path))
            .bearer_auth(&self.token)
    }

    fn mutation(&self, method: Method, path: &str, action: ActionId) -> RequestBuilder {
        self.request(method, path)
            .header(IDEMPOTENCY_HEADER, action.to_string())
    }

    async fn send(builder: RequestBuilder) -> Result<Response, ServiceError> {
        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        log::debug!("Service responded {status}: {body}");
        Err(classify(status, error_message(&body)))
    }

    async fn send_json<T: DeserializeOwned>(builder: RequestBuilder) -> Result<T, ServiceError> {
        let response = Self::send(builder).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| ServiceError::Decode(e.to_string()))
    }
}

#[async_trait]
impl BoardService for RestBoardService {
    async fn list_boards(&self) -> Result<Vec<Board>, ServiceError> {
        let envelope: BoardsEnvelope = Self::send_json(self.request(Method::GET, "/boards")).await?;
        Ok(envelope.boards)
    }

    async fn create_board(&self, draft: &BoardDraft) -> Result<Board, ServiceError> {
        let builder = self.request(Method::POST, "/boards").json(draft);
        let envelope: BoardEnvelope = Self::send_json(builder).await?;
        Ok(envelope.board)
    }

    async fn get_board(&self, board_id: &BoardId) -> Result<BoardSnapshot, ServiceError> {
        Self::send_json(self.request(Method::GET, &format!("/boards/{board_id}"))).await
    }

    async fn update_board(
        &self,
        board_id: &BoardId,
        patch: &BoardPatch,
    ) -> Result<Board, ServiceError> {
        let builder = self
            .request(Method::PUT, &format!("/boards/{board_id}"))
            .json(patch);
        let envelope: BoardEnvelope = Self::send_json(builder).await?;
        Ok(envelope.board)
    }

    async fn delete_board(&self, board_id: &BoardId) -> Result<(), ServiceError> {
        Self::send(self.request(Method::DELETE, &format!("/boards/{board_id}"))).await?;
        Ok(())
    }

    async fn add_member(
        &self,
        board_id: &BoardId,
        user_id: &UserId,
        role: Role,
    ) -> Result<Board, ServiceError> {
        let builder = self
            .request(Method::POST, &format!("/boards/{board_id}/members"))
            .json(&NewMember { user_id, role });
        let envelope: BoardEnvelope = Self::send_json(builder).await?;
        Ok(envelope.board)
    }

    async fn remove_member(
        &self,
        board_id: &BoardId,
        user_id: &UserId,
    ) -> Result<Board, ServiceError> {
        let builder = self.request(
            Method::DELETE,
            &format!("/boards/{board_id}/members/{user_id}"),
        );
        let envelope: BoardEnvelope = Self::send_json(builder).await?;
        Ok(envelope.board)
    }

    async fn update_member_role(
        &self,
        board_id: &BoardId,
        user_id: &UserId,
        role: Role,
    ) -> Result<Board, ServiceError> {
        let builder = self
            .request(
                Method::PUT,
                &format!("/boards/{board_id}/members/{user_id}/role"),
            )
            .json(&RoleChange { role });
        let envelope: BoardEnvelope = Self::send_json(builder).await?;
        Ok(envelope.board)
    }

    async fn create_card(
        &self,
        board_id: &BoardId,
        draft: &CardDraft,
        action: ActionId,
    ) -> Result<Card, ServiceError> {
        let builder = self
            .mutation(Method::POST, "/cards", action)
            .json(&NewCard { draft, board_id });
        let envelope: CardEnvelope = Self::send_json(builder).await?;
        Ok(envelope.card)
    }

    async fn update_card(
        &self,
        card_id: &CardId,
        patch: &CardPatch,
        action: ActionId,
    ) -> Result<Card, ServiceError> {
        let builder = self
            .mutation(Method::PUT, &format!("/cards/{card_id}"), action)
            .json(patch);
        let envelope: CardEnvelope = Self::send_json(builder).await?;
        Ok(envelope.card)
    }

    async fn delete_card(&self, card_id: &CardId, action: ActionId) -> Result<(), ServiceError> {
        Self::send(self.mutation(Method::DELETE, &format!("/cards/{card_id}"), action)).await?;
        Ok(())
    }

    async fn reorder_card(
        &self,
        request: &ReorderRequest,
        action: ActionId,
    ) -> Result<Card, ServiceError> {
        let builder = self
            .mutation(Method::POST, "/cards/reorder", action)
            .json(request);
        let envelope: CardEnvelope = Self::send_json(builder).await?;
        Ok(envelope.card)
    }
}
