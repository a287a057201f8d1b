//! Realtime channel protocol.
//!
//! Every frame is a JSON text message:
//! ```text
//! { "event": "<name>", "data": { ...camelCase payload... } }
//! ```
//!
//! Outbound commands (client → channel):
//! `join_board`, `leave_board`, `request_online_users`, `start_editing`,
//! `stop_editing`.
//!
//! Events (both directions; the client publishes card events after a
//! confirmed mutation so peers can react):
//! `card_created`, `card_updated`, `card_deleted`, `card_reordered`,
//! `member_added`, `user_joined_board`, `user_left_board`,
//! `user_disconnected`, `online_users_update`, `user_started_editing`,
//! `user_stopped_editing`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taskboard_core::{BoardId, Card, CardId, Member, UserId};
use uuid::Uuid;

use crate::error::ChannelError;
use crate::offline::ActionId;

/// Who this client is on the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientIdentity {
    /// Unique per engine instance; distinguishes two tabs of the same user.
    pub client_id: Uuid,
    pub user_id: UserId,
    pub user_name: String,
}

impl ClientIdentity {
    pub fn new(user_id: impl Into<UserId>, user_name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), user_id, user_name)
    }

    /// Create with explicit client id (for testing)
    pub fn with_id(
        client_id: Uuid,
        user_id: impl Into<UserId>,
        user_name: impl Into<String>,
    ) -> Self {
        Self {
            client_id,
            user_id: user_id.into(),
            user_name: user_name.into(),
        }
    }

    pub fn actor(&self, action: Option<ActionId>) -> Actor {
        Actor {
            user_id: self.user_id.clone(),
            user_name: Some(self.user_name.clone()),
            client_id: Some(self.client_id),
            action_id: action,
        }
    }
}

/// Originator of an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    #[serde(alias = "_id")]
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<ActionId>,
}

impl Actor {
    pub fn display_name(&self) -> &str {
        self.user_name.as_deref().unwrap_or(UNKNOWN_USER)
    }
}

pub const UNKNOWN_USER: &str = "Unknown User";

// ───────────────────────────────────────────────────────────────────
// Event payloads
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardEvent {
    pub board_id: BoardId,
    pub card: Card,
    #[serde(
        default,
        alias = "createdBy",
        alias = "updatedBy",
        skip_serializing_if = "Option::is_none"
    )]
    pub actor: Option<Actor>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardDeletedEvent {
    pub board_id: BoardId,
    pub card_id: CardId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card_title: Option<String>,
    #[serde(default, alias = "deletedBy", skip_serializing_if = "Option::is_none")]
    pub actor: Option<Actor>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardReorderedEvent {
    pub board_id: BoardId,
    pub card_id: CardId,
    pub source_column: String,
    pub destination_column: String,
    #[serde(default)]
    pub source_index: usize,
    #[serde(default)]
    pub destination_index: usize,
    #[serde(default, alias = "reorderedBy", skip_serializing_if = "Option::is_none")]
    pub actor: Option<Actor>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberAddedEvent {
    pub board_id: BoardId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member: Option<Member>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_name: Option<String>,
    #[serde(default, alias = "addedBy", skip_serializing_if = "Option::is_none")]
    pub actor: Option<Actor>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEvent {
    pub board_id: BoardId,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineUserRecord {
    #[serde(rename = "_id", alias = "id", alias = "userId")]
    pub user_id: UserId,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUsersEvent {
    pub board_id: BoardId,
    pub users: Vec<OnlineUserRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditingEvent {
    pub board_id: BoardId,
    pub card_id: CardId,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
}

// ───────────────────────────────────────────────────────────────────
// Events
// ───────────────────────────────────────────────────────────────────

/// Subscription category of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
    CardCreated,
    CardUpdated,
    CardDeleted,
    CardReordered,
    MemberAdded,
    PresenceJoined,
    PresenceLeft,
    PresenceDisconnected,
    PresenceSnapshot,
    EditingStarted,
    EditingStopped,
}

impl EventCategory {
    pub const ALL: [EventCategory; 11] = [
        EventCategory::CardCreated,
        EventCategory::CardUpdated,
        EventCategory::CardDeleted,
        EventCategory::CardReordered,
        EventCategory::MemberAdded,
        EventCategory::PresenceJoined,
        EventCategory::PresenceLeft,
        EventCategory::PresenceDisconnected,
        EventCategory::PresenceSnapshot,
        EventCategory::EditingStarted,
        EventCategory::EditingStopped,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ChannelEvent {
    CardCreated(CardEvent),
    CardUpdated(CardEvent),
    CardDeleted(CardDeletedEvent),
    CardReordered(CardReorderedEvent),
    MemberAdded(MemberAddedEvent),
    #[serde(rename = "user_joined_board")]
    UserJoined(PresenceEvent),
    #[serde(rename = "user_left_board")]
    UserLeft(PresenceEvent),
    UserDisconnected(PresenceEvent),
    #[serde(rename = "online_users_update")]
    OnlineUsers(OnlineUsersEvent),
    UserStartedEditing(EditingEvent),
    UserStoppedEditing(EditingEvent),
}

impl ChannelEvent {
    pub fn category(&self) -> EventCategory {
        match self {
            ChannelEvent::CardCreated(_) => EventCategory::CardCreated,
            ChannelEvent::CardUpdated(_) => EventCategory::CardUpdated,
            ChannelEvent::CardDeleted(_) => EventCategory::CardDeleted,
            ChannelEvent::CardReordered(_) => EventCategory::CardReordered,
            ChannelEvent::MemberAdded(_) => EventCategory::MemberAdded,
            ChannelEvent::UserJoined(_) => EventCategory::PresenceJoined,
            ChannelEvent::UserLeft(_) => EventCategory::PresenceLeft,
            ChannelEvent::UserDisconnected(_) => EventCategory::PresenceDisconnected,
            ChannelEvent::OnlineUsers(_) => EventCategory::PresenceSnapshot,
            ChannelEvent::UserStartedEditing(_) => EventCategory::EditingStarted,
            ChannelEvent::UserStoppedEditing(_) => EventCategory::EditingStopped,
        }
    }

    pub fn board_id(&self) -> &BoardId {
        match self {
            ChannelEvent::CardCreated(e) | ChannelEvent::CardUpdated(e) => &e.board_id,
            ChannelEvent::CardDeleted(e) => &e.board_id,
            ChannelEvent::CardReordered(e) => &e.board_id,
            ChannelEvent::MemberAdded(e) => &e.board_id,
            ChannelEvent::UserJoined(e)
            | ChannelEvent::UserLeft(e)
            | ChannelEvent::UserDisconnected(e) => &e.board_id,
            ChannelEvent::OnlineUsers(e) => &e.board_id,
            ChannelEvent::UserStartedEditing(e) | ChannelEvent::UserStoppedEditing(e) => {
                &e.board_id
            }
        }
    }

    pub fn actor(&self) -> Option<&Actor> {
        match self {
            ChannelEvent::CardCreated(e) | ChannelEvent::CardUpdated(e) => e.actor.as_ref(),
            ChannelEvent::CardDeleted(e) => e.actor.as_ref(),
            ChannelEvent::CardReordered(e) => e.actor.as_ref(),
            ChannelEvent::MemberAdded(e) => e.actor.as_ref(),
            _ => None,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Commands and framing
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardRef {
    pub board_id: BoardId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditingRef {
    pub board_id: BoardId,
    pub card_id: CardId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ChannelCommand {
    JoinBoard(BoardRef),
    LeaveBoard(BoardRef),
    RequestOnlineUsers(BoardRef),
    StartEditing(EditingRef),
    StopEditing(EditingRef),
}

/// Anything that can travel over the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelFrame {
    Command(ChannelCommand),
    Event(ChannelEvent),
}

impl ChannelFrame {
    pub fn encode(&self) -> Result<String, ChannelError> {
        serde_json::to_string(self).map_err(|e| ChannelError::InvalidFrame(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ChannelError> {
        serde_json::from_str(text).map_err(|e| ChannelError::InvalidFrame(e.to_string()))
    }
}

impl From<ChannelCommand> for ChannelFrame {
    fn from(command: ChannelCommand) -> Self {
        ChannelFrame::Command(command)
    }
}

impl From<ChannelEvent> for ChannelFrame {
    fn from(event: ChannelEvent) -> Self {
        ChannelFrame::Event(event)
    }
}
