//! Board and card model.
//!
//! Field names follow the service's JSON records (`_id`, camelCase), so the
//! same types are used for service payloads, channel events and the
//! persisted snapshot cache. References that the service may return either
//! as a bare id or as a populated object (`{"_id": ..}`) decode to the id.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ModelError;

// ───────────────────────────────────────────────────────────────────
// Identifiers
// ───────────────────────────────────────────────────────────────────

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Service-assigned board identifier.
    BoardId
);
string_id!(
    /// Card identifier. Locally created cards carry a temporary id
    /// (prefix [`CardId::TEMP_PREFIX`]) until the service assigns one.
    CardId
);
string_id!(
    /// Opaque user identifier.
    UserId
);

impl CardId {
    pub const TEMP_PREFIX: &'static str = "tmp-";

    /// Whether this id was minted locally and is still awaiting the
    /// service-assigned permanent id.
    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(Self::TEMP_PREFIX)
    }
}

// ───────────────────────────────────────────────────────────────────
// Enumerations
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Editor,
    Admin,
}

impl Role {
    pub fn can_edit(self) -> bool {
        !matches!(self, Role::Viewer)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Editor => "editor",
            Role::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "viewer" => Ok(Role::Viewer),
            "editor" => Ok(Role::Editor),
            "admin" => Ok(Role::Admin),
            other => Err(ModelError::InvalidRole(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CardStatus {
    #[default]
    Active,
    InProgress,
    Completed,
    Blocked,
}

impl CardStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CardStatus::Active => "active",
            CardStatus::InProgress => "in-progress",
            CardStatus::Completed => "completed",
            CardStatus::Blocked => "blocked",
        }
    }
}

impl FromStr for CardStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(CardStatus::Active),
            "in-progress" => Ok(CardStatus::InProgress),
            "completed" => Ok(CardStatus::Completed),
            "blocked" => Ok(CardStatus::Blocked),
            other => Err(ModelError::InvalidStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

impl FromStr for Priority {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(ModelError::InvalidPriority(other.to_string())),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Board
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    #[serde(alias = "user", deserialize_with = "wire::reference")]
    pub user_id: UserId,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// Unique within a board; cards reference their column by title.
    pub title: String,
    #[serde(default)]
    pub description: String,
}

impl Column {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardSettings {
    pub is_public: bool,
    pub allow_comments: bool,
    pub allow_editing: bool,
}

impl Default for BoardSettings {
    fn default() -> Self {
        Self {
            is_public: false,
            allow_comments: true,
            allow_editing: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Board {
    #[serde(rename = "_id", alias = "id")]
    pub id: BoardId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(alias = "owner", deserialize_with = "wire::reference")]
    pub owner_id: UserId,
    #[serde(default)]
    pub members: Vec<Member>,
    #[serde(default)]
    pub columns: Vec<Column>,
    #[serde(default)]
    pub settings: BoardSettings,
}

impl Board {
    /// New board with the conventional three columns.
    pub fn new(id: impl Into<BoardId>, title: impl Into<String>, owner: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            owner_id: owner.into(),
            members: Vec::new(),
            columns: vec![
                Column::new("To Do"),
                Column::new("In Progress"),
                Column::new("Done"),
            ],
            settings: BoardSettings::default(),
        }
    }

    pub fn with_columns<I, S>(mut self, titles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = titles.into_iter().map(Column::new).collect();
        self
    }

    pub fn has_column(&self, title: &str) -> bool {
        self.columns.iter().any(|c| c.title == title)
    }

    /// Reject a column title that this board does not declare.
    pub fn check_column(&self, title: &str) -> Result<(), ModelError> {
        if self.has_column(title) {
            Ok(())
        } else {
            Err(ModelError::UnknownColumn {
                column: title.to_string(),
            })
        }
    }

    pub fn column_titles(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.title.as_str())
    }

    /// Effective role of a user. The owner is always an admin.
    pub fn role_of(&self, user: &UserId) -> Option<Role> {
        if &self.owner_id == user {
            return Some(Role::Admin);
        }
        self.members
            .iter()
            .find(|m| &m.user_id == user)
            .map(|m| m.role)
    }

    /// Whether the client may attempt card edits. Only an explicit viewer
    /// role, or a non-member on a board that disallows editing, is refused;
    /// the service remains the authority.
    pub fn can_edit(&self, user: &UserId) -> bool {
        match self.role_of(user) {
            Some(role) => role.can_edit(),
            None => self.settings.allow_editing,
        }
    }

    /// Insert or update a member, keeping first-insertion order.
    pub fn upsert_member(&mut self, user_id: UserId, role: Role) {
        match self.members.iter_mut().find(|m| m.user_id == user_id) {
            Some(member) => member.role = role,
            None => self.members.push(Member { user_id, role }),
        }
    }

    pub fn remove_member(&mut self, user_id: &UserId) -> bool {
        let before = self.members.len();
        self.members.retain(|m| &m.user_id != user_id);
        self.members.len() != before
    }
}

// ───────────────────────────────────────────────────────────────────
// Card
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    #[serde(alias = "user", alias = "author", deserialize_with = "wire::reference")]
    pub author_id: UserId,
    #[serde(default)]
    pub author_name: String,
    pub text: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    #[serde(rename = "_id", alias = "id")]
    pub id: CardId,
    #[serde(alias = "board", deserialize_with = "wire::reference")]
    pub board_id: BoardId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub column: String,
    #[serde(default)]
    pub status: CardStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, deserialize_with = "wire::due_date")]
    pub due_date: Option<NaiveDate>,
    #[serde(default, deserialize_with = "wire::references")]
    pub assignees: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub comments: Vec<Comment>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

/// Payload for creating a card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardDraft {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub column: String,
    #[serde(default)]
    pub status: CardStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "wire::due_date"
    )]
    pub due_date: Option<NaiveDate>,
    #[serde(default)]
    pub assignees: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

impl CardDraft {
    pub fn new(title: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            column: column.into(),
            status: CardStatus::default(),
            priority: Priority::default(),
            due_date: None,
            assignees: Vec::new(),
            labels: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn validate(&self, board: &Board) -> Result<(), ModelError> {
        validate_title(&self.title)?;
        board.check_column(&self.column)
    }

    /// Materialize the draft as a card under the given id.
    pub fn to_card(&self, id: CardId, board_id: BoardId, now: DateTime<Utc>) -> Card {
        Card {
            id,
            board_id,
            title: self.title.trim().to_string(),
            description: self.description.clone(),
            column: self.column.clone(),
            status: self.status,
            priority: self.priority,
            due_date: self.due_date,
            assignees: self.assignees.clone(),
            labels: self.labels.clone(),
            comments: Vec::new(),
            updated_at: now,
        }
    }
}

/// Partial card update. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<CardStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    /// `Some(None)` clears the due date.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "wire::due_date_patch"
    )]
    pub due_date: Option<Option<NaiveDate>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignees: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<Vec<Comment>>,
}

impl CardPatch {
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    pub fn column(column: impl Into<String>) -> Self {
        Self {
            column: Some(column.into()),
            ..Self::default()
        }
    }

    pub fn status(status: CardStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn validate(&self, board: &Board) -> Result<(), ModelError> {
        if let Some(title) = &self.title {
            validate_title(title)?;
        }
        if let Some(column) = &self.column {
            board.check_column(column)?;
        }
        Ok(())
    }

    /// Apply the patch to a card, returning the proposed value.
    pub fn apply_to(&self, card: &Card) -> Card {
        let mut next = card.clone();
        if let Some(title) = &self.title {
            next.title = title.trim().to_string();
        }
        if let Some(description) = &self.description {
            next.description = description.clone();
        }
        if let Some(column) = &self.column {
            next.column = column.clone();
        }
        if let Some(status) = self.status {
            next.status = status;
        }
        if let Some(priority) = self.priority {
            next.priority = priority;
        }
        if let Some(due_date) = self.due_date {
            next.due_date = due_date;
        }
        if let Some(assignees) = &self.assignees {
            next.assignees = assignees.clone();
        }
        if let Some(labels) = &self.labels {
            next.labels = labels.clone();
        }
        if let Some(comments) = &self.comments {
            next.comments = comments.clone();
        }
        next
    }
}

pub fn validate_title(title: &str) -> Result<(), ModelError> {
    if title.trim().is_empty() {
        Err(ModelError::EmptyTitle)
    } else {
        Ok(())
    }
}

/// A board together with its cards, as returned by "get board".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardSnapshot {
    pub board: Board,
    #[serde(default)]
    pub cards: Vec<Card>,
}

impl BoardSnapshot {
    pub fn new(board: Board, cards: Vec<Card>) -> Self {
        Self { board, cards }
    }

    pub fn card(&self, id: &CardId) -> Option<&Card> {
        self.cards.iter().find(|c| &c.id == id)
    }

    pub fn cards_in_column<'a>(&'a self, column: &'a str) -> impl Iterator<Item = &'a Card> + 'a {
        self.cards.iter().filter(move |c| c.column == column)
    }
}

// ───────────────────────────────────────────────────────────────────
// Service record quirks
// ───────────────────────────────────────────────────────────────────

mod wire {
    use chrono::{DateTime, NaiveDate};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};

    /// A bare id or a populated document.
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Ref {
        Id(String),
        Document {
            #[serde(rename = "_id", alias = "id")]
            id: String,
        },
    }

    impl Ref {
        fn into_id(self) -> String {
            match self {
                Ref::Id(id) | Ref::Document { id } => id,
            }
        }
    }

    pub fn reference<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: From<String>,
    {
        Ref::deserialize(deserializer).map(|r| T::from(r.into_id()))
    }

    pub fn references<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: From<String>,
    {
        let refs = Vec::<Ref>::deserialize(deserializer)?;
        Ok(refs.into_iter().map(|r| T::from(r.into_id())).collect())
    }

    /// `YYYY-MM-DD` or a full RFC 3339 timestamp; empty reads as unset.
    pub fn parse_date(text: &str) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .ok()
            .or_else(|| DateTime::parse_from_rfc3339(text).ok().map(|dt| dt.date_naive()))
    }

    pub fn due_date<'de, D>(deserializer: D) -> Result<Option<NaiveDate>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            None => Ok(None),
            Some(text) if text.trim().is_empty() => Ok(None),
            Some(text) => parse_date(&text)
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("invalid due date '{text}'"))),
        }
    }

    /// Present-but-null clears the date, so the outer `Some` is kept.
    pub fn due_date_patch<'de, D>(deserializer: D) -> Result<Option<Option<NaiveDate>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        due_date(deserializer).map(Some)
    }
}
