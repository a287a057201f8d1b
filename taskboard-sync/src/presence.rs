//! Online-user registry for the current board.
//!
//! Independent of board entity state. Keyed by user id, in first-seen order.
//!
//! ```text
//!  user_joined_board ──► Online ◄──────────┐
//!                          │               │ joined again
//!  user_left_board ──────► Left ───────────┤
//!  user_disconnected ────► Disconnected ───┘
//!  online_users_update ──► replace everything
//! ```
//!
//! Left/disconnected/editing events for unknown users are no-ops.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use taskboard_core::{CardId, UserId};

use crate::protocol::{ChannelEvent, OnlineUserRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Left,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUser {
    pub user_id: UserId,
    pub name: String,
    pub status: PresenceStatus,
    /// Card this user is currently editing.
    pub editing: Option<CardId>,
    pub last_seen: DateTime<Utc>,
}

impl OnlineUser {
    pub fn is_online(&self) -> bool {
        self.status == PresenceStatus::Online
    }
}

#[derive(Debug, Default)]
pub struct PresenceRegistry {
    users: IndexMap<UserId, OnlineUser>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn joined(&mut self, user_id: &UserId, name: Option<&str>) {
        let now = Utc::now();
        match self.users.get_mut(user_id) {
            Some(user) => {
                user.status = PresenceStatus::Online;
                user.last_seen = now;
                if let Some(name) = name {
                    user.name = name.to_string();
                }
            }
            None => {
                self.users.insert(
                    user_id.clone(),
                    OnlineUser {
                        user_id: user_id.clone(),
                        name: name.unwrap_or_default().to_string(),
                        status: PresenceStatus::Online,
                        editing: None,
                        last_seen: now,
                    },
                );
            }
        }
    }

    pub fn left(&mut self, user_id: &UserId) -> bool {
        self.transition(user_id, PresenceStatus::Left)
    }

    pub fn disconnected(&mut self, user_id: &UserId) -> bool {
        self.transition(user_id, PresenceStatus::Disconnected)
    }

    fn transition(&mut self, user_id: &UserId, status: PresenceStatus) -> bool {
        let Some(user) = self.users.get_mut(user_id) else {
            log::debug!("Presence {status:?} for unknown user {user_id} ignored");
            return false;
        };
        user.status = status;
        user.editing = None;
        user.last_seen = Utc::now();
        true
    }

    /// Replace the registry with an authoritative snapshot.
    pub fn replace_snapshot(&mut self, records: &[OnlineUserRecord]) {
        let now = Utc::now();
        let mut next = IndexMap::with_capacity(records.len());
        for record in records {
            let editing = self
                .users
                .get(&record.user_id)
                .and_then(|u| u.editing.clone());
            next.insert(
                record.user_id.clone(),
                OnlineUser {
                    user_id: record.user_id.clone(),
                    name: record.name.clone(),
                    status: PresenceStatus::Online,
                    editing,
                    last_seen: now,
                },
            );
        }
        self.users = next;
    }

    pub fn started_editing(&mut self, user_id: &UserId, card_id: &CardId) -> bool {
        match self.users.get_mut(user_id) {
            Some(user) => {
                user.editing = Some(card_id.clone());
                true
            }
            None => false,
        }
    }

    pub fn stopped_editing(&mut self, user_id: &UserId, card_id: &CardId) -> bool {
        match self.users.get_mut(user_id) {
            Some(user) if user.editing.as_ref() == Some(card_id) => {
                user.editing = None;
                true
            }
            _ => false,
        }
    }

    /// Apply a presence event. Returns whether the registry changed; other
    /// event kinds are ignored.
    pub fn handle(&mut self, event: &ChannelEvent) -> bool {
        match event {
            ChannelEvent::UserJoined(e) => {
                self.joined(&e.user_id, e.user_name.as_deref());
                true
            }
            ChannelEvent::UserLeft(e) => self.left(&e.user_id),
            ChannelEvent::UserDisconnected(e) => self.disconnected(&e.user_id),
            ChannelEvent::OnlineUsers(e) => {
                self.replace_snapshot(&e.users);
                true
            }
            ChannelEvent::UserStartedEditing(e) => self.started_editing(&e.user_id, &e.card_id),
            ChannelEvent::UserStoppedEditing(e) => self.stopped_editing(&e.user_id, &e.card_id),
            _ => false,
        }
    }

    pub fn get(&self, user_id: &UserId) -> Option<&OnlineUser> {
        self.users.get(user_id)
    }

    pub fn users(&self) -> Vec<OnlineUser> {
        self.users.values().cloned().collect()
    }

    pub fn online_count(&self) -> usize {
        self.users.values().filter(|u| u.is_online()).count()
    }

    /// Users editing a given card.
    pub fn editors_of(&self, card_id: &CardId) -> Vec<&OnlineUser> {
        self.users
            .values()
            .filter(|u| u.editing.as_ref() == Some(card_id))
            .collect()
    }

    pub fn clear(&mut self) {
        self.users.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EditingEvent, PresenceEvent};
    use taskboard_core::BoardId;

    fn uid(s: &str) -> UserId {
        UserId::new(s)
    }

    #[test]
    fn test_join_leave_rejoin() {
        let mut registry = PresenceRegistry::new();
        registry.joined(&uid("u1"), Some("Ada"));
        registry.joined(&uid("u2"), Some("Grace"));
        assert_eq!(registry.online_count(), 2);

        assert!(registry.left(&uid("u1")));
        assert_eq!(registry.get(&uid("u1")).unwrap().status, PresenceStatus::Left);
        assert!(registry.disconnected(&uid("u2")));
        assert_eq!(registry.online_count(), 0);

        registry.joined(&uid("u1"), None);
        let ada = registry.get(&uid("u1")).unwrap();
        assert!(ada.is_online());
        assert_eq!(ada.name, "Ada");
        assert_eq!(registry.users().len(), 2);
    }

    #[test]
    fn test_unknown_user_is_noop() {
        let mut registry = PresenceRegistry::new();
        assert!(!registry.left(&uid("ghost")));
        assert!(!registry.disconnected(&uid("ghost")));
        assert!(!registry.started_editing(&uid("ghost"), &CardId::new("c1")));
        assert!(registry.users().is_empty());
    }

    #[test]
    fn test_snapshot_replaces() {
        let mut registry = PresenceRegistry::new();
        registry.joined(&uid("old"), Some("Old"));
        registry.replace_snapshot(&[
            OnlineUserRecord {
                user_id: uid("u1"),
                name: "Ada".into(),
            },
            OnlineUserRecord {
                user_id: uid("u2"),
                name: "Grace".into(),
            },
        ]);
        let ids: Vec<_> = registry.users().into_iter().map(|u| u.user_id).collect();
        assert_eq!(ids, vec![uid("u1"), uid("u2")]);
    }

    #[test]
    fn test_editing_via_events() {
        let mut registry = PresenceRegistry::new();
        let board = BoardId::new("b1");
        registry.handle(&ChannelEvent::UserJoined(PresenceEvent {
            board_id: board.clone(),
            user_id: uid("u1"),
            user_name: Some("Ada".into()),
        }));
        let editing = EditingEvent {
            board_id: board.clone(),
            card_id: CardId::new("c1"),
            user_id: uid("u1"),
            user_name: None,
        };
        assert!(registry.handle(&ChannelEvent::UserStartedEditing(editing.clone())));
        assert_eq!(registry.editors_of(&CardId::new("c1")).len(), 1);

        assert!(registry.handle(&ChannelEvent::UserStoppedEditing(editing)));
        assert!(registry.editors_of(&CardId::new("c1")).is_empty());

        // Leaving clears editing state as well.
        registry.started_editing(&uid("u1"), &CardId::new("c2"));
        registry.left(&uid("u1"));
        assert!(registry.editors_of(&CardId::new("c2")).is_empty());
    }
}
