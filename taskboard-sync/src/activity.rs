//! Bounded feed of recent peer activity, newest first.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

use crate::protocol::{Actor, ChannelEvent, UNKNOWN_USER};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Activity {
    pub actor: String,
    pub action: &'static str,
    pub details: String,
    pub timestamp: DateTime<Utc>,
}

impl Activity {
    /// Describe a card or membership event. Presence events yield `None`.
    pub fn from_event(event: &ChannelEvent) -> Option<Self> {
        let (action, details, timestamp) = match event {
            ChannelEvent::CardCreated(e) => ("created a card", e.card.title.clone(), e.timestamp),
            ChannelEvent::CardUpdated(e) => ("updated a card", e.card.title.clone(), e.timestamp),
            ChannelEvent::CardDeleted(e) => (
                "deleted a card",
                e.card_title.clone().unwrap_or_default(),
                e.timestamp,
            ),
            ChannelEvent::CardReordered(e) => (
                "moved a card",
                format!("from {} to {}", e.source_column, e.destination_column),
                e.timestamp,
            ),
            ChannelEvent::MemberAdded(e) => (
                "added a member",
                e.member_name.clone().unwrap_or_default(),
                e.timestamp,
            ),
            _ => return None,
        };
        let actor = event
            .actor()
            .map(Actor::display_name)
            .unwrap_or(UNKNOWN_USER)
            .to_string();
        Some(Self {
            actor,
            action,
            details,
            timestamp,
        })
    }
}

#[derive(Debug)]
pub struct ActivityFeed {
    entries: VecDeque<Activity>,
    capacity: usize,
}

impl ActivityFeed {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, activity: Activity) {
        if self.capacity == 0 {
            return;
        }
        self.entries.push_front(activity);
        self.entries.truncate(self.capacity);
    }

    pub fn entries(&self) -> Vec<Activity> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CardReorderedEvent, PresenceEvent};
    use taskboard_core::{BoardId, CardId, UserId};

    fn moved(n: usize) -> ChannelEvent {
        ChannelEvent::CardReordered(CardReorderedEvent {
            board_id: BoardId::new("b1"),
            card_id: CardId::new(format!("c{n}")),
            source_column: "To Do".into(),
            destination_column: "Done".into(),
            source_index: 0,
            destination_index: n,
            actor: None,
            timestamp: Utc::now(),
        })
    }

    #[test]
    fn test_reorder_description() {
        let activity = Activity::from_event(&moved(0)).unwrap();
        assert_eq!(activity.action, "moved a card");
        assert_eq!(activity.details, "from To Do to Done");
        assert_eq!(activity.actor, "Unknown User");
    }

    #[test]
    fn test_presence_is_not_activity() {
        let event = ChannelEvent::UserJoined(PresenceEvent {
            board_id: BoardId::new("b1"),
            user_id: UserId::new("u1"),
            user_name: None,
        });
        assert!(Activity::from_event(&event).is_none());
    }

    #[test]
    fn test_feed_keeps_newest_ten() {
        let mut feed = ActivityFeed::new(10);
        for n in 0..12 {
            let mut activity = Activity::from_event(&moved(n)).unwrap();
            activity.details = format!("#{n}");
            feed.record(activity);
        }
        let entries = feed.entries();
        assert_eq!(entries.len(), 10);
        assert_eq!(entries[0].details, "#11");
        assert_eq!(entries[9].details, "#2");
    }
}
