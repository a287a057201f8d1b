//! Durable FIFO of mutations attempted while offline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use taskboard_core::{BoardId, CardDraft, CardId, CardPatch};

use crate::storage::{self, LocalStore, Namespace, StorageError};

/// Client-generated action id.
///
/// Strictly increasing for the lifetime of a queue, including across
/// restarts. Sent to the service as the idempotency key and attached to
/// outbound channel events so echoes can be recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(pub u64);

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Create,
    Update,
    Delete,
    Reorder,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ActionPayload {
    Create { temp_id: CardId, draft: CardDraft },
    Update { patch: CardPatch },
    /// The title is kept only for logs and status displays.
    Delete { title: String },
    Reorder {
        source_column: String,
        destination_column: String,
    },
}

impl ActionPayload {
    pub fn kind(&self) -> ActionKind {
        match self {
            ActionPayload::Create { .. } => ActionKind::Create,
            ActionPayload::Update { .. } => ActionKind::Update,
            ActionPayload::Delete { .. } => ActionKind::Delete,
            ActionPayload::Reorder { .. } => ActionKind::Reorder,
        }
    }
}

/// A queued mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAction {
    pub id: ActionId,
    pub board_id: BoardId,
    /// `None` for creates.
    pub target: Option<CardId>,
    pub payload: ActionPayload,
    pub created_at: DateTime<Utc>,
    /// Replay attempts that were rejected by the service.
    #[serde(default)]
    pub attempts: u32,
}

impl PendingAction {
    pub fn kind(&self) -> ActionKind {
        self.payload.kind()
    }

    /// The card this action concerns: the target, or the temporary id of a
    /// create. Ordering is enforced per key.
    pub fn target_key(&self) -> Option<&CardId> {
        match (&self.target, &self.payload) {
            (Some(target), _) => Some(target),
            (None, ActionPayload::Create { temp_id, .. }) => Some(temp_id),
            (None, _) => None,
        }
    }
}

/// Persistent action queue.
///
/// Every mutation is written through to the local store before returning.
pub struct ActionQueue {
    store: Arc<dyn LocalStore>,
    actions: VecDeque<PendingAction>,
    last_id: u64,
}

impl ActionQueue {
    pub const STORAGE_KEY: &'static str = "offline_pending_actions";

    /// Load the queue. Unreadable data yields an empty queue.
    pub fn load(store: Arc<dyn LocalStore>) -> Self {
        let actions: VecDeque<PendingAction> =
            storage::load_json(store.as_ref(), Namespace::Actions, Self::STORAGE_KEY)
                .unwrap_or_default();
        let last_id = actions.iter().map(|a| a.id.0).max().unwrap_or(0);
        if !actions.is_empty() {
            log::info!("Loaded {} pending offline actions", actions.len());
        }
        Self {
            store,
            actions,
            last_id,
        }
    }

    /// Allocate the next action id.
    pub fn next_id(&mut self) -> ActionId {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        self.last_id = now.max(self.last_id + 1);
        ActionId(self.last_id)
    }

    /// Append an action. On a storage failure the queue is left unchanged.
    pub fn push(&mut self, action: PendingAction) -> Result<(), StorageError> {
        self.last_id = self.last_id.max(action.id.0);
        self.actions.push_back(action);
        if let Err(e) = self.persist() {
            self.actions.pop_back();
            return Err(e);
        }
        Ok(())
    }

    pub fn remove(&mut self, id: ActionId) -> Result<Option<PendingAction>, StorageError> {
        let Some(pos) = self.actions.iter().position(|a| a.id == id) else {
            return Ok(None);
        };
        let removed = self.actions.remove(pos);
        self.persist()?;
        Ok(removed)
    }

    /// Point every queued action that targets `from` at `to`.
    pub fn retarget(&mut self, from: &CardId, to: &CardId) -> Result<usize, StorageError> {
        let mut changed = 0;
        for action in self.actions.iter_mut() {
            if action.target.as_ref() == Some(from) {
                action.target = Some(to.clone());
                changed += 1;
            }
        }
        if changed > 0 {
            self.persist()?;
        }
        Ok(changed)
    }

    pub fn record_attempt(&mut self, id: ActionId) -> Result<(), StorageError> {
        if let Some(action) = self.actions.iter_mut().find(|a| a.id == id) {
            action.attempts += 1;
            self.persist()?;
        }
        Ok(())
    }

    pub fn get(&self, id: ActionId) -> Option<&PendingAction> {
        self.actions.iter().find(|a| a.id == id)
    }

    pub fn has_pending_for(&self, card: &CardId) -> bool {
        self.actions.iter().any(|a| a.target_key() == Some(card))
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingAction> {
        self.actions.iter()
    }

    pub fn ids(&self) -> Vec<ActionId> {
        self.actions.iter().map(|a| a.id).collect()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn clear(&mut self) -> Result<(), StorageError> {
        self.actions.clear();
        self.store.remove(Namespace::Actions, Self::STORAGE_KEY)
    }

    fn persist(&self) -> Result<(), StorageError> {
        storage::save_json(
            self.store.as_ref(),
            Namespace::Actions,
            Self::STORAGE_KEY,
            &self.actions,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn update(queue: &mut ActionQueue, card: &str) -> PendingAction {
        PendingAction {
            id: queue.next_id(),
            board_id: BoardId::new("b1"),
            target: Some(CardId::new(card)),
            payload: ActionPayload::Update {
                patch: CardPatch::title("Renamed"),
            },
            created_at: Utc::now(),
            attempts: 0,
        }
    }

    #[test]
    fn test_ids_strictly_increase() {
        let mut queue = ActionQueue::load(Arc::new(MemoryStore::new()));
        let a = queue.next_id();
        let b = queue.next_id();
        let c = queue.next_id();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_push_persists_and_reloads_in_order() {
        let store: Arc<dyn LocalStore> = Arc::new(MemoryStore::new());
        let mut queue = ActionQueue::load(store.clone());
        let first = update(&mut queue, "c1");
        let second = update(&mut queue, "c2");
        queue.push(first.clone()).unwrap();
        queue.push(second.clone()).unwrap();

        let mut reloaded = ActionQueue::load(store);
        assert_eq!(reloaded.ids(), vec![first.id, second.id]);
        assert!(reloaded.next_id() > second.id);
    }

    #[test]
    fn test_corrupt_queue_loads_empty() {
        let store: Arc<dyn LocalStore> = Arc::new(MemoryStore::new());
        store
            .save(Namespace::Actions, ActionQueue::STORAGE_KEY, b"[{\"id\": oops")
            .unwrap();
        let queue = ActionQueue::load(store);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_remove_and_retarget() {
        let mut queue = ActionQueue::load(Arc::new(MemoryStore::new()));
        let create = PendingAction {
            id: queue.next_id(),
            board_id: BoardId::new("b1"),
            target: None,
            payload: ActionPayload::Create {
                temp_id: CardId::new("tmp-1"),
                draft: CardDraft::new("New", "To Do"),
            },
            created_at: Utc::now(),
            attempts: 0,
        };
        let edit = update(&mut queue, "tmp-1");
        queue.push(create.clone()).unwrap();
        queue.push(edit.clone()).unwrap();

        assert!(queue.has_pending_for(&CardId::new("tmp-1")));
        assert_eq!(create.target_key(), Some(&CardId::new("tmp-1")));

        queue.remove(create.id).unwrap();
        assert_eq!(
            queue.retarget(&CardId::new("tmp-1"), &CardId::new("c77")).unwrap(),
            1
        );
        assert_eq!(
            queue.get(edit.id).and_then(|a| a.target.clone()),
            Some(CardId::new("c77"))
        );
        assert!(!queue.has_pending_for(&CardId::new("tmp-1")));
        assert_eq!(queue.remove(ActionId(1)).unwrap(), None);
    }

    #[test]
    fn test_payload_wire_shape() {
        let payload = ActionPayload::Reorder {
            source_column: "To Do".into(),
            destination_column: "Done".into(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "reorder");
        assert_eq!(json["destinationColumn"], "Done");
        assert_eq!(payload.kind(), ActionKind::Reorder);
    }
}
