//! Board State Store.
//!
//! Canonical in-memory state of one board: the confirmed cards as last
//! reported by the service, and an overlay of local mutations that are
//! still awaiting an answer.
//!
//! ```text
//!            read(id)
//!               │
//!   ┌───────────▼────────────┐   top layer wins
//!   │ overlay[id]            │   layers: [ L1 ─► L2 ─► L3 ]
//!   │   (unconfirmed, local) │   each layer = {before, proposed}
//!   └───────────┬────────────┘
//!               │ none
//!   ┌───────────▼────────────┐
//!   │ confirmed[id]          │   authoritative
//!   └────────────────────────┘
//! ```
//!
//! Several optimistic mutations of the same card may be in flight at once,
//! so an overlay entry is a stack of layers. Each layer is owned by exactly
//! one request (or queued offline action) and is identified by its
//! [`RollbackToken`].
//!
//! Deleted ids are remembered as tombstones until the next board load, so a
//! late response can never bring a deleted card back.
//!
//! The store is single-writer: only the dispatcher and the reconciler call
//! the mutating methods, always under the engine's write lock. Every change
//! is announced on a broadcast channel.

use indexmap::IndexMap;
use std::collections::HashSet;
use std::sync::Arc;
use taskboard_core::{Board, BoardId, BoardSnapshot, Card, CardId};
use tokio::sync::{broadcast, RwLock};

use crate::error::SyncError;

// ───────────────────────────────────────────────────────────────────
// Types
// ───────────────────────────────────────────────────────────────────

/// A proposed local change to one card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Upsert(Card),
    Remove,
}

/// Identifies one optimistic layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RollbackToken {
    pub entity: CardId,
    seq: u64,
}

#[derive(Debug, Clone)]
struct Layer {
    seq: u64,
    /// Visible value before this layer was applied.
    before: Option<Card>,
    proposed: Mutation,
}

#[derive(Debug, Clone, Default)]
struct OverlayEntry {
    layers: Vec<Layer>,
}

impl OverlayEntry {
    fn top(&self) -> Option<&Mutation> {
        self.layers.last().map(|l| &l.proposed)
    }

    /// Remove one layer. The layer above it inherits its `before`.
    fn remove_layer(&mut self, seq: u64) -> Option<Layer> {
        let pos = self.layers.iter().position(|l| l.seq == seq)?;
        let removed = self.layers.remove(pos);
        if let Some(next) = self.layers.get_mut(pos) {
            next.before = removed.before.clone();
        }
        Some(removed)
    }
}

/// A change made by a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForeignChange {
    Upsert(Card),
    Removed(CardId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Applied,
    /// A local overlay for the card is pending; it takes precedence.
    Shadowed,
    /// Deleted, or for another board.
    Ignored,
    /// The card references a column this snapshot does not know; the board
    /// itself is out of date.
    NeedsRefetch,
}

/// Where a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    Optimistic,
    Confirmed,
    Rollback,
    Foreign,
}

/// Change notification for presentation code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    Loaded(BoardId),
    Refreshed(BoardId),
    BoardUpdated(BoardId),
    Cleared,
    CardChanged { card_id: CardId, source: ChangeSource },
    CardRemoved { card_id: CardId, source: ChangeSource },
}

/// Identity of a board context. A response captured under one scope must
/// not be applied once the scope has changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardScope {
    pub board_id: BoardId,
    generation: u64,
}

// ───────────────────────────────────────────────────────────────────
// Store
// ───────────────────────────────────────────────────────────────────

/// The store as shared between the dispatcher, reconciler and readers.
pub type SharedStore = Arc<RwLock<BoardStore>>;

pub struct BoardStore {
    board: Option<Board>,
    generation: u64,
    confirmed: IndexMap<CardId, Card>,
    overlay: IndexMap<CardId, OverlayEntry>,
    tombstones: HashSet<CardId>,
    next_seq: u64,
    changes: broadcast::Sender<StoreChange>,
}

impl BoardStore {
    pub fn new(buffer: usize) -> Self {
        let (changes, _) = broadcast::channel(buffer.max(1));
        Self {
            board: None,
            generation: 0,
            confirmed: IndexMap::new(),
            overlay: IndexMap::new(),
            tombstones: HashSet::new(),
            next_seq: 1,
            changes,
        }
    }

    pub fn shared(buffer: usize) -> SharedStore {
        Arc::new(RwLock::new(Self::new(buffer)))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    fn notify(&self, change: StoreChange) {
        let _ = self.changes.send(change);
    }

    // ─── Board context ───────────────────────────────────────────────

    /// Replace all state with a freshly fetched board. Starts a new scope.
    pub fn load(&mut self, snapshot: BoardSnapshot) {
        let board_id = snapshot.board.id.clone();
        self.generation += 1;
        self.overlay.clear();
        self.tombstones.clear();
        self.confirmed = snapshot
            .cards
            .into_iter()
            .filter(|c| c.board_id == board_id)
            .map(|c| (c.id.clone(), c))
            .collect();
        self.board = Some(snapshot.board);
        log::info!("Loaded board {board_id} with {} cards", self.confirmed.len());
        self.notify(StoreChange::Loaded(board_id));
    }

    pub fn clear(&mut self) {
        self.generation += 1;
        self.board = None;
        self.confirmed.clear();
        self.overlay.clear();
        self.tombstones.clear();
        self.notify(StoreChange::Cleared);
    }

    pub fn scope(&self) -> Option<BoardScope> {
        self.board.as_ref().map(|b| BoardScope {
            board_id: b.id.clone(),
            generation: self.generation,
        })
    }

    pub fn is_current(&self, scope: &BoardScope) -> bool {
        self.generation == scope.generation
            && self.board.as_ref().is_some_and(|b| b.id == scope.board_id)
    }

    pub fn board(&self) -> Option<&Board> {
        self.board.as_ref()
    }

    pub fn board_id(&self) -> Option<&BoardId> {
        self.board.as_ref().map(|b| &b.id)
    }

    fn require_board(&self) -> Result<&Board, SyncError> {
        self.board.as_ref().ok_or(SyncError::NoBoard)
    }

    /// Apply a refetched snapshot of the current board, keeping pending
    /// overlays. Tombstoned cards are dropped. Returns `false` when the
    /// snapshot is for another board.
    pub fn replace_snapshot(&mut self, snapshot: BoardSnapshot) -> bool {
        let board_id = snapshot.board.id.clone();
        if self.board_id() != Some(&board_id) {
            log::debug!("Ignoring snapshot for board {board_id}; not in context");
            return false;
        }
        self.confirmed = snapshot
            .cards
            .into_iter()
            .filter(|c| c.board_id == board_id && !self.tombstones.contains(&c.id))
            .map(|c| (c.id.clone(), c))
            .collect();
        self.board = Some(snapshot.board);
        self.notify(StoreChange::Refreshed(board_id));
        true
    }

    /// Replace board metadata (title, members, columns, settings).
    pub fn replace_board(&mut self, board: Board) -> bool {
        if self.board_id() != Some(&board.id) {
            return false;
        }
        let board_id = board.id.clone();
        self.board = Some(board);
        self.notify(StoreChange::BoardUpdated(board_id));
        true
    }

    // ─── Optimistic layer ────────────────────────────────────────────

    /// Write an overlay layer. Upserts must name a column of the board.
    pub fn apply_optimistic(
        &mut self,
        card_id: &CardId,
        mutation: Mutation,
    ) -> Result<RollbackToken, SyncError> {
        let board = self.require_board()?;
        if let Mutation::Upsert(card) = &mutation {
            board.check_column(&card.column)?;
        }
        let before = self.card(card_id);
        let seq = self.next_seq;
        self.next_seq += 1;

        let removal = matches!(mutation, Mutation::Remove);
        self.overlay
            .entry(card_id.clone())
            .or_default()
            .layers
            .push(Layer {
                seq,
                before,
                proposed: mutation,
            });
        log::debug!("Optimistic layer {seq} on {card_id}");

        let card_id = card_id.clone();
        self.notify(if removal {
            StoreChange::CardRemoved {
                card_id: card_id.clone(),
                source: ChangeSource::Optimistic,
            }
        } else {
            StoreChange::CardChanged {
                card_id: card_id.clone(),
                source: ChangeSource::Optimistic,
            }
        });
        Ok(RollbackToken { entity: card_id, seq })
    }

    /// Locate the entry holding a layer. Entries can move when a temporary
    /// id is confirmed, so fall back to a scan.
    fn entry_of(&self, token: &RollbackToken) -> Option<CardId> {
        let holds = |e: &OverlayEntry| e.layers.iter().any(|l| l.seq == token.seq);
        if self.overlay.get(&token.entity).is_some_and(holds) {
            return Some(token.entity.clone());
        }
        self.overlay
            .iter()
            .find(|(_, e)| holds(e))
            .map(|(id, _)| id.clone())
    }

    fn drop_layer(&mut self, token: &RollbackToken) -> Option<(CardId, Layer)> {
        let id = self.entry_of(token)?;
        let entry = self.overlay.get_mut(&id)?;
        let layer = entry.remove_layer(token.seq)?;
        if entry.layers.is_empty() {
            self.overlay.shift_remove(&id);
        }
        Some((id, layer))
    }

    /// Restore the value visible before the token's layer. Returns `false`
    /// if the layer was already resolved.
    pub fn rollback(&mut self, token: &RollbackToken) -> bool {
        let Some((card_id, _)) = self.drop_layer(token) else {
            return false;
        };
        log::info!("Rolled back optimistic change to {card_id}");
        let source = ChangeSource::Rollback;
        self.notify(match self.card(&card_id) {
            Some(_) => StoreChange::CardChanged { card_id, source },
            None => StoreChange::CardRemoved { card_id, source },
        });
        true
    }

    // ─── Confirmation ────────────────────────────────────────────────

    /// Record the service's value for a card and resolve the token's layer
    /// (or the whole overlay entry when no token is given). A tombstoned
    /// card is never reinstated; returns `false` in that case.
    pub fn apply_confirmed(&mut self, card: Card, token: Option<&RollbackToken>) -> bool {
        match token {
            Some(token) => {
                self.drop_layer(token);
            }
            None => {
                self.overlay.shift_remove(&card.id);
            }
        }
        if self.tombstones.contains(&card.id) {
            log::info!("Confirmation for deleted card {} discarded", card.id);
            return false;
        }
        if self.board_id() != Some(&card.board_id) {
            return false;
        }
        let card_id = card.id.clone();
        self.confirmed.insert(card_id.clone(), card);
        self.notify(StoreChange::CardChanged {
            card_id,
            source: ChangeSource::Confirmed,
        });
        true
    }

    /// Replace a temporary card with its permanent identity. Layers stacked
    /// on the temporary id by later edits move to the permanent id.
    pub fn confirm_created(
        &mut self,
        temp_id: &CardId,
        card: Card,
        token: Option<&RollbackToken>,
    ) -> bool {
        if let Some(token) = token {
            self.drop_layer(token);
        }
        if let Some(mut remaining) = self.overlay.shift_remove(temp_id) {
            for layer in remaining.layers.iter_mut() {
                if let Some(before) = layer.before.as_mut() {
                    before.id = card.id.clone();
                }
                if let Mutation::Upsert(proposed) = &mut layer.proposed {
                    proposed.id = card.id.clone();
                }
            }
            self.overlay
                .entry(card.id.clone())
                .or_default()
                .layers
                .extend(remaining.layers);
        }
        self.notify(StoreChange::CardRemoved {
            card_id: temp_id.clone(),
            source: ChangeSource::Confirmed,
        });
        self.apply_confirmed_keep_overlay(card)
    }

    fn apply_confirmed_keep_overlay(&mut self, card: Card) -> bool {
        if self.tombstones.contains(&card.id) || self.board_id() != Some(&card.board_id) {
            return false;
        }
        let card_id = card.id.clone();
        self.confirmed.insert(card_id.clone(), card);
        self.notify(StoreChange::CardChanged {
            card_id,
            source: ChangeSource::Confirmed,
        });
        true
    }

    /// The service confirmed a deletion (or reported the card gone).
    pub fn confirm_removed(&mut self, card_id: &CardId) {
        self.remove_everywhere(card_id, ChangeSource::Confirmed);
    }

    fn remove_everywhere(&mut self, card_id: &CardId, source: ChangeSource) {
        let had_confirmed = self.confirmed.shift_remove(card_id).is_some();
        let had_overlay = self.overlay.shift_remove(card_id).is_some();
        self.tombstones.insert(card_id.clone());
        if had_confirmed || had_overlay {
            self.notify(StoreChange::CardRemoved {
                card_id: card_id.clone(),
                source,
            });
        }
    }

    // ─── Foreign changes ─────────────────────────────────────────────

    /// Merge a peer's change.
    ///
    /// Updates yield to a pending local overlay. Deletions always win: the
    /// card and any overlay are removed together and the id is tombstoned.
    pub fn merge_foreign(&mut self, change: ForeignChange) -> MergeOutcome {
        let Some(board) = self.board.as_ref() else {
            return MergeOutcome::Ignored;
        };
        match change {
            ForeignChange::Upsert(card) => {
                if card.board_id != board.id || self.tombstones.contains(&card.id) {
                    return MergeOutcome::Ignored;
                }
                if self.overlay.contains_key(&card.id) {
                    log::debug!("Foreign update to {} shadowed by local overlay", card.id);
                    return MergeOutcome::Shadowed;
                }
                if !board.has_column(&card.column) {
                    log::warn!(
                        "Foreign update places {} in unknown column '{}'",
                        card.id,
                        card.column
                    );
                    return MergeOutcome::NeedsRefetch;
                }
                let card_id = card.id.clone();
                self.confirmed.insert(card_id.clone(), card);
                self.notify(StoreChange::CardChanged {
                    card_id,
                    source: ChangeSource::Foreign,
                });
                MergeOutcome::Applied
            }
            ForeignChange::Removed(card_id) => {
                if self.overlay.contains_key(&card_id) {
                    log::info!("Peer deleted {card_id}; discarding local overlay");
                }
                self.remove_everywhere(&card_id, ChangeSource::Foreign);
                MergeOutcome::Applied
            }
        }
    }

    // ─── Reads ───────────────────────────────────────────────────────

    /// Visible value: overlay if present, else confirmed.
    pub fn card(&self, card_id: &CardId) -> Option<Card> {
        match self.overlay.get(card_id).and_then(OverlayEntry::top) {
            Some(Mutation::Upsert(card)) => Some(card.clone()),
            Some(Mutation::Remove) => None,
            None => self.confirmed.get(card_id).cloned(),
        }
    }

    pub fn confirmed_card(&self, card_id: &CardId) -> Option<&Card> {
        self.confirmed.get(card_id)
    }

    /// Visible cards: confirmed order with overlays substituted, then cards
    /// that exist only in the overlay, in creation order.
    pub fn cards(&self) -> Vec<Card> {
        let mut cards = Vec::with_capacity(self.confirmed.len() + self.overlay.len());
        for id in self.confirmed.keys() {
            if let Some(card) = self.card(id) {
                cards.push(card);
            }
        }
        for (id, entry) in &self.overlay {
            if self.confirmed.contains_key(id) {
                continue;
            }
            if let Some(Mutation::Upsert(card)) = entry.top() {
                cards.push(card.clone());
            }
        }
        cards
    }

    pub fn cards_in_column(&self, column: &str) -> Vec<Card> {
        self.cards().into_iter().filter(|c| c.column == column).collect()
    }

    pub fn snapshot(&self) -> Option<BoardSnapshot> {
        self.board
            .as_ref()
            .map(|board| BoardSnapshot::new(board.clone(), self.cards()))
    }

    /// The last confirmed state, ignoring overlays.
    pub fn confirmed_snapshot(&self) -> Option<BoardSnapshot> {
        self.board.as_ref().map(|board| {
            BoardSnapshot::new(board.clone(), self.confirmed.values().cloned().collect())
        })
    }

    pub fn has_overlay(&self, card_id: &CardId) -> bool {
        self.overlay.contains_key(card_id)
    }

    /// Number of cards with pending local changes.
    pub fn overlay_len(&self) -> usize {
        self.overlay.len()
    }

    pub fn is_tombstoned(&self, card_id: &CardId) -> bool {
        self.tombstones.contains(card_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use taskboard_core::{CardDraft, CardPatch, ModelError};

    fn card(id: &str, column: &str) -> Card {
        CardDraft::new(format!("Card {id}"), column).to_card(
            CardId::new(id),
            BoardId::new("b1"),
            Utc::now(),
        )
    }

    fn loaded() -> BoardStore {
        let mut store = BoardStore::new(16);
        store.load(BoardSnapshot::new(
            Board::new("b1", "Sprint", "owner"),
            vec![card("c1", "To Do"), card("c2", "In Progress")],
        ));
        store
    }

    fn id(s: &str) -> CardId {
        CardId::new(s)
    }

    #[test]
    fn test_overlay_shadows_confirmed_and_rolls_back() {
        let mut store = loaded();
        let moved = CardPatch::column("Done").apply_to(&store.card(&id("c1")).unwrap());
        let token = store.apply_optimistic(&id("c1"), Mutation::Upsert(moved)).unwrap();

        assert_eq!(store.card(&id("c1")).unwrap().column, "Done");
        assert_eq!(store.confirmed_card(&id("c1")).unwrap().column, "To Do");
        assert!(store.has_overlay(&id("c1")));

        assert!(store.rollback(&token));
        assert_eq!(store.card(&id("c1")).unwrap().column, "To Do");
        assert_eq!(store.overlay_len(), 0);
        assert!(!store.rollback(&token));
    }

    #[test]
    fn test_optimistic_rejects_unknown_column() {
        let mut store = loaded();
        let bad = card("c1", "Archive");
        let err = store.apply_optimistic(&id("c1"), Mutation::Upsert(bad)).unwrap_err();
        assert_eq!(
            err,
            SyncError::Validation(ModelError::UnknownColumn {
                column: "Archive".into()
            })
        );
        assert_eq!(store.overlay_len(), 0);
    }

    #[test]
    fn test_confirm_clears_only_its_layer() {
        let mut store = loaded();
        let base = store.card(&id("c1")).unwrap();
        let first = CardPatch::title("One").apply_to(&base);
        let t1 = store.apply_optimistic(&id("c1"), Mutation::Upsert(first.clone())).unwrap();
        let second = CardPatch::title("Two").apply_to(&first);
        let t2 = store.apply_optimistic(&id("c1"), Mutation::Upsert(second)).unwrap();

        assert!(store.apply_confirmed(first, Some(&t1)));
        assert_eq!(store.card(&id("c1")).unwrap().title, "Two");

        let mut server_two = base.clone();
        server_two.title = "Two".into();
        assert!(store.apply_confirmed(server_two, Some(&t2)));
        assert_eq!(store.overlay_len(), 0);
        assert_eq!(store.card(&id("c1")).unwrap().title, "Two");
    }

    #[test]
    fn test_foreign_update_shadowed_then_applies() {
        let mut store = loaded();
        let local = CardPatch::title("Mine").apply_to(&store.card(&id("c2")).unwrap());
        let token = store.apply_optimistic(&id("c2"), Mutation::Upsert(local.clone())).unwrap();

        let mut theirs = card("c2", "Done");
        theirs.title = "Theirs".into();
        assert_eq!(
            store.merge_foreign(ForeignChange::Upsert(theirs.clone())),
            MergeOutcome::Shadowed
        );
        assert_eq!(store.card(&id("c2")).unwrap().title, "Mine");

        store.apply_confirmed(local, Some(&token));
        assert_eq!(
            store.merge_foreign(ForeignChange::Upsert(theirs)),
            MergeOutcome::Applied
        );
        assert_eq!(store.card(&id("c2")).unwrap().title, "Theirs");
    }

    #[test]
    fn test_foreign_delete_wins_over_pending_edit() {
        let mut store = loaded();
        let edit = CardPatch::title("Edited").apply_to(&store.card(&id("c1")).unwrap());
        let token = store.apply_optimistic(&id("c1"), Mutation::Upsert(edit.clone())).unwrap();

        assert_eq!(
            store.merge_foreign(ForeignChange::Removed(id("c1"))),
            MergeOutcome::Applied
        );
        assert!(store.card(&id("c1")).is_none());

        // Late success for the edit must not resurrect the card.
        assert!(!store.apply_confirmed(edit, Some(&token)));
        assert!(store.card(&id("c1")).is_none());
        assert!(!store.rollback(&token));
        assert_eq!(store.cards().len(), 1);
    }

    #[test]
    fn test_temporary_card_confirmed_with_follow_up_edit() {
        let mut store = loaded();
        let temp = id("tmp-1");
        let draft = CardDraft::new("New", "To Do");
        let optimistic = draft.to_card(temp.clone(), BoardId::new("b1"), Utc::now());
        let create = store.apply_optimistic(&temp, Mutation::Upsert(optimistic.clone())).unwrap();
        let renamed = CardPatch::title("Renamed").apply_to(&optimistic);
        store.apply_optimistic(&temp, Mutation::Upsert(renamed)).unwrap();
        assert_eq!(store.cards().len(), 3);

        let permanent = draft.to_card(id("c9"), BoardId::new("b1"), Utc::now());
        assert!(store.confirm_created(&temp, permanent, Some(&create)));

        assert!(store.card(&temp).is_none());
        let visible = store.card(&id("c9")).unwrap();
        assert_eq!(visible.title, "Renamed");
        assert_eq!(visible.id, id("c9"));
        assert!(store.has_overlay(&id("c9")));
        assert_eq!(store.cards().len(), 3);
    }

    #[test]
    fn test_unknown_column_needs_refetch() {
        let mut store = loaded();
        assert_eq!(
            store.merge_foreign(ForeignChange::Upsert(card("c1", "Review"))),
            MergeOutcome::NeedsRefetch
        );
        let mut other_board = card("c1", "Done");
        other_board.board_id = BoardId::new("b2");
        assert_eq!(
            store.merge_foreign(ForeignChange::Upsert(other_board)),
            MergeOutcome::Ignored
        );
    }

    #[test]
    fn test_scope_changes_on_reload() {
        let mut store = loaded();
        let scope = store.scope().unwrap();
        assert!(store.is_current(&scope));

        store.load(BoardSnapshot::new(Board::new("b1", "Sprint", "owner"), Vec::new()));
        assert!(!store.is_current(&scope));

        store.clear();
        assert!(store.scope().is_none());
    }

    #[test]
    fn test_refresh_keeps_overlay_and_drops_tombstones() {
        let mut store = loaded();
        let edit = CardPatch::column("Done").apply_to(&store.card(&id("c2")).unwrap());
        store.apply_optimistic(&id("c2"), Mutation::Upsert(edit)).unwrap();
        store.merge_foreign(ForeignChange::Removed(id("c1")));

        let stale = BoardSnapshot::new(
            Board::new("b1", "Sprint", "owner"),
            vec![card("c1", "To Do"), card("c2", "In Progress"), card("c3", "Done")],
        );
        assert!(store.replace_snapshot(stale));
        let ids: Vec<_> = store.cards().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![id("c2"), id("c3")]);
        assert_eq!(store.card(&id("c2")).unwrap().column, "Done");
    }

    #[tokio::test]
    async fn test_changes_are_published() {
        let mut store = loaded();
        let mut rx = store.subscribe();
        store.merge_foreign(ForeignChange::Upsert(card("c2", "Done")));
        assert_eq!(
            rx.recv().await.unwrap(),
            StoreChange::CardChanged {
                card_id: id("c2"),
                source: ChangeSource::Foreign
            }
        );
    }
}
