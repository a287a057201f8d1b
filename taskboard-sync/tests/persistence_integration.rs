//! Persistence integration tests.
//!
//! Verifies:
//! - Queued actions and cached snapshots survive a RocksDB reopen
//! - Corrupt records degrade to "absent" instead of failing startup
//! - An engine opened on a storage path restores queued work

mod common;

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use taskboard_core::{Board, BoardId, BoardSnapshot, CardDraft, CardId, CardPatch};
use taskboard_sync::offline::{ActionPayload, OfflineManager, PendingAction};
use taskboard_sync::storage::{LocalStore, Namespace, RocksStore, StoreConfig};
use taskboard_sync::ActionId;
use tempfile::tempdir;

const DAY: Duration = Duration::from_secs(86_400);

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn open(path: &std::path::Path) -> Arc<dyn LocalStore> {
    Arc::new(RocksStore::open(StoreConfig::for_testing(path)).unwrap())
}

fn update(id: u64, card: &str, title: &str) -> PendingAction {
    PendingAction {
        id: ActionId(id),
        board_id: BoardId::new("b1"),
        target: Some(CardId::new(card)),
        payload: ActionPayload::Update {
            patch: CardPatch::title(title),
        },
        created_at: Utc::now(),
        attempts: 0,
    }
}

fn snapshot() -> BoardSnapshot {
    let board = Board::new("b1", "Sprint", "u1");
    let cards = (0..20)
        .map(|n| {
            CardDraft::new(format!("Card {n}"), "To Do").to_card(
                CardId::new(format!("c{n}")),
                board.id.clone(),
                Utc::now(),
            )
        })
        .collect();
    BoardSnapshot::new(board, cards)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_queue_and_cache_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("offline");
    {
        let manager = OfflineManager::new(open(&path), DAY, false);
        manager.enqueue(update(1, "c1", "First")).await.unwrap();
        manager.enqueue(update(2, "c2", "Second")).await.unwrap();
        manager.save_board(&BoardId::new("b1"), &snapshot()).await;
    }

    let manager = OfflineManager::new(open(&path), DAY, false);
    let pending = manager.pending().await;
    assert_eq!(pending.iter().map(|a| a.id).collect::<Vec<_>>(), vec![ActionId(1), ActionId(2)]);
    assert_eq!(manager.cached_board(&BoardId::new("b1")).await.unwrap().cards.len(), 20);

    // Ids keep increasing across restarts.
    assert!(manager.next_action_id().await > ActionId(2));
}

#[tokio::test]
async fn test_corrupt_records_degrade_to_empty() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("offline");
    {
        let store = open(&path);
        store
            .save(Namespace::Actions, "offline_pending_actions", b"{not json")
            .unwrap();
        store
            .save(Namespace::Snapshots, "offline_data", b"garbage that is not lz4")
            .unwrap();
    }

    let manager = OfflineManager::new(open(&path), DAY, true);
    let status = manager.status().await;
    assert_eq!(status.pending_actions_count, 0);
    assert!(status.offline_data_keys.is_empty());

    // The store stays usable after a bad load.
    manager.enqueue(update(5, "c1", "Recovered")).await.unwrap();
    assert_eq!(manager.pending().await.len(), 1);
}

#[tokio::test]
async fn test_clear_removes_everything_on_disk() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("offline");
    {
        let manager = OfflineManager::new(open(&path), DAY, true);
        manager.enqueue(update(1, "c1", "Gone")).await.unwrap();
        manager.save_board(&BoardId::new("b1"), &snapshot()).await;
        manager.clear().await.unwrap();
    }

    let manager = OfflineManager::new(open(&path), DAY, true);
    assert!(manager.pending().await.is_empty());
    assert!(manager.cached_board(&BoardId::new("b1")).await.is_none());
}

#[tokio::test]
async fn test_expired_snapshot_is_not_served() {
    let dir = tempdir().unwrap();
    let manager = OfflineManager::new(open(&dir.path().join("offline")), Duration::ZERO, true);
    manager.save_board(&BoardId::new("b1"), &snapshot()).await;
    tokio::time::sleep(Duration::from_millis(5)).await;

    assert!(manager.cached_board(&BoardId::new("b1")).await.is_none());
}

#[tokio::test]
async fn test_engine_on_rocksdb_replays_after_restart() {
    let dir = tempdir().unwrap();
    let config =
        taskboard_sync::SyncConfig::for_testing().with_storage_path(dir.path().join("engine"));
    let service = common::seeded_service();
    let identity = taskboard_sync::ClientIdentity::new(common::OWNER, "Ada");

    // First session: queue an edit while offline.
    {
        let store = open(config.storage_path.as_deref().unwrap());
        let engine = taskboard_sync::SyncEngine::new(
            &config,
            identity.clone(),
            service.clone(),
            Arc::new(taskboard_sync::LoopbackConnector::new()),
            store,
        );
        engine.enter_board(&BoardId::new("b1")).await.unwrap();
        engine.set_online(false).await;
        engine
            .update_card(&CardId::new("c1"), CardPatch::title("Saved to disk"))
            .await
            .unwrap();
        engine.shutdown().await;
        // Let aborted tasks release their handles on the database.
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let store = open(config.storage_path.as_deref().unwrap());
    let engine = taskboard_sync::SyncEngine::new(
        &config,
        identity,
        service.clone(),
        Arc::new(taskboard_sync::LoopbackConnector::new()),
        store,
    );
    assert_eq!(engine.pending_actions().await.len(), 1);
    engine.enter_board(&BoardId::new("b1")).await.unwrap();
    assert_eq!(engine.card(&CardId::new("c1")).await.unwrap().title, "Saved to disk");

    let report = engine.sync_pending().await;
    assert_eq!(report.executed.len(), 1);
    assert_eq!(service.card("c1").unwrap().title, "Saved to disk");
}
