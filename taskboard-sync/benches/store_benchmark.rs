use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use taskboard_core::{Board, BoardSnapshot, Card, CardDraft, CardId, CardPatch};
use taskboard_sync::protocol::{CardEvent, ChannelEvent, ChannelFrame};
use taskboard_sync::store::{BoardStore, ForeignChange, Mutation};
use taskboard_sync::ClientIdentity;
use taskboard_sync::ActionId;

fn card(board: &Board, n: usize) -> Card {
    let column = ["To Do", "In Progress", "Done"][n % 3];
    CardDraft::new(format!("Card {n}"), column).to_card(
        CardId::new(format!("c{n}")),
        board.id.clone(),
        Utc::now(),
    )
}

fn loaded_store(count: usize) -> BoardStore {
    let board = Board::new("b1", "Bench", "u1");
    let cards = (0..count).map(|n| card(&board, n)).collect();
    let mut store = BoardStore::new(16);
    store.load(BoardSnapshot::new(board, cards));
    store
}

fn bench_optimistic_rollback(c: &mut Criterion) {
    let mut store = loaded_store(1_000);
    let id = CardId::new("c500");
    let base = store.card(&id).unwrap();
    let edited = CardPatch::title("Edited").apply_to(&base);

    c.bench_function("optimistic_then_rollback", |b| {
        b.iter(|| {
            let token = store
                .apply_optimistic(black_box(&id), Mutation::Upsert(edited.clone()))
                .unwrap();
            black_box(store.rollback(&token));
        })
    });
}

fn bench_merged_view(c: &mut Criterion) {
    let mut store = loaded_store(1_000);
    for n in (0..1_000).step_by(10) {
        let id = CardId::new(format!("c{n}"));
        if let Some(base) = store.card(&id) {
            let _ = store.apply_optimistic(
                &id,
                Mutation::Upsert(CardPatch::column("Done").apply_to(&base)),
            );
        }
    }

    c.bench_function("cards_1k_with_overlays", |b| {
        b.iter(|| black_box(store.cards()))
    });

    c.bench_function("cards_in_column_1k", |b| {
        b.iter(|| black_box(store.cards_in_column(black_box("Done"))))
    });
}

fn bench_merge_foreign(c: &mut Criterion) {
    let mut store = loaded_store(1_000);
    let board = Board::new("b1", "Bench", "u1");
    let update = CardPatch::title("Peer edit").apply_to(&card(&board, 42));

    c.bench_function("merge_foreign_update", |b| {
        b.iter(|| black_box(store.merge_foreign(ForeignChange::Upsert(black_box(update.clone())))))
    });
}

fn bench_frame_codec(c: &mut Criterion) {
    let board = Board::new("b1", "Bench", "u1");
    let identity = ClientIdentity::new("u1", "Ada");
    let frame = ChannelFrame::Event(ChannelEvent::CardUpdated(CardEvent {
        board_id: board.id.clone(),
        card: card(&board, 7),
        actor: Some(identity.actor(Some(ActionId(7)))),
        timestamp: Utc::now(),
    }));
    let encoded = frame.encode().unwrap();

    c.bench_function("frame_encode_card_updated", |b| {
        b.iter(|| black_box(black_box(&frame).encode().unwrap()))
    });

    c.bench_function("frame_decode_card_updated", |b| {
        b.iter(|| black_box(ChannelFrame::decode(black_box(&encoded)).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_optimistic_rollback,
    bench_merged_view,
    bench_merge_foreign,
    bench_frame_codec,
);
criterion_main!(benches);
