use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use tandem_sync::broadcast::mailbox;
use tandem_sync::{
    apply_edits, BroadcastDispatcher, Change, ChangeRequest, ChangeStore, EngineConfig,
    InboundEvent, OutboundEvent, RocksChangeStore, StoreConfig, SyncEngine, TextEdit,
};
use uuid::Uuid;

fn sample_change(base: u64) -> Change {
    Change::new(
        "bench/doc",
        base,
        vec![TextEdit::insert(0, "Hello"), TextEdit::new(2, 4, "ll")],
        "bench-user",
    )
}

fn bench_inbound_encode(c: &mut Criterion) {
    let event = InboundEvent::Change {
        document_uri: "bench/doc".into(),
        change: ChangeRequest::new(42, vec![TextEdit::insert(10, "typed text")]),
    };

    c.bench_function("inbound_change_encode", |b| {
        b.iter(|| {
            let bytes = black_box(&event).encode().unwrap();
            black_box(bytes);
        })
    });
}

fn bench_inbound_decode(c: &mut Criterion) {
    let bytes = InboundEvent::Change {
        document_uri: "bench/doc".into(),
        change: ChangeRequest::new(42, vec![TextEdit::insert(10, "typed text")]),
    }
    .encode()
    .unwrap();

    c.bench_function("inbound_change_decode", |b| {
        b.iter(|| {
            let event = InboundEvent::decode(black_box(&bytes)).unwrap();
            black_box(event);
        })
    });
}

fn bench_outbound_roundtrip(c: &mut Criterion) {
    let event = OutboundEvent::ChangeApplied {
        document_uri: "bench/doc".into(),
        change: sample_change(7),
        new_version: 8,
    };

    c.bench_function("outbound_change_applied_roundtrip", |b| {
        b.iter(|| {
            let bytes = event.encode().unwrap();
            let decoded = OutboundEvent::decode(black_box(&bytes)).unwrap();
            black_box(decoded);
        })
    });
}

fn bench_apply_edits(c: &mut Criterion) {
    let content = "lorem ipsum dolor sit amet ".repeat(400);
    let edits: Vec<TextEdit> = (0..16)
        .map(|i| TextEdit::new(i * 50, i * 50 + 5, "changed"))
        .collect();

    c.bench_function("apply_16_edits_10KB", |b| {
        b.iter(|| {
            let next = apply_edits(black_box(&content), black_box(&edits)).unwrap();
            black_box(next);
        })
    });
}

fn bench_submit_sequential(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("submit_100_changes_one_session", |b| {
        b.iter(|| {
            rt.block_on(async {
                let engine = SyncEngine::new(EngineConfig::default());
                let (participant, _rx) = engine.open_session("bench-user", "Bench");
                let session = participant.session_id;
                engine
                    .join_document(session, "bench-user", "bench/doc")
                    .await
                    .unwrap();

                for base in 0..100u64 {
                    let change = Change::new(
                        "bench/doc",
                        base,
                        vec![TextEdit::insert(0, "x")],
                        "bench-user",
                    );
                    let outcome = engine.submit_change(session, change).await.unwrap();
                    black_box(outcome);
                }
            });
        })
    });
}

fn bench_submit_with_conflicts(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    // Every other submission is stale and parks a conflict
    c.bench_function("submit_50_accepted_50_conflicted", |b| {
        b.iter(|| {
            rt.block_on(async {
                let engine = SyncEngine::new(EngineConfig::default());
                let (participant, _rx) = engine.open_session("bench-user", "Bench");
                let session = participant.session_id;
                engine
                    .join_document(session, "bench-user", "bench/doc")
                    .await
                    .unwrap();

                for base in 0..50u64 {
                    let fresh = Change::new(
                        "bench/doc",
                        base,
                        vec![TextEdit::insert(0, "x")],
                        "bench-user",
                    );
                    engine.submit_change(session, fresh).await.unwrap();
                    let stale = Change::new(
                        "bench/doc",
                        base,
                        vec![TextEdit::insert(0, "y")],
                        "bench-user",
                    );
                    black_box(engine.submit_change(session, stale).await.unwrap());
                }
            });
        })
    });
}

fn bench_publish_fan_out(c: &mut Criterion) {
    let dispatcher = BroadcastDispatcher::new();
    let mut streams = Vec::new();
    for _ in 0..100 {
        let (sink, stream) = mailbox(4096);
        dispatcher.subscribe("bench/doc", Uuid::new_v4(), sink);
        streams.push(stream);
    }
    let event = OutboundEvent::ChangeApplied {
        document_uri: "bench/doc".into(),
        change: sample_change(0),
        new_version: 1,
    };

    c.bench_function("publish_100_subscribers", |b| {
        b.iter(|| {
            let delivered = dispatcher.publish("bench/doc", black_box(event.clone()));
            black_box(delivered);
            // Keep mailboxes from filling up
            for stream in &mut streams {
                while stream.try_recv().is_ok() {}
            }
        })
    });
}

fn bench_rocks_append(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = RocksChangeStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    let mut base = store.head("bench/doc").unwrap();

    c.bench_function("rocks_append_change", |b| {
        b.iter(|| {
            let version = store
                .append("bench/doc", black_box(&sample_change(base)))
                .unwrap();
            base = version;
        })
    });
}

fn bench_rocks_read_range(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = RocksChangeStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    for base in 0..1000u64 {
        store.append("bench/doc", &sample_change(base)).unwrap();
    }

    c.bench_function("rocks_read_100_of_1000", |b| {
        b.iter(|| {
            let changes = store.read_range("bench/doc", 901, 1000).unwrap();
            black_box(changes);
        })
    });
}

criterion_group!(
    benches,
    bench_inbound_encode,
    bench_inbound_decode,
    bench_outbound_roundtrip,
    bench_apply_edits,
    bench_submit_sequential,
    bench_submit_with_conflicts,
    bench_publish_fan_out,
    bench_rocks_append,
    bench_rocks_read_range,
);
criterion_main!(benches);
