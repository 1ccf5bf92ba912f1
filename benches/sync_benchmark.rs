use criterion::{black_box, criterion_group, criterion_main, Criterion};
use formsync::broadcast::BroadcastGroup;
use formsync::document::{Document, Operation};
use formsync::protocol::{UpdateBroadcast, UpdateRequest, WireMessage};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

fn bench_update_encode(c: &mut Criterion) {
    let session = Uuid::new_v4();
    let sender = Uuid::new_v4();
    let request = UpdateRequest {
        operation: Operation::Set {
            path: "sections.intro.title".into(),
            value: json!("Welcome"),
        },
        version: 42,
    };

    c.bench_function("update_encode", |b| {
        b.iter(|| {
            let msg = WireMessage::document_update(
                black_box(session),
                black_box(sender),
                black_box(&request),
            );
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let msg = WireMessage::document_updated(
        Uuid::new_v4(),
        &UpdateBroadcast {
            operation: Operation::Set {
                path: "sections.intro.title".into(),
                value: json!("Welcome"),
            },
            version: 42,
            user_id: Uuid::new_v4(),
        },
    );
    let encoded = msg.encode().unwrap();

    c.bench_function("update_decode", |b| {
        b.iter(|| {
            black_box(WireMessage::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_apply_set_nested(c: &mut Criterion) {
    let op = Operation::Set {
        path: "a.b.c.d".into(),
        value: json!({"x": 1}),
    };

    c.bench_function("apply_set_nested", |b| {
        b.iter(|| {
            let mut doc = Document::new(json!({"a": {"b": {"c": {}}}}));
            doc.apply(black_box(&op)).unwrap();
            black_box(doc);
        })
    });
}

fn bench_apply_array_insert(c: &mut Criterion) {
    let op = Operation::ArrayInsert {
        path: "items".into(),
        index: 0,
        value: json!("entry"),
    };

    c.bench_function("apply_array_insert", |b| {
        b.iter(|| {
            let mut doc = Document::new(json!({"items": ["a", "b", "c"]}));
            doc.apply(black_box(&op)).unwrap();
            black_box(doc);
        })
    });
}

fn bench_broadcast_fan_out(c: &mut Criterion) {
    let group = BroadcastGroup::new(2048);
    // Receivers that never drain just lag and drop frames; the send
    // path cost is what we measure.
    let _receivers: Vec<_> = (0..100).map(|_| group.subscribe()).collect();
    let frame = Arc::new(vec![0u8; 128]);

    c.bench_function("broadcast_100_receivers", |b| {
        b.iter(|| {
            black_box(group.send_raw(black_box(frame.clone())));
        })
    });
}

criterion_group!(
    benches,
    bench_update_encode,
    bench_update_decode,
    bench_apply_set_nested,
    bench_apply_array_insert,
    bench_broadcast_fan_out
);
criterion_main!(benches);
