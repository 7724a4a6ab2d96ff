use criterion::{criterion_group, criterion_main, Criterion};
use entsync_core::patch::{apply, diff};
use entsync_core::protocol::{from_wire, to_wire, Operation, SyncPacket};
use serde_json::{json, Value};
use std::hint::black_box;

fn contact(i: usize, emails: usize) -> Value {
    json!({
        "id": format!("contact-{i}"),
        "name": format!("Contact {i}"),
        "metadata": {"created": "2024-01-01T00:00:00Z", "source": "OPENLINE"},
        "emails": (0..emails).map(|e| json!({"id": format!("e{e}"), "address": format!("c{i}-{e}@x.io")})).collect::<Vec<_>>(),
        "tags": [{"id": "t1", "name": "vip"}],
    })
}

fn bench_diff_single_field(c: &mut Criterion) {
    let before = contact(1, 8);
    let mut after = before.clone();
    after["name"] = json!("Renamed");

    c.bench_function("diff_single_field", |b| {
        b.iter(|| black_box(diff(black_box(&before), black_box(&after))))
    });
}

fn bench_diff_sequence_insert(c: &mut Criterion) {
    let before = contact(1, 64);
    let mut after = before.clone();
    if let Some(emails) = after["emails"].as_array_mut() {
        emails.insert(0, json!({"id": "new", "address": "new@x.io"}));
    }

    c.bench_function("diff_sequence_insert_64", |b| {
        b.iter(|| black_box(diff(black_box(&before), black_box(&after))))
    });
}

fn bench_apply(c: &mut Criterion) {
    let before = contact(1, 64);
    let mut after = before.clone();
    after["emails"][10]["address"] = json!("changed@x.io");
    after["tags"] = json!([]);
    let patch = diff(&before, &after);

    c.bench_function("apply_patch_64", |b| {
        b.iter(|| black_box(apply(black_box(&before), black_box(&patch)).unwrap()))
    });
}

fn bench_packet_roundtrip(c: &mut Criterion) {
    let before = contact(1, 8);
    let mut after = before.clone();
    after["name"] = json!("Renamed");
    let packet = SyncPacket {
        version: 42,
        entity_id: "contact-1".into(),
        operation: Operation::between(41, &before, &after),
    };

    c.bench_function("sync_packet_roundtrip", |b| {
        b.iter(|| {
            let wire = to_wire(black_box(&packet)).unwrap();
            black_box(from_wire::<SyncPacket>(wire).unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_diff_single_field,
    bench_diff_sequence_insert,
    bench_apply,
    bench_packet_roundtrip,
);
criterion_main!(benches);
