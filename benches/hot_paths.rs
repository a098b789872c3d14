use std::time::{Duration, SystemTime};

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::{json, Value};
use telebridge::bridge::detector::evaluate;
use telebridge::bridge::heartbeat::HeartbeatPolicy;
use telebridge::bridge::state::{BridgeState, SeriesKey};
use telebridge::source::flatten::flatten;
use telebridge::source::topic::decode;
use telebridge::store::line_protocol::encode;
use telebridge::store::Point;

const MEASUREMENTS: usize = 8;
const FIELDS: usize = 24;

fn inverter_document() -> Value {
    let mut doc = serde_json::Map::new();
    for m in 0..MEASUREMENTS {
        let mut fields = serde_json::Map::new();
        for f in 0..FIELDS {
            fields.insert(format!("field_{f}"), json!((m * FIELDS + f) as f64 * 0.5));
        }
        fields.insert("label".to_string(), json!("ignored"));
        doc.insert(format!("measurement_{m}"), Value::Object(fields));
    }
    Value::Object(doc)
}

fn seeded_state(now: SystemTime) -> (BridgeState, Vec<SeriesKey>) {
    let mut state = BridgeState::new();
    let mut keys = Vec::with_capacity(MEASUREMENTS * FIELDS);
    for m in 0..MEASUREMENTS {
        for f in 0..FIELDS {
            let key = SeriesKey::new(format!("measurement_{m}"), format!("field_{f}"));
            evaluate(&mut state, &key, (m + f) as f64, now);
            keys.push(key);
        }
    }
    state.mark_initialized();
    (state, keys)
}

fn bench_decode(c: &mut Criterion) {
    let doc = inverter_document();

    c.bench_function("flatten/inverter_document", |b| {
        b.iter(|| black_box(flatten(black_box(&doc))).len())
    });

    c.bench_function("topic/decode", |b| {
        b.iter(|| {
            decode(black_box("/powmr/inverter.temp"), black_box(b"41.25")).expect("decode")
        })
    });
}

fn bench_bridge(c: &mut Criterion) {
    let now = SystemTime::now();
    let (mut state, keys) = seeded_state(now);

    c.bench_function("detector/evaluate_unchanged_sweep", |b| {
        b.iter(|| {
            for (i, key) in keys.iter().enumerate() {
                let eval = evaluate(&mut state, key, black_box(i as f64), now);
                black_box(eval.write);
            }
        })
    });

    let policy = HeartbeatPolicy::default();
    let later = now + Duration::from_secs(90);
    c.bench_function("heartbeat/due_scan", |b| {
        b.iter(|| black_box(policy.due(black_box(&state), later)).len())
    });

    let point = Point::new("inverter", "temp", 41.25, now);
    c.bench_function("line_protocol/encode", |b| {
        b.iter(|| encode(black_box(&point)).expect("encode"))
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_decode(c);
    bench_bridge(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
