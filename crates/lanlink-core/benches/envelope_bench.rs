//! Criterion benchmarks for the JSON line envelope codec.
//!
//! The codec sits on the receive hot path of every peer connection, so
//! encode/decode latency bounds the per-message overhead of the channel.
//!
//! Run with:
//! ```bash
//! cargo bench --package lanlink-core --bench envelope_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use lanlink_core::protocol::envelope::Envelope;
use serde_json::{json, Map, Value};

// ── Envelope fixtures ─────────────────────────────────────────────────────────

fn make_ping() -> Envelope {
    Envelope::with_token("Ping", 7, Map::new())
}

fn make_reply() -> Envelope {
    Envelope::result_ok(7, json!("pong"))
}

fn make_clipboard_event() -> Envelope {
    let mut payload = Map::new();
    payload.insert(
        "Formats".to_string(),
        json!(["Text", "UnicodeText", "System.String", "HTML Format"]),
    );
    payload.insert("SizeEstimate".to_string(), json!(48_213));
    Envelope::new("ClipboardChanged", payload)
}

fn make_input_batch() -> Envelope {
    let events: Vec<Value> = (0..64)
        .map(|i| json!({"Type": "Keyboard", "Message": 0x0100, "Virtual": 65 + (i % 26)}))
        .collect();
    let mut payload = Map::new();
    payload.insert("Events".to_string(), Value::Array(events));
    Envelope::with_token("RemoteInput", 99, payload)
}

// ── Benchmarks ────────────────────────────────────────────────────────────────

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope_encode");
    for (name, env) in [
        ("ping", make_ping()),
        ("reply", make_reply()),
        ("clipboard_event", make_clipboard_event()),
        ("input_batch_64", make_input_batch()),
    ] {
        group.bench_with_input(BenchmarkId::from_parameter(name), &env, |b, env| {
            b.iter(|| black_box(env.encode_line().unwrap()));
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope_decode");
    for (name, env) in [
        ("ping", make_ping()),
        ("reply", make_reply()),
        ("clipboard_event", make_clipboard_event()),
        ("input_batch_64", make_input_batch()),
    ] {
        let line = env.encode_line().unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(name), &line, |b, line| {
            b.iter(|| black_box(Envelope::decode_line(line).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
