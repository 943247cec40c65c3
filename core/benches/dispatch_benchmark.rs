/// EventDispatcher Performance Benchmarks using Criterion
///
/// Run with: cargo bench --bench dispatch_benchmark
///
/// Benchmarks cover:
/// - Dispatch throughput to one channel
/// - Fan-out to many listeners
/// - Typed payload decoding
/// - Register/unregister churn
use courier_core::dispatcher::{EventDispatcher, Identity, Listener};
use courier_core::model::Thread;
use courier_core::EventEnvelope;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

fn make_event(id: u64) -> EventEnvelope {
    EventEnvelope::new(
        "threadCreated",
        "thread",
        Some(1),
        json!({ "threadId": format!("t{id}"), "contextId": "ctx", "version": id }),
    )
}

fn counting_listener(counter: &Arc<AtomicU64>) -> Listener {
    let counter = Arc::clone(counter);
    Listener::raw(move |_| {
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(())
    })
}

/// Benchmark: one listener, many events
fn bench_dispatch_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch_throughput");

    for event_count in [100u64, 1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(*event_count));
        group.bench_with_input(
            BenchmarkId::from_parameter(event_count),
            event_count,
            |b, &count| {
                let dispatcher = EventDispatcher::new();
                let counter = Arc::new(AtomicU64::new(0));
                dispatcher.register(Identity::new(), "thread", "threadCreated", counting_listener(&counter));
                let events: Vec<EventEnvelope> = (0..count).map(make_event).collect();

                b.iter(|| {
                    for evt in &events {
                        black_box(dispatcher.dispatch(evt));
                    }
                });
            },
        );
    }
    group.finish();
}

/// Benchmark: fan-out to N listeners on the same key
fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch_fan_out");

    for listeners in [1usize, 10, 100].iter() {
        group.throughput(Throughput::Elements(*listeners as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(listeners),
            listeners,
            |b, &n| {
                let dispatcher = EventDispatcher::new();
                let counter = Arc::new(AtomicU64::new(0));
                for _ in 0..n {
                    dispatcher.register(Identity::new(), "thread", "threadCreated", counting_listener(&counter));
                }
                let evt = make_event(0);
                b.iter(|| black_box(dispatcher.dispatch(&evt)));
            },
        );
    }
    group.finish();
}

/// Benchmark: typed listener decoding the payload on every event
fn bench_typed_decode(c: &mut Criterion) {
    let dispatcher = EventDispatcher::new();
    dispatcher.register(
        Identity::new(),
        "thread",
        "threadCreated",
        Listener::typed(|t: Thread| {
            black_box(t.thread_id);
            Ok(())
        }),
    );
    let evt = make_event(7);

    c.bench_function("dispatch_typed_decode", |b| {
        b.iter(|| black_box(dispatcher.dispatch(&evt)))
    });
}

/// Benchmark: unmatched events (no listeners for the key)
fn bench_unmatched(c: &mut Criterion) {
    let dispatcher = EventDispatcher::new();
    dispatcher.register(Identity::new(), "store", "storeCreated", Listener::raw(|_| Ok(())));
    let evt = make_event(1);

    c.bench_function("dispatch_unmatched", |b| {
        b.iter(|| black_box(dispatcher.dispatch(&evt)))
    });
}

/// Benchmark: register then unregister one identity across channels
fn bench_registration_churn(c: &mut Criterion) {
    let dispatcher = EventDispatcher::new();
    let channels: Vec<String> = (0..16).map(|i| format!("thread/t{i}/messages")).collect();

    c.bench_function("dispatch_registration_churn", |b| {
        b.iter(|| {
            let identity = Identity::new();
            for channel in &channels {
                dispatcher.register(identity, channel, "threadNewMessage", Listener::raw(|_| Ok(())));
            }
            black_box(dispatcher.unregister_all(identity));
        })
    });
}

criterion_group!(
    benches,
    bench_dispatch_throughput,
    bench_fan_out,
    bench_typed_decode,
    bench_unmatched,
    bench_registration_churn
);
criterion_main!(benches);
