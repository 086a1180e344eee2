//! Latency benchmarks for Orbit.
//!
//! These benchmarks focus on the per-event cost of the presence path.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use orbit_bench::{followed_registry, status_delivery, status_event, status_frame};
use orbit_bus::{EventPublisher, EventReceiver, MemoryExchange, PublisherConfig, ReceiverConfig};
use orbit_core::{transition, PresenceTracker, PresenceTrigger};
use orbit_protocol::{codec, EventName, PresenceState, StatusRecord};
use std::sync::Arc;
use std::time::Instant;

/// Benchmark round-trip encode/decode latency.
fn bench_codec_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec_roundtrip");
    let frame = status_frame();

    group.bench_function("msgpack", |b| {
        b.iter(|| {
            let encoded = codec::encode(black_box(&frame)).unwrap();
            codec::decode(black_box(&encoded)).unwrap()
        });
    });

    group.bench_function("json", |b| {
        b.iter(|| {
            let encoded = codec::encode_text(black_box(&frame)).unwrap();
            codec::decode_text(black_box(&encoded)).unwrap()
        });
    });

    group.finish();
}

/// Benchmark the state machine.
fn bench_presence(c: &mut Criterion) {
    let mut group = c.benchmark_group("presence");
    let online = StatusRecord::new(PresenceState::Online, 1);
    let busy = StatusRecord::new(PresenceState::AppearBusy, 1);

    group.bench_function("transition_login", |b| {
        b.iter(|| transition(black_box(Some(&online)), PresenceTrigger::Login, 2))
    });
    group.bench_function("transition_sticky", |b| {
        b.iter(|| transition(black_box(Some(&busy)), PresenceTrigger::Logout, 2))
    });

    group.bench_function("tracker_login_logout", |b| {
        let tracker = PresenceTracker::new();
        let mut i = 0u64;
        b.iter(|| {
            let uid = format!("u{}", i % 1024);
            i += 1;
            tracker.apply(&uid, PresenceTrigger::Login);
            tracker.apply(&uid, PresenceTrigger::Logout)
        });
    });

    group.finish();
}

/// Benchmark a bus delivery reaching local followers.
fn bench_receiver(c: &mut Criterion) {
    let mut group = c.benchmark_group("receiver");

    group.bench_function("handle_delivery_10_followers", |b| {
        let (registry, mut rxs) = followed_registry(10);
        let receiver = EventReceiver::new(
            Arc::new(MemoryExchange::new()),
            registry,
            "bench",
            ReceiverConfig::default(),
        );
        let delivery = status_delivery("peer");

        b.iter(|| {
            let _ = receiver.handle_delivery(black_box(&delivery));
            for rx in &mut rxs {
                let _ = rx.try_recv();
            }
        });
    });

    group.finish();
}

/// Benchmark publishing through the in-memory exchange.
fn bench_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish");
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    group.bench_function("memory_exchange", |b| {
        let publisher = EventPublisher::new(
            Arc::new(MemoryExchange::new()),
            PublisherConfig::default(),
            "bench",
        );
        let event = status_event(PresenceState::AppearAway);

        b.iter_custom(|iters| {
            runtime.block_on(async {
                let start = Instant::now();
                for _ in 0..iters {
                    let _ = publisher.publish(EventName::UserStatus, black_box(&event)).await;
                }
                start.elapsed()
            })
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_codec_roundtrip,
    bench_presence,
    bench_receiver,
    bench_publish,
);
criterion_main!(benches);
