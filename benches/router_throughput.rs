//! Router throughput benchmarks
//!
//! Measures the producer-side cost of the structured `get`/`publish` path against
//! the `send` slow path and the synchronous fallback, across wait strategies.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use telemetry_router::{
    DestinationRegistry, EventEntry, Level, Router, RouterConfig, TracingDiagnostics, Value,
    WaitStrategyKind,
};

const BATCH: u64 = 1_000;

/// Registry that only counts, so the benchmark measures the router
#[derive(Default)]
struct CountingRegistry {
    writes: AtomicU64,
}

impl DestinationRegistry for CountingRegistry {
    fn write(&self, entry: &EventEntry) -> anyhow::Result<()> {
        black_box(entry.parameters());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_direct(
        &self,
        _destination_index: u32,
        _level: Level,
        _timestamp_nanos: i64,
        _source: Option<&str>,
        _template: Option<&str>,
        args: &[Value],
    ) -> anyhow::Result<()> {
        black_box(args);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn index_of(&self, _name: &str) -> Option<u32> {
        Some(0)
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn started_router(config: RouterConfig) -> (Router, Arc<CountingRegistry>) {
    let registry = Arc::new(CountingRegistry::default());
    let router = Router::new(config, registry.clone(), Arc::new(TracingDiagnostics))
        .expect("Failed to create router");
    router.start().expect("Failed to start router");
    (router, registry)
}

/// Wait until the consumer has caught up with everything published so far
fn wait_for_drain(registry: &CountingRegistry, expected: u64) {
    while registry.writes.load(Ordering::Acquire) < expected {
        std::hint::spin_loop();
    }
}

fn structured_publish_benchmark(c: &mut Criterion) {
    init_tracing();
    let mut group = c.benchmark_group("structured_publish");
    group.throughput(Throughput::Elements(BATCH));
    group.measurement_time(Duration::from_secs(5));

    let strategies = [
        ("blocking", WaitStrategyKind::Blocking),
        ("yielding", WaitStrategyKind::Yielding),
        ("busy-spin", WaitStrategyKind::BusySpin),
    ];

    for (name, strategy) in strategies {
        let (router, registry) = started_router(
            RouterConfig::asynchronous()
                .with_ring_size(4096)
                .with_wait_strategy(strategy),
        );
        let mut published = 0u64;

        group.bench_function(BenchmarkId::new("get_publish", name), |b| {
            b.iter(|| {
                for value in 0..BATCH {
                    let mut entry = router.get().expect("claim failed");
                    entry.level = Level::Info;
                    entry.push_parameter("request served");
                    entry.push_parameter(value);
                    let _ = write!(entry.payload_mut(), "latency={value}us");
                    router.publish(entry);
                }
                published += BATCH;
                wait_for_drain(&registry, published);
            });
        });

        router.stop().expect("Failed to stop router");
    }

    group.finish();
}

fn send_benchmark(c: &mut Criterion) {
    init_tracing();
    let mut group = c.benchmark_group("send");
    group.throughput(Throughput::Elements(BATCH));

    let args = [Value::from("request served"), Value::from(42u64)];

    let (router, registry) = started_router(RouterConfig::asynchronous().with_ring_size(4096));
    let mut published = 0u64;
    group.bench_function("asynchronous", |b| {
        b.iter(|| {
            for _ in 0..BATCH {
                router
                    .send(Level::Info, 0, 0, None, None, false, black_box(&args))
                    .expect("send failed");
            }
            published += BATCH;
            wait_for_drain(&registry, published);
        });
    });
    router.stop().expect("Failed to stop router");

    let (router, _) = started_router(RouterConfig::synchronous());
    group.bench_function("synchronous", |b| {
        b.iter(|| {
            for _ in 0..BATCH {
                router
                    .send(Level::Info, 0, 0, None, None, false, black_box(&args))
                    .expect("send failed");
            }
        });
    });

    group.finish();
}

fn contended_producers_benchmark(c: &mut Criterion) {
    init_tracing();
    let mut group = c.benchmark_group("contended_producers");
    group.sample_size(20);

    for producers in [2u64, 4] {
        group.throughput(Throughput::Elements(BATCH * producers));
        let (router, registry) = started_router(RouterConfig::asynchronous().with_ring_size(8192));
        let mut published = 0u64;

        group.bench_with_input(
            BenchmarkId::new("producers", producers),
            &producers,
            |b, &producers| {
                b.iter(|| {
                    thread::scope(|scope| {
                        for _ in 0..producers {
                            scope.spawn(|| {
                                for value in 0..BATCH {
                                    let mut entry = router.get().expect("claim failed");
                                    entry.push_parameter(value);
                                    entry.publish();
                                }
                            });
                        }
                    });
                    published += BATCH * producers;
                    wait_for_drain(&registry, published);
                });
            },
        );

        router.stop().expect("Failed to stop router");
    }

    group.finish();
}

criterion_group!(
    benches,
    structured_publish_benchmark,
    send_benchmark,
    contended_producers_benchmark
);
criterion_main!(benches);
