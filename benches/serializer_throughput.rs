use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use seqcounter::kv::{KvStore, MemoryKv};
use seqcounter::retry::RetryPolicy;
use seqcounter::serializer::{IncrementSerializer, SerializerConfig};
use seqcounter::stats::Stats;
use seqcounter::Backpressure;

const NUM_PRODUCERS: usize = 8;
const DELTAS_PER_PRODUCER: usize = 1_000;

fn config() -> SerializerConfig {
    SerializerConfig {
        key: "counter".to_string(),
        capacity: 100,
        backpressure: Backpressure::Block,
        retry: RetryPolicy::IMMEDIATE,
    }
}

/// Spawns `nodes` serializers on one store and feeds them from `NUM_PRODUCERS` tasks.
async fn run(nodes: usize, cas_failure_rate: f64) -> i64 {
    let kv = Arc::new(MemoryKv::new().with_cas_failure_rate(cas_failure_rate));
    let handles: Vec<_> = (0..nodes)
        .map(|_| IncrementSerializer::spawn(kv.clone(), config(), Arc::new(Stats::new())))
        .collect();

    let producers: Vec<_> = (0..NUM_PRODUCERS)
        .map(|i| {
            let queue = handles[i % nodes].queue();
            tokio::spawn(async move {
                for _ in 0..DELTAS_PER_PRODUCER {
                    let _ = queue.push(1).await;
                }
            })
        })
        .collect();
    for producer in producers {
        let _ = producer.await;
    }
    for handle in handles {
        handle.drain().await;
    }
    kv.read("counter").await.unwrap_or_default()
}

fn bench_serializer(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap();

    let mut group = c.benchmark_group("serializer_apply");
    group.sample_size(20);

    for nodes in [1, 2, 4] {
        for rate in [0.0, 0.3] {
            group.bench_function(
                BenchmarkId::new(
                    format!("{nodes} nodes"),
                    format!("{}x{} deltas, {rate} cas failures", NUM_PRODUCERS, DELTAS_PER_PRODUCER),
                ),
                |b| b.to_async(&rt).iter(|| async move { black_box(run(nodes, rate).await) }),
            );
        }
    }

    group.finish();
}

criterion_group!(benches, bench_serializer);
criterion_main!(benches);
