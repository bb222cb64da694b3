//! Increment serializers racing on one shared store.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use seqcounter::error::KvResult;
use seqcounter::kv::{KvStore, MemoryKv};
use seqcounter::retry::RetryPolicy;
use seqcounter::serializer::{IncrementSerializer, SerializerConfig};
use seqcounter::stats::Stats;
use seqcounter::{Backpressure, KvError, NodeError};
use serde_json::Value;
use tokio::sync::{Notify, Semaphore};

fn config(capacity: usize, backpressure: Backpressure, retry: RetryPolicy) -> SerializerConfig {
    SerializerConfig {
        key: "counter".to_string(),
        capacity,
        backpressure,
        retry,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_nodes_converge_under_cas_conflicts() {
    let kv = Arc::new(MemoryKv::new().with_seed(2024).with_cas_failure_rate(0.25));
    let stats: Vec<_> = (0..2).map(|_| Arc::new(Stats::new())).collect();
    let nodes: Vec<_> = stats
        .iter()
        .map(|stats| {
            IncrementSerializer::spawn(
                kv.clone(),
                config(100, Backpressure::Block, RetryPolicy::IMMEDIATE),
                stats.clone(),
            )
        })
        .collect();

    let producers: Vec<_> = nodes
        .iter()
        .map(|node| {
            let queue = node.queue();
            tokio::spawn(async move {
                for _ in 0..1000 {
                    queue.push(1).await.unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.await.unwrap();
    }
    for node in nodes {
        assert!(node.drain().await.is_empty());
    }

    assert_eq!(kv.read("counter").await, Ok(2000));
    let applied: u64 = stats.iter().map(|s| s.snapshot().deltas_applied).sum();
    let conflicts: u64 = stats.iter().map(|s| s.snapshot().cas_conflicts).sum();
    assert_eq!(applied, 2000);
    assert!(conflicts > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_random_deltas_applied_exactly_once() {
    let kv = Arc::new(
        MemoryKv::new()
            .with_seed(99)
            .with_cas_failure_rate(0.2)
            .with_read_failure_rate(0.1),
    );
    let mut rng = StdRng::seed_from_u64(5);
    let batches: Vec<Vec<i64>> = (0..3)
        .map(|_| (0..300).map(|_| rng.random_range(-50..=50)).collect())
        .collect();
    let expected: i64 = batches.iter().flatten().sum();

    let retry = RetryPolicy::new(Duration::from_micros(10), Duration::from_micros(200));
    let mut nodes = Vec::new();
    for batch in batches {
        let node = IncrementSerializer::spawn(
            kv.clone(),
            config(16, Backpressure::Block, retry),
            Arc::new(Stats::new()),
        );
        let queue = node.queue();
        tokio::spawn(async move {
            for delta in batch {
                queue.push(delta).await.unwrap();
            }
        });
        nodes.push(node);
    }
    for node in nodes {
        assert!(node.drain().await.is_empty());
    }

    assert_eq!(kv.read("counter").await, Ok(expected));
}

/// Store whose counter reads wait at a gate until the test opens it.
struct GatedKv {
    inner: MemoryKv,
    entered: Notify,
    gate: Semaphore,
}

impl GatedKv {
    fn new() -> Self {
        GatedKv {
            inner: MemoryKv::new(),
            entered: Notify::new(),
            gate: Semaphore::new(0),
        }
    }

    fn open(&self) {
        self.gate.add_permits(1);
    }
}

impl KvStore for GatedKv {
    async fn read(&self, key: &str) -> KvResult<i64> {
        self.entered.notify_one();
        let _permit = self.gate.acquire().await.map_err(|_| KvError::Closed)?;
        self.inner.read(key).await
    }

    async fn write(&self, key: &str, value: Value) -> KvResult<()> {
        self.inner.write(key, value).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        from: i64,
        to: i64,
        create_if_missing: bool,
    ) -> KvResult<()> {
        self.inner
            .compare_and_swap(key, from, to, create_if_missing)
            .await
    }
}

#[tokio::test(start_paused = true)]
async fn test_full_queue_blocks_producer() {
    let kv = Arc::new(GatedKv::new());
    let node = IncrementSerializer::spawn(
        kv.clone(),
        config(2, Backpressure::Block, RetryPolicy::IMMEDIATE),
        Arc::new(Stats::new()),
    );
    let queue = node.queue();

    // The first delta is stuck in its attempt and still holds its slot.
    queue.push(1).await.unwrap();
    kv.entered.notified().await;
    queue.push(2).await.unwrap();
    assert_eq!(queue.pending(), 2);

    let blocked = tokio::time::timeout(Duration::from_millis(50), queue.push(3)).await;
    assert!(blocked.is_err(), "push into a full queue must wait");

    let producer = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.push(3).await })
    };
    tokio::task::yield_now().await;
    assert!(!producer.is_finished());

    kv.open();
    producer.await.unwrap().unwrap();
    drop(queue);
    assert!(node.drain().await.is_empty());
    assert_eq!(kv.inner.read("counter").await, Ok(6));
}

#[tokio::test]
async fn test_full_queue_rejects_producer() {
    let kv = Arc::new(GatedKv::new());
    let node = IncrementSerializer::spawn(
        kv.clone(),
        config(2, Backpressure::Reject, RetryPolicy::IMMEDIATE),
        Arc::new(Stats::new()),
    );
    let queue = node.queue();

    queue.push(1).await.unwrap();
    kv.entered.notified().await;
    queue.push(2).await.unwrap();
    for _ in 0..3 {
        assert!(matches!(queue.push(3).await, Err(NodeError::QueueFull)));
    }

    kv.open();
    drop(queue);
    assert!(node.drain().await.is_empty());
    assert_eq!(kv.inner.read("counter").await, Ok(3));
}

#[tokio::test]
async fn test_capacity_bounds_deltas_against_failing_store() {
    let kv = Arc::new(MemoryKv::new().with_cas_failure_rate(1.0));
    let stats = Arc::new(Stats::new());
    let node = IncrementSerializer::spawn(
        kv.clone(),
        config(2, Backpressure::Reject, RetryPolicy::IMMEDIATE),
        stats.clone(),
    );
    let queue = node.queue();

    let mut rejected = 0;
    for delta in 0..1000 {
        if let Err(err) = queue.push(delta).await {
            assert!(matches!(err, NodeError::QueueFull));
            rejected += 1;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(rejected, 998);
    assert!(stats.snapshot().retries > 0);

    let left = node.shutdown().await;
    assert_eq!(left.len(), 2);
    assert_eq!(kv.get("counter"), None);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_shutdown_is_prompt() {
    let kv = Arc::new(MemoryKv::new().with_cas_failure_rate(1.0));
    let stats = Arc::new(Stats::new());
    let node = IncrementSerializer::spawn(
        kv,
        config(
            4,
            Backpressure::Block,
            RetryPolicy::new(Duration::from_secs(30), Duration::from_secs(30)),
        ),
        stats.clone(),
    );
    node.queue().push(8).await.unwrap();
    while stats.snapshot().retries == 0 {
        tokio::task::yield_now().await;
    }

    let left = tokio::time::timeout(Duration::from_secs(5), node.shutdown())
        .await
        .expect("shutdown must interrupt the backoff sleep");
    assert_eq!(left, vec![8]);
}
