//! The increment serializer: the only path by which this node mutates the
//! shared counter.
//!
//! Handlers never touch the counter key themselves. They push deltas onto a
//! [`DeltaQueue`]; a single worker task drains it and applies one delta at a
//! time with a read + compare-and-swap loop, so this node never has two
//! attempts in flight. Peer nodes run the same loop against the same
//! key; correctness across nodes rests entirely on the store's CAS.
//!
//! ```text
//!   add ──slot──push──►  [ channel ]  ──►  backlog (worker-owned)
//!                                              │ pop front
//!                                              ▼
//!                                   read counter (missing = 0)
//!                                              │
//!                                   cas(current, current + delta)
//!                                     │ ok            │ failed
//!                                     ▼               ▼
//!                                  applied     back of the backlog,
//!                                slot freed    backoff, try again
//! ```
//!
//! # Capacity
//!
//! The queue holds `capacity` slots. A delta takes one when it is pushed and
//! gives it back only once applied, so deltas waiting in the channel, in the
//! backlog and under attempt all count against the same bound. A full queue
//! blocks or rejects producers according to [`Backpressure`].
//!
//! # Retries
//!
//! A failed attempt never loses the delta: it goes to the tail of the
//! worker-owned backlog, behind whatever arrived meanwhile, so deltas may be
//! applied out of arrival order. Retries are unbounded; the delay between
//! them follows the configured [`RetryPolicy`].
//!
//! A compare-and-swap whose outcome is unknown ([`KvError::outcome_unknown`])
//! is never retried, since it may already have committed. The delta is
//! dropped, logged at `error` and counted in `cas_unknown`.
//!
//! # Shutdown
//!
//! [`SerializerHandle::shutdown`] stops the worker between attempts and hands
//! back every delta that was accepted but not applied.
//! [`SerializerHandle::drain`] closes intake and waits until everything
//! pending has been applied.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{Backpressure, Config};
use crate::error::{KvError, NodeError, Result};
use crate::kv::{self, KvStore};
use crate::retry::RetryPolicy;
use crate::stats::Stats;

/// Consecutive failures between two `warn` logs.
const WARN_EVERY: u32 = 100;

/// Settings of one serializer instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializerConfig {
    pub key: String,
    pub capacity: usize,
    pub backpressure: Backpressure,
    pub retry: RetryPolicy,
}

impl Default for SerializerConfig {
    fn default() -> Self {
        SerializerConfig::from(&Config::default())
    }
}

impl From<&Config> for SerializerConfig {
    fn from(config: &Config) -> Self {
        SerializerConfig {
            key: config.counter_key.clone(),
            capacity: config.queue_capacity,
            backpressure: config.backpressure,
            retry: config.retry_policy(),
        }
    }
}

/// An accepted delta and the queue slot it occupies until applied.
#[derive(Debug)]
pub(crate) struct Pending {
    pub(crate) delta: i64,
    _slot: OwnedSemaphorePermit,
}

/// Producer side of the pending-delta queue.
#[derive(Debug, Clone)]
pub struct DeltaQueue {
    tx: mpsc::UnboundedSender<Pending>,
    slots: Arc<Semaphore>,
    capacity: usize,
    backpressure: Backpressure,
}

impl DeltaQueue {
    pub(crate) fn bounded(
        capacity: usize,
        backpressure: Backpressure,
    ) -> (Self, mpsc::UnboundedReceiver<Pending>) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = DeltaQueue {
            tx,
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            backpressure,
        };
        (queue, rx)
    }

    /// Hands a delta to the serializer.
    ///
    /// With [`Backpressure::Block`] this waits for a free slot; with
    /// [`Backpressure::Reject`] a full queue fails with
    /// [`NodeError::QueueFull`]. Either way, `Ok` means the delta now holds a
    /// slot and will be attempted until settled; `Err` means it was not
    /// enqueued.
    pub async fn push(&self, delta: i64) -> Result<()> {
        let slot = match self.backpressure {
            Backpressure::Block => self
                .slots
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| NodeError::SerializerStopped)?,
            Backpressure::Reject => {
                self.slots
                    .clone()
                    .try_acquire_owned()
                    .map_err(|err| match err {
                        TryAcquireError::NoPermits => NodeError::QueueFull,
                        TryAcquireError::Closed => NodeError::SerializerStopped,
                    })?
            }
        };
        self.tx
            .send(Pending { delta, _slot: slot })
            .map_err(|_| NodeError::SerializerStopped)
    }

    /// Deltas accepted but not yet applied.
    pub fn pending(&self) -> usize {
        self.capacity - self.slots.available_permits()
    }
}

/// Outcome of one read + compare-and-swap attempt.
#[derive(Debug)]
enum Attempt {
    Applied { from: i64, to: i64 },
    ReadFailed(KvError),
    Overflow { current: i64 },
    CasFailed(KvError),
    CasUnknown(KvError),
}

/// Worker applying deltas to the shared counter, one at a time.
pub struct IncrementSerializer<K> {
    kv: Arc<K>,
    key: String,
    retry: RetryPolicy,
    rx: mpsc::UnboundedReceiver<Pending>,
    slots: Arc<Semaphore>,
    backlog: VecDeque<Pending>,
    stop: watch::Receiver<bool>,
    stats: Arc<Stats>,
    failures: u32,
}

/// Owner handle of a running [`IncrementSerializer`].
///
/// Dropping the handle stops the worker like [`SerializerHandle::shutdown`],
/// without collecting the leftover deltas.
#[derive(Debug)]
pub struct SerializerHandle {
    queue: DeltaQueue,
    stop: watch::Sender<bool>,
    task: JoinHandle<Vec<i64>>,
}

impl<K: KvStore> IncrementSerializer<K> {
    /// Starts the worker on the current tokio runtime.
    pub fn spawn(kv: Arc<K>, config: SerializerConfig, stats: Arc<Stats>) -> SerializerHandle {
        let (queue, rx) = DeltaQueue::bounded(config.capacity, config.backpressure);
        let (stop_tx, stop_rx) = watch::channel(false);
        let worker = IncrementSerializer {
            kv,
            key: config.key,
            retry: config.retry,
            rx,
            slots: queue.slots.clone(),
            backlog: VecDeque::new(),
            stop: stop_rx,
            stats,
            failures: 0,
        };
        info!(
            key = %worker.key,
            capacity = queue.capacity,
            backpressure = ?config.backpressure,
            "increment serializer started"
        );
        SerializerHandle {
            queue,
            stop: stop_tx,
            task: tokio::spawn(worker.run()),
        }
    }

    async fn run(mut self) -> Vec<i64> {
        while let Some(pending) = self.next_delta().await {
            let delta = pending.delta;
            let outcome = attempt(&*self.kv, &self.key, delta).await;
            match outcome {
                Attempt::Applied { from, to } => {
                    debug!(delta, from, to, "delta applied");
                    self.failures = 0;
                    self.stats.deltas_applied.incr();
                }
                Attempt::CasUnknown(err) => {
                    self.failures = 0;
                    self.stats.cas_unknown.incr();
                    error!(delta, error = %err, "compare-and-swap outcome unknown, delta not retried");
                }
                failed => {
                    self.record_failure(delta, &failed);
                    self.backlog.push_back(pending);
                    if !self.pause().await {
                        break;
                    }
                }
            }
        }

        self.slots.close();
        self.rx.close();
        while let Ok(pending) = self.rx.try_recv() {
            self.backlog.push_back(pending);
        }
        let left: Vec<i64> = self.backlog.iter().map(|pending| pending.delta).collect();
        info!(unapplied = left.len(), "increment serializer stopped");
        left
    }

    fn stopping(&self) -> bool {
        *self.stop.borrow()
    }

    /// Returns the next delta to try, or `None` once the worker must exit.
    async fn next_delta(&mut self) -> Option<Pending> {
        if self.stopping() {
            return None;
        }
        while let Ok(pending) = self.rx.try_recv() {
            self.backlog.push_back(pending);
        }
        if let Some(pending) = self.backlog.pop_front() {
            return Some(pending);
        }
        tokio::select! {
            biased;
            _ = self.stop.changed() => None,
            pending = self.rx.recv() => pending,
        }
    }

    fn record_failure(&mut self, delta: i64, attempt: &Attempt) {
        self.failures = self.failures.saturating_add(1);
        self.stats.retries.incr();
        match attempt {
            Attempt::CasFailed(KvError::CasConflict) => {
                self.stats.cas_conflicts.incr();
                debug!(delta, failures = self.failures, "lost compare-and-swap race");
            }
            Attempt::ReadFailed(err) | Attempt::CasFailed(err) => {
                self.stats.store_failures.incr();
                debug!(delta, failures = self.failures, error = %err, "store call failed");
            }
            Attempt::Overflow { current } => {
                self.stats.store_failures.incr();
                error!(delta, current, "counter would overflow, delta kept pending");
            }
            Attempt::Applied { .. } | Attempt::CasUnknown(_) => {}
        }
        if self.failures % WARN_EVERY == 0 {
            warn!(
                failures = self.failures,
                pending = self.backlog.len() + 1,
                "increment serializer keeps failing"
            );
        }
    }

    /// Waits out the backoff delay. Returns `false` if asked to stop meanwhile.
    async fn pause(&mut self) -> bool {
        let delay = self.retry.delay(self.failures, &mut rand::rng());
        if delay.is_zero() {
            tokio::task::yield_now().await;
            return !self.stopping();
        }
        tokio::select! {
            biased;
            _ = self.stop.changed() => false,
            _ = tokio::time::sleep(delay) => !self.stopping(),
        }
    }
}

/// One read + compare-and-swap round for `delta`.
async fn attempt<K: KvStore>(kv: &K, key: &str, delta: i64) -> Attempt {
    let current = match kv::read_counter(kv, key).await {
        Ok(current) => current,
        Err(err) => return Attempt::ReadFailed(err),
    };
    let Some(next) = current.checked_add(delta) else {
        return Attempt::Overflow { current };
    };
    match kv.compare_and_swap(key, current, next, true).await {
        Ok(()) => Attempt::Applied {
            from: current,
            to: next,
        },
        Err(err) if err.outcome_unknown() => Attempt::CasUnknown(err),
        Err(err) => Attempt::CasFailed(err),
    }
}

impl SerializerHandle {
    /// Returns a producer for the pending-delta queue.
    pub fn queue(&self) -> DeltaQueue {
        self.queue.clone()
    }

    /// Stops the worker and returns the deltas it never applied.
    ///
    /// An attempt already talking to the store is allowed to finish, so a
    /// returned delta has definitely not been committed by this worker.
    pub async fn shutdown(self) -> Vec<i64> {
        let SerializerHandle { queue, stop, task } = self;
        drop(queue);
        let _ = stop.send(true);
        collect(task).await
    }

    /// Waits until every pending delta has been applied, then stops.
    ///
    /// Intake closes once every [`DeltaQueue`] clone is dropped; until then
    /// new deltas keep being accepted and applied. Never returns while the
    /// store keeps failing.
    pub async fn drain(self) -> Vec<i64> {
        let SerializerHandle { queue, stop, task } = self;
        drop(queue);
        let left = collect(task).await;
        drop(stop);
        left
    }
}

async fn collect(task: JoinHandle<Vec<i64>>) -> Vec<i64> {
    match task.await {
        Ok(left) => left,
        Err(err) => {
            error!(error = %err, "increment serializer task failed");
            Vec::new()
        }
    }
}
