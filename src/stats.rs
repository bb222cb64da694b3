//! Node-local statistics with sharded atomic tallies.
//!
//! Handlers run concurrently on every runtime worker thread and each of them
//! bumps a tally per request, so a single shared atomic would bounce its
//! cache line between cores on every message. A [`Tally`] spreads updates
//! over cache-padded slots instead: each thread is assigned one slot on first
//! use and only ever writes there, and reads sum all slots.
//!
//! ```text
//!   worker 0 ──incr──►  [slot 0] (CachePadded)
//!   worker 1 ──incr──►  [slot 1] (CachePadded)
//!      ...                ...
//!   worker 15 ─incr──►  [slot 15]
//!                            │
//!                            ▼
//!                    value() sums all slots
//! ```
//!
//! Slots are handed out round-robin and wrap around, so two threads may
//! share a slot; that only costs contention, never correctness.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use serde::{Deserialize, Serialize};

const NUM_SLOTS: usize = 16;

static NEXT_SLOT: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static THREAD_SLOT: usize = NEXT_SLOT.fetch_add(1, Ordering::Relaxed) % NUM_SLOTS;
}

/// A monotonically increasing counter sharded across threads.
pub struct Tally {
    slots: [CachePadded<AtomicU64>; NUM_SLOTS],
}

impl Tally {
    pub const fn new() -> Self {
        const ZERO: CachePadded<AtomicU64> = CachePadded::new(AtomicU64::new(0));
        Tally {
            slots: [ZERO; NUM_SLOTS],
        }
    }

    #[inline]
    pub fn incr(&self) {
        self.add(1);
    }

    #[inline]
    pub fn add(&self, n: u64) {
        THREAD_SLOT.with(|slot| self.slots[*slot].fetch_add(n, Ordering::Relaxed));
    }

    /// Sums all slots.
    ///
    /// Not atomic across slots: increments racing with the read may or may
    /// not be included.
    pub fn value(&self) -> u64 {
        self.slots
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .sum()
    }
}

impl Default for Tally {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for Tally {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value())
    }
}

/// Everything this node counts about its own work.
#[derive(Debug, Default)]
pub struct Stats {
    /// `add` requests whose delta was enqueued.
    pub adds_accepted: Tally,
    /// `add` requests refused because the queue was full or closed.
    pub adds_rejected: Tally,
    /// `read` requests answered.
    pub reads_served: Tally,
    /// `read` requests failed because the store was unavailable.
    pub reads_failed: Tally,
    /// Deltas committed to the store by the increment serializer.
    pub deltas_applied: Tally,
    /// Compare-and-swap attempts lost to a concurrent writer.
    pub cas_conflicts: Tally,
    /// Serializer attempts failed for any other reason.
    pub store_failures: Tally,
    /// Deltas put back in the queue after a failed attempt.
    pub retries: Tally,
    /// Deltas dropped after a compare-and-swap with unknown outcome.
    pub cas_unknown: Tally,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a point-in-time copy of every tally.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            adds_accepted: self.adds_accepted.value(),
            adds_rejected: self.adds_rejected.value(),
            reads_served: self.reads_served.value(),
            reads_failed: self.reads_failed.value(),
            deltas_applied: self.deltas_applied.value(),
            cas_conflicts: self.cas_conflicts.value(),
            store_failures: self.store_failures.value(),
            retries: self.retries.value(),
            cas_unknown: self.cas_unknown.value(),
        }
    }
}

/// Serializable copy of [`Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub adds_accepted: u64,
    pub adds_rejected: u64,
    pub reads_served: u64,
    pub reads_failed: u64,
    pub deltas_applied: u64,
    pub cas_conflicts: u64,
    pub store_failures: u64,
    pub retries: u64,
    pub cas_unknown: u64,
}

impl StatsSnapshot {
    /// Accepted deltas the serializer has not settled, either way.
    pub fn outstanding(&self) -> u64 {
        self.adds_accepted
            .saturating_sub(self.deltas_applied)
            .saturating_sub(self.cas_unknown)
    }
}
