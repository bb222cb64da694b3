//! # seqcounter - A Grow-Only Counter over a Sequentially Consistent Store
//!
//! A node for Maelstrom's `g-counter` workload. Every node of the cluster
//! serves `add` and `read` over the Maelstrom JSON protocol, and all of them
//! share a single counter kept in the `seq-kv` service.
//!
//! ## The Problem
//!
//! The store offers single-key `read`, `write` and `compare-and-swap`, and is
//! only *sequentially* consistent. Incrementing a shared value with those
//! primitives is a read-modify-write: two nodes reading the same value and
//! writing back `value + delta` lose one of the increments. And a plain read
//! may be served from a view arbitrarily far behind other nodes' writes.
//!
//! ## The Solution
//!
//! 1. **One writer path per node**: `add` never touches the store. It hands
//!    its delta to the [`IncrementSerializer`](serializer::IncrementSerializer),
//!    a single worker that applies deltas one at a time with
//!    `read` + `compare_and_swap(current, current + delta)`.
//!
//! 2. **Retry, never drop**: a failed attempt (lost race, store error,
//!    timeout) puts the same delta back at the tail of the worker's backlog.
//!    Across nodes, the store's atomic CAS is the only arbiter.
//!
//! 3. **Missing means zero**: a counter key that was never written is read
//!    as `0`, and the first CAS creates it.
//!
//! 4. **Fenced reads**: `read` writes a fresh random marker to
//!    `"<node-id>-scratch"` before reading the counter. The store orders a
//!    client's own operations, so the read cannot be served from a view older
//!    than the write.
//!
//! ```text
//!          add {delta}                        read {}
//!              │                                 │
//!              ▼                                 ▼
//!     ┌─────────────────┐              write <id>-scratch
//!     │   DeltaQueue    │──► add_ok             │
//!     └────────┬────────┘                  read counter ──► read_ok {value}
//!              ▼
//!   ┌─────────────────────┐    read / cas   ┌──────────┐
//!   │ IncrementSerializer │ ──────────────► │  seq-kv  │ ◄── other nodes
//!   └─────────────────────┘   retry on fail └──────────┘
//! ```
//!
//! ## Guarantees
//!
//! - `add_ok` means the delta is *accepted*: it will be applied exactly
//!   once as long as the store stays reachable and answers its
//!   compare-and-swaps, but possibly after the acknowledgment, and not
//!   necessarily in arrival order.
//! - `read` reflects every delta committed to the store before the read was
//!   issued, whichever node committed it. An acknowledged delta still
//!   waiting in a serializer, or concurrently being applied, may be missed.
//! - A compare-and-swap is never retried once its outcome is unknown, so no
//!   delta is applied twice.
//! - A `read` that cannot fence or cannot reach the store fails instead of
//!   answering with a guess.
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`message`] | Wire envelope and typed payloads |
//! | [`node`] | Identity, replies and correlated RPCs |
//! | [`kv`] | Store capability, `seq-kv` client, in-memory store |
//! | [`serializer`] | The increment worker and its queue |
//! | [`handlers`] | `add` and `read` |
//! | [`runtime`] | The line loop tying everything together |
//! | [`stats`] | Sharded node-local statistics |
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use seqcounter::kv::{KvStore, MemoryKv};
//! use seqcounter::serializer::{IncrementSerializer, SerializerConfig};
//! use seqcounter::stats::Stats;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let kv = Arc::new(MemoryKv::new());
//! let handle = IncrementSerializer::spawn(kv.clone(), SerializerConfig::default(), Arc::new(Stats::new()));
//!
//! let queue = handle.queue();
//! queue.push(3).await.unwrap();
//! queue.push(4).await.unwrap();
//! drop(queue);
//!
//! assert!(handle.drain().await.is_empty());
//! assert_eq!(kv.read("counter").await, Ok(7));
//! # });
//! ```

pub mod config;
pub mod error;
pub mod handlers;
pub mod kv;
pub mod message;
pub mod node;
pub mod retry;
pub mod runtime;
pub mod serializer;
pub mod stats;

pub use config::{Backpressure, Config};
pub use error::{KvError, NodeError};
