//! Request handlers for the counter workload.
//!
//! - `add` hands its delta to the [`IncrementSerializer`](crate::serializer::IncrementSerializer)
//!   and acknowledges right away. `add_ok` means *accepted*, not *applied*.
//! - `read` first writes a fresh random marker to this node's scratch key,
//!   then reads the counter. On a sequentially consistent store a client's
//!   own operations are observed in issue order, but a bare read may be
//!   served from an arbitrarily old view; the preceding write forces the
//!   read to land after it, which bounds how stale the answer can be.
//!
//! Store failures escape `read` (answering with a default value would be a
//! lie) but never `add`, whose delta stays with the serializer.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::error::{NodeError, Result};
use crate::kv::{self, KvStore};
use crate::message::{Body, Message, Response, Workload};
use crate::serializer::DeltaQueue;
use crate::stats::Stats;

/// Size of the random marker written before every read.
pub const SCRATCH_MARKER_BYTES: usize = 32;

/// Serves `add` and `read` for one node.
#[derive(Debug)]
pub struct CounterHandlers<K> {
    kv: Arc<K>,
    queue: DeltaQueue,
    counter_key: String,
    scratch_key: String,
    stats: Arc<Stats>,
}

impl<K: KvStore> CounterHandlers<K> {
    pub fn new(
        node_id: &str,
        counter_key: impl Into<String>,
        kv: Arc<K>,
        queue: DeltaQueue,
        stats: Arc<Stats>,
    ) -> Self {
        CounterHandlers {
            kv,
            queue,
            counter_key: counter_key.into(),
            scratch_key: scratch_key(node_id),
            stats,
        }
    }

    /// Decodes and serves one workload request.
    pub async fn handle(&self, request: &Message) -> Result<Response> {
        match request.kind() {
            Some("add") | Some("read") => {}
            other => return Err(NodeError::UnknownType(other.unwrap_or_default().to_string())),
        }
        let body: Body<Workload> = request.decode()?;
        match body.payload {
            Workload::Add { delta } => {
                self.add(delta).await?;
                Ok(Response::AddOk)
            }
            Workload::Read {} => {
                let value = self.read().await?;
                Ok(Response::ReadOk { value })
            }
        }
    }

    /// Accepts `delta` for eventual application.
    pub async fn add(&self, delta: i64) -> Result<()> {
        match self.queue.push(delta).await {
            Ok(()) => {
                self.stats.adds_accepted.incr();
                debug!(delta, "delta accepted");
                Ok(())
            }
            Err(err) => {
                self.stats.adds_rejected.incr();
                Err(err)
            }
        }
    }

    /// Returns a counter value reflecting every delta committed before this
    /// call started.
    pub async fn read(&self) -> Result<i64> {
        let result = self.fenced_read().await;
        match &result {
            Ok(value) => {
                self.stats.reads_served.incr();
                debug!(value, "read served");
            }
            Err(_) => self.stats.reads_failed.incr(),
        }
        result
    }

    async fn fenced_read(&self) -> Result<i64> {
        self.kv
            .write(&self.scratch_key, Value::String(scratch_marker()))
            .await?;
        Ok(kv::read_counter(&*self.kv, &self.counter_key).await?)
    }
}

/// Per-node key overwritten before every read.
pub fn scratch_key(node_id: &str) -> String {
    format!("{node_id}-scratch")
}

/// Fresh random marker, hex encoded.
pub fn scratch_marker() -> String {
    let bytes: [u8; SCRATCH_MARKER_BYTES] = rand::random();
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}
