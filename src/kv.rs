//! The key-value store capability the counter is built on.
//!
//! The store is external: the node only needs single-key `read`, `write` and
//! `compare_and_swap`, and relies on the store being sequentially consistent
//! (each client's operations are observed by everyone in issue order).
//!
//! | Implementation | Description |
//! |----------------|-------------|
//! | [`SeqKv`] | Client for Maelstrom's `seq-kv` service over the node's RPC |
//! | [`MemoryKv`] | In-process store with optional fault injection, for tests and benches |

mod memory;
mod seq_kv;

use std::future::Future;

use serde_json::Value;

use crate::error::{KvError, KvResult};

pub use memory::MemoryKv;
pub use seq_kv::SeqKv;

/// Single-key operations of a shared, sequentially consistent store.
///
/// Futures are `Send` so the increment serializer and the request handlers
/// can run on any runtime worker.
pub trait KvStore: Send + Sync + 'static {
    /// Reads an integer value.
    fn read(&self, key: &str) -> impl Future<Output = KvResult<i64>> + Send;

    /// Overwrites `key` with an arbitrary value.
    fn write(&self, key: &str, value: Value) -> impl Future<Output = KvResult<()>> + Send;

    /// Replaces `from` with `to` atomically.
    ///
    /// With `create_if_missing`, an absent key is created holding `to`.
    /// Fails with [`KvError::CasConflict`] when the current value is not
    /// `from`, and with [`KvError::NotFound`] when the key is absent and
    /// creation was not requested.
    fn compare_and_swap(
        &self,
        key: &str,
        from: i64,
        to: i64,
        create_if_missing: bool,
    ) -> impl Future<Output = KvResult<()>> + Send;
}

/// Reads the counter, treating a key that was never written as zero.
pub async fn read_counter<K: KvStore>(kv: &K, key: &str) -> KvResult<i64> {
    match kv.read(key).await {
        Err(KvError::NotFound) => Ok(0),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_counter_missing_is_zero() {
        let kv = MemoryKv::new();
        assert_eq!(kv.read("counter").await, Err(KvError::NotFound));
        assert_eq!(read_counter(&kv, "counter").await, Ok(0));
    }

    #[tokio::test]
    async fn test_read_counter_passes_other_errors() {
        let kv = MemoryKv::new();
        kv.write("counter", Value::String("abc".into())).await.unwrap();
        assert!(matches!(
            read_counter(&kv, "counter").await,
            Err(KvError::Decode(_))
        ));
    }
}
