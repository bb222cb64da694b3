//! In-process key-value store.
//!
//! Every operation is applied under one lock, so the store is linearizable
//! (and therefore sequentially consistent). Faults can be injected to
//! exercise retry paths: a failed compare-and-swap reports a conflict without
//! touching the value, a failed read reports an unclassified store error.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;

use crate::error::{KvError, KvResult};
use crate::kv::KvStore;

/// A shared in-memory store.
///
/// # Examples
///
/// ```rust
/// use seqcounter::kv::{KvStore, MemoryKv};
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let kv = MemoryKv::new();
/// kv.compare_and_swap("counter", 0, 5, true).await.unwrap();
/// assert_eq!(kv.read("counter").await, Ok(5));
/// # });
/// ```
#[derive(Debug)]
pub struct MemoryKv {
    values: Mutex<HashMap<String, Value>>,
    faults: Mutex<Faults>,
}

#[derive(Debug)]
struct Faults {
    rng: StdRng,
    cas_failure_rate: f64,
    read_failure_rate: f64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryKv {
    /// Creates an empty store without fault injection.
    pub fn new() -> Self {
        MemoryKv {
            values: Mutex::new(HashMap::new()),
            faults: Mutex::new(Faults {
                rng: StdRng::seed_from_u64(0),
                cas_failure_rate: 0.0,
                read_failure_rate: 0.0,
            }),
        }
    }

    /// Seeds the fault injector so runs are reproducible.
    pub fn with_seed(self, seed: u64) -> Self {
        lock(&self.faults).rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Makes each compare-and-swap fail with a conflict with probability `rate`.
    pub fn with_cas_failure_rate(self, rate: f64) -> Self {
        lock(&self.faults).cas_failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Makes each read fail with an unclassified error with probability `rate`.
    pub fn with_read_failure_rate(self, rate: f64) -> Self {
        lock(&self.faults).read_failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Returns the raw value stored under `key`.
    pub fn get(&self, key: &str) -> Option<Value> {
        lock(&self.values).get(key).cloned()
    }

    fn inject(&self, pick: impl FnOnce(&Faults) -> f64) -> bool {
        let mut faults = lock(&self.faults);
        let rate = pick(&faults);
        rate > 0.0 && faults.rng.random_bool(rate)
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemoryKv {
    async fn read(&self, key: &str) -> KvResult<i64> {
        if self.inject(|f| f.read_failure_rate) {
            return Err(KvError::Rpc {
                code: 13,
                text: "injected read failure".to_string(),
            });
        }
        let values = lock(&self.values);
        let value = values.get(key).ok_or(KvError::NotFound)?;
        value
            .as_i64()
            .ok_or_else(|| KvError::Decode(format!("non-integer value {value} at {key:?}")))
    }

    async fn write(&self, key: &str, value: Value) -> KvResult<()> {
        lock(&self.values).insert(key.to_string(), value);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        from: i64,
        to: i64,
        create_if_missing: bool,
    ) -> KvResult<()> {
        if self.inject(|f| f.cas_failure_rate) {
            return Err(KvError::CasConflict);
        }
        let mut values = lock(&self.values);
        match values.get_mut(key) {
            Some(current) if current.as_i64() == Some(from) => {
                *current = Value::from(to);
                Ok(())
            }
            Some(_) => Err(KvError::CasConflict),
            None if create_if_missing => {
                values.insert(key.to_string(), Value::from(to));
                Ok(())
            }
            None => Err(KvError::NotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cas_semantics() {
        let kv = MemoryKv::new();
        assert_eq!(
            kv.compare_and_swap("counter", 0, 1, false).await,
            Err(KvError::NotFound)
        );
        assert_eq!(kv.compare_and_swap("counter", 0, 1, true).await, Ok(()));
        assert_eq!(
            kv.compare_and_swap("counter", 0, 2, true).await,
            Err(KvError::CasConflict)
        );
        assert_eq!(kv.compare_and_swap("counter", 1, 3, false).await, Ok(()));
        assert_eq!(kv.read("counter").await, Ok(3));
    }

    #[tokio::test]
    async fn test_write_overwrites() {
        let kv = MemoryKv::new();
        kv.write("n1-scratch", Value::from("aa")).await.unwrap();
        kv.write("n1-scratch", Value::from("bb")).await.unwrap();
        assert_eq!(kv.get("n1-scratch"), Some(Value::from("bb")));
    }

    #[tokio::test]
    async fn test_injected_cas_failures_leave_value_untouched() {
        let kv = MemoryKv::new().with_seed(7).with_cas_failure_rate(1.0);
        assert_eq!(
            kv.compare_and_swap("counter", 0, 1, true).await,
            Err(KvError::CasConflict)
        );
        assert_eq!(kv.get("counter"), None);
    }

    #[tokio::test]
    async fn test_injected_read_failures() {
        let kv = MemoryKv::new().with_read_failure_rate(1.0);
        assert!(matches!(
            kv.read("counter").await,
            Err(KvError::Rpc { code: 13, .. })
        ));
    }

    #[tokio::test]
    async fn test_failure_rate_is_roughly_honoured() {
        let kv = MemoryKv::new().with_seed(42).with_cas_failure_rate(0.5);
        let mut failures = 0;
        for i in 0..1000 {
            kv.write("k", Value::from(i)).await.unwrap();
            if kv.compare_and_swap("k", i, i + 1, false).await.is_err() {
                failures += 1;
            }
        }
        assert!((350..650).contains(&failures), "failures = {failures}");
    }
}
