//! Node configuration from command-line flags and environment variables.

use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::error::{NodeError, Result};
use crate::retry::RetryPolicy;

/// What an `add` does when the pending-delta queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum Backpressure {
    /// Wait for room; the acknowledgment is delayed, nothing is dropped.
    #[default]
    Block,
    /// Fail the request with `temporarily-unavailable`; nothing is enqueued.
    Reject,
}

/// Grow-only counter node for Maelstrom, backed by `seq-kv`.
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Capacity of the pending-delta queue
    #[arg(long, env = "SEQCOUNTER_QUEUE_CAPACITY", default_value_t = 100)]
    pub queue_capacity: usize,

    /// Behavior of `add` when the queue is full
    #[arg(long, env = "SEQCOUNTER_BACKPRESSURE", value_enum, default_value = "block")]
    pub backpressure: Backpressure,

    /// First retry delay after a failed compare-and-swap, 0 retries immediately
    #[arg(long, env = "SEQCOUNTER_RETRY_INITIAL_MS", default_value_t = 1)]
    pub retry_initial_ms: u64,

    /// Upper bound of the retry delay
    #[arg(long, env = "SEQCOUNTER_RETRY_MAX_MS", default_value_t = 100)]
    pub retry_max_ms: u64,

    /// Deadline of store reads and writes; compare-and-swap waits past it, warning each time it elapses
    #[arg(long, env = "SEQCOUNTER_RPC_TIMEOUT_MS", default_value_t = 1000)]
    pub rpc_timeout_ms: u64,

    /// Name of the key-value service
    #[arg(long, env = "SEQCOUNTER_KV_SERVICE", default_value = "seq-kv")]
    pub kv_service: String,

    /// Key holding the shared counter
    #[arg(long, env = "SEQCOUNTER_COUNTER_KEY", default_value = "counter")]
    pub counter_key: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            queue_capacity: 100,
            backpressure: Backpressure::Block,
            retry_initial_ms: 1,
            retry_max_ms: 100,
            rpc_timeout_ms: 1000,
            kv_service: "seq-kv".to_string(),
            counter_key: "counter".to_string(),
        }
    }
}

impl Config {
    /// Rejects settings the node cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(NodeError::Config("queue capacity must be at least 1".into()));
        }
        if self.retry_max_ms < self.retry_initial_ms {
            return Err(NodeError::Config(format!(
                "retry max ({} ms) is below retry initial ({} ms)",
                self.retry_max_ms, self.retry_initial_ms
            )));
        }
        if self.rpc_timeout_ms == 0 {
            return Err(NodeError::Config("rpc timeout must be positive".into()));
        }
        if self.counter_key.is_empty() || self.kv_service.is_empty() {
            return Err(NodeError::Config(
                "counter key and kv service must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry_initial_ms),
            Duration::from_millis(self.retry_max_ms),
        )
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_cli_defaults() {
        let parsed = Config::try_parse_from(["seqcounter"]).unwrap();
        // Environment variables may override the CLI defaults on a dev machine.
        if std::env::vars().all(|(k, _)| !k.starts_with("SEQCOUNTER_")) {
            assert_eq!(parsed, Config::default());
        }
    }

    #[test]
    fn test_parse_flags() {
        let config = Config::try_parse_from([
            "seqcounter",
            "--queue-capacity",
            "8",
            "--backpressure",
            "reject",
            "--retry-initial-ms",
            "0",
            "--counter-key",
            "total",
        ])
        .unwrap();
        assert_eq!(config.queue_capacity, 8);
        assert_eq!(config.backpressure, Backpressure::Reject);
        assert_eq!(config.retry_policy(), RetryPolicy::IMMEDIATE.with_max(Duration::from_millis(100)));
        assert_eq!(config.counter_key, "total");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate() {
        assert!(Config::default().validate().is_ok());

        let config = Config {
            queue_capacity: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(NodeError::Config(_))));

        let config = Config {
            retry_initial_ms: 50,
            retry_max_ms: 10,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(NodeError::Config(_))));

        let config = Config {
            rpc_timeout_ms: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(NodeError::Config(_))));
    }
}
