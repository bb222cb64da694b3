//! Error types for the store capability and the request handlers.
//!
//! Two layers, two enums:
//!
//! - [`KvError`] is what the key-value store capability returns. Its variants
//!   are the classification the serializer and the `read` handler branch on,
//!   so nobody has to dig an error code out of a generic error at runtime.
//! - [`NodeError`] is what a request handler (or the runtime) fails with. Each
//!   variant maps to a Maelstrom [`ErrorCode`] so it can be sent back to the
//!   requester as an `error` body.

use std::time::Duration;

use thiserror::Error;

use crate::message::ErrorCode;

/// Failure of a single key-value store operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KvError {
    /// The key has never been written.
    #[error("key does not exist")]
    NotFound,

    /// Compare-and-swap found a value other than the expected one.
    #[error("compare-and-swap precondition failed")]
    CasConflict,

    /// No reply arrived before the RPC deadline.
    #[error("store rpc timed out after {0:?}")]
    Timeout(Duration),

    /// Any other error body returned by the store.
    #[error("store error {code}: {text}")]
    Rpc { code: u32, text: String },

    /// The node's transport is gone; no reply can ever arrive.
    #[error("node transport closed")]
    Closed,

    /// The store replied with something we could not interpret.
    #[error("malformed store reply: {0}")]
    Decode(String),
}

impl KvError {
    /// Classifies an `error` body received from the store.
    pub fn from_error_body(code: u32, text: impl Into<String>) -> Self {
        match ErrorCode::from_u32(code) {
            Some(ErrorCode::KeyDoesNotExist) => KvError::NotFound,
            Some(ErrorCode::PreconditionFailed) => KvError::CasConflict,
            _ => KvError::Rpc {
                code,
                text: text.into(),
            },
        }
    }

    /// Returns the protocol error code that describes this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            KvError::NotFound => ErrorCode::KeyDoesNotExist,
            KvError::CasConflict => ErrorCode::PreconditionFailed,
            KvError::Timeout(_) => ErrorCode::Timeout,
            KvError::Rpc { code, .. } => ErrorCode::from_u32(*code).unwrap_or(ErrorCode::Crash),
            KvError::Closed => ErrorCode::TemporarilyUnavailable,
            KvError::Decode(_) => ErrorCode::Crash,
        }
    }

    /// Whether the operation may have taken effect even though it failed.
    ///
    /// True when the request may have reached the store but its reply was
    /// lost. Only errors the store answered explicitly are definite.
    pub fn outcome_unknown(&self) -> bool {
        matches!(self, KvError::Timeout(_) | KvError::Closed)
    }
}

/// Result type for key-value store operations.
pub type KvResult<T> = std::result::Result<T, KvError>;

/// Failure of a request handler or of the node runtime.
#[derive(Debug, Error)]
pub enum NodeError {
    /// An inbound message body could not be decoded (or an outbound one encoded).
    #[error("malformed message: {0}")]
    Codec(#[from] serde_json::Error),

    /// A store operation failed and the caller cannot recover from it.
    #[error(transparent)]
    Kv(#[from] KvError),

    /// The pending-delta queue is full and the node rejects instead of waiting.
    #[error("pending delta queue is full")]
    QueueFull,

    /// The increment serializer is no longer accepting deltas.
    #[error("increment serializer has stopped")]
    SerializerStopped,

    /// A request arrived before the `init` handshake.
    #[error("node has not been initialized")]
    NotInitialized,

    /// A second `init` arrived.
    #[error("node is already initialized")]
    AlreadyInitialized,

    /// The message type has no handler on this node.
    #[error("unsupported message type {0:?}")]
    UnknownType(String),

    /// The outbound message channel is closed.
    #[error("outbound transport closed")]
    TransportClosed,

    /// Reading the input or writing the output failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl NodeError {
    /// Returns the protocol error code reported to the requester.
    pub fn code(&self) -> ErrorCode {
        match self {
            NodeError::Codec(_) => ErrorCode::MalformedRequest,
            NodeError::Kv(err) => err.code(),
            NodeError::QueueFull | NodeError::NotInitialized => ErrorCode::TemporarilyUnavailable,
            NodeError::AlreadyInitialized | NodeError::UnknownType(_) => ErrorCode::NotSupported,
            NodeError::SerializerStopped
            | NodeError::TransportClosed
            | NodeError::Io(_)
            | NodeError::Config(_) => ErrorCode::Crash,
        }
    }
}

/// Result type for handler and runtime operations.
pub type Result<T> = std::result::Result<T, NodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_error_bodies() {
        assert_eq!(KvError::from_error_body(20, "missing"), KvError::NotFound);
        assert_eq!(KvError::from_error_body(22, "expected 1"), KvError::CasConflict);
        assert_eq!(
            KvError::from_error_body(13, "boom"),
            KvError::Rpc {
                code: 13,
                text: "boom".to_string()
            }
        );
    }

    #[test]
    fn test_outcome_unknown() {
        assert!(KvError::Timeout(Duration::from_secs(1)).outcome_unknown());
        assert!(KvError::Closed.outcome_unknown());
        assert!(!KvError::CasConflict.outcome_unknown());
        assert!(!KvError::NotFound.outcome_unknown());
        assert!(!KvError::from_error_body(13, "crash").outcome_unknown());
    }

    #[test]
    fn test_unknown_store_code_reports_crash() {
        let err = KvError::from_error_body(1000, "custom");
        assert_eq!(err.code(), ErrorCode::Crash);
    }

    #[test]
    fn test_node_error_codes() {
        let decode = serde_json::from_str::<i64>("\"x\"").unwrap_err();
        assert_eq!(NodeError::from(decode).code(), ErrorCode::MalformedRequest);
        assert_eq!(NodeError::QueueFull.code(), ErrorCode::TemporarilyUnavailable);
        assert_eq!(
            NodeError::UnknownType("echo".into()).code(),
            ErrorCode::NotSupported
        );
        assert_eq!(
            NodeError::from(KvError::Timeout(Duration::from_millis(5))).code(),
            ErrorCode::Timeout
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(KvError::NotFound.to_string(), "key does not exist");
        assert_eq!(
            NodeError::UnknownType("echo".into()).to_string(),
            "unsupported message type \"echo\""
        );
    }
}
