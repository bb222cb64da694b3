//! Maelstrom message envelope and typed payloads.
//!
//! Every line on stdin/stdout is one JSON [`Message`]. The body is kept as a
//! raw [`serde_json::Value`] until somebody claims it, then decoded into a
//! [`Body`] over one of the payload families below. Each family is an
//! internally tagged enum keyed on the body's `type` field.
//!
//! ```text
//! {"src":"c1","dest":"n1","body":{"type":"add","msg_id":7,"delta":3}}
//!                                 └────────── Body<Workload> ──────────┘
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One protocol message as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub src: String,
    pub dest: String,
    pub body: Value,
}

impl Message {
    /// Parses a single input line.
    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }

    /// Returns the body's `type` tag, if any.
    pub fn kind(&self) -> Option<&str> {
        self.body.get("type").and_then(Value::as_str)
    }

    pub fn msg_id(&self) -> Option<u64> {
        self.body.get("msg_id").and_then(Value::as_u64)
    }

    pub fn in_reply_to(&self) -> Option<u64> {
        self.body.get("in_reply_to").and_then(Value::as_u64)
    }

    /// Decodes the body into a typed payload family.
    pub fn decode<P: DeserializeOwned>(&self) -> serde_json::Result<Body<P>> {
        Body::<P>::deserialize(&self.body)
    }
}

/// Message body: correlation ids plus a typed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Body<P> {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<u64>,
    #[serde(flatten)]
    pub payload: P,
}

/// The `init` handshake sent by Maelstrom before anything else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Control {
    Init {
        node_id: String,
        #[serde(default)]
        node_ids: Vec<String>,
    },
}

/// Client requests served by the counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Workload {
    Add { delta: i64 },
    Read {},
}

/// Everything this node sends back to a requester.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    InitOk,
    AddOk,
    ReadOk { value: i64 },
    Error { code: u32, text: String },
}

impl Response {
    /// Builds an `error` body from a handler failure.
    pub fn error(err: &crate::error::NodeError) -> Self {
        Response::Error {
            code: err.code().as_u32(),
            text: err.to_string(),
        }
    }
}

/// Requests understood by the `seq-kv` service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KvRequest {
    Read {
        key: String,
    },
    Write {
        key: String,
        value: Value,
    },
    Cas {
        key: String,
        from: i64,
        to: i64,
        #[serde(default)]
        create_if_not_exists: bool,
    },
}

/// Replies from the `seq-kv` service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KvReply {
    ReadOk {
        value: Value,
    },
    WriteOk,
    CasOk,
    Error {
        code: u32,
        #[serde(default)]
        text: String,
    },
}

/// Maelstrom's standard error codes, the subset this node produces or interprets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Timeout,
    NotSupported,
    TemporarilyUnavailable,
    MalformedRequest,
    Crash,
    KeyDoesNotExist,
    PreconditionFailed,
}

impl ErrorCode {
    pub const fn as_u32(self) -> u32 {
        match self {
            ErrorCode::Timeout => 0,
            ErrorCode::NotSupported => 10,
            ErrorCode::TemporarilyUnavailable => 11,
            ErrorCode::MalformedRequest => 12,
            ErrorCode::Crash => 13,
            ErrorCode::KeyDoesNotExist => 20,
            ErrorCode::PreconditionFailed => 22,
        }
    }

    pub const fn from_u32(code: u32) -> Option<Self> {
        match code {
            0 => Some(ErrorCode::Timeout),
            10 => Some(ErrorCode::NotSupported),
            11 => Some(ErrorCode::TemporarilyUnavailable),
            12 => Some(ErrorCode::MalformedRequest),
            13 => Some(ErrorCode::Crash),
            20 => Some(ErrorCode::KeyDoesNotExist),
            22 => Some(ErrorCode::PreconditionFailed),
            _ => None,
        }
    }
}
