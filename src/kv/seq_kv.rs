//! Client for Maelstrom's `seq-kv` service.
//!
//! Reads and writes give up after the configured timeout. Compare-and-swap
//! never does: a CAS whose reply is lost may or may not have committed, so
//! it waits for the store's answer and only fails once the node shuts down.

use std::time::Duration;

use serde_json::Value;

use crate::error::{KvError, KvResult};
use crate::kv::KvStore;
use crate::message::{Body, KvReply, KvRequest, Message};
use crate::node::Node;

/// Talks to a Maelstrom key-value service through the node's RPC.
#[derive(Debug, Clone)]
pub struct SeqKv {
    node: Node,
    service: String,
    timeout: Duration,
}

impl SeqKv {
    /// Creates a client for `service` (usually `"seq-kv"`) whose reads and
    /// writes give up after `timeout`.
    pub fn new(node: Node, service: impl Into<String>, timeout: Duration) -> Self {
        SeqKv {
            node,
            service: service.into(),
            timeout,
        }
    }

    async fn call(&self, request: KvRequest) -> KvResult<KvReply> {
        let reply = self.node.rpc(&self.service, request, self.timeout).await?;
        decode(reply)
    }

    async fn call_to_completion(&self, request: KvRequest) -> KvResult<KvReply> {
        let reply = self
            .node
            .rpc_to_completion(&self.service, request, self.timeout)
            .await?;
        decode(reply)
    }
}

fn decode(reply: Message) -> KvResult<KvReply> {
    let body: Body<KvReply> = reply
        .decode()
        .map_err(|err| KvError::Decode(err.to_string()))?;
    match body.payload {
        KvReply::Error { code, text } => Err(KvError::from_error_body(code, text)),
        payload => Ok(payload),
    }
}

fn unexpected(reply: KvReply) -> KvError {
    KvError::Decode(format!("unexpected reply {reply:?}"))
}

impl KvStore for SeqKv {
    async fn read(&self, key: &str) -> KvResult<i64> {
        let request = KvRequest::Read {
            key: key.to_string(),
        };
        match self.call(request).await? {
            KvReply::ReadOk { value } => value
                .as_i64()
                .ok_or_else(|| KvError::Decode(format!("non-integer value {value} at {key:?}"))),
            other => Err(unexpected(other)),
        }
    }

    async fn write(&self, key: &str, value: Value) -> KvResult<()> {
        let request = KvRequest::Write {
            key: key.to_string(),
            value,
        };
        match self.call(request).await? {
            KvReply::WriteOk => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        from: i64,
        to: i64,
        create_if_missing: bool,
    ) -> KvResult<()> {
        let request = KvRequest::Cas {
            key: key.to_string(),
            from,
            to,
            create_if_not_exists: create_if_missing,
        };
        match self.call_to_completion(request).await? {
            KvReply::CasOk => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}
