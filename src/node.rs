//! Node identity, outbound messages and correlated RPCs.
//!
//! A [`Node`] is a cheap cloneable handle. Outbound messages are pushed onto
//! an unbounded channel drained by the runtime's writer task, so sending never
//! blocks a handler. RPCs register a oneshot waiter under a fresh `msg_id`;
//! the runtime hands every inbound message carrying `in_reply_to` to
//! [`Node::complete`], which wakes the matching waiter.
//!
//! ```text
//!   handler ──rpc()──► pending[msg_id] = tx ──► outbound ──► stdout
//!                                                             │
//!   handler ◄──rx──── complete(reply) ◄── stdin ◄─────────────┘
//! ```

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{trace, warn};

use crate::error::{KvError, KvResult, NodeError, Result};
use crate::message::{Body, Message};

type Pending = HashMap<u64, oneshot::Sender<Message>>;

/// Handle to this node's identity and transport.
#[derive(Clone)]
pub struct Node {
    inner: Arc<Inner>,
}

struct Inner {
    id: String,
    peers: Vec<String>,
    next_msg_id: AtomicU64,
    outbound: mpsc::UnboundedSender<Message>,
    pending: Mutex<Pending>,
    closed: AtomicBool,
}

impl Node {
    /// Creates a node that emits messages on `outbound`.
    pub fn new(
        id: impl Into<String>,
        peers: Vec<String>,
        outbound: mpsc::UnboundedSender<Message>,
    ) -> Self {
        Node {
            inner: Arc::new(Inner {
                id: id.into(),
                peers,
                next_msg_id: AtomicU64::new(0),
                outbound,
                pending: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Returns the id assigned by `init`.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    fn next_msg_id(&self) -> u64 {
        self.inner.next_msg_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Sends a body to `dest`.
    pub fn send<P: Serialize>(&self, dest: &str, body: Body<P>) -> Result<()> {
        let message = Message {
            src: self.inner.id.clone(),
            dest: dest.to_string(),
            body: serde_json::to_value(body)?,
        };
        self.inner
            .outbound
            .send(message)
            .map_err(|_| NodeError::TransportClosed)
    }

    /// Replies to `request` with `payload`.
    pub fn reply<P: Serialize>(&self, request: &Message, payload: P) -> Result<()> {
        let body = Body {
            msg_id: Some(self.next_msg_id()),
            in_reply_to: request.msg_id(),
            payload,
        };
        self.send(&request.src, body)
    }

    /// Sends `payload` to `dest` and waits for the correlated reply.
    ///
    /// A reply arriving after `timeout` is dropped by [`Node::complete`].
    pub async fn rpc<P: Serialize>(
        &self,
        dest: &str,
        payload: P,
        timeout: Duration,
    ) -> KvResult<Message> {
        let (msg_id, rx) = self.dispatch(dest, payload)?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(KvError::Closed),
            Err(_) => {
                self.forget(msg_id);
                Err(KvError::Timeout(timeout))
            }
        }
    }

    /// Sends `payload` to `dest` and waits for the correlated reply, however
    /// long it takes.
    ///
    /// Meant for requests whose effect must be known before moving on. A
    /// `warn` is logged every `patience` without a reply; the only failure
    /// after sending is [`KvError::Closed`], once [`Node::close`] runs.
    pub async fn rpc_to_completion<P: Serialize>(
        &self,
        dest: &str,
        payload: P,
        patience: Duration,
    ) -> KvResult<Message> {
        let (msg_id, mut rx) = self.dispatch(dest, payload)?;
        let mut waited = Duration::ZERO;
        loop {
            match tokio::time::timeout(patience, &mut rx).await {
                Ok(Ok(reply)) => return Ok(reply),
                Ok(Err(_)) => return Err(KvError::Closed),
                Err(_) => {
                    waited += patience;
                    warn!(msg_id, dest, ?waited, "still waiting for rpc reply");
                }
            }
        }
    }

    fn dispatch<P: Serialize>(
        &self,
        dest: &str,
        payload: P,
    ) -> KvResult<(u64, oneshot::Receiver<Message>)> {
        let msg_id = self.next_msg_id();
        let rx = self.register(msg_id)?;

        let body = Body {
            msg_id: Some(msg_id),
            in_reply_to: None,
            payload,
        };
        if let Err(err) = self.send(dest, body) {
            self.forget(msg_id);
            return Err(match err {
                NodeError::Codec(err) => KvError::Decode(err.to_string()),
                _ => KvError::Closed,
            });
        }
        Ok((msg_id, rx))
    }

    fn register(&self, msg_id: u64) -> KvResult<oneshot::Receiver<Message>> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(KvError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        self.pending().insert(msg_id, tx);
        Ok(rx)
    }

    fn forget(&self, msg_id: u64) {
        self.pending().remove(&msg_id);
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Routes a reply to the RPC waiting for it.
    ///
    /// Returns `false` when nobody is waiting (late reply after a timeout, or
    /// a reply to a message we never sent).
    pub fn complete(&self, reply: Message) -> bool {
        let Some(id) = reply.in_reply_to() else {
            return false;
        };
        let waiter = self.pending().remove(&id);
        match waiter {
            Some(tx) => tx.send(reply).is_ok(),
            None => {
                trace!(in_reply_to = id, "no rpc waiting for reply");
                false
            }
        }
    }

    /// Fails every outstanding RPC and refuses new ones.
    ///
    /// Called once the input is exhausted, since no reply can arrive anymore.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.pending().clear();
    }

    /// Number of RPCs still waiting for a reply.
    pub fn in_flight(&self) -> usize {
        self.pending().len()
    }
}

impl Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.inner.id)
            .field("peers", &self.inner.peers)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
