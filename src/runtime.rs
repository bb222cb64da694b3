//! Wires the counter to a Maelstrom line stream.
//!
//! [`serve`] owns the whole life of a node:
//!
//! 1. wait for `init`, answer `init_ok`;
//! 2. start the increment serializer and the handlers over a [`SeqKv`] client;
//! 3. route every inbound line: replies wake the RPC waiting for them,
//!    requests run on their own task;
//! 4. on end of input, fail outstanding RPCs, stop the serializer and report
//!    what was left unapplied.

use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, Lines};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{NodeError, Result};
use crate::handlers::CounterHandlers;
use crate::kv::{KvStore, SeqKv};
use crate::message::{Body, Control, Message, Response};
use crate::node::Node;
use crate::serializer::{IncrementSerializer, SerializerConfig};
use crate::stats::{Stats, StatsSnapshot};

/// What a node leaves behind when its input ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServeReport {
    /// Id assigned by `init`, if the handshake happened.
    pub node_id: Option<String>,
    /// Deltas acknowledged with `add_ok` that never reached the store.
    pub unapplied: Vec<i64>,
    pub stats: StatsSnapshot,
}

/// Runs a node until `input` is exhausted.
pub async fn serve<R, W>(config: &Config, input: R, output: W) -> Result<ServeReport>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    config.validate()?;

    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_lines(outbound_rx, output));
    let mut lines = input.lines();

    let Some(node) = handshake(&mut lines, &outbound).await? else {
        info!("input closed before init");
        drop(outbound);
        finish_writer(writer).await?;
        return Ok(ServeReport {
            node_id: None,
            unapplied: Vec::new(),
            stats: StatsSnapshot::default(),
        });
    };
    drop(outbound);

    let stats = Arc::new(Stats::new());
    let kv = Arc::new(SeqKv::new(
        node.clone(),
        config.kv_service.clone(),
        config.rpc_timeout(),
    ));
    let serializer =
        IncrementSerializer::spawn(kv.clone(), SerializerConfig::from(config), stats.clone());
    let handlers = Arc::new(CounterHandlers::new(
        node.id(),
        config.counter_key.clone(),
        kv,
        serializer.queue(),
        stats.clone(),
    ));

    let mut requests = JoinSet::new();
    let result = route(&mut lines, &node, &handlers, &mut requests).await;

    info!(in_flight = requests.len(), "input closed, shutting down");
    requests.shutdown().await;
    node.close();
    let unapplied = serializer.shutdown().await;
    if !unapplied.is_empty() {
        warn!(
            count = unapplied.len(),
            total = unapplied.iter().sum::<i64>(),
            "acknowledged deltas were never applied"
        );
    }

    let node_id = node.id().to_string();
    drop(handlers);
    drop(node);
    finish_writer(writer).await?;
    result?;

    let report = ServeReport {
        node_id: Some(node_id),
        unapplied,
        stats: stats.snapshot(),
    };
    info!(
        outstanding = report.stats.outstanding(),
        stats = %serde_json::to_string(&report.stats)?,
        "node stopped"
    );
    Ok(report)
}

/// Consumes lines until `init`, answering anything else with an error.
async fn handshake<R: AsyncBufRead + Unpin>(
    lines: &mut Lines<R>,
    outbound: &mpsc::UnboundedSender<Message>,
) -> Result<Option<Node>> {
    while let Some(line) = lines.next_line().await? {
        let Some(request) = parse(&line) else {
            continue;
        };
        // Until init we have no identity of our own; answer as whoever was addressed.
        let unassigned = Node::new(request.dest.clone(), Vec::new(), outbound.clone());
        if request.kind() != Some("init") {
            warn!(kind = ?request.kind(), src = %request.src, "request before init");
            if request.in_reply_to().is_none() {
                unassigned.reply(&request, Response::error(&NodeError::NotInitialized))?;
            }
            continue;
        }
        let body: Body<Control> = match request.decode() {
            Ok(body) => body,
            Err(err) => {
                let err = NodeError::from(err);
                warn!(error = %err, "malformed init");
                unassigned.reply(&request, Response::error(&err))?;
                continue;
            }
        };
        let Control::Init { node_id, node_ids } = body.payload;
        info!(node_id = %node_id, peers = node_ids.len(), "node initialized");
        let node = Node::new(node_id, node_ids, outbound.clone());
        node.reply(&request, Response::InitOk)?;
        return Ok(Some(node));
    }
    Ok(None)
}

async fn route<R, K>(
    lines: &mut Lines<R>,
    node: &Node,
    handlers: &Arc<CounterHandlers<K>>,
    requests: &mut JoinSet<()>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    K: KvStore,
{
    while let Some(line) = lines.next_line().await? {
        while requests.try_join_next().is_some() {}

        let Some(message) = parse(&line) else {
            continue;
        };
        if message.in_reply_to().is_some() {
            if !node.complete(message) {
                debug!("dropped reply nobody was waiting for");
            }
            continue;
        }
        if message.kind() == Some("init") {
            node.reply(&message, Response::error(&NodeError::AlreadyInitialized))?;
            continue;
        }
        requests.spawn(dispatch(node.clone(), Arc::clone(handlers), message));
    }
    Ok(())
}

async fn dispatch<K: KvStore>(node: Node, handlers: Arc<CounterHandlers<K>>, request: Message) {
    let response = match handlers.handle(&request).await {
        Ok(response) => response,
        Err(err) => {
            warn!(
                kind = ?request.kind(),
                src = %request.src,
                error = %err,
                "request failed"
            );
            Response::error(&err)
        }
    };
    if let Err(err) = node.reply(&request, response) {
        warn!(error = %err, "could not send reply");
    }
}

fn parse(line: &str) -> Option<Message> {
    if line.trim().is_empty() {
        return None;
    }
    match Message::from_line(line) {
        Ok(message) => Some(message),
        Err(err) => {
            warn!(error = %err, line, "ignoring unparseable line");
            None
        }
    }
}

/// Writes each outbound message as one JSON line, flushing after each.
async fn write_lines<W: AsyncWrite + Unpin>(
    mut outbound: mpsc::UnboundedReceiver<Message>,
    mut output: W,
) -> std::io::Result<()> {
    while let Some(message) = outbound.recv().await {
        let mut line = serde_json::to_vec(&message)?;
        line.push(b'\n');
        output.write_all(&line).await?;
        output.flush().await?;
    }
    output.shutdown().await
}

async fn finish_writer(writer: tokio::task::JoinHandle<std::io::Result<()>>) -> Result<()> {
    match writer.await {
        Ok(result) => Ok(result?),
        Err(err) => Err(NodeError::Io(std::io::Error::other(err))),
    }
}
