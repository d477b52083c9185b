//! TCP responder answering node operations the way a field gateway does.
//!
//! The server opens one connection per request, writes a single
//! `NFL`/`NER`/`NRS` frame and waits for the matching `GNF`/`GNE`/`GNR`
//! frame on the same connection.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use wsn_common::{
    Action, Frame, FrameBuffer, GatewayNodeRequest, GatewayNodeResult, NodeReport, NodeStatus,
};

use crate::error::{Error, Result};

/// A node operation received from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedRequest {
    pub action: Action,
    pub request: GatewayNodeRequest,
}

/// Status a healthy node reports for `action`, if the action is a node operation.
pub fn success_status(action: Action) -> Option<NodeStatus> {
    match action {
        Action::NodesFlash => Some(NodeStatus::Flashed),
        Action::NodesErase => Some(NodeStatus::Erased),
        Action::NodesReset => Some(NodeStatus::Reset),
        _ => None,
    }
}

/// Build the reply frame for a node operation.
pub fn outcome(
    action: Action,
    request: &GatewayNodeRequest,
    fail_nodes: &HashSet<String>,
) -> Result<Frame> {
    let (Some(status), Some(reply)) = (success_status(action), action.gateway_result()) else {
        return Err(Error::UnexpectedRequest(action.to_string()));
    };
    let nodes = request
        .node_ids
        .iter()
        .map(|id| NodeReport {
            node_id: id.clone(),
            status: if fail_nodes.contains(id) {
                NodeStatus::Error
            } else {
                status.clone()
            },
        })
        .collect();
    Ok(Frame::json(reply, &GatewayNodeResult { nodes })?)
}

pub struct CommandResponder {
    listener: TcpListener,
    fail_nodes: Arc<HashSet<String>>,
    reply_delay: Duration,
    received: Arc<Mutex<Vec<ReceivedRequest>>>,
}

impl CommandResponder {
    pub async fn bind(
        addr: &str,
        fail_nodes: impl IntoIterator<Item = String>,
        reply_delay: Duration,
    ) -> Result<Self> {
        Ok(Self {
            listener: TcpListener::bind(addr).await?,
            fail_nodes: Arc::new(fail_nodes.into_iter().collect()),
            reply_delay,
            received: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared log of every request answered so far.
    pub fn received(&self) -> Arc<Mutex<Vec<ReceivedRequest>>> {
        self.received.clone()
    }

    pub async fn run(self, cancel: CancellationToken) {
        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!("Accept failed: {}", e);
                        continue;
                    }
                },
            };
            let fail_nodes = self.fail_nodes.clone();
            let received = self.received.clone();
            let delay = self.reply_delay;
            tokio::spawn(async move {
                if let Err(e) = serve(stream, &fail_nodes, delay, &received).await {
                    tracing::warn!(%peer, "Request failed: {}", e);
                }
            });
        }
    }
}

async fn serve(
    mut stream: TcpStream,
    fail_nodes: &HashSet<String>,
    delay: Duration,
    received: &Mutex<Vec<ReceivedRequest>>,
) -> Result<()> {
    let mut frames = FrameBuffer::new();
    let frame = loop {
        if let Some(frame) = frames.next_frame() {
            break frame;
        }
        if stream.read_buf(frames.buffer_mut()).await? == 0 {
            return Ok(());
        }
    };

    let action = frame
        .action()
        .ok_or_else(|| Error::UnexpectedRequest(frame.code_str()))?;
    let request: GatewayNodeRequest = frame.parse()?;
    tracing::info!(action = %action, nodes = ?request.node_ids, "Node operation");

    let reply = outcome(action, &request, fail_nodes)?;
    if let Ok(mut log) = received.lock() {
        log.push(ReceivedRequest { action, request });
    }
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    stream.write_all(&reply.encode()?).await?;
    stream.flush().await?;
    Ok(())
}
