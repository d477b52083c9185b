//! TCP side: client commands, gateway fan-out/fan-in and the debug relay.
//!
//! One task owns every piece of mutable state (open connections, pending
//! gateway groups, the debug observer, the slot timers). Per-connection reader
//! tasks only decode frames and forward them over a channel, so all state
//! changes happen in the order the server task observes them.

mod aggregator;
mod connection;
mod debug;
mod fanout;
pub mod handlers;

pub use aggregator::{Completed, GroupId, MemberInfo, RequestAggregator};
pub use connection::{ConnId, Connection, Inbound};
pub use debug::{DebugRelay, END_BANNER, START_BANNER};
pub use fanout::GatewayTarget;

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wsn_common::{
    encode_response, Action, FlashState, Frame, GatewayNodeResult, NodeOperationRequest,
    NodeOutcome, NodeStatus, SlotRequest, Telemetry,
};

use crate::error::CommandError;
use crate::experiment::ExperimentInfo;
use crate::timer::TimerScheduler;
use crate::AppState;

const INBOUND_CAPACITY: usize = 256;
const IDLE_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandTask {
    SlotsStart,
    SlotsEnd,
    LogSweep,
    GroupExpiry,
}

enum Event {
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    Inbound(Inbound),
    Tick,
}

/// How a command is answered.
enum Reply {
    Json(Value),
    /// Pre-chunked size-prefixed writes.
    Stream(Vec<Vec<u8>>),
    /// Answered later by the fan-in side.
    Deferred,
}

/// Image resolved for a flash request.
struct FlashImage {
    name: String,
    nodetype_id: String,
    path: PathBuf,
}

pub struct CommandServer {
    listener: TcpListener,
    state: Arc<AppState>,
    connections: HashMap<ConnId, Connection>,
    next_conn: ConnId,
    inbound_tx: mpsc::Sender<Inbound>,
    inbound_rx: mpsc::Receiver<Inbound>,
    aggregator: RequestAggregator,
    debug: DebugRelay,
    timers: TimerScheduler<CommandTask>,
    reply_timeout: Option<Duration>,
}

impl CommandServer {
    pub async fn bind(addr: &str, state: Arc<AppState>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let timers_config = &state.config.timers;
        let reply_timeout = timers_config.gateway_reply_timeout();

        let now = Instant::now();
        let mut timers = TimerScheduler::new();
        timers.add(CommandTask::SlotsStart, timers_config.slots_start_poll(), now);
        timers.add(CommandTask::SlotsEnd, timers_config.slots_end_poll(), now);
        timers.add(CommandTask::LogSweep, timers_config.log_sweep(), now);
        if let Some(timeout) = reply_timeout {
            timers.add(CommandTask::GroupExpiry, timeout, now);
        }

        Ok(Self {
            listener,
            state,
            connections: HashMap::new(),
            next_conn: 0,
            inbound_tx,
            inbound_rx,
            aggregator: RequestAggregator::new(),
            debug: DebugRelay::new(),
            timers,
            reply_timeout,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!(addr = ?self.listener.local_addr().ok(), "Command server started");

        loop {
            for task in self.timers.due(Instant::now()) {
                self.run_task(task).await;
            }
            let wait = self.timers.next_wait(Instant::now()).unwrap_or(IDLE_WAIT);

            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => Event::Accepted(accepted),
                Some(inbound) = self.inbound_rx.recv() => Event::Inbound(inbound),
                _ = tokio::time::sleep(wait) => Event::Tick,
            };

            match event {
                Event::Accepted(Ok((stream, peer))) => {
                    let conn = self.register(stream, peer);
                    tracing::debug!(conn, peer = %peer, "Accepted connection");
                }
                Event::Accepted(Err(e)) => tracing::warn!("Accept failed: {}", e),
                Event::Inbound(Inbound::Frame(conn, frame)) => self.handle_frame(conn, frame).await,
                Event::Inbound(Inbound::Closed(conn)) => self.handle_closed(conn).await,
                Event::Tick => {}
            }
        }

        for (_, connection) in self.connections.drain() {
            connection.close().await;
        }
        tracing::info!("Command server stopped");
    }

    fn register(&mut self, stream: TcpStream, peer: SocketAddr) -> ConnId {
        self.next_conn += 1;
        let id = self.next_conn;
        let connection = Connection::spawn(id, stream, peer, self.inbound_tx.clone());
        self.connections.insert(id, connection);
        id
    }

    async fn close(&mut self, conn: ConnId) {
        if let Some(connection) = self.connections.remove(&conn) {
            connection.close().await;
        }
    }

    async fn send_bytes(&mut self, conn: ConnId, bytes: &[u8]) {
        let Some(connection) = self.connections.get_mut(&conn) else {
            return;
        };
        if let Err(e) = connection.send(bytes).await {
            tracing::warn!(conn, peer = %connection.peer(), "Write failed: {}", e);
        }
    }

    async fn send_json(&mut self, conn: ConnId, body: &Value) {
        match encode_response(body) {
            Ok(bytes) => self.send_bytes(conn, &bytes).await,
            Err(e) => tracing::error!(conn, "Reply could not be encoded: {}", e),
        }
    }

    async fn handle_closed(&mut self, conn: ConnId) {
        let Some(connection) = self.connections.remove(&conn) else {
            return;
        };
        tracing::debug!(conn, peer = %connection.peer(), "Connection closed");
        self.debug.forget(conn);

        if self.aggregator.is_member(conn) {
            tracing::warn!(conn, "Gateway closed before sending a result");
            if let Some(done) = self.aggregator.abandon(conn) {
                self.flush(done).await;
            }
        }
    }

    async fn handle_frame(&mut self, conn: ConnId, frame: Frame) {
        let started = Instant::now();
        let peer = match self.connections.get(&conn) {
            Some(connection) => connection.peer(),
            None => return,
        };
        let Some(action) = frame.action() else {
            tracing::warn!(peer = %peer, code = %frame.code_str(), "Discarding frame with unknown action");
            return;
        };

        let status = match self.dispatch(conn, action, &frame).await {
            Ok(Reply::Json(body)) => {
                self.send_json(conn, &body).await;
                body.get("status").and_then(Value::as_u64)
            }
            Ok(Reply::Stream(chunks)) => {
                for chunk in &chunks {
                    self.send_bytes(conn, chunk).await;
                }
                Some(200)
            }
            Ok(Reply::Deferred) => None,
            Err(e) => {
                let status = e.status();
                if let CommandError::Decode(_) = e {
                    tracing::warn!(peer = %peer, action = %action, "Discarding malformed payload: {}", e);
                } else if status >= 500 {
                    tracing::error!(peer = %peer, action = %action, "Command failed: {}", e);
                }
                match e.into_reply() {
                    Some(body) => {
                        self.send_json(conn, &body).await;
                        Some(u64::from(status))
                    }
                    None => None,
                }
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        if is_gateway_traffic(action) {
            tracing::debug!(action = %action, peer = %peer, elapsed_ms, "Handled gateway frame");
        } else {
            tracing::info!(
                action = %action,
                peer = %peer,
                status = ?status,
                elapsed_ms,
                "Handled command"
            );
        }
    }

    async fn dispatch(
        &mut self,
        conn: ConnId,
        action: Action,
        frame: &Frame,
    ) -> Result<Reply, CommandError> {
        let state = self.state.clone();
        let reply = match action {
            Action::UserSignup => Reply::Json(handlers::signup(&state, frame.parse()?)?),
            Action::UserLogin => Reply::Json(handlers::login(&state, frame.parse()?)?),
            Action::NodesGet => Reply::Json(handlers::nodes(&state, frame.parse()?)?),
            Action::NodeTypesGet => Reply::Json(handlers::node_types(&state, frame.parse()?)?),
            Action::ImagesGet => Reply::Json(handlers::images(&state, frame.parse()?)?),
            Action::ImageSave => Reply::Json(handlers::image_save(&state, frame.parse()?)?),
            Action::ImageDelete => Reply::Json(handlers::image_delete(&state, frame.parse()?)?),
            Action::SlotsSave => Reply::Json(handlers::slots_save(&state, frame.parse()?)?),
            Action::SlotsGetDay => Reply::Json(handlers::slots_day(&state, frame.parse()?)?),
            Action::SlotsGetUser => Reply::Json(handlers::slots_user(&state, frame.parse()?)?),
            Action::DebugClearLog => Reply::Json(handlers::clear_log(&state, frame.parse()?)?),
            Action::DebugGetLog => Reply::Stream(handlers::read_log(&state, frame.parse()?)?),
            Action::NodesFlash | Action::NodesErase | Action::NodesReset => {
                self.node_operation(conn, action, frame.parse()?).await?
            }
            Action::DebugStart => self.debug_start(conn, frame.parse()?).await?,
            Action::DebugEnd => self.debug_end(frame.parse()?).await?,
            Action::GatewayNodesFlash | Action::GatewayNodesErase | Action::GatewayNodesReset => {
                self.gateway_result(conn, action, frame.parse()?).await;
                Reply::Deferred
            }
            Action::DebugGateway => {
                self.telemetry(frame.parse()?).await;
                Reply::Deferred
            }
        };
        Ok(reply)
    }

    // --- fan-out / fan-in -------------------------------------------------

    async fn node_operation(
        &mut self,
        conn: ConnId,
        action: Action,
        req: NodeOperationRequest,
    ) -> Result<Reply, CommandError> {
        let user = handlers::authorize(&self.state, &req.token)?;
        handlers::require_slot(&self.state, &req.slot_id)?;

        let image = if action == Action::NodesFlash {
            let name = req
                .image_name
                .clone()
                .ok_or_else(|| CommandError::NotFound("No image named".to_string()))?;
            let nodetype_id = self
                .state
                .images
                .find_nodetype(&user.sub, &name)?
                .ok_or_else(|| CommandError::NotFound(format!("Image {} not found", name)))?;
            let path = self.state.images.path(&user.sub, &nodetype_id, &name)?;
            Some(FlashImage {
                name,
                nodetype_id,
                path,
            })
        } else {
            None
        };

        match self
            .fan_out(Some(conn), action, &req.node_uids, image.as_ref())
            .await?
        {
            Some(done) => Ok(Reply::Json(aggregated_reply(&done.results))),
            None => Ok(Reply::Deferred),
        }
    }

    /// Send each owning gateway its share of the request. Returns the group
    /// right away when no gateway could be reached.
    async fn fan_out(
        &mut self,
        origin: Option<ConnId>,
        action: Action,
        node_uids: &[String],
        image: Option<&FlashImage>,
    ) -> Result<Option<Completed>, CommandError> {
        let targets = fanout::targets(&self.state.store, node_uids)?;
        let image_name = image.map(|i| i.name.clone());
        let group = self
            .aggregator
            .open(origin, action, image_name.clone(), Instant::now());

        for target in &targets {
            if let Some(image) = image {
                if let Err(e) = self
                    .state
                    .transfer
                    .push_image(&target.ip, &image.path, &image.nodetype_id)
                    .await
                {
                    tracing::warn!(gateway = %target.gateway_id, image = %image.name, "Image push failed: {}", e);
                }
            }

            match fanout::dispatch(target, action, image_name.as_deref()).await {
                Ok(stream) => {
                    let peer = stream
                        .peer_addr()
                        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], target.port)));
                    let conn = self.register(stream, peer);
                    self.aggregator.attach(group, conn, &target.gateway_id);
                }
                Err(e) => {
                    tracing::warn!(
                        gateway = %target.gateway_id,
                        addr = %format!("{}:{}", target.ip, target.port),
                        "Gateway unreachable: {}",
                        e
                    );
                }
            }
        }

        tracing::debug!(group, action = %action, gateways = targets.len(), "Fanned out");
        Ok(self.aggregator.finish_if_empty(group))
    }

    async fn gateway_result(&mut self, conn: ConnId, action: Action, result: GatewayNodeResult) {
        let Some(member) = self.aggregator.member(conn) else {
            tracing::warn!(conn, action = %action, "Result from a connection with no pending request");
            return;
        };
        if member.action.gateway_result() != Some(action) {
            tracing::warn!(
                conn,
                gateway = %member.gateway_id,
                expected = ?member.action.gateway_result(),
                action = %action,
                "Gateway answered with the wrong result type"
            );
            let completed = self.aggregator.abandon(conn);
            self.close(conn).await;
            if let Some(done) = completed {
                self.flush(done).await;
            }
            return;
        }
        let outcomes = self.persist_outcomes(&member, action, &result);
        let completed = self.aggregator.record(conn, outcomes);
        self.close(conn).await;
        if let Some(done) = completed {
            self.flush(done).await;
        }
    }

    /// Map local ids to uids and persist flash/erase outcomes.
    fn persist_outcomes(
        &self,
        member: &MemberInfo,
        action: Action,
        result: &GatewayNodeResult,
    ) -> Vec<NodeOutcome> {
        let store = &self.state.store;
        let mut outcomes = Vec::with_capacity(result.nodes.len());
        for report in &result.nodes {
            let uid = match store.node_uid(&member.gateway_id, &report.node_id) {
                Ok(Some(uid)) => uid,
                Ok(None) => {
                    tracing::warn!(gateway = %member.gateway_id, node = %report.node_id, "Result for unknown node");
                    continue;
                }
                Err(e) => {
                    tracing::error!(gateway = %member.gateway_id, "Node lookup failed: {}", e);
                    continue;
                }
            };

            let update = match (action, &report.status) {
                (Action::GatewayNodesFlash, NodeStatus::Flashed) => {
                    Some((FlashState::Finished, member.image_name.as_deref()))
                }
                (Action::GatewayNodesErase, NodeStatus::Erased) => Some((FlashState::NotStarted, None)),
                _ => None,
            };
            if let Some((flash_state, image_name)) = update {
                if let Err(e) = store.update_flash_state(&uid, flash_state, image_name) {
                    tracing::error!(node = %uid, "Flash state update failed: {}", e);
                }
            }

            outcomes.push(NodeOutcome {
                uid,
                status: report.status.clone(),
            });
        }
        outcomes
    }

    async fn flush(&mut self, done: Completed) {
        tracing::info!(
            group = done.group,
            action = %done.action,
            results = done.results.len(),
            "Node operation complete"
        );
        if let Some(origin) = done.origin {
            self.send_json(origin, &aggregated_reply(&done.results)).await;
        }
    }

    // --- debug channel ----------------------------------------------------

    async fn debug_start(&mut self, conn: ConnId, req: SlotRequest) -> Result<Reply, CommandError> {
        handlers::authorize(&self.state, &req.token)?;
        handlers::require_slot(&self.state, &req.slot_id)?;

        if let Some(previous) = self.debug.replace_observer(conn) {
            tracing::info!(conn = previous, "Evicting debug observer");
            self.close(previous).await;
        }
        Ok(Reply::Json(debug::start_banner()))
    }

    async fn debug_end(&mut self, req: SlotRequest) -> Result<Reply, CommandError> {
        handlers::authorize(&self.state, &req.token)?;
        handlers::require_slot(&self.state, &req.slot_id)?;

        if let Some(observer) = self.debug.take_observer() {
            self.send_json(observer, &debug::end_banner()).await;
            self.close(observer).await;
        }
        self.debug.clear_experiment();
        Ok(Reply::Json(json!({ "status": 204 })))
    }

    async fn telemetry(&mut self, telemetry: Telemetry) {
        if let Some(info) = self.debug.experiment() {
            if let Err(e) = self.state.logs.append(info, &telemetry) {
                tracing::warn!(slot = %info.slot_id, "Experiment log write failed: {}", e);
            }
        }
        if let Some(observer) = self.debug.observer() {
            self.send_json(observer, &debug::relay_message(&telemetry)).await;
        }
    }

    // --- periodic tasks -----------------------------------------------------

    async fn run_task(&mut self, task: CommandTask) {
        match task {
            CommandTask::SlotsStart => self.start_slot(),
            CommandTask::SlotsEnd => self.end_slots().await,
            CommandTask::LogSweep => {
                match self.state.logs.sweep(self.state.config.timers.log_retention()) {
                    Ok(0) => {}
                    Ok(removed) => tracing::info!(removed, "Removed old experiment logs"),
                    Err(e) => tracing::warn!("Experiment log sweep failed: {}", e),
                }
            }
            CommandTask::GroupExpiry => {
                let Some(timeout) = self.reply_timeout else {
                    return;
                };
                for (done, conns) in self.aggregator.expire(Instant::now(), timeout) {
                    tracing::warn!(group = done.group, missing = conns.len(), "Gateways did not answer in time");
                    for conn in conns {
                        self.close(conn).await;
                    }
                    self.flush(done).await;
                }
            }
        }
    }

    fn start_slot(&mut self) {
        let active = self.debug.experiment().map(|e| e.slot_id.clone());
        let slot = match self.state.slots.starting(Utc::now(), active.as_deref()) {
            Ok(Some(slot)) => slot,
            Ok(None) => return,
            Err(e) => {
                tracing::error!("Slot lookup failed: {}", e);
                return;
            }
        };

        let info = ExperimentInfo {
            slot_id: slot.uid.clone(),
            user_id: slot.user_id.clone(),
        };
        if let Err(e) = self.state.logs.init(&info) {
            tracing::warn!(slot = %info.slot_id, "Experiment log init failed: {}", e);
        }
        tracing::info!(slot = %info.slot_id, user = %info.user_id, "Experiment started");
        self.debug.set_experiment(info);
    }

    async fn end_slots(&mut self) {
        let ended = match self.state.slots.ending(Utc::now()) {
            Ok(ended) => ended,
            Err(e) => {
                tracing::error!("Slot lookup failed: {}", e);
                return;
            }
        };
        if ended.is_empty() {
            return;
        }

        for slot in &ended {
            if let Err(e) = self.state.store.delete_slot(&slot.uid) {
                tracing::error!(slot = %slot.uid, "Slot delete failed: {}", e);
            }
            if self.debug.end_slot(&slot.uid) {
                tracing::info!(slot = %slot.uid, "Experiment ended");
            }
        }

        let uids: Vec<String> = match self.state.store.list_nodes() {
            Ok(nodes) => nodes.into_iter().map(|n| n.uid).collect(),
            Err(e) => {
                tracing::error!("Node listing failed: {}", e);
                return;
            }
        };
        tracing::info!(slots = ended.len(), nodes = uids.len(), "Erasing nodes after slot end");
        match self.fan_out(None, Action::NodesErase, &uids, None).await {
            Ok(Some(done)) => self.flush(done).await,
            Ok(None) => {}
            Err(e) => tracing::error!("Mass erase failed: {}", e),
        }
    }
}

fn is_gateway_traffic(action: Action) -> bool {
    matches!(
        action,
        Action::GatewayNodesFlash
            | Action::GatewayNodesErase
            | Action::GatewayNodesReset
            | Action::DebugGateway
    )
}

fn aggregated_reply(results: &[NodeOutcome]) -> Value {
    json!({ "data": results, "status": 200 })
}
