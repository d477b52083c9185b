use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use wsn_common::Heartbeat;

use super::registry::{diff_nodes, GatewayRegistry, HeartbeatOutcome};
use crate::descriptor::{read_gateway, read_node_types, DescriptorError, GatewayDescriptor};
use crate::models::GatewayRecord;
use crate::reference::FileWatch;
use crate::store::StoreError;
use crate::timer::TimerScheduler;
use crate::transfer::TransferError;
use crate::AppState;

/// Upper bound on a wait when no watch is registered.
const IDLE_WAIT: Duration = Duration::from_secs(1);
const DATAGRAM_SIZE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeartbeatTask {
    GatewaySweep,
    NodeTypesPoll,
    LocationsPoll,
}

/// Failure to bring storage in line with a gateway's descriptor.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Descriptor transfer failed: {0}")]
    Transfer(#[from] TransferError),
    #[error("Descriptor rejected: {0}")]
    Descriptor(#[from] DescriptorError),
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

/// Single-task UDP loop owning the gateway registry.
pub struct HeartbeatListener {
    socket: UdpSocket,
    state: Arc<AppState>,
    registry: GatewayRegistry,
    timers: TimerScheduler<HeartbeatTask>,
    node_types: FileWatch,
    locations: FileWatch,
}

impl HeartbeatListener {
    pub async fn bind(addr: &str, state: Arc<AppState>) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let timers_config = &state.config.timers;
        let now = Instant::now();

        let mut timers = TimerScheduler::new();
        timers.add(HeartbeatTask::GatewaySweep, timers_config.gateway_sweep(), now);
        timers.add(HeartbeatTask::NodeTypesPoll, timers_config.node_types_poll(), now);
        timers.add(HeartbeatTask::LocationsPoll, timers_config.locations_poll(), now);

        Ok(Self {
            registry: GatewayRegistry::new(timers_config.gateway_timeout()),
            node_types: FileWatch::new(&state.config.paths.node_types_file),
            locations: FileWatch::new(&state.config.paths.locations_file),
            timers,
            socket,
            state,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!(addr = ?self.socket.local_addr().ok(), "Heartbeat listener started");
        self.load_node_types();

        let mut buf = [0u8; DATAGRAM_SIZE];
        loop {
            for task in self.timers.due(Instant::now()) {
                self.run_task(task).await;
            }
            let wait = self.timers.next_wait(Instant::now()).unwrap_or(IDLE_WAIT);

            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => Some(received),
                _ = tokio::time::sleep(wait) => None,
            };

            match received {
                Some(Ok((len, peer))) => self.handle_datagram(&buf[..len], peer).await,
                Some(Err(e)) => tracing::warn!("Heartbeat receive failed: {}", e),
                None => {}
            }
        }
        tracing::info!("Heartbeat listener stopped");
    }

    async fn handle_datagram(&mut self, data: &[u8], peer: SocketAddr) {
        let heartbeat = match Heartbeat::decode(data) {
            Ok(hb) => hb,
            Err(e) => {
                tracing::warn!(peer = %peer, "Discarding malformed heartbeat: {}", e);
                return;
            }
        };
        tracing::trace!(
            gateway = %heartbeat.gateway_id,
            sequence = heartbeat.sequence,
            "Heartbeat"
        );

        let outcome = self
            .registry
            .observe(&heartbeat.gateway_id, heartbeat.sequence, Instant::now());
        let (previous, result) = match outcome {
            HeartbeatOutcome::Unchanged => return,
            HeartbeatOutcome::Bootstrap { previous } => {
                (previous, self.bootstrap(&heartbeat, peer).await)
            }
            HeartbeatOutcome::Reconcile { previous } => {
                (previous, self.reconcile(&heartbeat, peer).await)
            }
        };

        match result {
            Ok(()) => self.registry.commit(&heartbeat.gateway_id),
            Err(e) => {
                tracing::warn!(
                    gateway = %heartbeat.gateway_id,
                    sequence = heartbeat.sequence,
                    "Gateway sync failed, will retry: {}",
                    e
                );
                self.registry.rollback(&heartbeat.gateway_id, previous);
            }
        }
    }

    /// Descriptors are served by the host the heartbeat came from.
    async fn fetch_descriptor(
        &self,
        gateway_id: &str,
        peer: SocketAddr,
    ) -> Result<GatewayDescriptor, SyncError> {
        let path = self
            .state
            .transfer
            .pull_descriptor(
                &peer.ip().to_string(),
                gateway_id,
                &self.state.config.paths.gateways_dir,
            )
            .await?;
        Ok(read_gateway(&path)?)
    }

    fn record(heartbeat: &Heartbeat, descriptor: &GatewayDescriptor) -> GatewayRecord {
        GatewayRecord {
            id: heartbeat.gateway_id.clone(),
            ip: heartbeat.ip.clone(),
            port: heartbeat.port,
            location: descriptor.location.clone(),
        }
    }

    async fn bootstrap(&self, heartbeat: &Heartbeat, peer: SocketAddr) -> Result<(), SyncError> {
        let descriptor = self.fetch_descriptor(&heartbeat.gateway_id, peer).await?;
        let record = Self::record(heartbeat, &descriptor);
        let nodes = self.state.store.replace_gateway(&record, &descriptor.nodes)?;
        tracing::info!(
            gateway = %record.id,
            nodes = nodes.len(),
            sequence = heartbeat.sequence,
            "Registered gateway"
        );

        let paths = &self.state.config.paths;
        self.push_file(&record.ip, &paths.node_types_file).await;
        self.push_file(&record.ip, &paths.locations_file).await;
        self.push_erase_images(&record.ip).await;
        Ok(())
    }

    async fn reconcile(&self, heartbeat: &Heartbeat, peer: SocketAddr) -> Result<(), SyncError> {
        let descriptor = self.fetch_descriptor(&heartbeat.gateway_id, peer).await?;
        let record = Self::record(heartbeat, &descriptor);
        let store = &self.state.store;

        if !store.update_gateway(&record)? {
            store.replace_gateway(&record, &descriptor.nodes)?;
            tracing::info!(gateway = %record.id, "Re-created missing gateway record");
            return Ok(());
        }

        let existing = store.nodes_by_gateway(&record.id)?;
        let diff = diff_nodes(&existing, &descriptor.nodes);
        for node in &diff.to_insert {
            store.insert_node(&record.id, node)?;
        }
        for local_id in &diff.to_delete {
            store.delete_node(&record.id, local_id)?;
        }
        tracing::info!(
            gateway = %record.id,
            inserted = diff.to_insert.len(),
            deleted = diff.to_delete.len(),
            sequence = heartbeat.sequence,
            "Reconciled gateway nodes"
        );
        Ok(())
    }

    async fn push_file(&self, host: &str, path: &Path) {
        if let Err(e) = self.state.transfer.push_file(host, path).await {
            tracing::warn!(host = %host, file = %path.display(), "Push failed: {}", e);
        }
    }

    async fn push_erase_images(&self, host: &str) {
        let dir = &self.state.config.paths.erase_images_dir;
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!(dir = %dir.display(), "No erase images: {}", e);
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if let Err(e) = self.state.transfer.push_erase_image(host, &path).await {
                tracing::warn!(host = %host, file = %path.display(), "Erase image push failed: {}", e);
            }
        }
    }

    /// Push a reference file to every tracked gateway.
    async fn broadcast_file(&self, path: &Path) {
        for id in self.registry.ids() {
            match self.state.store.gateway_address(&id) {
                Ok(Some((ip, _))) => self.push_file(&ip, path).await,
                Ok(None) => {}
                Err(e) => tracing::error!(gateway = %id, "Gateway lookup failed: {}", e),
            }
        }
    }

    fn load_node_types(&self) {
        let path = &self.state.config.paths.node_types_file;
        match read_node_types(path) {
            Ok(node_types) => match self.state.store.replace_node_types(&node_types) {
                Ok(()) => {}
                Err(e) => tracing::error!("Failed to store node types: {}", e),
            },
            Err(e) => tracing::warn!(file = %path.display(), "Node types not loaded: {}", e),
        }
    }

    async fn run_task(&mut self, task: HeartbeatTask) {
        match task {
            HeartbeatTask::GatewaySweep => {
                for id in self.registry.sweep(Instant::now()) {
                    match self.state.store.delete_gateway(&id) {
                        Ok(_) => tracing::info!(gateway = %id, "Evicted silent gateway"),
                        Err(e) => tracing::error!(gateway = %id, "Failed to delete gateway: {}", e),
                    }
                }
            }
            HeartbeatTask::NodeTypesPoll => {
                if self.node_types.changed() {
                    self.load_node_types();
                    let path = self.node_types.path().to_path_buf();
                    self.broadcast_file(&path).await;
                }
            }
            HeartbeatTask::LocationsPoll => {
                if self.locations.changed() {
                    let path = self.locations.path().to_path_buf();
                    tracing::info!(file = %path.display(), "Locations changed");
                    self.broadcast_file(&path).await;
                }
            }
        }
    }
}
