//! UDP side: gateway heartbeats, topology sync and reference-file distribution.

mod listener;
mod registry;

pub use listener::{HeartbeatListener, SyncError};
pub use registry::{diff_nodes, GatewayRegistry, HeartbeatOutcome, NodeDiff};
