//! The single live debug observer and the experiment whose telemetry is logged.

use serde_json::{json, Value};
use wsn_common::Telemetry;

use super::connection::ConnId;
use crate::experiment::ExperimentInfo;

pub const START_BANNER: &str = "=== DEBUG CHANNEL START ===\n===========================\n";
pub const END_BANNER: &str = "=== DEBUG CHANNEL END ===\n=========================\n";

pub fn start_banner() -> Value {
    json!({ "data": [START_BANNER], "status": 200 })
}

pub fn end_banner() -> Value {
    json!({ "data": [END_BANNER], "message": "STOP DEBUG" })
}

/// Telemetry as relayed to the observer.
pub fn relay_message(telemetry: &Telemetry) -> Value {
    json!({ "data": telemetry })
}

#[derive(Debug, Default)]
pub struct DebugRelay {
    observer: Option<ConnId>,
    experiment: Option<ExperimentInfo>,
}

impl DebugRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observer(&self) -> Option<ConnId> {
        self.observer
    }

    /// Install `conn` as the observer, returning a different previous one to evict.
    pub fn replace_observer(&mut self, conn: ConnId) -> Option<ConnId> {
        self.observer.replace(conn).filter(|previous| *previous != conn)
    }

    pub fn take_observer(&mut self) -> Option<ConnId> {
        self.observer.take()
    }

    /// Drop the observer if it is `conn`.
    pub fn forget(&mut self, conn: ConnId) {
        if self.observer == Some(conn) {
            self.observer = None;
        }
    }

    pub fn experiment(&self) -> Option<&ExperimentInfo> {
        self.experiment.as_ref()
    }

    pub fn set_experiment(&mut self, info: ExperimentInfo) {
        self.experiment = Some(info);
    }

    pub fn clear_experiment(&mut self) -> Option<ExperimentInfo> {
        self.experiment.take()
    }

    /// Clear the experiment if it belongs to `slot_id`.
    pub fn end_slot(&mut self, slot_id: &str) -> bool {
        if self.experiment.as_ref().is_some_and(|e| e.slot_id == slot_id) {
            self.experiment = None;
            return true;
        }
        false
    }
}
