pub mod auth;
pub mod command;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod experiment;
pub mod heartbeat;
pub mod images;
pub mod logging;
pub mod models;
pub mod reference;
pub mod slots;
pub mod store;
pub mod test_util;
pub mod timer;
pub mod transfer;

pub use command::CommandServer;
pub use config::Config;
pub use heartbeat::HeartbeatListener;
pub use store::Store;
pub use transfer::{FileTransfer, FtpTransfer};

use std::sync::Arc;

use crate::auth::TokenIssuer;
use crate::experiment::ExperimentLog;
use crate::images::ImageStore;
use crate::slots::SlotScheduler;

/// Collaborators shared by the heartbeat and command loops.
pub struct AppState {
    pub config: Config,
    pub store: Arc<Store>,
    pub tokens: TokenIssuer,
    pub images: ImageStore,
    /// Per-slot experiment logs.
    pub logs: ExperimentLog,
    pub slots: SlotScheduler,
    pub transfer: Arc<dyn FileTransfer>,
}

impl AppState {
    pub fn new(config: Config, store: Arc<Store>, transfer: Arc<dyn FileTransfer>) -> Self {
        Self {
            tokens: TokenIssuer::new(&config.auth.secret, config.auth.token_ttl_hours),
            images: ImageStore::new(&config.paths.images_dir),
            logs: ExperimentLog::new(&config.paths.experiments_dir),
            slots: SlotScheduler::new(store.clone(), config.timers.slot_lookahead()),
            config,
            store,
            transfer,
        }
    }
}
