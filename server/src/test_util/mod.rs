//! Fakes and fixtures shared by unit and integration tests.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::config::Config;
use crate::models::{GatewayRecord, NewNode, NodeRecord};
use crate::store::Store;
use crate::transfer::{FileTransfer, TransferError};
use crate::AppState;

/// A transfer the fake performed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Push {
    File { host: String, name: String },
    Image { host: String, name: String, nodetype_id: String },
    EraseImage { host: String, name: String },
}

fn name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// [`FileTransfer`] that records pushes and serves descriptors from memory.
#[derive(Debug, Default)]
pub struct RecordingTransfer {
    descriptors: Mutex<HashMap<String, String>>,
    pushes: Mutex<Vec<Push>>,
    pulls: Mutex<Vec<(String, String)>>,
}

impl RecordingTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `xml` as the descriptor of `gateway_id`.
    pub fn set_descriptor(&self, gateway_id: &str, xml: &str) {
        if let Ok(mut descriptors) = self.descriptors.lock() {
            descriptors.insert(gateway_id.to_string(), xml.to_string());
        }
    }

    pub fn pushes(&self) -> Vec<Push> {
        self.pushes.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// `(host, gateway id)` of every descriptor pull, successful or not.
    pub fn pulls(&self) -> Vec<(String, String)> {
        self.pulls.lock().map(|p| p.clone()).unwrap_or_default()
    }

    fn record(&self, push: Push) {
        if let Ok(mut pushes) = self.pushes.lock() {
            pushes.push(push);
        }
    }
}

#[async_trait]
impl FileTransfer for RecordingTransfer {
    async fn push_file(&self, host: &str, local: &Path) -> Result<(), TransferError> {
        self.record(Push::File {
            host: host.to_string(),
            name: name_of(local),
        });
        Ok(())
    }

    async fn push_image(
        &self,
        host: &str,
        local: &Path,
        nodetype_id: &str,
    ) -> Result<(), TransferError> {
        self.record(Push::Image {
            host: host.to_string(),
            name: name_of(local),
            nodetype_id: nodetype_id.to_string(),
        });
        Ok(())
    }

    async fn push_erase_image(&self, host: &str, local: &Path) -> Result<(), TransferError> {
        self.record(Push::EraseImage {
            host: host.to_string(),
            name: name_of(local),
        });
        Ok(())
    }

    async fn pull_descriptor(
        &self,
        host: &str,
        gateway_id: &str,
        dest_dir: &Path,
    ) -> Result<PathBuf, TransferError> {
        if let Ok(mut pulls) = self.pulls.lock() {
            pulls.push((host.to_string(), gateway_id.to_string()));
        }
        let xml = self
            .descriptors
            .lock()
            .ok()
            .and_then(|d| d.get(gateway_id).cloned())
            .ok_or_else(|| {
                TransferError::Io(io::Error::new(io::ErrorKind::NotFound, "no descriptor"))
            })?;
        std::fs::create_dir_all(dest_dir)?;
        let dest = dest_dir.join(format!("{}.xml", gateway_id));
        std::fs::write(&dest, xml)?;
        Ok(dest)
    }
}

/// Configuration rooted in `root`, with an in-memory database.
pub fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.database.url = ":memory:".to_string();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;
    config.auth.secret = "test-secret".to_string();
    config.paths.gateways_dir = root.join("gateways");
    config.paths.images_dir = root.join("images");
    config.paths.erase_images_dir = root.join("erase");
    config.paths.experiments_dir = root.join("experiments");
    config.paths.node_types_file = root.join("nodetypes.xml");
    config.paths.locations_file = root.join("locations.xml");
    config
}

/// Gateway descriptor XML listing `local_ids`, all of node type `UNO`.
pub fn descriptor_xml(local_ids: &[&str]) -> String {
    let nodes: String = local_ids
        .iter()
        .map(|id| {
            format!(
                "<node id=\"{}\"><nodetype_id>UNO</nodetype_id><location><x>{}</x></location></node>",
                id, id
            )
        })
        .collect();
    format!(
        "<gateway><location><building>A</building></location><nodes>{}</nodes></gateway>",
        nodes
    )
}

/// Application state wired to a [`RecordingTransfer`].
pub struct TestContext {
    pub state: Arc<AppState>,
    pub transfer: Arc<RecordingTransfer>,
}

impl TestContext {
    pub fn new(root: &Path) -> Self {
        Self::with_config(test_config(root))
    }

    pub fn with_config(config: Config) -> Self {
        let store = match Store::open(&config.database.url) {
            Ok(store) => Arc::new(store),
            Err(e) => panic!("test store: {}", e),
        };
        let transfer = Arc::new(RecordingTransfer::new());
        let state = Arc::new(AppState::new(config, store, transfer.clone()));
        Self { state, transfer }
    }

    /// Store a gateway at `127.0.0.1:port` owning nodes with the given local ids.
    pub fn seed_gateway(&self, id: &str, port: u16, local_ids: &[&str]) -> Vec<NodeRecord> {
        let gateway = GatewayRecord {
            id: id.to_string(),
            ip: "127.0.0.1".to_string(),
            port,
            location: BTreeMap::new(),
        };
        let nodes: Vec<NewNode> = local_ids
            .iter()
            .map(|local_id| NewNode {
                local_id: local_id.to_string(),
                nodetype_id: "UNO".to_string(),
                location: BTreeMap::new(),
            })
            .collect();
        match self.state.store.replace_gateway(&gateway, &nodes) {
            Ok(records) => records,
            Err(e) => panic!("seed gateway {}: {}", id, e),
        }
    }

    /// Bearer token for `email`.
    pub fn token(&self, email: &str) -> String {
        match self.state.tokens.issue(email) {
            Ok(token) => token,
            Err(e) => panic!("issue token: {}", e),
        }
    }
}
