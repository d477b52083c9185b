use std::collections::BTreeMap;

use serde::Serialize;
use wsn_common::FlashState;

/// Sensor node owned by a gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeRecord {
    /// Storage-assigned identity.
    #[serde(rename = "_id")]
    pub uid: String,
    /// Gateway-scoped identifier.
    #[serde(rename = "id")]
    pub local_id: String,
    pub nodetype_id: String,
    pub gateway_id: String,
    pub location: BTreeMap<String, String>,
    #[serde(rename = "flashed")]
    pub flash_state: FlashState,
    pub image_name: Option<String>,
}

/// Node parsed from a descriptor, before storage assigns a uid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNode {
    pub local_id: String,
    pub nodetype_id: String,
    pub location: BTreeMap<String, String>,
}
