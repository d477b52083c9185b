use std::collections::BTreeMap;

use serde::Serialize;

/// Gateway as persisted after a descriptor sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewayRecord {
    /// Identifier chosen by the field device.
    pub id: String,
    /// Address the gateway accepts commands on.
    pub ip: String,
    pub port: u16,
    /// Location attributes from the gateway descriptor.
    pub location: BTreeMap<String, String>,
}
