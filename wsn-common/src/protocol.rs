//! Action codes and JSON payloads exchanged over TCP.
//!
//! # Traffic
//!
//! - Clients send `NFL`/`NER`/`NRS`, `NGE`, `NTG`, `IMG`/`IMS`/`IMD`,
//!   `TSA`/`TGD`/`TGU`, `USU`/`ULI` and `DST`/`DEN`/`DCL`/`DGL` to the server
//!   and receive one size-prefixed JSON response per request.
//! - The server opens a fresh connection per gateway to send `NFL`/`NER`/`NRS`
//!   carrying a [`GatewayNodeRequest`]; the gateway answers on the same socket
//!   with `GNF`/`GNE`/`GNR` carrying a [`GatewayNodeResult`].
//! - Gateways push `DGA` telemetry frames on their own connections.
//!
//! Timestamps are RFC 3339 strings in UTC.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::node::NodeStatus;

/// Three-byte action tag at the start of every application frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    NodesFlash,
    NodesErase,
    NodesReset,
    GatewayNodesFlash,
    GatewayNodesErase,
    GatewayNodesReset,
    NodesGet,
    NodeTypesGet,
    ImagesGet,
    ImageSave,
    ImageDelete,
    SlotsSave,
    SlotsGetDay,
    SlotsGetUser,
    UserSignup,
    UserLogin,
    DebugStart,
    DebugEnd,
    DebugClearLog,
    DebugGetLog,
    DebugGateway,
}

impl Action {
    pub const ALL: [Action; 21] = [
        Action::NodesFlash,
        Action::NodesErase,
        Action::NodesReset,
        Action::GatewayNodesFlash,
        Action::GatewayNodesErase,
        Action::GatewayNodesReset,
        Action::NodesGet,
        Action::NodeTypesGet,
        Action::ImagesGet,
        Action::ImageSave,
        Action::ImageDelete,
        Action::SlotsSave,
        Action::SlotsGetDay,
        Action::SlotsGetUser,
        Action::UserSignup,
        Action::UserLogin,
        Action::DebugStart,
        Action::DebugEnd,
        Action::DebugClearLog,
        Action::DebugGetLog,
        Action::DebugGateway,
    ];

    pub fn code(&self) -> [u8; 3] {
        *match self {
            Action::NodesFlash => b"NFL",
            Action::NodesErase => b"NER",
            Action::NodesReset => b"NRS",
            Action::GatewayNodesFlash => b"GNF",
            Action::GatewayNodesErase => b"GNE",
            Action::GatewayNodesReset => b"GNR",
            Action::NodesGet => b"NGE",
            Action::NodeTypesGet => b"NTG",
            Action::ImagesGet => b"IMG",
            Action::ImageSave => b"IMS",
            Action::ImageDelete => b"IMD",
            Action::SlotsSave => b"TSA",
            Action::SlotsGetDay => b"TGD",
            Action::SlotsGetUser => b"TGU",
            Action::UserSignup => b"USU",
            Action::UserLogin => b"ULI",
            Action::DebugStart => b"DST",
            Action::DebugEnd => b"DEN",
            Action::DebugClearLog => b"DCL",
            Action::DebugGetLog => b"DGL",
            Action::DebugGateway => b"DGA",
        }
    }

    pub fn from_code(code: &[u8]) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.code() == code)
    }

    /// Gateway result action answering a node operation.
    pub fn gateway_result(&self) -> Option<Action> {
        match self {
            Action::NodesFlash => Some(Action::GatewayNodesFlash),
            Action::NodesErase => Some(Action::GatewayNodesErase),
            Action::NodesReset => Some(Action::GatewayNodesReset),
            _ => None,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.code()))
    }
}

/// Body of requests that only carry a bearer token (`NGE`, `NTG`, `IMG`, `TGU`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRequest {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignupRequest {
    pub email: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// Slot-scoped requests (`DST`, `DEN`, `DCL`, `DGL`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotRequest {
    pub token: String,
    pub slot_id: String,
}

/// Client flash/erase/reset request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeOperationRequest {
    pub token: String,
    pub slot_id: String,
    pub node_uids: Vec<String>,
    /// Only meaningful for flash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_name: Option<String>,
}

/// Server to gateway request carrying only that gateway's node ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayNodeRequest {
    pub node_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_name: Option<String>,
}

/// Per-node outcome reported by a gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReport {
    pub node_id: String,
    pub status: NodeStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayNodeResult {
    pub nodes: Vec<NodeReport>,
}

/// Per-node outcome relayed to the client, keyed by node uid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeOutcome {
    #[serde(rename = "_id")]
    pub uid: String,
    pub status: NodeStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSaveRequest {
    pub token: String,
    pub image_name: String,
    pub image_data: String,
    pub nodetype_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageDeleteRequest {
    pub token: String,
    pub image_name: String,
}

/// Half-open reservation window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotsSaveRequest {
    pub token: String,
    pub slots: Vec<SlotWindow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DayQuery {
    pub token: String,
    pub date: DateTime<Utc>,
}

/// Gateway debug output: `[timestamp, node_id, data]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Telemetry(pub String, pub String, pub serde_json::Value);

impl Telemetry {
    pub fn timestamp(&self) -> &str {
        &self.0
    }

    pub fn node_id(&self) -> &str {
        &self.1
    }

    /// Data rendered for a log line; strings are written without quotes.
    pub fn data_text(&self) -> String {
        match &self.2 {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}
