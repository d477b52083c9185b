//! Node state types carried on the wire.

use serde::{Deserialize, Serialize};

/// Flash lifecycle of a sensor node as tracked by the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlashState {
    /// No image has been flashed (or the node was erased).
    #[default]
    NotStarted,
    /// A flash request is in flight.
    Started,
    /// The gateway reported the image as flashed.
    Finished,
}

impl FlashState {
    pub const ALL: [FlashState; 3] = [
        FlashState::NotStarted,
        FlashState::Started,
        FlashState::Finished,
    ];

    /// Storage/wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            FlashState::NotStarted => "NOT_STARTED",
            FlashState::Started => "STARTED",
            FlashState::Finished => "FINISHED",
        }
    }

    /// Parse the storage/wire representation.
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }
}

impl std::fmt::Display for FlashState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-node outcome reported by a gateway for a flash/erase/reset request.
///
/// Statuses this crate does not name are kept verbatim so they can be relayed
/// to the client unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NodeStatus {
    Flashed,
    Erased,
    Reset,
    Error,
    Other(String),
}

impl NodeStatus {
    pub fn as_str(&self) -> &str {
        match self {
            NodeStatus::Flashed => "FLASHED",
            NodeStatus::Erased => "ERASED",
            NodeStatus::Reset => "RESET",
            NodeStatus::Error => "ERROR",
            NodeStatus::Other(raw) => raw,
        }
    }
}

impl From<String> for NodeStatus {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "FLASHED" => NodeStatus::Flashed,
            "ERASED" => NodeStatus::Erased,
            "RESET" => NodeStatus::Reset,
            "ERROR" => NodeStatus::Error,
            _ => NodeStatus::Other(raw),
        }
    }
}

impl From<NodeStatus> for String {
    fn from(status: NodeStatus) -> Self {
        match status {
            NodeStatus::Other(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
