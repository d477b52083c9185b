//! Gateway emulator for the WSN testbed.
//!
//! Plays the gateway side of the control protocol: periodic UDP heartbeats,
//! replies to node flash/erase/reset requests and `DGA` debug telemetry.

pub mod config;
pub mod error;
pub mod heartbeat;
pub mod responder;
pub mod telemetry;

pub use config::Config;
pub use error::{Error, Result};
pub use heartbeat::{send_once, HeartbeatSender};
pub use responder::{CommandResponder, ReceivedRequest};
