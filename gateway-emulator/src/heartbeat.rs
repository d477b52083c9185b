//! Periodic UDP heartbeats towards the control server.

use std::time::Duration;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use wsn_common::Heartbeat;

use crate::error::Result;

/// Send a single heartbeat datagram to `target`.
pub async fn send_once(target: &str, heartbeat: &Heartbeat) -> Result<()> {
    let bytes = heartbeat.encode()?;
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.send_to(&bytes, target).await?;
    Ok(())
}

pub struct HeartbeatSender {
    target: String,
    heartbeat: Heartbeat,
    interval: Duration,
}

impl HeartbeatSender {
    pub fn new(target: impl Into<String>, heartbeat: Heartbeat, interval: Duration) -> Self {
        Self {
            target: target.into(),
            heartbeat,
            interval,
        }
    }

    /// Announce until cancelled. Send failures are logged and retried on the
    /// next tick; an unencodable heartbeat ends the loop.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let bytes = self.heartbeat.encode()?;
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            gateway_id = %self.heartbeat.gateway_id,
            sequence = self.heartbeat.sequence,
            "Sending heartbeats to {} every {:?}",
            self.target,
            self.interval
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = socket.send_to(&bytes, &self.target).await {
                        tracing::warn!("Heartbeat send failed: {}", e);
                    }
                }
            }
        }
        Ok(())
    }
}
