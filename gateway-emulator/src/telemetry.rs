//! Debug telemetry pushed to the server as `DGA` frames.

use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use wsn_common::{Action, Frame, Telemetry};

use crate::error::Result;

/// A telemetry line stamped with the current time.
pub fn reading(node_id: &str, data: Value) -> Telemetry {
    Telemetry(
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        node_id.to_string(),
        data,
    )
}

/// Open a connection and push each line as its own `DGA` frame.
pub async fn send(target: &str, lines: &[Telemetry]) -> Result<()> {
    let mut stream = TcpStream::connect(target).await?;
    for line in lines {
        let bytes = Frame::json(Action::DebugGateway, line)?.encode()?;
        stream.write_all(&bytes).await?;
    }
    stream.flush().await?;
    stream.shutdown().await?;
    Ok(())
}

/// Emit a synthetic counter reading for every node until cancelled.
pub async fn run(
    target: String,
    node_ids: Vec<String>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut counter: u64 = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        counter += 1;
        let lines: Vec<Telemetry> = node_ids
            .iter()
            .map(|id| reading(id, json!({ "counter": counter })))
            .collect();
        if let Err(e) = send(&target, &lines).await {
            tracing::warn!("Telemetry send failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use wsn_common::FrameBuffer;

    #[test]
    fn test_reading_stamps_rfc3339_time() {
        let line = reading("4", json!("hello"));
        assert_eq!(line.node_id(), "4");
        assert!(chrono::DateTime::parse_from_rfc3339(line.timestamp()).is_ok());
        assert_eq!(line.data_text(), "hello");
    }

    #[tokio::test]
    async fn test_send_writes_one_frame_per_line() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();
        let lines = vec![reading("1", json!(1)), reading("2", json!(2))];

        let sender = tokio::spawn({
            let lines = lines.clone();
            async move { send(&target, &lines).await }
        });

        let (mut stream, _) = listener.accept().await.unwrap();
        let mut frames = FrameBuffer::new();
        while stream.read_buf(frames.buffer_mut()).await.unwrap() > 0 {}
        sender.await.unwrap().unwrap();

        let mut got = Vec::new();
        while let Some(frame) = frames.next_frame() {
            assert_eq!(frame.action(), Some(Action::DebugGateway));
            got.push(frame.parse::<Telemetry>().unwrap());
        }
        assert_eq!(got, lines);
    }
}
