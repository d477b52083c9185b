//! One TCP peer of the command server: clients, debug observers and gateways alike.

use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use wsn_common::{Frame, FrameBuffer};

pub type ConnId = u64;

/// Events forwarded from reader tasks to the owning server task.
#[derive(Debug)]
pub enum Inbound {
    Frame(ConnId, Frame),
    /// Peer closed the socket or the read failed.
    Closed(ConnId),
}

/// Write half plus the task draining the read half.
pub struct Connection {
    peer: SocketAddr,
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
}

impl Connection {
    pub fn spawn(id: ConnId, stream: TcpStream, peer: SocketAddr, tx: mpsc::Sender<Inbound>) -> Self {
        let (read_half, writer) = stream.into_split();
        let reader = tokio::spawn(read_frames(id, read_half, tx));
        Self {
            peer,
            writer,
            reader,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub async fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await
    }

    /// Shut the socket down. No `Closed` event follows.
    pub async fn close(mut self) {
        self.reader.abort();
        if let Err(e) = self.writer.shutdown().await {
            tracing::debug!(peer = %self.peer, "Shutdown failed: {}", e);
        }
    }
}

async fn read_frames(id: ConnId, mut reader: OwnedReadHalf, tx: mpsc::Sender<Inbound>) {
    let mut buffer = FrameBuffer::new();
    loop {
        match reader.read_buf(buffer.buffer_mut()).await {
            Ok(0) => break,
            Ok(_) => {
                while let Some(frame) = buffer.next_frame() {
                    if tx.send(Inbound::Frame(id, frame)).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::debug!(conn = id, "Read failed: {}", e);
                break;
            }
        }
    }
    if buffer.pending() > 0 {
        tracing::debug!(conn = id, pending = buffer.pending(), "Dropped partial frame");
    }
    // The server may already be gone during shutdown.
    let _ = tx.send(Inbound::Closed(id)).await;
}
