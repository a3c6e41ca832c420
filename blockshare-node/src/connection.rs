//! One peer socket carrying framed messages.
//!
//! Sends and receives are each serialized by their own lock, so one sender and one
//! receiver may work on the same connection at once without interleaving frames.

use std::net::SocketAddr;

use blockshare_core::wire::{self, FrameDecodeError, FrameEncodeError, LEN_SIZE};
use blockshare_core::{Message, NodeIdentity};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection closed")]
    Closed,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
    #[error(transparent)]
    Decode(#[from] FrameDecodeError),
}

pub struct Connection {
    remote: Option<SocketAddr>,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    closed: watch::Sender<bool>,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Self {
        let remote = stream.peer_addr().ok();
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        let (closed, _) = watch::channel(false);
        Self {
            remote,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed,
        }
    }

    /// Open an outbound connection to `peer`'s listening port.
    pub async fn open(peer: &NodeIdentity) -> std::io::Result<Self> {
        let stream = TcpStream::connect((peer.host(), peer.port())).await?;
        Ok(Self::new(stream))
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// Write one message and flush it. A write failure marks the connection closed.
    pub async fn send(&self, msg: &Message) -> Result<(), ConnectionError> {
        if !self.is_alive() {
            return Err(ConnectionError::Closed);
        }
        let frame = wire::encode_frame(msg)?;
        let mut writer = self.writer.lock().await;
        let written = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            self.mark_closed();
            return Err(e.into());
        }
        debug!(remote = ?self.remote, kind = msg.kind(), "sent");
        Ok(())
    }

    /// Wait for the next message. `None` once the stream ends, a frame fails to decode,
    /// or [`close`](Self::close) is called; the connection is dead from then on.
    pub async fn receive(&self) -> Option<Message> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return None;
        }
        let mut reader = self.reader.lock().await;
        let read = tokio::select! {
            r = read_message(&mut reader) => r,
            _ = async { let _ = closed.wait_for(|c| *c).await; } => return None,
        };
        match read {
            Ok(msg) => {
                debug!(remote = ?self.remote, kind = msg.kind(), "received");
                Some(msg)
            }
            Err(e) => {
                debug!(remote = ?self.remote, error = %e, "receive ended");
                self.mark_closed();
                None
            }
        }
    }

    /// Non-blocking liveness check.
    pub fn is_alive(&self) -> bool {
        !*self.closed.borrow()
    }

    /// Shut the socket down and wake any pending `receive`. Idempotent.
    pub async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        debug!(remote = ?self.remote, "connection closed");
    }

    /// Mark the connection dead without touching the socket: pending and later `receive`
    /// calls return `None` and sends fail. For callers that cannot await [`close`](Self::close).
    pub fn abandon(&self) {
        if !self.closed.send_replace(true) {
            debug!(remote = ?self.remote, "connection abandoned");
        }
    }

    fn mark_closed(&self) {
        self.closed.send_replace(true);
    }
}

async fn read_message(reader: &mut OwnedReadHalf) -> Result<Message, ConnectionError> {
    let mut header = [0u8; LEN_SIZE];
    reader.read_exact(&mut header).await?;
    let len = wire::payload_len(header)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(wire::decode_payload(&payload)?)
}
