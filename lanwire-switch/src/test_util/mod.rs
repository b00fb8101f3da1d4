//! Test utilities for lanwire-switch unit and integration tests.
//!
//! Provides in-memory devices, a recording publisher, packet builders and
//! sessions over channels, so the switch can be exercised without
//! CAP_NET_ADMIN.

pub mod memory;
pub mod packets;

pub use memory::{MemoryBridge, MemoryDevices, MemoryTap, RecordingPublisher};
pub use packets::*;

use async_trait::async_trait;
use lanwire_socket::transport::{self, FrameReader, FrameWriter, Link, TransportError};
use lanwire_socket::{Frame, Session, SessionOptions};
use std::time::Duration;
use tokio::sync::mpsc;

/// Default timeout for operations in tests
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

struct ChannelReader(mpsc::Receiver<Vec<u8>>);
struct ChannelWriter(mpsc::UnboundedSender<Vec<u8>>);

#[async_trait]
impl FrameReader for ChannelReader {
    async fn read_frame(&mut self, timeout: Duration) -> transport::Result<Vec<u8>> {
        match tokio::time::timeout(timeout, self.0.recv()).await {
            Err(_) => Err(TransportError::Timeout),
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(TransportError::Closed),
        }
    }
}

#[async_trait]
impl FrameWriter for ChannelWriter {
    async fn write_frame(&mut self, frame: &[u8]) -> transport::Result<()> {
        self.0.send(frame.to_vec()).map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) {}
}

/// Far end of a [`memory_session`].
pub struct Peer {
    /// Frames sent to the session. Dropping it closes the session.
    pub tx: mpsc::Sender<Vec<u8>>,
    /// Frames the session wrote.
    pub rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Peer {
    pub async fn send(&self, frame: &Frame) {
        self.tx.send(frame.as_bytes().to_vec()).await.unwrap();
    }

    /// Next frame written by the session, decoded.
    pub async fn recv(&mut self) -> Option<Frame> {
        let raw = tokio::time::timeout(DEFAULT_TIMEOUT, self.rx.recv())
            .await
            .ok()??;
        Frame::decode(raw).ok()
    }
}

/// Connected server-side session over channels.
pub fn memory_session(remote: &str) -> (Session, Peer) {
    let (in_tx, in_rx) = mpsc::channel(64);
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let link = Link {
        reader: Box::new(ChannelReader(in_rx)),
        writer: Box::new(ChannelWriter(out_tx)),
        remote: remote.parse().unwrap(),
        local: "10.255.0.1:10002".parse().unwrap(),
    };
    let session = Session::from_link(link, SessionOptions::default());
    (session, Peer { tx: in_tx, rx: out_rx })
}
