//! Datagram binding.
//!
//! One UDP socket serves every point on the server side. Incoming datagrams
//! are demultiplexed by source address; the first datagram from an unknown
//! address opens a new link.

use super::fec::{FecConfig, FecReader, FecWriter};
use super::{
    Acceptor, Backlog, Dialer, FrameReader, FrameWriter, Link, Protocol, Result, TransportError,
    open, resolve, seal,
};
use crate::crypt::{BlockCrypt, CryptConfig, SEAL_OVERHEAD};
use crate::frame::MAX_FRAME;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Largest datagram read from the socket.
pub const MAX_DATAGRAM: usize = MAX_FRAME + SEAL_OVERHEAD + 64;

/// Datagrams buffered per peer before new ones are dropped.
const PEER_QUEUE: usize = 256;

/// How frames map onto datagrams.
#[derive(Debug, Clone, Copy)]
pub enum DatagramCodec {
    Plain,
    Fec(FecConfig),
}

/// Receiving side of a datagram flow.
#[async_trait]
pub trait DatagramRecv: Send {
    async fn recv(&mut self, timeout: Duration) -> Result<Vec<u8>>;
}

/// Sending side of a datagram flow.
#[async_trait]
pub trait DatagramSend: Send {
    async fn send(&mut self, datagram: &[u8]) -> Result<()>;

    async fn close(&mut self);
}

/// One frame per datagram.
struct PlainReader {
    inner: Box<dyn DatagramRecv>,
    block: Option<Arc<dyn BlockCrypt>>,
}

#[async_trait]
impl FrameReader for PlainReader {
    async fn read_frame(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(TransportError::Timeout);
            }
            let datagram = self.inner.recv(left).await?;
            match open(&self.block, datagram) {
                Ok(frame) => return Ok(frame),
                Err(e) => debug!(error = %e, "Dropping unreadable datagram"),
            }
        }
    }
}

struct PlainWriter {
    inner: Box<dyn DatagramSend>,
    block: Option<Arc<dyn BlockCrypt>>,
}

#[async_trait]
impl FrameWriter for PlainWriter {
    async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        let datagram = seal(&self.block, frame)?;
        self.inner.send(&datagram).await
    }

    async fn close(&mut self) {
        self.inner.close().await;
    }
}

fn datagram_link(
    codec: DatagramCodec,
    recv: Box<dyn DatagramRecv>,
    send: Box<dyn DatagramSend>,
    block: Option<Arc<dyn BlockCrypt>>,
    remote: SocketAddr,
    local: SocketAddr,
) -> Link {
    let (reader, writer): (Box<dyn FrameReader>, Box<dyn FrameWriter>) = match codec {
        DatagramCodec::Plain => (
            Box::new(PlainReader {
                inner: recv,
                block: block.clone(),
            }),
            Box::new(PlainWriter { inner: send, block }),
        ),
        DatagramCodec::Fec(config) => (
            Box::new(FecReader::new(recv, block.clone(), config)),
            Box::new(FecWriter::new(send, block, config)),
        ),
    };
    Link {
        reader,
        writer,
        remote,
        local,
    }
}

fn protocol_of(codec: DatagramCodec) -> Protocol {
    match codec {
        DatagramCodec::Plain => Protocol::Udp,
        DatagramCodec::Fec(_) => Protocol::Fec,
    }
}

/// Connected client socket.
struct ConnectedRecv {
    socket: Arc<UdpSocket>,
}

#[async_trait]
impl DatagramRecv for ConnectedRecv {
    async fn recv(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let n = tokio::time::timeout(timeout, self.socket.recv(&mut buf))
            .await
            .map_err(|_| TransportError::Timeout)??;
        buf.truncate(n);
        Ok(buf)
    }
}

struct ConnectedSend {
    socket: Arc<UdpSocket>,
}

#[async_trait]
impl DatagramSend for ConnectedSend {
    async fn send(&mut self, datagram: &[u8]) -> Result<()> {
        self.socket.send(datagram).await?;
        Ok(())
    }

    async fn close(&mut self) {}
}

/// Client side of the datagram binding.
pub struct UdpDialer {
    address: String,
    crypt: CryptConfig,
    codec: DatagramCodec,
}

impl UdpDialer {
    pub fn new(address: &str, crypt: CryptConfig, codec: DatagramCodec) -> Self {
        Self {
            address: address.to_string(),
            crypt,
            codec,
        }
    }
}

#[async_trait]
impl Dialer for UdpDialer {
    fn protocol(&self) -> Protocol {
        protocol_of(self.codec)
    }

    fn address(&self) -> &str {
        &self.address
    }

    async fn connect(&self) -> Result<Link> {
        let block = self.crypt.block()?;
        let remote = resolve(&self.address).await?;
        let bind = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(remote).await?;
        let local = socket.local_addr()?;
        let socket = Arc::new(socket);
        debug!(%remote, %local, "Datagram socket connected");

        Ok(datagram_link(
            self.codec,
            Box::new(ConnectedRecv {
                socket: socket.clone(),
            }),
            Box::new(ConnectedSend { socket }),
            block,
            remote,
            local,
        ))
    }
}

type PeerMap = Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Vec<u8>>>>>;

/// Datagrams routed to one peer by the server demux.
struct PeerRecv {
    rx: mpsc::Receiver<Vec<u8>>,
}

#[async_trait]
impl DatagramRecv for PeerRecv {
    async fn recv(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Err(_) => Err(TransportError::Timeout),
            Ok(Some(datagram)) => Ok(datagram),
            Ok(None) => Err(TransportError::Closed),
        }
    }
}

struct PeerSend {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    peers: PeerMap,
}

#[async_trait]
impl DatagramSend for PeerSend {
    async fn send(&mut self, datagram: &[u8]) -> Result<()> {
        self.socket.send_to(datagram, self.peer).await?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Ok(mut peers) = self.peers.lock() {
            peers.remove(&self.peer);
        }
    }
}

/// Server side of the datagram binding.
pub struct UdpAcceptor {
    listen: String,
    crypt: CryptConfig,
    codec: DatagramCodec,
    peers: PeerMap,
    backlog: Backlog,
}

impl UdpAcceptor {
    pub fn new(listen: &str, crypt: CryptConfig, codec: DatagramCodec) -> Self {
        Self {
            listen: listen.to_string(),
            crypt,
            codec,
            peers: Arc::new(Mutex::new(HashMap::new())),
            backlog: Backlog::new(),
        }
    }

    /// Number of peers with an open link.
    pub fn peer_count(&self) -> usize {
        self.peers.lock().map(|p| p.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Acceptor for UdpAcceptor {
    fn protocol(&self) -> Protocol {
        protocol_of(self.codec)
    }

    async fn listen(&self) -> Result<SocketAddr> {
        if let Some(local) = self.backlog.local_addr() {
            return Ok(local);
        }
        let block = self.crypt.block()?;
        let socket = Arc::new(UdpSocket::bind(&self.listen).await?);
        let local = socket.local_addr()?;
        let tx = self.backlog.sender().ok_or(TransportError::Closed)?;
        let peers = self.peers.clone();
        let codec = self.codec;

        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let (n, peer) = match socket.recv_from(&mut buf).await {
                    Ok(r) => r,
                    Err(e) => {
                        debug!(error = %e, "Datagram receive failed");
                        continue;
                    }
                };
                let datagram = buf[..n].to_vec();

                let existing = peers.lock().ok().and_then(|p| p.get(&peer).cloned());
                let datagram = match existing {
                    Some(sender) => match sender.try_send(datagram) {
                        Ok(()) => continue,
                        Err(TrySendError::Full(_)) => {
                            debug!(%peer, "Peer queue full, dropping datagram");
                            continue;
                        }
                        // The link went away, treat the sender as a new peer.
                        Err(TrySendError::Closed(datagram)) => datagram,
                    },
                    None => datagram,
                };

                let (peer_tx, peer_rx) = mpsc::channel(PEER_QUEUE);
                let _ = peer_tx.try_send(datagram);
                if let Ok(mut map) = peers.lock() {
                    map.insert(peer, peer_tx);
                }
                let link = datagram_link(
                    codec,
                    Box::new(PeerRecv { rx: peer_rx }),
                    Box::new(PeerSend {
                        socket: socket.clone(),
                        peer,
                        peers: peers.clone(),
                    }),
                    block.clone(),
                    peer,
                    local,
                );
                if let Err(e) = tx.try_send(link) {
                    warn!(%peer, error = %e, "Accept backlog full, dropping peer");
                    if let Ok(mut map) = peers.lock() {
                        map.remove(&peer);
                    }
                }
            }
        });
        self.backlog.start(local, task);
        Ok(local)
    }

    async fn accept(&self) -> Result<Link> {
        self.backlog.next().await
    }

    async fn close(&self) {
        self.backlog.stop();
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.backlog.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Action, Frame};
    use crate::session::{Session, SessionHandler, SessionOptions};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullSend;

    #[async_trait]
    impl DatagramSend for NullSend {
        async fn send(&mut self, _datagram: &[u8]) -> Result<()> {
            Ok(())
        }

        async fn close(&mut self) {}
    }

    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<Frame>>,
        closed: AtomicUsize,
    }

    #[async_trait]
    impl SessionHandler for Recorder {
        async fn on_frame(&self, _session: &Session, frame: Frame) {
            self.frames.lock().unwrap().push(frame);
        }

        async fn on_close(&self, _session: &Session) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_unreadable_datagram_keeps_session() {
        let block = CryptConfig::new("aes-256-gcm", "shared-secret")
            .block()
            .unwrap();
        let (tx, rx) = mpsc::channel(8);
        let link = datagram_link(
            DatagramCodec::Plain,
            Box::new(PeerRecv { rx }),
            Box::new(NullSend),
            block.clone(),
            "192.0.2.2:4000".parse().unwrap(),
            "192.0.2.1:10002".parse().unwrap(),
        );
        let session = Session::from_link(link, SessionOptions::default());
        let recorder = Arc::new(Recorder::default());
        let task = tokio::spawn({
            let session = session.clone();
            let recorder = recorder.clone();
            async move { session.run(recorder).await }
        });

        let ping = Frame::control(Action::PingRequest, &json!({"datetime": 1})).unwrap();
        let sealed = seal(&block, ping.as_bytes()).unwrap();
        tx.send(sealed.clone()).await.unwrap();
        tx.send(b"garbage-not-sealed-by-peer-key".to_vec())
            .await
            .unwrap();
        tx.send(sealed).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while recorder.frames.lock().unwrap().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(session.is_connected());
        assert_eq!(recorder.closed.load(Ordering::SeqCst), 0);

        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(recorder.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_demux_by_source_address() {
        let acceptor = UdpAcceptor::new("127.0.0.1:0", CryptConfig::default(), DatagramCodec::Plain);
        let addr = acceptor.listen().await.unwrap().to_string();

        let a = UdpDialer::new(&addr, CryptConfig::default(), DatagramCodec::Plain);
        let b = UdpDialer::new(&addr, CryptConfig::default(), DatagramCodec::Plain);
        let mut link_a = a.connect().await.unwrap();
        let mut link_b = b.connect().await.unwrap();

        link_a.writer.write_frame(b"from-a").await.unwrap();
        let mut server_a = acceptor.accept().await.unwrap();
        assert_eq!(server_a.remote, link_a.local);

        link_b.writer.write_frame(b"from-b").await.unwrap();
        let mut server_b = acceptor.accept().await.unwrap();
        assert_eq!(server_b.remote, link_b.local);
        assert_eq!(acceptor.peer_count(), 2);

        let wait = Duration::from_secs(1);
        assert_eq!(server_a.reader.read_frame(wait).await.unwrap(), b"from-a");
        assert_eq!(server_b.reader.read_frame(wait).await.unwrap(), b"from-b");

        link_a.writer.write_frame(b"again").await.unwrap();
        assert_eq!(server_a.reader.read_frame(wait).await.unwrap(), b"again");

        server_b.writer.write_frame(b"reply").await.unwrap();
        assert_eq!(link_b.reader.read_frame(wait).await.unwrap(), b"reply");

        server_b.writer.close().await;
        assert_eq!(acceptor.peer_count(), 1);
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let acceptor = UdpAcceptor::new("127.0.0.1:0", CryptConfig::default(), DatagramCodec::Plain);
        let addr = acceptor.listen().await.unwrap().to_string();
        let dialer = UdpDialer::new(&addr, CryptConfig::default(), DatagramCodec::Plain);
        let mut link = dialer.connect().await.unwrap();
        let err = link
            .reader
            .read_frame(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }
}
