//! Transport bindings.
//!
//! Every wire transport is reduced to the same capability set: a [`Dialer`]
//! producing a [`Link`] on the client side, an [`Acceptor`] producing links on
//! the server side, and the two halves of a link, [`FrameReader`] and
//! [`FrameWriter`]. Sessions and listeners never see a concrete transport.
//!
//! ```text
//! tcp  stream, [0xff 0xff][len u16][bytes], optional TLS
//! udp  one datagram per frame
//! fec  datagrams with one XOR parity shard per group
//! ws   binary WebSocket messages, wss runs over TLS
//! ```

pub mod fec;
pub mod tcp;
pub mod tls;
pub mod udp;
pub mod ws;

use crate::crypt::{BlockCrypt, CryptConfig, CryptError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use fec::FecConfig;

/// Links waiting to be picked up by `Acceptor::accept`.
const ACCEPT_BACKLOG: usize = 128;

/// Time allowed for a TLS or WebSocket handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("read timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    #[error("cipher error: {0}")]
    Crypt(#[from] CryptError),

    #[error("invalid frame header: {0}")]
    Framing(String),

    #[error("frame of {0} bytes exceeds transport limit")]
    Oversize(usize),

    #[error("cannot resolve address {0}")]
    Address(String),

    #[error("{0} requires a server certificate")]
    MissingCertificate(Protocol),
}

impl TransportError {
    /// A timeout is recoverable, everything else ends the connection.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        TransportError::WebSocket(Box::new(e))
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Wire transport selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Fec,
    Ws,
    Wss,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Fec => "fec",
            Protocol::Ws => "ws",
            Protocol::Wss => "wss",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "fec" | "kcp" => Ok(Protocol::Fec),
            "ws" => Ok(Protocol::Ws),
            "wss" => Ok(Protocol::Wss),
            other => Err(format!("unknown protocol: {other}")),
        }
    }
}

/// Everything a binding needs besides the address.
#[derive(Clone, Default)]
pub struct TransportConfig {
    pub protocol: Protocol,
    pub crypt: CryptConfig,
    pub fec: FecConfig,
    /// Server certificate; enables TLS on `tcp` and is required by `wss`.
    pub tls_server: Option<Arc<rustls::ServerConfig>>,
    /// Client TLS settings; enables TLS on `tcp`, `wss` falls back to
    /// [`tls::client_config`] without a CA.
    pub tls_client: Option<Arc<rustls::ClientConfig>>,
}

impl TransportConfig {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            ..Default::default()
        }
    }

    pub fn with_crypt(mut self, crypt: CryptConfig) -> Self {
        self.crypt = crypt;
        self
    }
}

/// Receiving half of a connection.
#[async_trait]
pub trait FrameReader: Send {
    /// Wait for one complete frame, at most `timeout`.
    ///
    /// Returns [`TransportError::Timeout`] when nothing arrived in time and
    /// [`TransportError::Closed`] once the peer is gone.
    async fn read_frame(&mut self, timeout: Duration) -> Result<Vec<u8>>;
}

/// Sending half of a connection.
///
/// Callers serialize writes, a binding never sees two concurrent writers.
#[async_trait]
pub trait FrameWriter: Send {
    async fn write_frame(&mut self, frame: &[u8]) -> Result<()>;

    /// Release the transport. Errors are ignored.
    async fn close(&mut self);
}

/// One established connection.
pub struct Link {
    pub reader: Box<dyn FrameReader>,
    pub writer: Box<dyn FrameWriter>,
    pub remote: SocketAddr,
    pub local: SocketAddr,
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("remote", &self.remote)
            .field("local", &self.local)
            .finish()
    }
}

/// Client side of a transport.
#[async_trait]
pub trait Dialer: Send + Sync {
    fn protocol(&self) -> Protocol;

    fn address(&self) -> &str;

    /// Establish a connection, including cipher and TLS setup.
    async fn connect(&self) -> Result<Link>;
}

/// Server side of a transport.
#[async_trait]
pub trait Acceptor: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Bind the listening socket. Calling it again is a no-op.
    async fn listen(&self) -> Result<SocketAddr>;

    /// Wait for the next connection.
    async fn accept(&self) -> Result<Link>;

    /// Stop accepting. Established links stay open.
    async fn close(&self);

    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Build the dialer for `protocol`.
pub fn dialer(address: &str, config: &TransportConfig) -> Arc<dyn Dialer> {
    match config.protocol {
        Protocol::Tcp => Arc::new(tcp::TcpDialer::new(
            address,
            config.crypt.clone(),
            config.tls_client.clone(),
        )),
        Protocol::Udp => Arc::new(udp::UdpDialer::new(
            address,
            config.crypt.clone(),
            udp::DatagramCodec::Plain,
        )),
        Protocol::Fec => Arc::new(udp::UdpDialer::new(
            address,
            config.crypt.clone(),
            udp::DatagramCodec::Fec(config.fec),
        )),
        Protocol::Ws => Arc::new(ws::WsDialer::new(address, config.crypt.clone(), None)),
        Protocol::Wss => Arc::new(ws::WsDialer::new(
            address,
            config.crypt.clone(),
            Some(config.tls_client.clone()),
        )),
    }
}

/// Build the acceptor for `protocol`.
pub fn acceptor(listen: &str, config: &TransportConfig) -> Result<Arc<dyn Acceptor>> {
    let acceptor: Arc<dyn Acceptor> = match config.protocol {
        Protocol::Tcp => Arc::new(tcp::TcpAcceptor::new(
            listen,
            config.crypt.clone(),
            config.tls_server.clone(),
        )),
        Protocol::Udp => Arc::new(udp::UdpAcceptor::new(
            listen,
            config.crypt.clone(),
            udp::DatagramCodec::Plain,
        )),
        Protocol::Fec => Arc::new(udp::UdpAcceptor::new(
            listen,
            config.crypt.clone(),
            udp::DatagramCodec::Fec(config.fec),
        )),
        Protocol::Ws => Arc::new(ws::WsAcceptor::new(listen, config.crypt.clone(), None)),
        Protocol::Wss => {
            let tls = config
                .tls_server
                .clone()
                .ok_or(TransportError::MissingCertificate(Protocol::Wss))?;
            Arc::new(ws::WsAcceptor::new(listen, config.crypt.clone(), Some(tls)))
        }
    };
    Ok(acceptor)
}

/// A byte stream that may or may not be wrapped in TLS.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxStream = Box<dyn AsyncStream>;

pub(crate) fn seal(block: &Option<Arc<dyn BlockCrypt>>, frame: &[u8]) -> Result<Vec<u8>> {
    let mut data = frame.to_vec();
    if let Some(block) = block {
        block.seal(&mut data)?;
    }
    Ok(data)
}

pub(crate) fn open(block: &Option<Arc<dyn BlockCrypt>>, mut data: Vec<u8>) -> Result<Vec<u8>> {
    if let Some(block) = block {
        block.open(&mut data)?;
    }
    Ok(data)
}

pub(crate) async fn resolve(address: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(address)
        .await?
        .next()
        .ok_or_else(|| TransportError::Address(address.to_string()))
}

/// Links produced by a background intake task, handed out by `accept`.
pub(crate) struct Backlog {
    tx: Mutex<Option<mpsc::Sender<Link>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Link>>,
    task: Mutex<Option<JoinHandle<()>>>,
    local: Mutex<Option<SocketAddr>>,
}

impl Backlog {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            task: Mutex::new(None),
            local: Mutex::new(None),
        }
    }

    pub(crate) fn sender(&self) -> Option<mpsc::Sender<Link>> {
        self.tx.lock().ok()?.clone()
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.local.lock().ok().and_then(|l| *l)
    }

    pub(crate) fn start(&self, local: SocketAddr, task: JoinHandle<()>) {
        if let Ok(mut guard) = self.local.lock() {
            *guard = Some(local);
        }
        if let Ok(mut guard) = self.task.lock() {
            *guard = Some(task);
        }
    }

    pub(crate) async fn next(&self) -> Result<Link> {
        self.rx.lock().await.recv().await.ok_or(TransportError::Closed)
    }

    pub(crate) fn stop(&self) {
        if let Ok(mut guard) = self.task.lock()
            && let Some(task) = guard.take()
        {
            task.abort();
        }
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_parse() {
        assert_eq!("tcp".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!("kcp".parse::<Protocol>().unwrap(), Protocol::Fec);
        assert_eq!("wss".parse::<Protocol>().unwrap(), Protocol::Wss);
        assert!("sctp".parse::<Protocol>().is_err());
    }

    #[test]
    fn test_protocol_serde() {
        let p: Protocol = serde_json::from_str("\"ws\"").unwrap();
        assert_eq!(p, Protocol::Ws);
        assert_eq!(serde_json::to_string(&Protocol::Fec).unwrap(), "\"fec\"");
    }

    #[test]
    fn test_wss_acceptor_requires_certificate() {
        let err = acceptor("127.0.0.1:0", &TransportConfig::new(Protocol::Wss))
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::MissingCertificate(Protocol::Wss)));
    }
}
