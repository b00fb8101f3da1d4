//! Stream binding: TCP, optionally wrapped in TLS.
//!
//! Each frame is prefixed with a two byte magic and its length:
//!
//! ```text
//! +------+------+----------+----------------+
//! | 0xff | 0xff | len (BE) | sealed frame   |
//! +------+------+----------+----------------+
//! ```

use super::{
    Acceptor, Backlog, BoxStream, Dialer, FrameReader, FrameWriter, Link, Protocol, Result,
    TransportError, open, seal, tls,
};
use crate::crypt::{BlockCrypt, CryptConfig, SEAL_OVERHEAD};
use crate::frame::MAX_FRAME;
use async_trait::async_trait;
use rustls::{ClientConfig, ServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tracing::{debug, warn};

const MAGIC: [u8; 2] = [0xff, 0xff];
const HEADER_LEN: usize = 4;
const MAX_SEALED: usize = MAX_FRAME + SEAL_OVERHEAD;

/// Prefix `frame` with the stream header.
pub fn encode(frame: &[u8]) -> Result<Vec<u8>> {
    if frame.len() > MAX_SEALED {
        return Err(TransportError::Oversize(frame.len()));
    }
    let mut packet = Vec::with_capacity(HEADER_LEN + frame.len());
    packet.extend_from_slice(&MAGIC);
    packet.extend_from_slice(&(frame.len() as u16).to_be_bytes());
    packet.extend_from_slice(frame);
    Ok(packet)
}

/// Reads framed messages from a byte stream.
///
/// Partial reads are buffered, so a read that times out in the middle of a
/// frame resumes where it left off.
pub struct StreamReader<R> {
    io: R,
    buf: Vec<u8>,
    block: Option<Arc<dyn BlockCrypt>>,
}

impl<R: AsyncRead + Unpin + Send> StreamReader<R> {
    pub fn new(io: R, block: Option<Arc<dyn BlockCrypt>>) -> Self {
        Self {
            io,
            buf: Vec::with_capacity(2 * (HEADER_LEN + MAX_SEALED)),
            block,
        }
    }

    fn take_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        if self.buf[..2] != MAGIC {
            return Err(TransportError::Framing(format!(
                "bad magic {:02x}{:02x}",
                self.buf[0], self.buf[1]
            )));
        }
        let size = u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize;
        if size > MAX_SEALED {
            return Err(TransportError::Oversize(size));
        }
        if self.buf.len() < HEADER_LEN + size {
            return Ok(None);
        }
        let frame = self.buf[HEADER_LEN..HEADER_LEN + size].to_vec();
        self.buf.drain(..HEADER_LEN + size);
        Ok(Some(frame))
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> FrameReader for StreamReader<R> {
    async fn read_frame(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(frame) = self.take_frame()? {
                return open(&self.block, frame);
            }
            let n = tokio::time::timeout_at(deadline, self.io.read(&mut chunk))
                .await
                .map_err(|_| TransportError::Timeout)??;
            if n == 0 {
                return Err(TransportError::Closed);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Writes framed messages to a byte stream.
pub struct StreamWriter<W> {
    io: W,
    block: Option<Arc<dyn BlockCrypt>>,
}

impl<W: AsyncWrite + Unpin + Send> StreamWriter<W> {
    pub fn new(io: W, block: Option<Arc<dyn BlockCrypt>>) -> Self {
        Self { io, block }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameWriter for StreamWriter<W> {
    async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        let packet = encode(&seal(&self.block, frame)?)?;
        self.io.write_all(&packet).await?;
        self.io.flush().await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.io.shutdown().await;
    }
}

fn stream_link(
    stream: BoxStream,
    block: Option<Arc<dyn BlockCrypt>>,
    remote: SocketAddr,
    local: SocketAddr,
) -> Link {
    let (rd, wr): (ReadHalf<BoxStream>, WriteHalf<BoxStream>) = tokio::io::split(stream);
    Link {
        reader: Box::new(StreamReader::new(rd, block.clone())),
        writer: Box::new(StreamWriter::new(wr, block)),
        remote,
        local,
    }
}

/// Client side of the stream binding.
pub struct TcpDialer {
    address: String,
    crypt: CryptConfig,
    tls: Option<Arc<ClientConfig>>,
}

impl TcpDialer {
    pub fn new(address: &str, crypt: CryptConfig, tls: Option<Arc<ClientConfig>>) -> Self {
        Self {
            address: address.to_string(),
            crypt,
            tls,
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    fn address(&self) -> &str {
        &self.address
    }

    async fn connect(&self) -> Result<Link> {
        let block = self.crypt.block()?;
        let tcp = TcpStream::connect(&self.address).await?;
        tcp.set_nodelay(true)?;
        let remote = tcp.peer_addr()?;
        let local = tcp.local_addr()?;

        let stream: BoxStream = match &self.tls {
            Some(config) => tls::connect(config.clone(), &self.address, tcp).await?,
            None => Box::new(tcp),
        };
        debug!(%remote, tls = self.tls.is_some(), "Stream connected");
        Ok(stream_link(stream, block, remote, local))
    }
}

/// Server side of the stream binding.
pub struct TcpAcceptor {
    listen: String,
    crypt: CryptConfig,
    tls: Option<Arc<ServerConfig>>,
    backlog: Backlog,
}

impl TcpAcceptor {
    pub fn new(listen: &str, crypt: CryptConfig, tls: Option<Arc<ServerConfig>>) -> Self {
        Self {
            listen: listen.to_string(),
            crypt,
            tls,
            backlog: Backlog::new(),
        }
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    async fn listen(&self) -> Result<SocketAddr> {
        if let Some(local) = self.backlog.local_addr() {
            return Ok(local);
        }
        let block = self.crypt.block()?;
        let listener = TcpListener::bind(&self.listen).await?;
        let local = listener.local_addr()?;
        let tx = self.backlog.sender().ok_or(TransportError::Closed)?;
        let tls = self.tls.clone();

        let task = tokio::spawn(async move {
            loop {
                let (tcp, remote) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "Stream accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };
                let _ = tcp.set_nodelay(true);
                let tx = tx.clone();
                let tls = tls.clone();
                let block = block.clone();
                tokio::spawn(async move {
                    let stream: BoxStream = match tls {
                        Some(config) => match tls::accept(config, tcp).await {
                            Ok(stream) => stream,
                            Err(e) => {
                                debug!(%remote, error = %e, "TLS handshake failed");
                                return;
                            }
                        },
                        None => Box::new(tcp),
                    };
                    let _ = tx.send(stream_link(stream, block, remote, local)).await;
                });
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
    use crate::crypt::CryptConfig;

    #[test]
    fn test_encode_header() {
        let packet = encode(b"abc").unwrap();
        assert_eq!(packet, vec![0xff, 0xff, 0x00, 0x03, b'a', b'b', b'c']);
    }

    #[test]
    fn test_encode_rejects_oversize() {
        assert!(encode(&vec![0u8; MAX_SEALED + 1]).is_err());
    }

    #[tokio::test]
    async fn test_reader_resumes_split_frame() {
        let (client, server) = tokio::io::duplex(64);
        let mut reader = StreamReader::new(server, None);
        let (_, mut wr) = tokio::io::split(client);

        let packet = encode(&[9u8; 40]).unwrap();
        wr.write_all(&packet[..10]).await.unwrap();
        let err = reader.read_frame(Duration::from_millis(20)).await.unwrap_err();
        assert!(err.is_timeout());

        wr.write_all(&packet[10..]).await.unwrap();
        let frame = reader.read_frame(Duration::from_secs(1)).await.unwrap();
        assert_eq!(frame, vec![9u8; 40]);
    }

    #[tokio::test]
    async fn test_reader_rejects_bad_magic() {
        let (client, server) = tokio::io::duplex(64);
        let mut reader = StreamReader::new(server, None);
        let (_, mut wr) = tokio::io::split(client);
        wr.write_all(&[0x12, 0x34, 0x00, 0x01, 0x00]).await.unwrap();
        let err = reader.read_frame(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, TransportError::Framing(_)));
    }

    #[tokio::test]
    async fn test_reader_reports_close() {
        let (client, server) = tokio::io::duplex(64);
        let mut reader = StreamReader::new(server, None);
        drop(client);
        let err = reader.read_frame(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test]
    async fn test_loopback_with_cipher() {
        let crypt = CryptConfig::new("aes-256-gcm", "s3cret");
        let acceptor = TcpAcceptor::new("127.0.0.1:0", crypt.clone(), None);
        let addr = acceptor.listen().await.unwrap();
        assert_eq!(acceptor.listen().await.unwrap(), addr);

        let dialer = TcpDialer::new(&addr.to_string(), crypt, None);
        let mut client = dialer.connect().await.unwrap();
        let mut server = acceptor.accept().await.unwrap();
        assert_eq!(server.remote, client.local);

        client.writer.write_frame(b"\x03{}").await.unwrap();
        let frame = server.reader.read_frame(Duration::from_secs(1)).await.unwrap();
        assert_eq!(frame, b"\x03{}");

        server.writer.write_frame(b"\x04{}").await.unwrap();
        let frame = client.reader.read_frame(Duration::from_secs(1)).await.unwrap();
        assert_eq!(frame, b"\x04{}");

        acceptor.close().await;
        assert!(acceptor.accept().await.is_err());
    }
}
