//! WebSocket binding. Each frame travels as one binary message.

use super::{
    Acceptor, Backlog, BoxStream, Dialer, FrameReader, FrameWriter, HANDSHAKE_TIMEOUT, Link,
    Protocol, Result, TransportError, open, seal, tls,
};
use crate::crypt::{BlockCrypt, CryptConfig};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use rustls::{ClientConfig, ServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

type Socket = WebSocketStream<BoxStream>;

pub struct WsReader {
    stream: SplitStream<Socket>,
    block: Option<Arc<dyn BlockCrypt>>,
}

#[async_trait]
impl FrameReader for WsReader {
    async fn read_frame(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let msg = tokio::time::timeout_at(deadline, self.stream.next())
                .await
                .map_err(|_| TransportError::Timeout)?;
            match msg {
                None | Some(Ok(Message::Close(_))) => return Err(TransportError::Closed),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Message::Binary(data))) => return open(&self.block, data),
                // Pings are answered by tungstenite on the next write.
                Some(Ok(_)) => continue,
            }
        }
    }
}

pub struct WsWriter {
    sink: SplitSink<Socket, Message>,
    block: Option<Arc<dyn BlockCrypt>>,
}

#[async_trait]
impl FrameWriter for WsWriter {
    async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        let data = seal(&self.block, frame)?;
        self.sink.send(Message::Binary(data)).await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.sink.close().await;
    }
}

fn ws_link(
    socket: Socket,
    block: Option<Arc<dyn BlockCrypt>>,
    remote: SocketAddr,
    local: SocketAddr,
) -> Link {
    let (sink, stream) = socket.split();
    Link {
        reader: Box::new(WsReader {
            stream,
            block: block.clone(),
        }),
        writer: Box::new(WsWriter { sink, block }),
        remote,
        local,
    }
}

/// Client side of the WebSocket binding.
pub struct WsDialer {
    address: String,
    crypt: CryptConfig,
    /// `Some` for `wss`, with an optional custom client configuration.
    tls: Option<Option<Arc<ClientConfig>>>,
}

impl WsDialer {
    pub fn new(
        address: &str,
        crypt: CryptConfig,
        tls: Option<Option<Arc<ClientConfig>>>,
    ) -> Self {
        Self {
            address: address.to_string(),
            crypt,
            tls,
        }
    }

    fn url(&self) -> String {
        let scheme = if self.tls.is_some() { "wss" } else { "ws" };
        format!("{scheme}://{}/", self.address)
    }
}

#[async_trait]
impl Dialer for WsDialer {
    fn protocol(&self) -> Protocol {
        if self.tls.is_some() {
            Protocol::Wss
        } else {
            Protocol::Ws
        }
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
            Some(config) => {
                let config = match config {
                    Some(config) => config.clone(),
                    None => tls::client_config(None)?,
                };
                tls::connect(config, &self.address, tcp).await?
            }
            None => Box::new(tcp),
        };

        let url = self.url();
        let (socket, _) = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            tokio_tungstenite::client_async(url.as_str(), stream),
        )
        .await
        .map_err(|_| TransportError::Timeout)??;
        debug!(%url, "WebSocket connected");
        Ok(ws_link(socket, block, remote, local))
    }
}

/// Server side of the WebSocket binding.
pub struct WsAcceptor {
    listen: String,
    crypt: CryptConfig,
    tls: Option<Arc<ServerConfig>>,
    backlog: Backlog,
}

impl WsAcceptor {
    pub fn new(listen: &str, crypt: CryptConfig, tls: Option<Arc<ServerConfig>>) -> Self {
        Self {
            listen: listen.to_string(),
            crypt,
            tls,
            backlog: Backlog::new(),
        }
    }
}

async fn upgrade(
    tcp: TcpStream,
    tls: Option<Arc<ServerConfig>>,
) -> Result<Socket> {
    let stream: BoxStream = match tls {
        Some(config) => tls::accept(config, tcp).await?,
        None => Box::new(tcp),
    };
    let socket = tokio::time::timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::accept_async(stream))
        .await
        .map_err(|_| TransportError::Timeout)??;
    Ok(socket)
}

#[async_trait]
impl Acceptor for WsAcceptor {
    fn protocol(&self) -> Protocol {
        if self.tls.is_some() {
            Protocol::Wss
        } else {
            Protocol::Ws
        }
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
                        warn!(error = %e, "WebSocket accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };
                let _ = tcp.set_nodelay(true);
                let tx = tx.clone();
                let tls = tls.clone();
                let block = block.clone();
                tokio::spawn(async move {
                    match upgrade(tcp, tls).await {
                        Ok(socket) => {
                            let _ = tx.send(ws_link(socket, block, remote, local)).await;
                        }
                        Err(e) => debug!(%remote, error = %e, "WebSocket upgrade failed"),
                    }
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

    #[tokio::test]
    async fn test_loopback_binary_messages() {
        let crypt = CryptConfig::new("xor", "key");
        let acceptor = WsAcceptor::new("127.0.0.1:0", crypt.clone(), None);
        let addr = acceptor.listen().await.unwrap();

        let dialer = WsDialer::new(&addr.to_string(), crypt, None);
        assert_eq!(dialer.url(), format!("ws://{addr}/"));
        let mut client = dialer.connect().await.unwrap();
        let mut server = acceptor.accept().await.unwrap();

        let wait = Duration::from_secs(2);
        client.writer.write_frame(b"\x01{}").await.unwrap();
        assert_eq!(server.reader.read_frame(wait).await.unwrap(), b"\x01{}");

        server.writer.write_frame(b"\x06{}").await.unwrap();
        assert_eq!(client.reader.read_frame(wait).await.unwrap(), b"\x06{}");

        client.writer.close().await;
        assert!(server.reader.read_frame(wait).await.is_err());
    }
}
