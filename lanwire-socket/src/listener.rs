//! Listener: turns accepted links into sessions and drives their events.
//!
//! [`Listener::accept`] pulls links from the transport and promotes each one
//! to a [`Session`]; [`Listener::run_loop`] delivers the resulting events to
//! a [`SessionHandler`]. A session's `on_connected` always completes before
//! its read loop starts.

use crate::session::{Session, SessionHandler, SessionId, SessionOptions};
use crate::transport::{Acceptor, Protocol, TransportError};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};

/// Events buffered between the accept loop and the event loop.
const EVENT_QUEUE: usize = 256;

#[derive(Debug)]
enum Event {
    Accepted(Session),
    Closed(SessionId),
}

/// Server side of the session layer.
pub struct Listener {
    acceptor: Arc<dyn Acceptor>,
    options: SessionOptions,
    sessions: RwLock<HashMap<SessionId, Session>>,
    events_tx: mpsc::Sender<Event>,
    events_rx: Mutex<Option<mpsc::Receiver<Event>>>,
    shutdown: watch::Sender<bool>,
}

async fn closed(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closed| *closed).await;
}

impl Listener {
    pub fn new(acceptor: Arc<dyn Acceptor>, options: SessionOptions) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (shutdown, _) = watch::channel(false);
        Self {
            acceptor,
            options,
            sessions: RwLock::new(HashMap::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            shutdown,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.acceptor.protocol()
    }

    /// Bind the transport. Calling it again returns the same address.
    pub async fn listen(&self) -> Result<SocketAddr, TransportError> {
        let addr = self.acceptor.listen().await?;
        info!(protocol = %self.protocol(), %addr, "Listening");
        Ok(addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.acceptor.local_addr()
    }

    /// Accept connections until [`Listener::close`].
    pub async fn accept(&self) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let link = tokio::select! {
                _ = closed(&mut shutdown) => break,
                link = self.acceptor.accept() => link,
            };
            match link {
                Ok(link) => {
                    let session = Session::from_link(link, self.options);
                    debug!(session = %session, "Connection accepted");
                    if self.events_tx.send(Event::Accepted(session.clone())).await.is_err() {
                        session.close();
                        break;
                    }
                }
                Err(TransportError::Closed) => break,
                Err(e) => warn!(error = %e, "Accept failed"),
            }
        }
        debug!("Accept loop stopped");
    }

    /// Deliver connection events to `handler` until [`Listener::close`].
    ///
    /// Only one event loop may run; a second call returns immediately.
    pub async fn run_loop(&self, handler: Arc<dyn SessionHandler>) {
        let Some(mut events) = self.events_rx.lock().await.take() else {
            warn!("Listener event loop already running");
            return;
        };
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let event = tokio::select! {
                _ = closed(&mut shutdown) => break,
                event = events.recv() => event,
            };
            match event {
                Some(Event::Accepted(session)) => self.on_accepted(session, &handler).await,
                Some(Event::Closed(id)) => {
                    self.remove(id);
                }
                None => break,
            }
        }
        debug!("Event loop stopped");
    }

    async fn on_accepted(&self, session: Session, handler: &Arc<dyn SessionHandler>) {
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.insert(session.id(), session.clone());
        }
        handler.on_connected(&session).await;

        let handler = handler.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            session.run(handler).await;
            let _ = events.send(Event::Closed(session.id())).await;
        });
    }

    fn remove(&self, id: SessionId) -> Option<Session> {
        self.sessions.write().ok()?.remove(&id)
    }

    /// Close one session and forget it.
    pub fn off_client(&self, session: &Session) {
        session.close();
        self.remove(session.id());
    }

    /// Snapshot of live sessions.
    pub fn sessions(&self) -> Vec<Session> {
        self.sessions
            .read()
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Stop accepting and close every live session.
    pub async fn close(&self) {
        self.shutdown.send_replace(true);
        self.acceptor.close().await;
        let sessions: Vec<Session> = self
            .sessions
            .write()
            .map(|mut s| s.drain().map(|(_, v)| v).collect())
            .unwrap_or_default();
        for session in &sessions {
            session.close();
        }
        info!(closed = sessions.len(), "Listener closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypt::CryptConfig;
    use crate::frame::{Action, Frame};
    use crate::transport::tcp::{TcpAcceptor, TcpDialer};
    use crate::transport::Dialer;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Events {
        log: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl SessionHandler for Events {
        async fn on_connected(&self, _session: &Session) {
            self.log.lock().unwrap().push("connected".into());
        }

        async fn on_frame(&self, session: &Session, frame: Frame) {
            self.log.lock().unwrap().push(format!("frame:{:?}", frame.action()));
            let pong = Frame::control(Action::PingResponse, &serde_json::json!({})).unwrap();
            session.write(&pong).await.unwrap();
        }

        async fn on_close(&self, _session: &Session) {
            self.log.lock().unwrap().push("closed".into());
        }
    }

    #[tokio::test]
    async fn test_connected_before_frames_and_close_all() {
        let acceptor = Arc::new(TcpAcceptor::new("127.0.0.1:0", CryptConfig::default(), None));
        let listener = Arc::new(Listener::new(acceptor, SessionOptions::default()));
        let addr = listener.listen().await.unwrap();
        let handler = Arc::new(Events::default());

        let accept = tokio::spawn({
            let listener = listener.clone();
            async move { listener.accept().await }
        });
        let events = tokio::spawn({
            let listener = listener.clone();
            let handler = handler.clone();
            async move { listener.run_loop(handler).await }
        });

        let dialer = TcpDialer::new(&addr.to_string(), CryptConfig::default(), None);
        let mut link = dialer.connect().await.unwrap();
        let ping = Frame::control(Action::PingRequest, &serde_json::json!({})).unwrap();
        link.writer.write_frame(ping.as_bytes()).await.unwrap();
        let reply = link.reader.read_frame(Duration::from_secs(2)).await.unwrap();
        assert_eq!(Frame::decode(reply).unwrap().action(), Some(Action::PingResponse));
        assert_eq!(listener.session_count(), 1);

        listener.close().await;
        accept.await.unwrap();
        events.await.unwrap();
        assert_eq!(listener.session_count(), 0);

        // The peer observes the close.
        assert!(link.reader.read_frame(Duration::from_secs(2)).await.is_err());
        let log = handler.log.lock().unwrap().clone();
        assert_eq!(log[0], "connected");
        assert_eq!(log[1], "frame:Some(PingRequest)");
    }
}
