//! Sessions: one logical connection on top of any transport binding.
//!
//! A session owns the two halves of a [`Link`]. Reads run in the caller's
//! task through [`Session::run`]; writes go through a bounded queue drained
//! by a dedicated sender task, so frames are never interleaved on the wire.
//!
//! ```text
//!            connect() ok               read/write error, close(), leave
//! Connecting ------------> Connected ----------------------------------> Closed
//!     ^                                                                    |
//!     +-------------------- backoff (client sessions only) ----------------+
//!
//! terminate(): any state -> Terminal, no reconnect
//! ```

use crate::backoff::Backoff;
use crate::frame::{Frame, FrameError};
use crate::transport::{Dialer, FrameReader, FrameWriter, Link, TransportError};
use async_trait::async_trait;
use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

pub type SessionId = u64;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} is not connected")]
    NotConnected(String),

    #[error("session {0} is terminated")]
    Terminated(String),

    #[error("connect already in progress for {0}")]
    InProgress(String),

    #[error("session {0} has no dialer")]
    NoDialer(String),

    #[error("write queue full, frame dropped")]
    QueueFull,

    #[error("write timed out, frame dropped")]
    WriteTimeout,

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Connecting,
    Connected,
    Closed,
    /// Closed for good; a client session never reconnects from here.
    Terminal,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Connecting => "connecting",
            Status::Connected => "connected",
            Status::Closed => "closed",
            Status::Terminal => "terminal",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tunables shared by every session of a listener or client.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// Read timeout handed to the transport.
    pub timeout: Duration,
    /// Consecutive read timeouts before the session is closed, 0 disables.
    pub idle_timeouts: u32,
    /// Frames queued for the sender task.
    pub write_queue: usize,
    /// How long `write` waits for queue space before dropping the frame.
    pub write_timeout: Duration,
    pub backoff: Backoff,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            idle_timeouts: 4,
            write_queue: 1024,
            write_timeout: Duration::from_secs(1),
            backoff: Backoff::default(),
        }
    }
}

/// Callbacks invoked by the session for its connection events.
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    /// Called once per established connection, before any frame is read.
    async fn on_connected(&self, _session: &Session) {}

    /// Called for every decoded frame, in read order.
    async fn on_frame(&self, session: &Session, frame: Frame);

    /// Called once when a connection ends, whatever the reason.
    async fn on_close(&self, _session: &Session) {}
}

struct State {
    remote: Option<SocketAddr>,
    local: Option<SocketAddr>,
    writer: Option<mpsc::Sender<Vec<u8>>>,
    reader: Option<Box<dyn FrameReader>>,
    shutdown: Option<watch::Sender<bool>>,
    shutdown_rx: Option<watch::Receiver<bool>>,
    generation: u64,
    attempts: u32,
    last_attempt: Option<Instant>,
}

struct Inner {
    id: SessionId,
    address: String,
    options: SessionOptions,
    dialer: Option<Arc<dyn Dialer>>,
    state: Mutex<State>,
    status: watch::Sender<Status>,
    private: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
    connecting: AtomicBool,
    dropped: AtomicU64,
}

/// One endpoint connection. Cheap to clone, clones share the connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    fn with(address: String, options: SessionOptions, dialer: Option<Arc<dyn Dialer>>) -> Self {
        let (status, _) = watch::channel(Status::Closed);
        Self {
            inner: Arc::new(Inner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                address,
                options,
                dialer,
                state: Mutex::new(State {
                    remote: None,
                    local: None,
                    writer: None,
                    reader: None,
                    shutdown: None,
                    shutdown_rx: None,
                    generation: 0,
                    attempts: 0,
                    last_attempt: None,
                }),
                status,
                private: Mutex::new(None),
                connecting: AtomicBool::new(false),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// A client session that dials `dialer` and reconnects on failure.
    pub fn client(dialer: Arc<dyn Dialer>, options: SessionOptions) -> Self {
        Self::with(dialer.address().to_string(), options, Some(dialer))
    }

    /// A server session for an accepted link, already connected.
    pub fn from_link(link: Link, options: SessionOptions) -> Self {
        let session = Self::with(link.remote.to_string(), options, None);
        session.attach(link);
        session
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_status(&self, status: Status) {
        self.inner.status.send_if_modified(|current| {
            if *current == Status::Terminal || *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    /// Dial address for clients, remote address for accepted sessions.
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.state().remote
    }

    pub fn local(&self) -> Option<SocketAddr> {
        self.state().local
    }

    pub fn status(&self) -> Status {
        *self.inner.status.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == Status::Connected
    }

    /// Follow status changes.
    pub fn watch_status(&self) -> watch::Receiver<Status> {
        self.inner.status.subscribe()
    }

    /// Frames dropped because the write queue was full.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Failed connect attempts since the last successful one.
    pub fn attempts(&self) -> u32 {
        self.state().attempts
    }

    pub fn last_attempt(&self) -> Option<Instant> {
        self.state().last_attempt
    }

    pub fn options(&self) -> &SessionOptions {
        &self.inner.options
    }

    /// Attach an opaque value, replacing any previous one.
    pub fn set_private<T: Any + Send + Sync>(&self, value: Arc<T>) {
        if let Ok(mut private) = self.inner.private.lock() {
            *private = Some(value);
        }
    }

    /// The attached value, if one of type `T` is set.
    pub fn private<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let value = self.inner.private.lock().ok()?.clone()?;
        value.downcast::<T>().ok()
    }

    pub fn clear_private(&self) {
        if let Ok(mut private) = self.inner.private.lock() {
            private.take();
        }
    }

    /// Install a fresh connection and start its sender task.
    fn attach(&self, link: Link) {
        let (tx, rx) = mpsc::channel(self.inner.options.write_queue.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let generation = {
            let mut state = self.state();
            state.generation += 1;
            state.remote = Some(link.remote);
            state.local = Some(link.local);
            state.writer = Some(tx);
            state.reader = Some(link.reader);
            state.shutdown = Some(shutdown);
            state.shutdown_rx = Some(shutdown_rx);
            state.generation
        };
        self.set_status(Status::Connected);
        tokio::spawn(send_loop(
            Arc::downgrade(&self.inner),
            link.writer,
            rx,
            generation,
        ));
    }

    /// Dial once and install the connection.
    pub async fn connect(&self) -> Result<()> {
        let dialer = self
            .inner
            .dialer
            .clone()
            .ok_or_else(|| SessionError::NoDialer(self.to_string()))?;
        if self.status() == Status::Terminal {
            return Err(SessionError::Terminated(self.to_string()));
        }
        if self
            .inner
            .connecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SessionError::InProgress(self.to_string()));
        }

        self.set_status(Status::Connecting);
        self.state().last_attempt = Some(Instant::now());
        let result = dialer.connect().await;
        self.inner.connecting.store(false, Ordering::Release);

        match result {
            Ok(link) => {
                if self.status() == Status::Terminal {
                    let mut writer = link.writer;
                    writer.close().await;
                    return Err(SessionError::Terminated(self.to_string()));
                }
                info!(session = %self, remote = %link.remote, "Session connected");
                self.state().attempts = 0;
                self.attach(link);
                Ok(())
            }
            Err(e) => {
                self.state().attempts += 1;
                self.set_status(Status::Closed);
                Err(e.into())
            }
        }
    }

    /// Read frames and hand them to `handler` until the connection ends.
    ///
    /// Frames that fail to decode are dropped; transport errors and
    /// `idle_timeouts` consecutive read timeouts end the connection.
    pub async fn run(&self, handler: Arc<dyn SessionHandler>) {
        let taken = {
            let mut state = self.state();
            match (state.reader.take(), state.shutdown_rx.take()) {
                (Some(reader), Some(shutdown)) => Some((reader, shutdown, state.generation)),
                _ => None,
            }
        };
        let Some((mut reader, mut shutdown, generation)) = taken else {
            return;
        };

        let options = self.inner.options;
        let mut idle = 0u32;
        loop {
            let result = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                r = reader.read_frame(options.timeout) => r,
            };
            match result {
                Ok(raw) => {
                    idle = 0;
                    match Frame::decode(raw) {
                        Ok(frame) => {
                            trace!(session = %self, control = frame.is_control(), len = frame.len(), "Frame received");
                            handler.on_frame(self, frame).await;
                        }
                        Err(e) => debug!(session = %self, error = %e, "Dropping undecodable frame"),
                    }
                }
                Err(e) if e.is_timeout() => {
                    idle += 1;
                    if options.idle_timeouts > 0 && idle >= options.idle_timeouts {
                        info!(session = %self, idle, "Session idle, closing");
                        break;
                    }
                }
                Err(TransportError::Closed) => {
                    debug!(session = %self, "Peer closed connection");
                    break;
                }
                Err(e) => {
                    warn!(session = %self, error = %e, "Session read failed");
                    break;
                }
            }
        }

        close_generation(&self.inner, generation);
        handler.on_close(self).await;
    }

    /// Queue a frame, waiting at most `write_timeout` for space.
    pub async fn write(&self, frame: &Frame) -> Result<()> {
        let tx = self.sender()?;
        match tx
            .send_timeout(frame.as_bytes().to_vec(), self.inner.options.write_timeout)
            .await
        {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                Err(SessionError::WriteTimeout)
            }
            Err(SendTimeoutError::Closed(_)) => Err(SessionError::NotConnected(self.to_string())),
        }
    }

    /// Queue a frame without waiting; the frame is dropped when the queue is full.
    pub fn try_write(&self, frame: &Frame) -> Result<()> {
        let tx = self.sender()?;
        match tx.try_send(frame.as_bytes().to_vec()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                Err(SessionError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(SessionError::NotConnected(self.to_string())),
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<Vec<u8>>> {
        self.state()
            .writer
            .clone()
            .ok_or_else(|| SessionError::NotConnected(self.to_string()))
    }

    /// End the current connection. Queued frames are still flushed.
    ///
    /// Client sessions reconnect afterwards unless terminated.
    pub fn close(&self) {
        let generation = self.state().generation;
        close_generation(&self.inner, generation);
    }

    /// Close and never reconnect.
    pub fn terminate(&self) {
        self.close();
        self.inner.status.send_replace(Status::Terminal);
    }

    /// Keep a client session connected until it is terminated.
    ///
    /// Each connection gets `on_connected`, then frames, then `on_close`.
    /// Failed attempts wait for [`Backoff::delay`] of the attempt count.
    pub fn start(&self, handler: Arc<dyn SessionHandler>) -> JoinHandle<()> {
        let session = self.clone();
        tokio::spawn(async move {
            let mut status = session.watch_status();
            loop {
                if session.status() == Status::Terminal {
                    break;
                }
                match session.connect().await {
                    Ok(()) => {
                        handler.on_connected(&session).await;
                        session.run(handler.clone()).await;
                    }
                    Err(SessionError::Terminated(_)) => break,
                    Err(e) => {
                        warn!(session = %session, attempts = session.attempts(), error = %e, "Connect failed");
                    }
                }
                if session.status() == Status::Terminal {
                    break;
                }

                let delay = session.inner.options.backoff.delay(session.attempts());
                debug!(session = %session, ?delay, "Reconnecting");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = terminated(&mut status) => break,
                }
            }
            debug!(session = %session, "Session terminated");
        })
    }
}

async fn terminated(status: &mut watch::Receiver<Status>) {
    let _ = status.wait_for(|s| *s == Status::Terminal).await;
}

fn close_generation(inner: &Inner, generation: u64) {
    {
        let mut state = inner.state.lock().unwrap_or_else(|p| p.into_inner());
        if state.generation != generation || state.shutdown.is_none() {
            return;
        }
        state.writer = None;
        state.shutdown = None;
    }
    inner.status.send_if_modified(|current| {
        if *current == Status::Terminal || *current == Status::Closed {
            return false;
        }
        *current = Status::Closed;
        true
    });
}

async fn send_loop(
    inner: Weak<Inner>,
    mut writer: Box<dyn FrameWriter>,
    mut rx: mpsc::Receiver<Vec<u8>>,
    generation: u64,
) {
    while let Some(data) = rx.recv().await {
        if let Err(e) = writer.write_frame(&data).await {
            warn!(error = %e, "Session write failed");
            if let Some(inner) = inner.upgrade() {
                close_generation(&inner, generation);
            }
            break;
        }
    }
    writer.close().await;
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Session {}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.inner.address, self.inner.id)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("address", &self.inner.address)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Action;
    use crate::transport::Result as TransportResult;
    use serde_json::json;

    /// Reader fed from a channel, writer recording into one.
    struct ChannelReader(mpsc::Receiver<Vec<u8>>);
    struct ChannelWriter(mpsc::UnboundedSender<Vec<u8>>);

    #[async_trait]
    impl FrameReader for ChannelReader {
        async fn read_frame(&mut self, timeout: Duration) -> TransportResult<Vec<u8>> {
            match tokio::time::timeout(timeout, self.0.recv()).await {
                Err(_) => Err(TransportError::Timeout),
                Ok(Some(f)) => Ok(f),
                Ok(None) => Err(TransportError::Closed),
            }
        }
    }

    #[async_trait]
    impl FrameWriter for ChannelWriter {
        async fn write_frame(&mut self, frame: &[u8]) -> TransportResult<()> {
            self.0.send(frame.to_vec()).map_err(|_| TransportError::Closed)
        }

        async fn close(&mut self) {}
    }

    fn link() -> (Link, mpsc::Sender<Vec<u8>>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let link = Link {
            reader: Box::new(ChannelReader(in_rx)),
            writer: Box::new(ChannelWriter(out_tx)),
            remote: "10.0.0.2:4000".parse().unwrap(),
            local: "10.0.0.1:10002".parse().unwrap(),
        };
        (link, in_tx, out_rx)
    }

    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<Frame>>,
        closed: AtomicU64,
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
    async fn test_from_link_is_connected() {
        let (link, _in, _out) = link();
        let session = Session::from_link(link, SessionOptions::default());
        assert_eq!(session.status(), Status::Connected);
        assert_eq!(session.address(), "10.0.0.2:4000");
        assert_eq!(session.remote(), Some("10.0.0.2:4000".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_undecodable_frame_is_dropped_session_kept() {
        let (link, input, _out) = link();
        let session = Session::from_link(link, SessionOptions::default());
        let recorder = Arc::new(Recorder::default());
        let task = tokio::spawn({
            let session = session.clone();
            let recorder = recorder.clone();
            async move { session.run(recorder).await }
        });

        input.send(vec![0x7f]).await.unwrap();
        let ping = Frame::control(Action::PingRequest, &json!({"datetime": 1})).unwrap();
        input.send(ping.as_bytes().to_vec()).await.unwrap();
        drop(input);
        task.await.unwrap();

        let frames = recorder.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].action(), Some(Action::PingRequest));
        assert_eq!(recorder.closed.load(Ordering::SeqCst), 1);
        assert_eq!(session.status(), Status::Closed);
    }

    #[tokio::test]
    async fn test_writes_are_flushed_in_order() {
        let (link, _in, mut out) = link();
        let session = Session::from_link(link, SessionOptions::default());
        for i in 0..3u8 {
            let f = Frame::control(Action::PingResponse, &json!({"datetime": i})).unwrap();
            session.write(&f).await.unwrap();
        }
        session.close();
        for i in 0..3u8 {
            let raw = out.recv().await.unwrap();
            let f = Frame::decode(raw).unwrap();
            let body: serde_json::Value = f.parse_body().unwrap();
            assert_eq!(body["datetime"], i);
        }
        assert!(matches!(
            session.write(&Frame::data(&[0u8; 14]).unwrap()).await,
            Err(SessionError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_idle_timeouts_close_session() {
        let (link, _in, _out) = link();
        let options = SessionOptions {
            timeout: Duration::from_millis(10),
            idle_timeouts: 3,
            ..Default::default()
        };
        let session = Session::from_link(link, options);
        let recorder = Arc::new(Recorder::default());
        tokio::time::timeout(Duration::from_secs(2), session.run(recorder.clone()))
            .await
            .unwrap();
        assert_eq!(session.status(), Status::Closed);
        assert_eq!(recorder.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_stops_reader() {
        let (link, _in, _out) = link();
        let session = Session::from_link(link, SessionOptions::default());
        let recorder = Arc::new(Recorder::default());
        let task = tokio::spawn({
            let session = session.clone();
            let recorder = recorder.clone();
            async move { session.run(recorder).await }
        });
        tokio::task::yield_now().await;
        session.close();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(recorder.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_terminate_is_sticky() {
        let (link, _in, _out) = link();
        let session = Session::from_link(link, SessionOptions::default());
        session.terminate();
        assert_eq!(session.status(), Status::Terminal);
        session.close();
        assert_eq!(session.status(), Status::Terminal);
    }

    #[tokio::test]
    async fn test_private_attachment() {
        let (link, _in, _out) = link();
        let session = Session::from_link(link, SessionOptions::default());
        assert!(session.private::<String>().is_none());
        session.set_private(Arc::new("point".to_string()));
        assert_eq!(session.private::<String>().unwrap().as_str(), "point");
        assert!(session.private::<u32>().is_none());
        session.clear_private();
        assert!(session.private::<String>().is_none());
    }

    #[tokio::test]
    async fn test_try_write_drops_when_full() {
        let (link, _in, _out) = link();
        let options = SessionOptions {
            write_queue: 1,
            ..Default::default()
        };
        let session = Session::from_link(link, options);
        let frame = Frame::data(&[0u8; 14]).unwrap();
        let mut dropped = 0;
        for _ in 0..64 {
            if matches!(session.try_write(&frame), Err(SessionError::QueueFull)) {
                dropped += 1;
            }
        }
        assert_eq!(session.dropped(), dropped);
    }
}
