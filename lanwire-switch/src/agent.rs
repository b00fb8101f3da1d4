//! Point agent: tunnels a local tap to a switch.
//!
//! The agent keeps one client session to the switch, pings it on connect
//! and every keepalive interval, answers the sign-in challenge with its
//! credentials and shuttles frames between the session and its tap.

use crate::bridge::{BridgeError, Bridger};
use crate::config::{ConfigError, PointConfig};
use crate::message::{Leave, Ping, SignRequest, SignResponse, SignResult};
use crate::tap::{TAP_BUFFER, TapError, Taper};
use async_trait::async_trait;
use lanwire_socket::transport;
use lanwire_socket::{Action, Frame, Session, SessionError, SessionHandler, Status};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("tap: {0}")]
    Tap(#[from] TapError),

    #[error("bridge: {0}")]
    Bridge(#[from] BridgeError),
}

pub type Result<T> = std::result::Result<T, AgentError>;

pub struct Agent {
    config: PointConfig,
    session: Session,
    device: Arc<dyn Taper>,
    bridge: Mutex<Option<Arc<dyn Bridger>>>,
    result: Mutex<Option<SignResult>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Agent {
    pub fn new(config: PointConfig, device: Arc<dyn Taper>) -> Result<Arc<Self>> {
        let transport = config.transport()?;
        let dialer = transport::dialer(&config.connection, &transport);
        let session = Session::client(dialer, config.session_options());
        Ok(Arc::new(Self {
            config,
            session,
            device,
            bridge: Mutex::new(None),
            result: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn device(&self) -> &Arc<dyn Taper> {
        &self.device
    }

    pub fn config(&self) -> &PointConfig {
        &self.config
    }

    /// Last sign-in outcome of the current connection.
    pub fn sign_result(&self) -> Option<SignResult> {
        lock(&self.result).clone()
    }

    pub fn is_signed_in(&self) -> bool {
        self.sign_result().is_some_and(|r| r.is_ok())
    }

    /// Attach the tap to a local bridge; it is detached again on stop.
    pub fn attach(&self, bridge: Arc<dyn Bridger>) -> Result<()> {
        bridge.add_slave(self.device.name())?;
        info!(tap = %self.device.name(), bridge = %bridge.name(), "Tap attached to bridge");
        *lock(&self.bridge) = Some(bridge);
        Ok(())
    }

    /// Start the session, keepalive and tap reader tasks.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = lock(&self.tasks);
        if !tasks.is_empty() {
            return;
        }
        info!(
            connection = %self.config.connection,
            protocol = %self.config.protocol,
            network = %self.config.network,
            tap = %self.device.name(),
            "Point starting"
        );
        tasks.push(self.session.start(self.clone()));
        tasks.push(tokio::spawn(keepalive(
            self.session.clone(),
            Duration::from_secs(self.config.keepalive.max(1)),
        )));
        tasks.push(tokio::spawn(read_tap(self.session.clone(), self.device.clone())));
    }

    /// Run until [`Agent::stop`] is called.
    pub async fn run(self: &Arc<Self>) {
        self.start();
        let mut status = self.session.watch_status();
        let _ = status.wait_for(|s| *s == Status::Terminal).await;
    }

    pub fn stop(&self) {
        self.session.terminate();
        self.device.close();
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        if let Some(bridge) = lock(&self.bridge).take()
            && let Err(e) = bridge.del_slave(self.device.name())
        {
            warn!(tap = %self.device.name(), error = %e, "Failed to detach tap");
        }
        info!(connection = %self.config.connection, "Point stopped");
    }

    async fn send<T: serde::Serialize>(&self, action: Action, body: &T) {
        let frame = match Frame::control(action, body) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(%action, error = %e, "Failed to encode control frame");
                return;
            }
        };
        if let Err(e) = self.session.write(&frame).await {
            debug!(%action, error = %e, "Failed to send control frame");
        }
    }

    async fn on_control(&self, action: Action, frame: &Frame) {
        match action {
            Action::SignRequest => {
                if let Ok(request) = frame.parse_body::<SignRequest>() {
                    debug!(address = %request.address, switch = %request.switch, "Sign-in requested");
                }
                let response = SignResponse {
                    username: self.config.username.clone(),
                    password: self.config.password.clone(),
                    network: self.config.network.clone(),
                    uuid: self.config.uuid.map(|u| u.to_string()).unwrap_or_default(),
                    alias: self.config.alias.clone(),
                };
                self.send(Action::SignResponse, &response).await;
            }
            Action::SignResult => match frame.parse_body::<SignResult>() {
                Ok(result) => {
                    if result.is_ok() {
                        info!(network = %result.network, address = %result.address, netmask = %result.netmask, "Signed in");
                    } else {
                        warn!(network = %result.network, message = %result.message, "Sign-in failed");
                    }
                    *lock(&self.result) = Some(result);
                }
                Err(e) => warn!(error = %e, "Invalid sign-in result"),
            },
            Action::PingRequest => self.send(Action::PingResponse, &Ping::now()).await,
            Action::PingResponse => trace!("Pong"),
            Action::LeaveRequest => {
                match frame.parse_body::<Leave>() {
                    Ok(leave) => info!(switch = %leave.alias, uuid = %leave.uuid, "Switch asked to leave"),
                    Err(_) => info!("Switch asked to leave"),
                }
                self.session.close();
            }
            Action::SignResponse => debug!("Ignoring sign-response from switch"),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl SessionHandler for Agent {
    async fn on_connected(&self, session: &Session) {
        info!(session = %session, "Connected to switch");
        lock(&self.result).take();
        self.send(Action::PingRequest, &Ping::now()).await;
    }

    async fn on_frame(&self, _session: &Session, frame: Frame) {
        if let Some(action) = frame.action() {
            self.on_control(action, &frame).await;
            return;
        }
        if let Some(ethernet) = frame.ethernet()
            && let Err(e) = self.device.write_frame(ethernet).await
        {
            debug!(tap = %self.device.name(), error = %e, "Tap write failed");
        }
    }

    async fn on_close(&self, session: &Session) {
        info!(session = %session, "Disconnected from switch");
        lock(&self.result).take();
    }
}

async fn keepalive(session: Session, every: Duration) {
    let mut interval = time::interval(every);
    // The first ping goes out from on_connected.
    interval.tick().await;
    loop {
        interval.tick().await;
        if !session.is_connected() {
            continue;
        }
        if let Ok(ping) = Frame::control(Action::PingRequest, &Ping::now()) {
            let _ = session.try_write(&ping);
        }
    }
}

async fn read_tap(session: Session, device: Arc<dyn Taper>) {
    let mut buf = vec![0u8; TAP_BUFFER];
    loop {
        let n = match device.read_frame(&mut buf).await {
            Ok(n) => n,
            Err(TapError::Closed(_)) => break,
            Err(e) => {
                warn!(tap = %device.name(), error = %e, "Tap read failed");
                device.close();
                break;
            }
        };
        let frame = match Frame::data(&buf[..n]) {
            Ok(frame) => frame,
            Err(e) => {
                trace!(error = %e, "Dropping tap frame");
                continue;
            }
        };
        match session.try_write(&frame) {
            Ok(()) | Err(SessionError::QueueFull) | Err(SessionError::NotConnected(_)) => {}
            Err(e) => debug!(error = %e, "Failed to forward tap frame"),
        }
    }
    debug!(tap = %device.name(), "Tap reader stopped");
}
