//! Switch core.
//!
//! The switch owns the listener, the hook pipeline, the point registry and
//! one [`NetworkWorker`] per tenant network. Every inbound frame runs through
//! the pipeline; data frames that survive are written to the tap of the
//! point bound to their session, and every tap is read back into its
//! session.
//!
//! Topology changes (sign-in, session close) are serialized by one lock so
//! that leases, taps and bridge slaves move together.

use crate::bridge::BridgeError;
use crate::config::{ConfigError, SwitchConfig};
use crate::device::DeviceFactory;
use crate::hook::{
    self, AccessHook, Control, FlowSweeper, HookError, OnlineHook, Pipeline, RequestHook,
};
use crate::lease::LeaseError;
use crate::message::{Leave, SignRequest, SignResponse, SignResult, SignStatus};
use crate::neighbor::Neighbors;
use crate::point::{Point, PointTable};
use crate::publish::Publisher;
use crate::tap::{TAP_BUFFER, TapError, Taper};
use crate::worker::NetworkWorker;
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use lanwire_socket::transport::{self, TransportError};
use lanwire_socket::{Action, Frame, Listener, Session, SessionError, SessionHandler};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SwitchError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("network {0}: {1}")]
    Bridge(String, BridgeError),

    #[error("network {0}: {1}")]
    Lease(String, LeaseError),
}

pub type Result<T> = std::result::Result<T, SwitchError>;

pub struct Switch {
    config: SwitchConfig,
    uuid: String,
    listener: Arc<Listener>,
    pipeline: Pipeline,
    points: PointTable,
    neighbors: Option<Arc<Neighbors>>,
    online: Option<Arc<OnlineHook>>,
    workers: HashMap<String, Arc<NetworkWorker>>,
    devices: Arc<dyn DeviceFactory>,
    publisher: Arc<dyn Publisher>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    sweeper: Mutex<Option<FlowSweeper>>,
    topology: tokio::sync::Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Switch {
    pub fn new(
        config: SwitchConfig,
        devices: Arc<dyn DeviceFactory>,
        publisher: Arc<dyn Publisher>,
    ) -> Result<Arc<Self>> {
        let acceptor = transport::acceptor(&config.listen, &config.transport()?)?;
        let listener = Arc::new(Listener::new(acceptor, config.session_options()));

        let mut workers = HashMap::new();
        for network in &config.networks {
            let worker = NetworkWorker::new(network.clone(), devices.clone())
                .map_err(|e| SwitchError::Lease(network.name.clone(), e))?;
            workers.insert(network.name.clone(), Arc::new(worker));
        }

        let neighbors = config
            .inspects("neighbor")
            .then(|| Arc::new(Neighbors::new(publisher.clone())));
        let online = config.inspects("online").then(|| {
            Arc::new(OnlineHook::new(
                config.online.max_flows,
                Duration::from_secs(config.online.timeout),
            ))
        });

        Ok(Arc::new_cyclic(|me: &Weak<Switch>| {
            let control: Weak<dyn Control> = me.clone();
            let mut pipeline = Pipeline::new();
            pipeline.push(Arc::new(AccessHook::new(&config.networks)));
            pipeline.push(Arc::new(RequestHook::new(control)));
            if let Some(neighbors) = &neighbors {
                pipeline.push(neighbors.clone());
            }
            if let Some(online) = &online {
                pipeline.push(online.clone());
            }
            Switch {
                uuid: Uuid::new_v4().to_string(),
                listener,
                pipeline,
                points: PointTable::new(),
                neighbors,
                online,
                workers,
                devices,
                publisher,
                tasks: Mutex::new(Vec::new()),
                sweeper: Mutex::new(None),
                topology: tokio::sync::Mutex::new(()),
                config,
            }
        }))
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn alias(&self) -> &str {
        &self.config.alias
    }

    pub fn config(&self) -> &SwitchConfig {
        &self.config
    }

    pub fn points(&self) -> &PointTable {
        &self.points
    }

    pub fn neighbors(&self) -> Option<&Arc<Neighbors>> {
        self.neighbors.as_ref()
    }

    pub fn online(&self) -> Option<&Arc<OnlineHook>> {
        self.online.as_ref()
    }

    pub fn listener(&self) -> &Arc<Listener> {
        &self.listener
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn worker(&self, network: &str) -> Option<&Arc<NetworkWorker>> {
        self.workers.get(network)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    /// Start networks, then the listener and its event loop.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        for worker in self.workers.values() {
            worker
                .start()
                .map_err(|e| SwitchError::Bridge(worker.name().to_string(), e))?;
        }
        let addr = self.listener.listen().await?;

        {
            let mut tasks = lock(&self.tasks);
            let listener = self.listener.clone();
            tasks.push(tokio::spawn(async move { listener.accept().await }));
            let listener = self.listener.clone();
            let handler: Arc<dyn SessionHandler> = self.clone();
            tasks.push(tokio::spawn(async move { listener.run_loop(handler).await }));
        }

        if let Some(online) = &self.online {
            *lock(&self.sweeper) = Some(FlowSweeper::start(online.clone()));
        }
        info!(
            alias = %self.config.alias,
            uuid = %self.uuid,
            protocol = %self.listener.protocol(),
            %addr,
            hooks = ?self.pipeline.names(),
            networks = self.workers.len(),
            "Switch started"
        );
        Ok(addr)
    }

    /// Tell every point to leave, close the listener, then tear down networks.
    pub async fn stop(&self) {
        info!(points = self.points.len(), "Switch stopping");
        let points = self.points.list();
        join_all(points.iter().map(|p| self.leave(&p.session))).await;
        self.listener.close().await;
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        if let Some(sweeper) = lock(&self.sweeper).take() {
            sweeper.stop();
        }
        {
            let _topology = self.topology.lock().await;
            for point in self.points.clear() {
                self.free_tap(&point);
            }
            for worker in self.workers.values() {
                worker.stop();
            }
            if let Some(neighbors) = &self.neighbors {
                neighbors.clear();
            }
        }
        self.publisher.close().await;
        info!("Switch stopped");
    }

    /// Create a tap and attach it to the bridge of `network`.
    pub fn new_tap(&self, network: &str) -> std::result::Result<Arc<dyn Taper>, TapError> {
        let device = self.devices.create_tap("")?;
        if let Some(worker) = self.workers.get(network)
            && let Err(e) = worker.bridge().add_slave(device.name())
        {
            warn!(network, tap = %device.name(), error = %e, "Failed to attach tap");
        }
        debug!(network, tap = %device.name(), "Tap created");
        Ok(device)
    }

    /// Detach a point's tap from its bridge and close it.
    pub fn free_tap(&self, point: &Point) {
        if let Some(worker) = self.workers.get(&point.network)
            && let Err(e) = worker.bridge().del_slave(point.device.name())
        {
            warn!(network = %point.network, tap = %point.device.name(), error = %e, "Failed to detach tap");
        }
        point.device.close();
        debug!(network = %point.network, tap = %point.device.name(), "Tap freed");
    }

    /// Pump frames read from the point's tap into its session.
    ///
    /// The tap queue drops new frames while full. Both tasks end once the
    /// device is closed.
    pub fn read_tap(&self, point: &Arc<Point>) {
        let (tx, mut rx) = mpsc::channel::<Frame>(self.config.queue.tap_write.max(1));
        let device = point.device.clone();
        tokio::spawn(async move {
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
                match Frame::data(&buf[..n]) {
                    Ok(frame) => {
                        if tx.try_send(frame).is_err() {
                            trace!(tap = %device.name(), "Tap queue full, dropping frame");
                        }
                    }
                    Err(e) => trace!(tap = %device.name(), error = %e, "Dropping tap frame"),
                }
            }
            debug!(tap = %device.name(), "Tap reader stopped");
        });

        let session = point.session.clone();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                match session.try_write(&frame) {
                    Ok(()) | Err(SessionError::QueueFull) => {}
                    Err(e @ (SessionError::NotConnected(_) | SessionError::Terminated(_))) => {
                        debug!(session = %session, error = %e, "Stopping tap forwarder");
                        break;
                    }
                    Err(e) => debug!(session = %session, error = %e, "Failed to forward tap frame"),
                }
            }
        });
    }

    /// Send a leave-request to `session`.
    pub async fn leave(&self, session: &Session) {
        let body = Leave {
            datetime: Utc::now().timestamp(),
            uuid: self.uuid.clone(),
            alias: self.config.alias.clone(),
            connection: session.address().to_string(),
            address: session.local().map(|a| a.to_string()).unwrap_or_default(),
        };
        hook::reply(session, Action::LeaveRequest, &body).await;
    }

    /// Challenge `session` to sign in.
    pub async fn sign_request(&self, session: &Session) {
        let body = SignRequest {
            address: session.address().to_string(),
            switch: session.local().map(|a| a.to_string()).unwrap_or_default(),
        };
        debug!(session = %session, "Sending sign-in challenge");
        hook::reply(session, Action::SignRequest, &body).await;
    }

    fn signed(point: &Point) -> SignResult {
        SignResult {
            status: SignStatus::Ok,
            message: String::new(),
            network: point.network.clone(),
            address: point.address.map(|a| a.to_string()).unwrap_or_default(),
            netmask: point.netmask.map(|a| a.to_string()).unwrap_or_default(),
        }
    }

    /// Drop `point` from the registry, releasing its lease unless a newer
    /// session now holds its UUID.
    fn unbind(&self, point: &Arc<Point>) {
        let key = point.key();
        if self.points.addr_of(&point.uuid).as_deref() == Some(key)
            && let Some(leases) = self.workers.get(&point.network).and_then(|w| w.leases())
            && let Some(address) = leases.release(&point.uuid)
        {
            debug!(uuid = %point.uuid, %address, "Lease released");
        }
        if self
            .points
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(&current, point))
        {
            self.points.remove(key);
        }
        self.free_tap(point);
    }
}

#[async_trait]
impl Control for Switch {
    async fn sign_in(&self, session: &Session, request: SignResponse) -> hook::Result<SignResult> {
        let _topology = self.topology.lock().await;
        let worker = self
            .workers
            .get(&request.network)
            .ok_or_else(|| HookError::UnknownNetwork(request.network.clone()))?;
        let uuid = if request.uuid.is_empty() {
            session.address().to_string()
        } else {
            request.uuid.clone()
        };

        if let Some(current) = session.private::<Point>() {
            if current.uuid == uuid && current.network == request.network {
                return Ok(Self::signed(&current));
            }
            self.unbind(&current);
            session.clear_private();
        }

        let lease = match worker.leases() {
            Some(leases) => Some(leases.alloc(&uuid)?),
            None => None,
        };
        let device = match self.new_tap(&request.network) {
            Ok(device) => device,
            Err(e) => {
                if self.points.addr_of(&uuid).is_none()
                    && let Some(leases) = worker.leases()
                {
                    leases.release(&uuid);
                }
                return Err(e.into());
            }
        };

        if let Some(stale) = self.points.get(session.address())
            && stale.session.id() != session.id()
        {
            self.unbind(&stale);
        }

        let mut point = Point::new(
            &uuid,
            &request.alias,
            &request.username,
            &request.network,
            session.clone(),
            device,
        );
        if let Some(lease) = lease {
            point = point.with_lease(lease.address, lease.netmask);
        }
        let point = Arc::new(point);
        let superseded = self.points.add(point.clone());
        session.set_private(point.clone());
        self.read_tap(&point);

        info!(
            session = %session,
            uuid = %point.uuid,
            alias = %point.alias,
            user = %point.user,
            network = %point.network,
            tap = %point.device.name(),
            address = ?point.address,
            "Point signed in"
        );

        if let Some(old) = superseded
            && old.session.id() != session.id()
        {
            info!(uuid = %old.uuid, old = %old.session, new = %session, "Point superseded");
            self.leave(&old.session).await;
            self.listener.off_client(&old.session);
        }
        Ok(Self::signed(&point))
    }

    async fn close_session(&self, session: &Session) {
        self.listener.off_client(session);
    }
}

#[async_trait]
impl SessionHandler for Switch {
    async fn on_connected(&self, session: &Session) {
        debug!(session = %session, "Session accepted");
    }

    async fn on_frame(&self, session: &Session, frame: Frame) {
        if let Err(e) = self.pipeline.process(session, &frame).await {
            debug!(session = %session, action = ?frame.action(), error = %e, "Frame dropped");
            if frame.action() == Some(Action::PingRequest) {
                self.sign_request(session).await;
            }
            return;
        }
        if frame.is_control() {
            return;
        }
        let Some(point) = session.private::<Point>() else {
            warn!(session = %session, "Point not found");
            return;
        };
        let Some(ethernet) = frame.ethernet() else {
            return;
        };
        point.touch();
        if let Err(e) = point.device.write_frame(ethernet).await {
            debug!(session = %session, tap = %point.device.name(), error = %e, "Tap write failed");
        }
    }

    async fn on_close(&self, session: &Session) {
        let _topology = self.topology.lock().await;
        self.pipeline.on_close(session).await;
        if let Some(point) = self.points.get(session.address())
            && point.session.id() == session.id()
        {
            self.unbind(&point);
            info!(session = %session, uuid = %point.uuid, network = %point.network, "Point closed");
        }
        session.clear_private();
    }
}
