//! Per-network state: bridge, address leases and cascade links.

use crate::agent::Agent;
use crate::bridge::{self, Bridger};
use crate::config::{NetworkConfig, PointConfig};
use crate::device::DeviceFactory;
use crate::lease::{LeaseError, LeasePool};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};

pub struct NetworkWorker {
    config: NetworkConfig,
    bridge: Arc<dyn Bridger>,
    leases: Option<LeasePool>,
    devices: Arc<dyn DeviceFactory>,
    links: Mutex<Vec<Arc<Agent>>>,
}

impl NetworkWorker {
    pub fn new(config: NetworkConfig, devices: Arc<dyn DeviceFactory>) -> Result<Self, LeaseError> {
        let leases = config
            .subnet
            .as_ref()
            .map(|subnet| LeasePool::new(&config.name, subnet))
            .transpose()?;
        let bridge = devices.bridge(&config.bridge);
        Ok(Self {
            config,
            bridge,
            leases,
            devices,
            links: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn bridge(&self) -> &Arc<dyn Bridger> {
        &self.bridge
    }

    pub fn leases(&self) -> Option<&LeasePool> {
        self.leases.as_ref()
    }

    pub fn links(&self) -> Vec<Arc<Agent>> {
        self.lock_links().clone()
    }

    fn lock_links(&self) -> MutexGuard<'_, Vec<Arc<Agent>>> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open the bridge and dial the configured links.
    ///
    /// Only a bridge that cannot be opened is fatal. Tuning and link
    /// failures are logged and skipped.
    pub fn start(&self) -> bridge::Result<()> {
        let cfg = &self.config.bridge;
        self.bridge.open(&cfg.address)?;
        if let Err(e) = self.bridge.set_stp(cfg.stp) {
            warn!(network = %self.name(), error = %e, "Failed to set STP");
        }
        if let Err(e) = self.bridge.set_forward_delay(cfg.forward_delay) {
            warn!(network = %self.name(), error = %e, "Failed to set forward delay");
        }
        info!(network = %self.name(), bridge = %self.bridge.name(), address = %cfg.address, "Network started");

        for link in &self.config.links {
            match self.start_link(link.clone()) {
                Ok(agent) => self.lock_links().push(agent),
                Err(e) => {
                    warn!(network = %self.name(), connection = %link.connection, error = %e, "Failed to start link")
                }
            }
        }
        Ok(())
    }

    fn start_link(&self, link: PointConfig) -> crate::agent::Result<Arc<Agent>> {
        let device = self.devices.create_tap(&link.tap)?;
        let agent = match Agent::new(link, device.clone()) {
            Ok(agent) => agent,
            Err(e) => {
                device.close();
                return Err(e);
            }
        };
        if let Err(e) = agent.attach(self.bridge.clone()) {
            device.close();
            return Err(e);
        }
        agent.start();
        Ok(agent)
    }

    pub fn stop(&self) {
        for agent in self.lock_links().drain(..) {
            agent.stop();
        }
        if let Err(e) = self.bridge.close() {
            warn!(network = %self.name(), error = %e, "Failed to close bridge");
        }
        info!(network = %self.name(), "Network stopped");
    }
}
