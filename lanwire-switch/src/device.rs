//! Host network devices used by the switch and the point agent.

use crate::bridge::{Bridger, LinuxBridge};
use crate::config::BridgeConfig;
use crate::tap::{Result, TapDevice, Taper};
use std::sync::Arc;

/// Creates bridges and taps on the host.
pub trait DeviceFactory: Send + Sync + 'static {
    fn bridge(&self, config: &BridgeConfig) -> Arc<dyn Bridger>;

    /// Create a tap and bring it up. An empty name lets the host pick one.
    fn create_tap(&self, name: &str) -> Result<Arc<dyn Taper>>;
}

/// Kernel bridges and TAP devices.
#[derive(Debug, Default)]
pub struct LinuxDevices;

impl DeviceFactory for LinuxDevices {
    fn bridge(&self, config: &BridgeConfig) -> Arc<dyn Bridger> {
        Arc::new(LinuxBridge::new(config))
    }

    fn create_tap(&self, name: &str) -> Result<Arc<dyn Taper>> {
        let tap = TapDevice::create(name)?;
        tap.set_up()?;
        Ok(Arc::new(tap))
    }
}
