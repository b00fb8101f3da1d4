//! Per-network Linux bridges, driven through `ip`.

use crate::config::BridgeConfig;
use std::collections::BTreeSet;
use std::io;
use std::process::Command;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Failed to create bridge '{0}': {1}")]
    Create(String, io::Error),

    #[error("Failed to configure bridge '{0}': {1}")]
    Configure(String, io::Error),

    #[error("Failed to set address {1} on '{0}': {2}")]
    Address(String, String, io::Error),

    #[error("Failed to attach '{1}' to '{0}': {2}")]
    AddSlave(String, String, io::Error),

    #[error("Failed to detach '{1}' from '{0}': {2}")]
    DelSlave(String, String, io::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// L2 forwarding context of one tenant network.
pub trait Bridger: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Create the bridge if needed, assign `address` if non-empty, bring it up.
    fn open(&self, address: &str) -> Result<()>;

    /// Remove the address assigned by `open`.
    fn close(&self) -> Result<()>;

    fn add_slave(&self, name: &str) -> Result<()>;

    fn del_slave(&self, name: &str) -> Result<()>;

    fn set_stp(&self, enabled: bool) -> Result<()>;

    /// Forward delay in seconds.
    fn set_forward_delay(&self, seconds: u32) -> Result<()>;

    /// Interfaces attached through this bridge.
    fn slaves(&self) -> Vec<String>;
}

/// Run `ip` with `args`, treating stderr containing any of `ignore` as success.
fn ip(args: &[&str], ignore: &[&str]) -> io::Result<()> {
    let output = Command::new("ip").args(args).output()?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if ignore.iter().any(|s| stderr.contains(s)) {
        return Ok(());
    }
    Err(io::Error::other(stderr.trim().to_string()))
}

/// Kernel bridge.
pub struct LinuxBridge {
    name: String,
    mtu: u32,
    address: Mutex<Option<String>>,
    slaves: Mutex<BTreeSet<String>>,
}

impl LinuxBridge {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            name: config.name.clone(),
            mtu: config.mtu,
            address: Mutex::new(None),
            slaves: Mutex::new(BTreeSet::new()),
        }
    }

    fn slave_set(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.slaves.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn exists(&self) -> bool {
        ip(&["link", "show", "dev", &self.name], &[]).is_ok()
    }
}

impl Bridger for LinuxBridge {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self, address: &str) -> Result<()> {
        if !self.exists() {
            ip(&["link", "add", "name", &self.name, "type", "bridge"], &["File exists"])
                .map_err(|e| BridgeError::Create(self.name.clone(), e))?;
            info!(bridge = %self.name, "Bridge created");
        }
        let mtu = self.mtu.to_string();
        ip(&["link", "set", "dev", &self.name, "mtu", &mtu, "up"], &[])
            .map_err(|e| BridgeError::Configure(self.name.clone(), e))?;

        if !address.is_empty() {
            ip(&["addr", "add", address, "dev", &self.name], &["File exists"])
                .map_err(|e| BridgeError::Address(self.name.clone(), address.to_string(), e))?;
            if let Ok(mut current) = self.address.lock() {
                *current = Some(address.to_string());
            }
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let address = self.address.lock().ok().and_then(|mut a| a.take());
        if let Some(address) = address {
            ip(
                &["addr", "del", &address, "dev", &self.name],
                &["Cannot assign", "Cannot find device"],
            )
            .map_err(|e| BridgeError::Address(self.name.clone(), address.clone(), e))?;
            debug!(bridge = %self.name, %address, "Bridge address removed");
        }
        Ok(())
    }

    fn add_slave(&self, name: &str) -> Result<()> {
        ip(&["link", "set", "dev", name, "master", &self.name], &[])
            .map_err(|e| BridgeError::AddSlave(self.name.clone(), name.to_string(), e))?;
        self.slave_set().insert(name.to_string());
        Ok(())
    }

    fn del_slave(&self, name: &str) -> Result<()> {
        self.slave_set().remove(name);
        ip(&["link", "set", "dev", name, "nomaster"], &["Cannot find device"])
            .map_err(|e| BridgeError::DelSlave(self.name.clone(), name.to_string(), e))
    }

    fn set_stp(&self, enabled: bool) -> Result<()> {
        let state = if enabled { "1" } else { "0" };
        ip(
            &["link", "set", "dev", &self.name, "type", "bridge", "stp_state", state],
            &[],
        )
        .map_err(|e| BridgeError::Configure(self.name.clone(), e))
    }

    fn set_forward_delay(&self, seconds: u32) -> Result<()> {
        // The kernel takes centiseconds.
        let delay = (seconds * 100).to_string();
        ip(
            &["link", "set", "dev", &self.name, "type", "bridge", "forward_delay", &delay],
            &[],
        )
        .map_err(|e| BridgeError::Configure(self.name.clone(), e))
    }

    fn slaves(&self) -> Vec<String> {
        self.slave_set().iter().cloned().collect()
    }
}
