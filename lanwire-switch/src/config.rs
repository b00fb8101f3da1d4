//! Switch and point configuration files.

use ipnet::Ipv4Net;
use lanwire_socket::transport::{self, FecConfig, Protocol, TransportConfig, TransportError};
use lanwire_socket::{Backoff, CryptConfig, CryptError, SessionOptions};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Longest kernel interface name.
pub const IFNAME_MAX: usize = 15;

/// Default switch port.
pub const DEFAULT_PORT: u16 = 10002;

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    Read(PathBuf, io::Error),

    #[error("failed to parse {0}: {1}")]
    Parse(PathBuf, serde_json::Error),

    #[error("network #{0} has no name")]
    EmptyNetwork(usize),

    #[error("duplicate network {0}")]
    DuplicateNetwork(String),

    #[error("network {0}: {1}")]
    Network(String, String),

    #[error("{0} requires cert.crt and cert.key")]
    MissingCertificate(Protocol),

    #[error("invalid inspect flag: {0}")]
    Inspect(String),

    #[error("point: {0}")]
    Point(String),

    #[error("cipher: {0}")]
    Crypt(#[from] CryptError),

    #[error("TLS: {0}")]
    Tls(#[from] TransportError),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let data = std::fs::read(path).map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
    serde_json::from_slice(&data).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
}

fn default_alias() -> String {
    "lanwire".to_string()
}

fn default_listen() -> String {
    format!("0.0.0.0:{DEFAULT_PORT}")
}

fn default_timeout() -> u64 {
    120
}

fn default_idle_timeouts() -> u32 {
    3
}

fn default_inspect() -> Vec<String> {
    vec!["neighbor".to_string(), "online".to_string()]
}

fn default_mtu() -> u32 {
    1500
}

fn default_forward_delay() -> u32 {
    4
}

fn default_network() -> String {
    "default".to_string()
}

fn default_keepalive() -> u64 {
    10
}

fn default_point_timeout() -> u64 {
    60
}

/// Server certificate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertConfig {
    pub crt: PathBuf,
    pub key: PathBuf,
}

/// Queue sizes, in frames.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Per-session write queue.
    pub sock_write: usize,
    /// Frames read from a tap waiting to be sent to its session.
    pub tap_write: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            sock_write: 1024,
            tap_write: 1024,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublishConfig {
    /// JSON-lines file receiving every published record.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Online flow table limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct OnlineConfig {
    pub max_flows: usize,
    /// Seconds a flow may stay idle before the sweep drops it.
    pub timeout: u64,
}

impl Default for OnlineConfig {
    fn default() -> Self {
        Self {
            max_flows: 1024,
            timeout: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Kernel name, `br-<network>` when empty.
    #[serde(default)]
    pub name: String,
    /// Address in CIDR notation assigned to the bridge, may be empty.
    #[serde(default)]
    pub address: String,
    #[serde(default = "default_mtu")]
    pub mtu: u32,
    #[serde(default)]
    pub stp: bool,
    #[serde(default = "default_forward_delay")]
    pub forward_delay: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            address: String::new(),
            mtu: default_mtu(),
            stp: false,
            forward_delay: default_forward_delay(),
        }
    }
}

/// Addresses leased to points of one network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubnetConfig {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub name: String,
    pub password: String,
}

/// One tenant network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub subnet: Option<SubnetConfig>,
    #[serde(default)]
    pub users: Vec<UserConfig>,
    /// Outbound connections to other switches, bridged into this network.
    #[serde(default)]
    pub links: Vec<PointConfig>,
}

impl NetworkConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            bridge: BridgeConfig::default(),
            subnet: None,
            users: Vec::new(),
            links: Vec::new(),
        }
    }

    fn validate(&mut self) -> Result<()> {
        if self.bridge.name.is_empty() {
            let mut name = format!("br-{}", self.name);
            name.truncate(IFNAME_MAX);
            self.bridge.name = name;
        }
        if self.bridge.name.len() > IFNAME_MAX {
            return Err(ConfigError::Network(
                self.name.clone(),
                format!("bridge name {} too long", self.bridge.name),
            ));
        }
        if !self.bridge.address.is_empty() && self.bridge.address.parse::<Ipv4Net>().is_err() {
            return Err(ConfigError::Network(
                self.name.clone(),
                format!("bad bridge address {}", self.bridge.address),
            ));
        }
        if let Some(subnet) = &self.subnet
            && u32::from(subnet.start) > u32::from(subnet.end)
        {
            return Err(ConfigError::Network(
                self.name.clone(),
                format!("subnet start {} after end {}", subnet.start, subnet.end),
            ));
        }
        for link in &mut self.links {
            link.network = self.name.clone();
            link.bridge = Some(self.bridge.name.clone());
            link.validate()?;
        }
        Ok(())
    }
}

/// Switch daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchConfig {
    #[serde(default = "default_alias")]
    pub alias: String,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Session read timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Consecutive read timeouts before a silent session is closed.
    #[serde(default = "default_idle_timeouts")]
    pub idle_timeouts: u32,
    #[serde(default)]
    pub crypt: CryptConfig,
    #[serde(default)]
    pub cert: Option<CertConfig>,
    #[serde(default)]
    pub fec: FecConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    /// Optional hooks: `neighbor`, `online`.
    #[serde(default = "default_inspect")]
    pub inspect: Vec<String>,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub online: OnlineConfig,
    #[serde(default)]
    pub networks: Vec<NetworkConfig>,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            alias: default_alias(),
            protocol: Protocol::default(),
            listen: default_listen(),
            timeout: default_timeout(),
            idle_timeouts: default_idle_timeouts(),
            crypt: CryptConfig::default(),
            cert: None,
            fec: FecConfig::default(),
            queue: QueueConfig::default(),
            inspect: default_inspect(),
            publish: PublishConfig::default(),
            online: OnlineConfig::default(),
            networks: Vec::new(),
        }
    }
}

impl SwitchConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: Self = load_json(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration and fill in derived defaults.
    pub fn validate(&mut self) -> Result<()> {
        let mut names = HashSet::new();
        for (i, network) in self.networks.iter_mut().enumerate() {
            if network.name.is_empty() {
                return Err(ConfigError::EmptyNetwork(i));
            }
            if !names.insert(network.name.clone()) {
                return Err(ConfigError::DuplicateNetwork(network.name.clone()));
            }
            network.validate()?;
        }
        for flag in &self.inspect {
            if flag != "neighbor" && flag != "online" {
                return Err(ConfigError::Inspect(flag.clone()));
            }
        }
        if self.protocol == Protocol::Wss && self.cert.is_none() {
            return Err(ConfigError::MissingCertificate(Protocol::Wss));
        }
        self.crypt.block()?;
        Ok(())
    }

    pub fn inspects(&self, flag: &str) -> bool {
        self.inspect.iter().any(|f| f == flag)
    }

    pub fn network(&self, name: &str) -> Option<&NetworkConfig> {
        self.networks.iter().find(|n| n.name == name)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            timeout: Duration::from_secs(self.timeout.max(1)),
            idle_timeouts: self.idle_timeouts,
            write_queue: self.queue.sock_write,
            ..Default::default()
        }
    }

    /// Transport settings, loading the certificate if one is configured.
    pub fn transport(&self) -> Result<TransportConfig> {
        let mut config = TransportConfig::new(self.protocol).with_crypt(self.crypt.clone());
        config.fec = self.fec;
        if let Some(cert) = &self.cert {
            config.tls_server = Some(transport::tls::server_config(&cert.crt, &cert.key)?);
        }
        Ok(config)
    }
}

/// Point agent configuration, also used for switch-to-switch links.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointConfig {
    /// Switch address, `host` or `host:port`.
    pub connection: String,
    #[serde(default)]
    pub protocol: Protocol,
    pub username: String,
    pub password: String,
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default)]
    pub alias: String,
    /// Stable identity; generated when absent.
    #[serde(default)]
    pub uuid: Option<Uuid>,
    /// Tap name, chosen by the kernel when empty.
    #[serde(default)]
    pub tap: String,
    /// Bridge the tap is attached to.
    #[serde(default)]
    pub bridge: Option<String>,
    #[serde(default)]
    pub crypt: CryptConfig,
    #[serde(default)]
    pub fec: FecConfig,
    /// Use TLS on `tcp`; always on for `wss`.
    #[serde(default)]
    pub tls: bool,
    /// CA verifying the switch certificate.
    #[serde(default)]
    pub ca: Option<PathBuf>,
    /// Read timeout in seconds.
    #[serde(default = "default_point_timeout")]
    pub timeout: u64,
    /// Ping interval in seconds.
    #[serde(default = "default_keepalive")]
    pub keepalive: u64,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub backoff: Backoff,
}

impl PointConfig {
    pub fn new(connection: &str, username: &str, password: &str) -> Self {
        Self {
            connection: connection.to_string(),
            protocol: Protocol::default(),
            username: username.to_string(),
            password: password.to_string(),
            network: default_network(),
            alias: String::new(),
            uuid: None,
            tap: String::new(),
            bridge: None,
            crypt: CryptConfig::default(),
            fec: FecConfig::default(),
            tls: false,
            ca: None,
            timeout: default_point_timeout(),
            keepalive: default_keepalive(),
            queue: QueueConfig::default(),
            backoff: Backoff::default(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let mut config: Self = load_json(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&mut self) -> Result<()> {
        if self.connection.is_empty() {
            return Err(ConfigError::Point("connection is empty".to_string()));
        }
        if !self.connection.contains(':') {
            self.connection = format!("{}:{DEFAULT_PORT}", self.connection);
        }
        if self.username.is_empty() {
            return Err(ConfigError::Point("username is empty".to_string()));
        }
        if self.tap.len() > IFNAME_MAX {
            return Err(ConfigError::Point(format!("tap name {} too long", self.tap)));
        }
        if self.uuid.is_none() {
            self.uuid = Some(Uuid::new_v4());
        }
        if self.alias.is_empty() {
            self.alias = self.username.clone();
        }
        self.crypt.block()?;
        Ok(())
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            timeout: Duration::from_secs(self.timeout.max(1)),
            // Pings keep the connection busy; silence means the switch is gone.
            idle_timeouts: 1,
            write_queue: self.queue.sock_write,
            backoff: self.backoff,
            ..Default::default()
        }
    }

    pub fn transport(&self) -> Result<TransportConfig> {
        let mut config = TransportConfig::new(self.protocol).with_crypt(self.crypt.clone());
        config.fec = self.fec;
        if self.tls || self.protocol == Protocol::Wss {
            config.tls_client = Some(transport::tls::client_config(self.ca.as_deref())?);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write(json: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_switch_defaults() {
        let file = write(r#"{"networks": [{"name": "default"}]}"#);
        let config = SwitchConfig::load(file.path()).unwrap();
        assert_eq!(config.protocol, Protocol::Tcp);
        assert_eq!(config.listen, "0.0.0.0:10002");
        assert_eq!(config.networks[0].bridge.name, "br-default");
        assert_eq!(config.networks[0].bridge.mtu, 1500);
        assert!(config.inspects("neighbor"));
        assert!(config.inspects("online"));
    }

    #[test]
    fn test_switch_full() {
        let file = write(
            r#"{
                "alias": "sw1",
                "protocol": "udp",
                "listen": "127.0.0.1:20000",
                "timeout": 30,
                "crypt": {"algorithm": "aes-256-gcm", "secret": "s"},
                "inspect": ["neighbor"],
                "queue": {"sock_write": 64},
                "networks": [{
                    "name": "corp",
                    "bridge": {"name": "br-corp", "address": "172.16.1.1/24", "stp": true},
                    "subnet": {"start": "172.16.1.10", "end": "172.16.1.99", "netmask": "255.255.255.0"},
                    "users": [{"name": "alice", "password": "secret"}]
                }]
            }"#,
        );
        let config = SwitchConfig::load(file.path()).unwrap();
        assert_eq!(config.protocol, Protocol::Udp);
        assert!(!config.inspects("online"));
        assert_eq!(config.queue.sock_write, 64);
        assert_eq!(config.queue.tap_write, 1024);
        assert_eq!(config.session_options().timeout, Duration::from_secs(30));
        let corp = config.network("corp").unwrap();
        assert!(corp.bridge.stp);
        assert_eq!(corp.users[0].name, "alice");
    }

    #[test]
    fn test_long_network_name_truncates_bridge() {
        let mut config = SwitchConfig {
            networks: vec![NetworkConfig::new("engineering-lab")],
            ..Default::default()
        };
        config.validate().unwrap();
        assert_eq!(config.networks[0].bridge.name, "br-engineering-");
    }

    #[test]
    fn test_rejects_empty_and_duplicate_networks() {
        let mut config = SwitchConfig {
            networks: vec![NetworkConfig::new("")],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::EmptyNetwork(0))));

        let mut config = SwitchConfig {
            networks: vec![NetworkConfig::new("a"), NetworkConfig::new("a")],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::DuplicateNetwork(_))));
    }

    #[test]
    fn test_rejects_bad_subnet() {
        let mut network = NetworkConfig::new("a");
        network.subnet = Some(SubnetConfig {
            start: "10.0.0.20".parse().unwrap(),
            end: "10.0.0.10".parse().unwrap(),
            netmask: "255.255.255.0".parse().unwrap(),
        });
        let mut config = SwitchConfig {
            networks: vec![network],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Network(..))));
    }

    #[test]
    fn test_wss_requires_cert() {
        let mut config = SwitchConfig {
            protocol: Protocol::Wss,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingCertificate(Protocol::Wss))
        ));
    }

    #[test]
    fn test_unknown_protocol_is_parse_error() {
        let file = write(r#"{"protocol": "sctp"}"#);
        assert!(matches!(
            SwitchConfig::load(file.path()),
            Err(ConfigError::Parse(..))
        ));
    }

    #[test]
    fn test_point_defaults() {
        let file = write(r#"{"connection": "vpn.example.com", "username": "bob", "password": "pw"}"#);
        let config = PointConfig::load(file.path()).unwrap();
        assert_eq!(config.connection, "vpn.example.com:10002");
        assert_eq!(config.network, "default");
        assert_eq!(config.alias, "bob");
        assert!(config.uuid.is_some());
        assert_eq!(config.keepalive, 10);
    }

    #[test]
    fn test_links_inherit_network() {
        let mut network = NetworkConfig::new("corp");
        network.links.push(PointConfig::new("10.0.0.1", "sw2", "pw"));
        let mut config = SwitchConfig {
            networks: vec![network],
            ..Default::default()
        };
        config.validate().unwrap();
        let link = &config.networks[0].links[0];
        assert_eq!(link.network, "corp");
        assert_eq!(link.bridge.as_deref(), Some("br-corp"));
    }
}
