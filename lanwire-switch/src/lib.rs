//! lanwire-switch: virtual Ethernet overlay switch.
//!
//! Points tunnel Ethernet frames to the switch over a [`lanwire_socket`]
//! session. The switch authenticates each point, binds it to a tap on the
//! bridge of its tenant network and forwards frames both ways.
//!
//! # Architecture
//!
//! ```text
//! point tap <-> Agent <-> Session ~~ transport ~~ Listener <-> Switch
//!                                                               |
//!                      access -> request -> neighbor -> online  (hook pipeline)
//!                                                               |
//!                                             point tap <-> tenant bridge
//! ```

pub mod agent;
pub mod bridge;
pub mod config;
pub mod device;
pub mod hook;
pub mod lease;
pub mod message;
pub mod neighbor;
pub mod point;
pub mod publish;
pub mod switch;
pub mod tap;
pub mod worker;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

// Re-export commonly used types
pub use agent::Agent;
pub use bridge::{Bridger, LinuxBridge};
pub use config::{NetworkConfig, PointConfig, SwitchConfig};
pub use device::{DeviceFactory, LinuxDevices};
pub use hook::{Hook, HookError, Pipeline};
pub use lease::LeasePool;
pub use neighbor::{Neighbor, Neighbors};
pub use point::{Point, PointTable};
pub use publish::{FilePublisher, LogPublisher, Publisher};
pub use switch::{Switch, SwitchError};
pub use tap::{TapDevice, Taper};
pub use worker::NetworkWorker;
