//! IPv4 address leases handed to signed-in points.

use crate::config::SubnetConfig;
use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("invalid netmask {0}")]
    Netmask(Ipv4Addr),

    #[error("range {0}-{1} does not fit netmask {2}")]
    Range(Ipv4Addr, Ipv4Addr, Ipv4Addr),

    #[error("no free address in network {0}")]
    Exhausted(String),
}

pub type Result<T> = std::result::Result<T, LeaseError>;

/// One allocated address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

#[derive(Default)]
struct Leases {
    by_uuid: HashMap<String, u32>,
    used: BTreeSet<u32>,
}

/// Address pool of one tenant network, keyed by point UUID.
pub struct LeasePool {
    network: String,
    start: u32,
    end: u32,
    netmask: Ipv4Addr,
    leases: Mutex<Leases>,
}

impl LeasePool {
    pub fn new(network: &str, subnet: &SubnetConfig) -> Result<Self> {
        let prefix = ipnet::ipv4_mask_to_prefix(subnet.netmask)
            .map_err(|_| LeaseError::Netmask(subnet.netmask))?;
        let net = ipnet::Ipv4Net::new(subnet.start, prefix)
            .map_err(|_| LeaseError::Netmask(subnet.netmask))?
            .trunc();
        if !net.contains(&subnet.end) || u32::from(subnet.start) > u32::from(subnet.end) {
            return Err(LeaseError::Range(subnet.start, subnet.end, subnet.netmask));
        }
        Ok(Self {
            network: network.to_string(),
            start: subnet.start.into(),
            end: subnet.end.into(),
            netmask: subnet.netmask,
            leases: Mutex::new(Leases::default()),
        })
    }

    fn leases(&self) -> MutexGuard<'_, Leases> {
        self.leases.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lease an address to `uuid`, returning its existing lease if it has one.
    pub fn alloc(&self, uuid: &str) -> Result<Lease> {
        let mut leases = self.leases();
        if let Some(&addr) = leases.by_uuid.get(uuid) {
            return Ok(self.lease(addr));
        }
        let free = (self.start..=self.end)
            .find(|a| !leases.used.contains(a))
            .ok_or_else(|| LeaseError::Exhausted(self.network.clone()))?;
        leases.used.insert(free);
        leases.by_uuid.insert(uuid.to_string(), free);
        Ok(self.lease(free))
    }

    /// Give back the lease of `uuid`. Releasing twice is a no-op.
    pub fn release(&self, uuid: &str) -> Option<Ipv4Addr> {
        let mut leases = self.leases();
        let addr = leases.by_uuid.remove(uuid)?;
        leases.used.remove(&addr);
        Some(Ipv4Addr::from(addr))
    }

    pub fn address_of(&self, uuid: &str) -> Option<Ipv4Addr> {
        self.leases().by_uuid.get(uuid).map(|&a| Ipv4Addr::from(a))
    }

    pub fn len(&self) -> usize {
        self.leases().by_uuid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lease(&self, addr: u32) -> Lease {
        Lease {
            address: Ipv4Addr::from(addr),
            netmask: self.netmask,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(start: &str, end: &str) -> LeasePool {
        LeasePool::new(
            "corp",
            &SubnetConfig {
                start: start.parse().unwrap(),
                end: end.parse().unwrap(),
                netmask: "255.255.255.0".parse().unwrap(),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_alloc_is_stable_per_uuid() {
        let pool = pool("10.0.0.10", "10.0.0.20");
        let a = pool.alloc("a").unwrap();
        let b = pool.alloc("b").unwrap();
        assert_eq!(a.address, Ipv4Addr::new(10, 0, 0, 10));
        assert_eq!(b.address, Ipv4Addr::new(10, 0, 0, 11));
        assert_eq!(pool.alloc("a").unwrap(), a);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_release_frees_address() {
        let pool = pool("10.0.0.10", "10.0.0.11");
        pool.alloc("a").unwrap();
        pool.alloc("b").unwrap();
        assert!(matches!(pool.alloc("c"), Err(LeaseError::Exhausted(_))));

        assert_eq!(pool.release("a"), Some(Ipv4Addr::new(10, 0, 0, 10)));
        assert_eq!(pool.release("a"), None);
        assert_eq!(pool.alloc("c").unwrap().address, Ipv4Addr::new(10, 0, 0, 10));
        assert_eq!(pool.address_of("b"), Some(Ipv4Addr::new(10, 0, 0, 11)));
    }

    #[test]
    fn test_rejects_range_outside_mask() {
        let subnet = SubnetConfig {
            start: "10.0.0.10".parse().unwrap(),
            end: "10.0.1.10".parse().unwrap(),
            netmask: "255.255.255.0".parse().unwrap(),
        };
        assert!(matches!(
            LeasePool::new("corp", &subnet),
            Err(LeaseError::Range(..))
        ));
    }

    #[test]
    fn test_rejects_bad_netmask() {
        let subnet = SubnetConfig {
            start: "10.0.0.10".parse().unwrap(),
            end: "10.0.0.20".parse().unwrap(),
            netmask: "255.0.255.0".parse().unwrap(),
        };
        assert!(matches!(
            LeasePool::new("corp", &subnet),
            Err(LeaseError::Netmask(_))
        ));
    }
}
