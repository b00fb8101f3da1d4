//! Registry of signed-in points.

use crate::tap::Taper;
use chrono::{DateTime, TimeZone, Utc};
use lanwire_socket::Session;
use serde::Serialize;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// One signed-in endpoint, bound to a session and a tap.
pub struct Point {
    pub uuid: String,
    pub alias: String,
    pub user: String,
    pub network: String,
    /// Leased address, if the network leases addresses.
    pub address: Option<Ipv4Addr>,
    pub netmask: Option<Ipv4Addr>,
    pub session: Session,
    pub device: Arc<dyn Taper>,
    pub created: DateTime<Utc>,
    hit: AtomicI64,
}

impl Point {
    pub fn new(
        uuid: &str,
        alias: &str,
        user: &str,
        network: &str,
        session: Session,
        device: Arc<dyn Taper>,
    ) -> Self {
        let now = Utc::now();
        Self {
            uuid: uuid.to_string(),
            alias: alias.to_string(),
            user: user.to_string(),
            network: network.to_string(),
            address: None,
            netmask: None,
            session,
            device,
            created: now,
            hit: AtomicI64::new(now.timestamp()),
        }
    }

    pub fn with_lease(mut self, address: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        self.address = Some(address);
        self.netmask = Some(netmask);
        self
    }

    /// Registry key: the session's remote address.
    pub fn key(&self) -> &str {
        self.session.address()
    }

    pub fn touch(&self) {
        self.hit.store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    pub fn hit(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.hit.load(Ordering::Relaxed), 0)
            .single()
            .unwrap_or(self.created)
    }

    pub fn info(&self) -> PointInfo {
        PointInfo {
            uuid: self.uuid.clone(),
            alias: self.alias.clone(),
            user: self.user.clone(),
            network: self.network.clone(),
            remote: self.key().to_string(),
            device: self.device.name().to_string(),
            address: self.address,
            status: self.session.status().to_string(),
            created: self.created,
            hit: self.hit(),
        }
    }
}

impl std::fmt::Debug for Point {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Point")
            .field("uuid", &self.uuid)
            .field("network", &self.network)
            .field("remote", &self.key())
            .field("device", &self.device.name())
            .finish()
    }
}

/// Serializable snapshot of a point.
#[derive(Debug, Clone, Serialize)]
pub struct PointInfo {
    pub uuid: String,
    pub alias: String,
    pub user: String,
    pub network: String,
    pub remote: String,
    pub device: String,
    pub address: Option<Ipv4Addr>,
    pub status: String,
    pub created: DateTime<Utc>,
    pub hit: DateTime<Utc>,
}

#[derive(Default)]
struct Tables {
    by_addr: HashMap<String, Arc<Point>>,
    /// Most recent remote address of each UUID.
    addr_by_uuid: HashMap<String, String>,
}

/// Points keyed by remote address, with a UUID index pointing at the
/// newest session of each point.
#[derive(Default)]
pub struct PointTable {
    tables: RwLock<Tables>,
}

impl PointTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert `point`, making it the current one for its UUID.
    ///
    /// Returns the point it superseded, if another address held the UUID.
    pub fn add(&self, point: Arc<Point>) -> Option<Arc<Point>> {
        let key = point.key().to_string();
        let mut tables = self.write();
        let previous = tables
            .addr_by_uuid
            .insert(point.uuid.clone(), key.clone())
            .filter(|addr| *addr != key)
            .and_then(|addr| tables.by_addr.get(&addr).cloned());
        tables.by_addr.insert(key, point);
        previous
    }

    pub fn get(&self, addr: &str) -> Option<Arc<Point>> {
        self.read().by_addr.get(addr).cloned()
    }

    pub fn get_by_uuid(&self, uuid: &str) -> Option<Arc<Point>> {
        let tables = self.read();
        let addr = tables.addr_by_uuid.get(uuid)?;
        tables.by_addr.get(addr).cloned()
    }

    /// Current remote address of `uuid`.
    pub fn addr_of(&self, uuid: &str) -> Option<String> {
        self.read().addr_by_uuid.get(uuid).cloned()
    }

    /// Remove the point at `addr`. The UUID index is only cleared when it
    /// still points at `addr`.
    pub fn remove(&self, addr: &str) -> Option<Arc<Point>> {
        let mut tables = self.write();
        let point = tables.by_addr.remove(addr)?;
        if tables.addr_by_uuid.get(&point.uuid).map(String::as_str) == Some(addr) {
            tables.addr_by_uuid.remove(&point.uuid);
        }
        Some(point)
    }

    pub fn list(&self) -> Vec<Arc<Point>> {
        self.read().by_addr.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().by_addr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) -> Vec<Arc<Point>> {
        let mut tables = self.write();
        tables.addr_by_uuid.clear();
        tables.by_addr.drain().map(|(_, p)| p).collect()
    }
}
