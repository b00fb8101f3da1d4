//! Neighbor table learned from ARP traffic inside data frames.
//!
//! Entries map a hardware address to its last seen IPv4 address and the
//! session it was seen on. The session is kept as an id only; resolving it
//! is up to whoever owns sessions.

use crate::hook::{Hook, Result};
use crate::publish::{Fields, Publisher};
use chrono::{DateTime, Utc};
use lanwire_socket::session::SessionId;
use lanwire_socket::{Frame, Session};
use serde::Serialize;
use serde_json::json;
use smoltcp::wire::{ArpOperation, ArpPacket, ArpRepr, EthernetFrame, EthernetProtocol};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Neighbor {
    pub hwaddr: String,
    pub ipaddr: Ipv4Addr,
    pub session: SessionId,
    pub remote: String,
    pub new_time: DateTime<Utc>,
    pub hit_time: DateTime<Utc>,
}

/// Format a MAC address as `aa:bb:cc:dd:ee:ff`.
pub fn format_mac(mac: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

/// Sender hardware and protocol address of an IPv4 ARP request or reply.
pub fn arp_sender(ethernet: &[u8]) -> Option<([u8; 6], Ipv4Addr)> {
    let eth = EthernetFrame::new_checked(ethernet).ok()?;
    if eth.ethertype() != EthernetProtocol::Arp {
        return None;
    }
    let packet = ArpPacket::new_checked(eth.payload()).ok()?;
    match ArpRepr::parse(&packet).ok()? {
        ArpRepr::EthernetIpv4 {
            operation: ArpOperation::Request | ArpOperation::Reply,
            source_hardware_addr,
            source_protocol_addr,
            ..
        } => Some((source_hardware_addr.0, source_protocol_addr)),
        _ => None,
    }
}

pub struct Neighbors {
    entries: RwLock<HashMap<String, Neighbor>>,
    publisher: Arc<dyn Publisher>,
}

impl Neighbors {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            publisher,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Neighbor>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Neighbor>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Learn from one frame. VLAN-tagged frames are not inspected.
    pub fn learn(&self, session: &Session, frame: &Frame) {
        let Some(ethernet) = frame.ethernet() else {
            return;
        };
        if let Some((hwaddr, ipaddr)) = arp_sender(ethernet) {
            self.add_neighbor(&hwaddr, ipaddr, session.id(), session.address());
        }
    }

    /// Insert or update the entry for `hwaddr` and publish it.
    pub fn add_neighbor(&self, hwaddr: &[u8; 6], ipaddr: Ipv4Addr, session: SessionId, remote: &str) {
        let key = format_mac(hwaddr);
        let now = Utc::now();
        let neighbor = {
            let mut entries = self.write();
            let entry = entries.entry(key.clone()).or_insert_with(|| {
                debug!(hwaddr = %key, %ipaddr, remote, "New neighbor");
                Neighbor {
                    hwaddr: key.clone(),
                    ipaddr,
                    session,
                    remote: remote.to_string(),
                    new_time: now,
                    hit_time: now,
                }
            });
            entry.ipaddr = ipaddr;
            entry.session = session;
            entry.remote = remote.to_string();
            // Never let hit_time run backwards, even if the clock does.
            entry.hit_time = now.max(entry.hit_time);
            entry.clone()
        };
        trace!(hwaddr = %key, %ipaddr, "Neighbor updated");
        self.publish(&neighbor);
    }

    fn publish(&self, neighbor: &Neighbor) {
        let mut fields = Fields::new();
        fields.insert("hwaddr".into(), json!(neighbor.hwaddr));
        fields.insert("ipaddr".into(), json!(neighbor.ipaddr.to_string()));
        fields.insert("remote".into(), json!(neighbor.remote));
        fields.insert("newtime".into(), json!(neighbor.new_time.timestamp()));
        fields.insert("hittime".into(), json!(neighbor.hit_time.timestamp()));
        let key = format!("neighbor:{}", neighbor.hwaddr.replace(':', "-"));
        self.publisher.publish(&key, fields);
    }

    /// Look up by `aa:bb:cc:dd:ee:ff`, case-insensitively.
    pub fn get_neighbor(&self, hwaddr: &str) -> Option<Neighbor> {
        self.read().get(&hwaddr.to_ascii_lowercase()).cloned()
    }

    pub fn del_neighbor(&self, hwaddr: &str) -> Option<Neighbor> {
        self.write().remove(&hwaddr.to_ascii_lowercase())
    }

    /// Point-in-time copy of every entry.
    pub fn list_neighbors(&self) -> Vec<Neighbor> {
        self.read().values().cloned().collect()
    }

    /// Forget everything learned on `session`.
    pub fn on_session_close(&self, session: SessionId) -> usize {
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|_, n| n.session != session);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.write().clear();
    }
}

#[async_trait::async_trait]
impl Hook for Neighbors {
    fn name(&self) -> &'static str {
        "neighbor"
    }

    async fn on_frame(&self, session: &Session, frame: &Frame) -> Result<()> {
        self.learn(session, frame);
        Ok(())
    }

    async fn on_close(&self, session: &Session) {
        let removed = self.on_session_close(session.id());
        if removed > 0 {
            debug!(session = %session, removed, "Neighbors removed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{RecordingPublisher, create_arp_reply, create_arp_request, create_udp_packet};

    const HW: [u8; 6] = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];

    fn neighbors() -> (Neighbors, Arc<RecordingPublisher>) {
        let publisher = Arc::new(RecordingPublisher::default());
        (Neighbors::new(publisher.clone()), publisher)
    }

    #[test]
    fn test_arp_sender() {
        let request = create_arp_request(HW, [10, 0, 0, 5], [10, 0, 0, 1]);
        assert_eq!(arp_sender(&request), Some((HW, Ipv4Addr::new(10, 0, 0, 5))));

        let reply = create_arp_reply(HW, [10, 0, 0, 5], [0x52, 0x54, 0, 0, 0, 1], [10, 0, 0, 1]);
        assert_eq!(arp_sender(&reply), Some((HW, Ipv4Addr::new(10, 0, 0, 5))));

        let udp = create_udp_packet(HW, [0xff; 6], [10, 0, 0, 5], [10, 0, 0, 1], 1, 2, b"x");
        assert_eq!(arp_sender(&udp), None);
    }

    #[test]
    fn test_update_in_place() {
        let (neighbors, publisher) = neighbors();
        neighbors.add_neighbor(&HW, Ipv4Addr::new(10, 0, 0, 5), 1, "192.0.2.1:4000");
        let first = neighbors.get_neighbor("aa:bb:cc:dd:ee:ff").unwrap();
        assert_eq!(first.ipaddr, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(first.session, 1);

        neighbors.add_neighbor(&HW, Ipv4Addr::new(10, 0, 0, 9), 2, "192.0.2.2:4000");
        let second = neighbors.get_neighbor("AA:BB:CC:DD:EE:FF").unwrap();
        assert_eq!(neighbors.len(), 1);
        assert_eq!(second.ipaddr, Ipv4Addr::new(10, 0, 0, 9));
        assert_eq!(second.session, 2);
        assert_eq!(second.new_time, first.new_time);
        assert!(second.hit_time >= first.hit_time);

        let records = publisher.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].0, "neighbor:aa-bb-cc-dd-ee-ff");
        assert_eq!(records[1].1["ipaddr"], "10.0.0.9");
        assert_eq!(records[1].1["remote"], "192.0.2.2:4000");
    }

    #[test]
    fn test_delete_and_list_snapshot() {
        let (neighbors, _) = neighbors();
        neighbors.add_neighbor(&HW, Ipv4Addr::new(10, 0, 0, 5), 1, "r1");
        neighbors.add_neighbor(&[0x02, 0, 0, 0, 0, 1], Ipv4Addr::new(10, 0, 0, 6), 1, "r1");

        let snapshot = neighbors.list_neighbors();
        assert_eq!(snapshot.len(), 2);
        assert!(neighbors.del_neighbor("aa:bb:cc:dd:ee:ff").is_some());
        assert!(neighbors.del_neighbor("aa:bb:cc:dd:ee:ff").is_none());
        assert_eq!(snapshot.len(), 2);
        assert_eq!(neighbors.list_neighbors().len(), 1);
    }

    #[test]
    fn test_session_close_removes_its_entries() {
        let (neighbors, _) = neighbors();
        neighbors.add_neighbor(&HW, Ipv4Addr::new(10, 0, 0, 5), 1, "r1");
        neighbors.add_neighbor(&[0x02, 0, 0, 0, 0, 1], Ipv4Addr::new(10, 0, 0, 6), 2, "r2");
        assert_eq!(neighbors.on_session_close(1), 1);
        assert!(neighbors.get_neighbor("aa:bb:cc:dd:ee:ff").is_none());
        assert!(neighbors.get_neighbor("02:00:00:00:00:01").is_some());
    }
}
