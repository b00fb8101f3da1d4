//! Online flow accounting for IPv4 traffic seen from points.

use super::{Hook, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use lanwire_socket::session::SessionId;
use lanwire_socket::{Frame, Session};
use serde::Serialize;
use smoltcp::wire::{EthernetFrame, EthernetProtocol, IpProtocol, Ipv4Packet, TcpPacket, UdpPacket};
use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time;
use tracing::{debug, info};

/// Sweep period of [`FlowSweeper`].
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FlowKey {
    pub protocol: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    /// Zero for ICMP.
    pub src_port: u16,
    pub dst_port: u16,
}

impl FlowKey {
    /// Five-tuple of an IPv4 TCP, UDP or ICMP Ethernet frame.
    pub fn parse(ethernet: &[u8]) -> Option<Self> {
        let eth = EthernetFrame::new_checked(ethernet).ok()?;
        if eth.ethertype() != EthernetProtocol::Ipv4 {
            return None;
        }
        let ip = Ipv4Packet::new_checked(eth.payload()).ok()?;
        let (src_port, dst_port) = match ip.next_header() {
            IpProtocol::Tcp => {
                let tcp = TcpPacket::new_checked(ip.payload()).ok()?;
                (tcp.src_port(), tcp.dst_port())
            }
            IpProtocol::Udp => {
                let udp = UdpPacket::new_checked(ip.payload()).ok()?;
                (udp.src_port(), udp.dst_port())
            }
            IpProtocol::Icmp => (0, 0),
            _ => return None,
        };
        Some(Self {
            protocol: u8::from(ip.next_header()),
            src: ip.src_addr(),
            dst: ip.dst_addr(),
            src_port,
            dst_port,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Flow {
    pub key: FlowKey,
    pub session: SessionId,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub packets: u64,
    pub bytes: u64,
}

#[derive(Default)]
struct FlowTable {
    flows: HashMap<FlowKey, Flow>,
    /// Insertion order, oldest first.
    order: VecDeque<FlowKey>,
}

pub struct OnlineHook {
    table: Mutex<FlowTable>,
    max_flows: usize,
    timeout: TimeDelta,
}

impl OnlineHook {
    pub fn new(max_flows: usize, timeout: Duration) -> Self {
        Self {
            table: Mutex::new(FlowTable::default()),
            max_flows: max_flows.max(1),
            timeout: TimeDelta::from_std(timeout).unwrap_or_else(|_| TimeDelta::days(3650)),
        }
    }

    fn table(&self) -> MutexGuard<'_, FlowTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Account one frame. Returns false if it carried no tracked flow.
    pub fn record(&self, session: SessionId, ethernet: &[u8], now: DateTime<Utc>) -> bool {
        let Some(key) = FlowKey::parse(ethernet) else {
            return false;
        };
        let mut table = self.table();
        if let Some(flow) = table.flows.get_mut(&key) {
            flow.last_seen = now;
            flow.packets += 1;
            flow.bytes += ethernet.len() as u64;
            flow.session = session;
            return true;
        }

        while table.flows.len() >= self.max_flows {
            let Some(oldest) = table.order.pop_front() else {
                break;
            };
            table.flows.remove(&oldest);
        }
        table.order.push_back(key);
        table.flows.insert(
            key,
            Flow {
                key,
                session,
                first_seen: now,
                last_seen: now,
                packets: 1,
                bytes: ethernet.len() as u64,
            },
        );
        true
    }

    /// Drop flows idle since before `now - timeout`.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let deadline = now - self.timeout;
        let mut table = self.table();
        let before = table.flows.len();
        table.flows.retain(|_, f| f.last_seen >= deadline);
        let FlowTable { flows, order } = &mut *table;
        order.retain(|k| flows.contains_key(k));
        before - flows.len()
    }

    pub fn get(&self, key: &FlowKey) -> Option<Flow> {
        self.table().flows.get(key).cloned()
    }

    /// Snapshot, oldest first.
    pub fn flows(&self) -> Vec<Flow> {
        let table = self.table();
        table
            .order
            .iter()
            .filter_map(|k| table.flows.get(k).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.table().flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Hook for OnlineHook {
    fn name(&self) -> &'static str {
        "online"
    }

    async fn on_frame(&self, session: &Session, frame: &Frame) -> Result<()> {
        if let Some(ethernet) = frame.ethernet() {
            self.record(session.id(), ethernet, Utc::now());
        }
        Ok(())
    }
}

/// Periodic removal of idle flows.
pub struct FlowSweeper {
    task: tokio::task::JoinHandle<()>,
}

impl FlowSweeper {
    pub fn start(online: Arc<OnlineHook>) -> Self {
        let task = tokio::spawn(async move {
            let mut interval = time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                let removed = online.sweep(Utc::now());
                if removed > 0 {
                    debug!(removed, remaining = online.len(), "Idle flows removed");
                }
            }
        });
        info!("Flow sweeper started");
        Self { task }
    }

    pub fn stop(self) {
        self.task.abort();
        info!("Flow sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{create_arp_request, create_icmp_echo_request, create_udp_packet};

    const MAC_A: [u8; 6] = [0x52, 0x54, 0x00, 0x00, 0x00, 0x0a];
    const MAC_B: [u8; 6] = [0x52, 0x54, 0x00, 0x00, 0x00, 0x0b];

    fn udp(src_port: u16) -> Vec<u8> {
        create_udp_packet(MAC_A, MAC_B, [10, 0, 0, 1], [10, 0, 0, 2], src_port, 53, b"query")
    }

    #[test]
    fn test_parse_udp_and_icmp() {
        let key = FlowKey::parse(&udp(4000)).unwrap();
        assert_eq!(key.protocol, 17);
        assert_eq!(key.src, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!((key.src_port, key.dst_port), (4000, 53));

        let icmp = create_icmp_echo_request(MAC_A, MAC_B, [10, 0, 0, 1], [10, 0, 0, 2], 1, 1);
        let key = FlowKey::parse(&icmp).unwrap();
        assert_eq!(key.protocol, 1);
        assert_eq!(key.src_port, 0);

        assert!(FlowKey::parse(&create_arp_request(MAC_A, [10, 0, 0, 1], [10, 0, 0, 2])).is_none());
    }

    #[test]
    fn test_repeated_packets_update_one_flow() {
        let online = OnlineHook::new(16, Duration::from_secs(60));
        let t0 = Utc::now();
        let t1 = t0 + TimeDelta::seconds(5);
        assert!(online.record(1, &udp(4000), t0));
        assert!(online.record(1, &udp(4000), t1));

        let flow = online.get(&FlowKey::parse(&udp(4000)).unwrap()).unwrap();
        assert_eq!(flow.packets, 2);
        assert_eq!(flow.first_seen, t0);
        assert_eq!(flow.last_seen, t1);
        assert_eq!(online.len(), 1);
    }

    #[test]
    fn test_oldest_flow_evicted_at_capacity() {
        let online = OnlineHook::new(2, Duration::from_secs(60));
        let now = Utc::now();
        online.record(1, &udp(1), now);
        online.record(1, &udp(2), now);
        online.record(1, &udp(3), now);

        let ports: Vec<u16> = online.flows().iter().map(|f| f.key.src_port).collect();
        assert_eq!(ports, vec![2, 3]);
    }

    #[test]
    fn test_sweep_removes_idle_flows() {
        let online = OnlineHook::new(16, Duration::from_secs(60));
        let t0 = Utc::now();
        online.record(1, &udp(1), t0);
        online.record(1, &udp(2), t0 + TimeDelta::seconds(50));

        assert_eq!(online.sweep(t0 + TimeDelta::seconds(90)), 1);
        let ports: Vec<u16> = online.flows().iter().map(|f| f.key.src_port).collect();
        assert_eq!(ports, vec![2]);

        // Eviction order stays consistent after a sweep.
        online.record(1, &udp(3), t0 + TimeDelta::seconds(91));
        assert_eq!(online.len(), 2);
    }
}
