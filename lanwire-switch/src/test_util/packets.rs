//! Ethernet frame builders for tests.

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
    EthernetRepr, Icmpv4Packet, Icmpv4Repr, IpProtocol, Ipv4Address, Ipv4Packet, Ipv4Repr,
    UdpPacket,
};

/// Ethernet header size
pub const ETHERNET_HDR_SIZE: usize = 14;

/// IP header size (without options)
pub const IP_HDR_SIZE: usize = 20;

/// UDP header size
pub const UDP_HDR_SIZE: usize = 8;

/// ARP packet size (Ethernet + IPv4)
pub const ARP_PKT_SIZE: usize = 28;

pub const BROADCAST_MAC: [u8; 6] = [0xff; 6];

fn emit_arp(
    operation: ArpOperation,
    eth_dst: [u8; 6],
    sender_mac: [u8; 6],
    sender_ip: [u8; 4],
    target_mac: [u8; 6],
    target_ip: [u8; 4],
) -> Vec<u8> {
    let mut packet = vec![0u8; ETHERNET_HDR_SIZE + ARP_PKT_SIZE];

    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress(sender_mac),
        dst_addr: EthernetAddress(eth_dst),
        ethertype: EthernetProtocol::Arp,
    };
    let mut eth_frame = EthernetFrame::new_unchecked(&mut packet[..]);
    eth_repr.emit(&mut eth_frame);

    let arp_repr = ArpRepr::EthernetIpv4 {
        operation,
        source_hardware_addr: EthernetAddress(sender_mac),
        source_protocol_addr: Ipv4Address::from(sender_ip),
        target_hardware_addr: EthernetAddress(target_mac),
        target_protocol_addr: Ipv4Address::from(target_ip),
    };
    let mut arp_packet = ArpPacket::new_unchecked(eth_frame.payload_mut());
    arp_repr.emit(&mut arp_packet);

    packet
}

/// Broadcast ARP who-has.
pub fn create_arp_request(sender_mac: [u8; 6], sender_ip: [u8; 4], target_ip: [u8; 4]) -> Vec<u8> {
    emit_arp(
        ArpOperation::Request,
        BROADCAST_MAC,
        sender_mac,
        sender_ip,
        [0; 6],
        target_ip,
    )
}

/// Unicast ARP is-at.
pub fn create_arp_reply(
    sender_mac: [u8; 6],
    sender_ip: [u8; 4],
    target_mac: [u8; 6],
    target_ip: [u8; 4],
) -> Vec<u8> {
    emit_arp(
        ArpOperation::Reply,
        target_mac,
        sender_mac,
        sender_ip,
        target_mac,
        target_ip,
    )
}

fn emit_ipv4(
    src_mac: [u8; 6],
    dst_mac: [u8; 6],
    src_ip: [u8; 4],
    dst_ip: [u8; 4],
    next_header: IpProtocol,
    payload_len: usize,
) -> Vec<u8> {
    let mut packet = vec![0u8; ETHERNET_HDR_SIZE + IP_HDR_SIZE + payload_len];

    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress(src_mac),
        dst_addr: EthernetAddress(dst_mac),
        ethertype: EthernetProtocol::Ipv4,
    };
    let mut eth_frame = EthernetFrame::new_unchecked(&mut packet[..]);
    eth_repr.emit(&mut eth_frame);

    let ip_repr = Ipv4Repr {
        src_addr: Ipv4Address::from(src_ip),
        dst_addr: Ipv4Address::from(dst_ip),
        next_header,
        payload_len,
        hop_limit: 64,
    };
    let mut ip_packet = Ipv4Packet::new_unchecked(eth_frame.payload_mut());
    ip_repr.emit(&mut ip_packet, &ChecksumCapabilities::default());

    packet
}

/// ICMP echo request.
pub fn create_icmp_echo_request(
    src_mac: [u8; 6],
    dst_mac: [u8; 6],
    src_ip: [u8; 4],
    dst_ip: [u8; 4],
    id: u16,
    seq: u16,
) -> Vec<u8> {
    let data = b"ping from test!";
    let icmp_repr = Icmpv4Repr::EchoRequest {
        ident: id,
        seq_no: seq,
        data,
    };
    let mut packet = emit_ipv4(
        src_mac,
        dst_mac,
        src_ip,
        dst_ip,
        IpProtocol::Icmp,
        icmp_repr.buffer_len(),
    );
    let offset = ETHERNET_HDR_SIZE + IP_HDR_SIZE;
    let mut icmp_packet = Icmpv4Packet::new_unchecked(&mut packet[offset..]);
    icmp_repr.emit(&mut icmp_packet, &ChecksumCapabilities::default());
    packet
}

/// UDP datagram without checksum.
pub fn create_udp_packet(
    src_mac: [u8; 6],
    dst_mac: [u8; 6],
    src_ip: [u8; 4],
    dst_ip: [u8; 4],
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let udp_len = UDP_HDR_SIZE + payload.len();
    let mut packet = emit_ipv4(src_mac, dst_mac, src_ip, dst_ip, IpProtocol::Udp, udp_len);
    let offset = ETHERNET_HDR_SIZE + IP_HDR_SIZE;
    let mut udp = UdpPacket::new_unchecked(&mut packet[offset..]);
    udp.set_src_port(src_port);
    udp.set_dst_port(dst_port);
    udp.set_len(udp_len as u16);
    udp.set_checksum(0);
    udp.payload_mut().copy_from_slice(payload);
    packet
}
