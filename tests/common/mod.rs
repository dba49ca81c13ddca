//! Frame builders shared by the end-to-end scenario tests, built the same
//! way the engine crate's own unit tests build frames (see
//! `transform::mod::tests::build_tcp_syn_frame`, `icmp::tests::
//! build_echo_request_frame`): by hand, header struct by header struct,
//! rather than through some higher-level packet-building crate.

use std::net::{IpAddr, Ipv4Addr};

use bytes::{Bytes, BytesMut};

use engine::packet::{self, EthernetHeader, ETH_HEADER_LEN};
use engine::transform::checksum;
use engine::transform::headers::{
    IcmpHeader, Ipv4Header, TcpHeader, UdpHeader, ETHERTYPE_IPV4, ICMP_DEST_UNREACHABLE,
    ICMP_ECHO_REQUEST, IPPROTO_ICMP, IPPROTO_IPIP, IPPROTO_TCP, IPPROTO_UDP, TCP_FLAG_ACK,
    TCP_FLAG_SYN,
};

pub fn tcp_frame(src: Ipv4Addr, src_port: u16, dst: Ipv4Addr, dst_port: u16, flags: u8) -> Bytes {
    let mut buf = BytesMut::new();
    buf.resize(ETH_HEADER_LEN, 0);
    let eth = EthernetHeader { dst: [1; 6], src: [2; 6], ethertype: ETHERTYPE_IPV4 };
    buf[0..ETH_HEADER_LEN].copy_from_slice(&eth.to_bytes());

    let mut tcp = vec![0u8; TcpHeader::MIN_LEN];
    tcp[0..2].copy_from_slice(&src_port.to_be_bytes());
    tcp[2..4].copy_from_slice(&dst_port.to_be_bytes());
    tcp[12] = 5 << 4;
    tcp[13] = flags;
    tcp[14..16].copy_from_slice(&4096u16.to_be_bytes());

    let ip = Ipv4Header {
        tos: 0,
        total_len: (Ipv4Header::LEN + tcp.len()) as u16,
        id: 0,
        flags_frag: 0,
        ttl: 64,
        proto: IPPROTO_TCP,
        checksum: 0,
        src,
        dst,
    }
    .with_checksum_recomputed();
    buf.extend_from_slice(&ip.to_bytes());
    buf.extend_from_slice(&tcp);
    buf.freeze()
}

pub fn udp_frame(src: Ipv4Addr, src_port: u16, dst: Ipv4Addr, dst_port: u16) -> Bytes {
    let mut buf = BytesMut::new();
    buf.resize(ETH_HEADER_LEN, 0);
    let eth = EthernetHeader { dst: [1; 6], src: [2; 6], ethertype: ETHERTYPE_IPV4 };
    buf[0..ETH_HEADER_LEN].copy_from_slice(&eth.to_bytes());

    let mut udp = vec![0u8; UdpHeader::LEN];
    udp[0..2].copy_from_slice(&src_port.to_be_bytes());
    udp[2..4].copy_from_slice(&dst_port.to_be_bytes());
    udp[4..6].copy_from_slice(&(UdpHeader::LEN as u16).to_be_bytes());

    let ip = Ipv4Header {
        tos: 0,
        total_len: (Ipv4Header::LEN + udp.len()) as u16,
        id: 0,
        flags_frag: 0,
        ttl: 64,
        proto: IPPROTO_UDP,
        checksum: 0,
        src,
        dst,
    }
    .with_checksum_recomputed();
    buf.extend_from_slice(&ip.to_bytes());
    buf.extend_from_slice(&udp);
    buf.freeze()
}

pub fn icmp_echo_request(src: Ipv4Addr, dst: Ipv4Addr, id: u16, seq: u16) -> Bytes {
    let mut buf = BytesMut::new();
    buf.resize(ETH_HEADER_LEN, 0);
    let eth = EthernetHeader { dst: [9; 6], src: [8; 6], ethertype: ETHERTYPE_IPV4 };
    buf[0..ETH_HEADER_LEN].copy_from_slice(&eth.to_bytes());

    let mut icmp = vec![0u8; IcmpHeader::LEN];
    icmp[0] = ICMP_ECHO_REQUEST;
    icmp[4..6].copy_from_slice(&id.to_be_bytes());
    icmp[6..8].copy_from_slice(&seq.to_be_bytes());
    let csum = checksum::checksum(&icmp);
    icmp[2..4].copy_from_slice(&csum.to_be_bytes());

    let ip = Ipv4Header {
        tos: 0,
        total_len: (Ipv4Header::LEN + icmp.len()) as u16,
        id: 0,
        flags_frag: 0,
        ttl: 64,
        proto: IPPROTO_ICMP,
        checksum: 0,
        src,
        dst,
    }
    .with_checksum_recomputed();
    buf.extend_from_slice(&ip.to_bytes());
    buf.extend_from_slice(&icmp);
    buf.freeze()
}

/// A destination-unreachable error whose payload embeds the full IPv4 +
/// TCP header of the flow that triggered it — enough for
/// `icmp::recover_embedded_flow` to read both ports.
pub fn icmp_dest_unreachable_embedding_tcp(
    reporter: Ipv4Addr,
    original_src: Ipv4Addr,
    original_src_port: u16,
    original_dst: Ipv4Addr,
    original_dst_port: u16,
) -> Bytes {
    let mut buf = BytesMut::new();
    buf.resize(ETH_HEADER_LEN, 0);
    let eth = EthernetHeader { dst: [9; 6], src: [8; 6], ethertype: ETHERTYPE_IPV4 };
    buf[0..ETH_HEADER_LEN].copy_from_slice(&eth.to_bytes());

    let mut embedded_tcp = vec![0u8; TcpHeader::MIN_LEN];
    embedded_tcp[0..2].copy_from_slice(&original_src_port.to_be_bytes());
    embedded_tcp[2..4].copy_from_slice(&original_dst_port.to_be_bytes());
    embedded_tcp[12] = 5 << 4;
    embedded_tcp[13] = TCP_FLAG_ACK;

    let embedded_ip = Ipv4Header {
        tos: 0,
        total_len: (Ipv4Header::LEN + embedded_tcp.len()) as u16,
        id: 0,
        flags_frag: 0,
        ttl: 64,
        proto: IPPROTO_TCP,
        checksum: 0,
        src: original_src,
        dst: original_dst,
    }
    .with_checksum_recomputed();

    let mut icmp = vec![0u8; IcmpHeader::LEN];
    icmp[0] = ICMP_DEST_UNREACHABLE;
    icmp[1] = 1; // host unreachable
    icmp.extend_from_slice(&embedded_ip.to_bytes());
    icmp.extend_from_slice(&embedded_tcp);
    let csum = checksum::checksum(&icmp);
    icmp[2..4].copy_from_slice(&csum.to_be_bytes());

    let ip = Ipv4Header {
        tos: 0,
        total_len: (Ipv4Header::LEN + icmp.len()) as u16,
        id: 0,
        flags_frag: 0,
        ttl: 64,
        proto: IPPROTO_ICMP,
        checksum: 0,
        src: reporter,
        dst: original_src,
    }
    .with_checksum_recomputed();
    buf.extend_from_slice(&ip.to_bytes());
    buf.extend_from_slice(&icmp);
    buf.freeze()
}

/// Wraps a full Ethernet+IPv4 frame in an IP-in-IP outer header addressed
/// at `outer_dst` — the shape an incoming tunneled ICMP error takes when
/// it arrives at a configured decap address.
pub fn wrap_in_ipip(inner: &Bytes, outer_src: Ipv4Addr, outer_dst: Ipv4Addr) -> Bytes {
    let inner_l3 = &inner[ETH_HEADER_LEN..];

    let mut buf = BytesMut::new();
    buf.resize(ETH_HEADER_LEN, 0);
    let eth = EthernetHeader { dst: [9; 6], src: [8; 6], ethertype: ETHERTYPE_IPV4 };
    buf[0..ETH_HEADER_LEN].copy_from_slice(&eth.to_bytes());

    let outer_ip = Ipv4Header {
        tos: 0,
        total_len: (Ipv4Header::LEN + inner_l3.len()) as u16,
        id: 0,
        flags_frag: 0,
        ttl: 64,
        proto: IPPROTO_IPIP,
        checksum: 0,
        src: outer_src,
        dst: outer_dst,
    }
    .with_checksum_recomputed();
    buf.extend_from_slice(&outer_ip.to_bytes());
    buf.extend_from_slice(inner_l3);
    buf.freeze()
}

pub fn parse_ipv4(frame: &Bytes) -> (Ipv4Addr, Ipv4Addr, u8) {
    let parsed = packet::parse(frame.clone()).unwrap();
    match parsed.l3 {
        engine::packet::L3Header::V4(h) => (h.src, h.dst, h.proto),
        _ => panic!("expected ipv4 frame"),
    }
}

#[allow(dead_code)]
pub fn addr(s: &str) -> IpAddr {
    s.parse().unwrap()
}
