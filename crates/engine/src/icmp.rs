//! ICMP echo replies, error recovery and peer broadcast (spec §4.5).

use std::net::IpAddr;

use bytes::{Bytes, BytesMut};

use proto::identifiers::Protocol;

use crate::packet::{self, EthernetHeader, L3Header, ParsedFrame, ETH_HEADER_LEN};
use crate::session::SessionKey;
use crate::transform::checksum;
use crate::transform::headers::{
    IcmpHeader, TcpHeader, UdpHeader, ICMPV6_DEST_UNREACHABLE, ICMPV6_ECHO_REPLY,
    ICMPV6_ECHO_REQUEST, ICMPV6_PACKET_TOO_BIG, ICMPV6_PARAMETER_PROBLEM, ICMPV6_TIME_EXCEEDED,
    ICMP_DEST_UNREACHABLE, ICMP_ECHO_REPLY, ICMP_ECHO_REQUEST, ICMP_PARAMETER_PROBLEM,
    ICMP_TIME_EXCEEDED, IPPROTO_ICMP, IPPROTO_ICMPV6, IPPROTO_TCP, IPPROTO_UDP,
};

/// Marks an ICMP error as already broadcast once, placed in the
/// traditionally-unused first 16 bits of the rest-of-header (spec §4.5,
/// §6, §9 — treated as a named constant in this one module only).
pub const ICMP_BROADCAST_IDENT: u16 = 0x0BDC;

#[derive(Debug)]
pub struct IcmpError(pub &'static str);

pub enum IcmpKind {
    EchoRequest,
    EchoReply,
    Error,
    Other,
}

pub fn classify(icmp_type: u8, is_v6: bool) -> IcmpKind {
    if is_v6 {
        match icmp_type {
            ICMPV6_ECHO_REQUEST => IcmpKind::EchoRequest,
            ICMPV6_ECHO_REPLY => IcmpKind::EchoReply,
            ICMPV6_DEST_UNREACHABLE | ICMPV6_PACKET_TOO_BIG | ICMPV6_TIME_EXCEEDED
            | ICMPV6_PARAMETER_PROBLEM => IcmpKind::Error,
            _ => IcmpKind::Other,
        }
    } else {
        match icmp_type {
            ICMP_ECHO_REQUEST => IcmpKind::EchoRequest,
            ICMP_ECHO_REPLY => IcmpKind::EchoReply,
            ICMP_DEST_UNREACHABLE | ICMP_TIME_EXCEEDED | ICMP_PARAMETER_PROBLEM => {
                IcmpKind::Error
            }
            _ => IcmpKind::Other,
        }
    }
}

/// Synthesizes an echo reply for an echo request addressed to a VS
/// address: swap the IP addresses, reset TTL/hop-limit to 64, preserve
/// id/seq, recompute checksums (spec §4.5).
pub fn build_echo_reply(frame: &ParsedFrame) -> Result<Bytes, IcmpError> {
    // id/seq live in the rest-of-header bytes, untouched below, so the
    // reply preserves them automatically.
    IcmpHeader::parse(frame.l4()).map_err(|_| IcmpError("icmp header truncated"))?;
    let mut icmp_bytes = BytesMut::from(frame.l4());
    let is_v6 = matches!(frame.l3, L3Header::V6(_));
    let reply_type = if is_v6 {
        ICMPV6_ECHO_REPLY
    } else {
        ICMP_ECHO_REPLY
    };
    icmp_bytes[0] = reply_type;
    icmp_bytes[1] = 0;
    icmp_bytes[2] = 0;
    icmp_bytes[3] = 0;

    let mut out = BytesMut::new();
    out.resize(ETH_HEADER_LEN, 0);

    match frame.l3 {
        L3Header::V4(h) => {
            let checksum = checksum::checksum(&icmp_bytes);
            icmp_bytes[2..4].copy_from_slice(&checksum.to_be_bytes());
            let header = crate::transform::headers::Ipv4Header {
                tos: 0,
                total_len: (crate::transform::headers::Ipv4Header::LEN + icmp_bytes.len()) as u16,
                id: 0,
                flags_frag: 0,
                ttl: 64,
                proto: IPPROTO_ICMP,
                checksum: 0,
                src: h.dst,
                dst: h.src,
            }
            .with_checksum_recomputed();
            out.extend_from_slice(&header.to_bytes());
            let ethernet = EthernetHeader {
                dst: frame.ethernet.src,
                src: frame.ethernet.dst,
                ethertype: crate::transform::headers::ETHERTYPE_IPV4,
            };
            out[0..ETH_HEADER_LEN].copy_from_slice(&ethernet.to_bytes());
        }
        L3Header::V6(h) => {
            icmp_bytes[2..4].copy_from_slice(&[0, 0]);
            let checksum =
                checksum::pseudo_header_checksum_v6(h.dst, h.src, IPPROTO_ICMPV6, &icmp_bytes);
            icmp_bytes[2..4].copy_from_slice(&checksum.to_be_bytes());
            let header = crate::transform::headers::Ipv6Header {
                traffic_class: 0,
                flow_label: 0,
                payload_len: icmp_bytes.len() as u16,
                next_header: IPPROTO_ICMPV6,
                hop_limit: 64,
                src: h.dst,
                dst: h.src,
            };
            out.extend_from_slice(&header.to_bytes());
            let ethernet = EthernetHeader {
                dst: frame.ethernet.src,
                src: frame.ethernet.dst,
                ethertype: crate::transform::headers::ETHERTYPE_IPV6,
            };
            out[0..ETH_HEADER_LEN].copy_from_slice(&ethernet.to_bytes());
        }
    }

    out.extend_from_slice(&icmp_bytes);
    Ok(out.freeze())
}

/// Recovers the flow tuple embedded in an ICMP error's payload (spec
/// §4.5 step 1): the inner IP header plus the first 8 bytes of its L4
/// header are enough to read both ports for TCP/UDP.
pub fn recover_embedded_flow(icmp_payload: &[u8]) -> Result<SessionKey, IcmpError> {
    let (inner_l3, l4_offset) =
        packet::parse_embedded(icmp_payload).map_err(|_| IcmpError("embedded packet truncated"))?;
    let l4 = icmp_payload
        .get(l4_offset..)
        .ok_or(IcmpError("embedded packet has no l4"))?;

    let (client_port, vs_port, proto) = match inner_l3.next_proto() {
        IPPROTO_TCP => {
            let tcp = TcpHeader::parse(l4).map_err(|_| IcmpError("embedded tcp truncated"))?;
            (tcp.src_port, tcp.dst_port, Protocol::Tcp)
        }
        IPPROTO_UDP => {
            let udp = UdpHeader::parse(l4).map_err(|_| IcmpError("embedded udp truncated"))?;
            (udp.src_port, udp.dst_port, Protocol::Udp)
        }
        _ => return Err(IcmpError("embedded packet is neither tcp nor udp")),
    };

    Ok(SessionKey {
        client_ip: inner_l3.src_ip(),
        client_port,
        vs_ip: inner_l3.dst_ip(),
        vs_port,
        proto,
    })
}

/// True when a decapsulated ICMP error already carries the broadcast
/// marker — re-broadcasting it would create a loop (spec §4.5 step 3).
pub fn is_broadcast_marked(frame: &ParsedFrame) -> Result<bool, IcmpError> {
    let header = IcmpHeader::parse(frame.l4()).map_err(|_| IcmpError("icmp header truncated"))?;
    Ok(header.identifier() == ICMP_BROADCAST_IDENT)
}

/// Stamps the broadcast marker into a clone of `frame`'s ICMP header and
/// recomputes its checksum, without touching the outer framing — the
/// caller encapsulates the result towards a peer separately.
pub fn with_broadcast_marker(frame: &ParsedFrame) -> Result<Bytes, IcmpError> {
    let mut raw = BytesMut::from(&frame.raw[..]);
    let l4_offset = frame.l4_offset;
    let header =
        IcmpHeader::parse(&raw[l4_offset..]).map_err(|_| IcmpError("icmp header truncated"))?;
    let marked = header.with_identifier(ICMP_BROADCAST_IDENT);
    raw[l4_offset..l4_offset + IcmpHeader::LEN].copy_from_slice(&marked.to_bytes());
    raw[l4_offset + 2..l4_offset + 4].copy_from_slice(&[0, 0]);

    let new_checksum = match frame.l3 {
        L3Header::V4(_) => checksum::checksum(&raw[l4_offset..]),
        L3Header::V6(h) => {
            checksum::pseudo_header_checksum_v6(h.src, h.dst, IPPROTO_ICMPV6, &raw[l4_offset..])
        }
    };
    raw[l4_offset + 2..l4_offset + 4].copy_from_slice(&new_checksum.to_be_bytes());

    Ok(raw.freeze())
}

/// Strips an outer tunnel header from a frame arriving at a local decap
/// address, returning the embedded packet re-parsed as if it had
/// arrived natively (spec §4.5 step 3).
pub fn decapsulate(frame: &ParsedFrame) -> Result<ParsedFrame, IcmpError> {
    let inner_bytes = frame.l4();
    if inner_bytes.is_empty() {
        return Err(IcmpError("no encapsulated payload"));
    }
    // GRE carries a 4-byte header before the inner IP packet; IP-in-IP /
    // 4-in-6 have the inner IP packet immediately following the outer
    // header, which `frame.l4()` already points at.
    let version = inner_bytes[0] >> 4;
    let payload = if version == 4 || version == 6 {
        inner_bytes
    } else if inner_bytes.len() > 4 {
        &inner_bytes[4..]
    } else {
        return Err(IcmpError("encapsulated payload too short"));
    };

    let mut synthetic = BytesMut::new();
    synthetic.extend_from_slice(&frame.ethernet.to_bytes());
    synthetic.extend_from_slice(payload);
    packet::parse(synthetic.freeze()).map_err(|_| IcmpError("failed to parse decapsulated packet"))
}

/// Whether `addr` is one of the locally configured decap addresses.
pub fn is_decap_address(addr: IpAddr, decap_addresses: &[IpAddr]) -> bool {
    decap_addresses.contains(&addr)
}
