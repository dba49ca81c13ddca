//! Packet rewriting: encapsulation towards the chosen real, MSS clamp,
//! checksum maintenance (spec §4.4).

pub mod checksum;
pub mod headers;

use std::net::IpAddr;

use bytes::{Bytes, BytesMut};

use crate::packet::{EthernetHeader, L3Header, ParsedFrame, ETH_HEADER_LEN};
use headers::{
    build_gre_header, find_mss_option, Ipv4Header, Ipv6Header, ETHERTYPE_IPV4, ETHERTYPE_IPV6,
    IPPROTO_GRE, IPPROTO_IPIP, IPPROTO_IPV6, IPPROTO_TCP, TcpHeader,
};

/// MSS ceiling applied when `fix_mss` is set (spec §4.4).
pub const MSS_CLAMP: u16 = 1220;
/// MSS inserted when the inner packet carried no MSS option at all.
pub const MSS_DEFAULT: u16 = 536;

#[derive(Debug)]
pub struct TransformError(pub &'static str);

/// Where the chosen real lives, and how to reach it — everything the
/// transform needs beyond the inner packet itself.
pub struct RealTarget {
    pub real_ip: IpAddr,
    pub src_addr: IpAddr,
    pub use_gre: bool,
}

/// Rewrites `frame` into an encapsulated packet toward `target`,
/// clamping the inner TCP MSS when `fix_mss` is set. Returns the full
/// outbound Ethernet frame ready for `PacketSink`.
pub fn encapsulate(
    frame: &ParsedFrame,
    target: &RealTarget,
    fix_mss: bool,
) -> Result<Bytes, TransformError> {
    let mut inner = BytesMut::from(frame.l3_bytes());

    if fix_mss && frame.l3.next_proto() == IPPROTO_TCP {
        clamp_mss(&mut inner, frame.l3)?;
    }

    let outer_is_v6 = matches!(target.real_ip, IpAddr::V6(_));
    let mut out = BytesMut::new();
    out.resize(ETH_HEADER_LEN, 0);

    let outer_ethertype = if outer_is_v6 {
        ETHERTYPE_IPV6
    } else {
        ETHERTYPE_IPV4
    };

    let gre_header = target.use_gre.then(|| build_gre_header(match frame.l3 {
        L3Header::V4(_) => ETHERTYPE_IPV4,
        L3Header::V6(_) => ETHERTYPE_IPV6,
    }));

    let payload_len = inner.len() + gre_header.map_or(0, |h| h.len());
    let outer_proto = if target.use_gre {
        IPPROTO_GRE
    } else {
        match frame.l3 {
            L3Header::V4(_) => IPPROTO_IPIP,
            L3Header::V6(_) => IPPROTO_IPV6,
        }
    };

    match target.real_ip {
        IpAddr::V4(real_v4) => {
            let src_v4 = match target.src_addr {
                IpAddr::V4(v) => v,
                IpAddr::V6(_) => return Err(TransformError("src_addr family mismatch")),
            };
            let header = Ipv4Header {
                tos: 0,
                total_len: (Ipv4Header::LEN + payload_len) as u16,
                id: 0,
                flags_frag: 0,
                ttl: 64,
                proto: outer_proto,
                checksum: 0,
                src: src_v4,
                dst: real_v4,
            }
            .with_checksum_recomputed();
            out.extend_from_slice(&header.to_bytes());
        }
        IpAddr::V6(real_v6) => {
            let src_v6 = match target.src_addr {
                IpAddr::V6(v) => v,
                IpAddr::V4(_) => return Err(TransformError("src_addr family mismatch")),
            };
            let header = Ipv6Header {
                traffic_class: 0,
                flow_label: 0,
                payload_len: payload_len as u16,
                next_header: outer_proto,
                hop_limit: 64,
                src: src_v6,
                dst: real_v6,
            };
            out.extend_from_slice(&header.to_bytes());
        }
    }

    if let Some(gre) = gre_header {
        out.extend_from_slice(&gre);
    }
    out.extend_from_slice(&inner);

    let ethernet = EthernetHeader {
        dst: [0; 6],
        src: [0; 6],
        ethertype: outer_ethertype,
    };
    out[0..ETH_HEADER_LEN].copy_from_slice(&ethernet.to_bytes());

    Ok(out.freeze())
}

/// Replaces (or inserts) the TCP MSS option in place. An in-place value
/// swap updates the TCP checksum incrementally (spec §4.4); inserting a
/// missing option changes the segment's length, so that path grows the
/// buffer and recomputes both the inner IP and TCP checksums in full —
/// still cheaper than recomputing anything at the outer header, since
/// the outer header is built fresh by the caller either way.
fn clamp_mss(inner: &mut BytesMut, l3: L3Header) -> Result<(), TransformError> {
    let l3_header_len = l3.header_len();
    if inner.len() < l3_header_len + TcpHeader::MIN_LEN {
        return Err(TransformError("tcp header truncated"));
    }
    let tcp_start = l3_header_len;
    let tcp = TcpHeader::parse(&inner[tcp_start..])
        .map_err(|_| TransformError("malformed tcp header"))?;
    let options_start = tcp_start + TcpHeader::MIN_LEN;
    let options_end = tcp_start + tcp.data_offset_words as usize * 4;
    if options_end > inner.len() || options_end < options_start {
        return Err(TransformError("tcp data offset out of range"));
    }

    if let Some((old_mss, offset)) = find_mss_option(&inner[options_start..options_end]) {
        let new_mss = old_mss.min(MSS_CLAMP);
        if new_mss == old_mss {
            return Ok(());
        }
        let value_offset = options_start + offset + 2;
        inner[value_offset..value_offset + 2].copy_from_slice(&new_mss.to_be_bytes());
        let new_checksum = checksum::adjust(tcp.checksum, &[old_mss], &[new_mss]);
        inner[tcp_start + 16..tcp_start + 18].copy_from_slice(&new_checksum.to_be_bytes());
        return Ok(());
    }

    if tcp.data_offset_words >= 15 {
        return Ok(()); // options area already maxed out; nothing to insert into
    }

    // Insert a 4-byte MSS option right after the fixed header, ahead of
    // any other options, and shift everything after it.
    let option = [2u8, 4, (MSS_DEFAULT >> 8) as u8, (MSS_DEFAULT & 0xFF) as u8];
    inner.extend_from_slice(&[0u8; 4]);
    let tail_len = inner.len() - 4 - options_start;
    let (_before, after) = inner.split_at_mut(options_start);
    after.copy_within(0..tail_len, 4);
    inner[options_start..options_start + 4].copy_from_slice(&option);
    inner[tcp_start + 12] = (tcp.data_offset_words + 1) << 4;
    inner[tcp_start + 16..tcp_start + 18].copy_from_slice(&[0, 0]);

    match l3 {
        L3Header::V4(mut v4) => {
            v4.total_len += 4;
            let new_header = v4.with_checksum_recomputed();
            inner[0..l3_header_len].copy_from_slice(&new_header.to_bytes());
            let checksum = checksum::pseudo_header_checksum_v4(
                new_header.src,
                new_header.dst,
                IPPROTO_TCP,
                &inner[tcp_start..],
            );
            inner[tcp_start + 16..tcp_start + 18].copy_from_slice(&checksum.to_be_bytes());
        }
        L3Header::V6(mut v6) => {
            v6.payload_len += 4;
            inner[0..l3_header_len].copy_from_slice(&v6.to_bytes());
            let checksum =
                checksum::pseudo_header_checksum_v6(v6.src, v6.dst, IPPROTO_TCP, &inner[tcp_start..]);
            inner[tcp_start + 16..tcp_start + 18].copy_from_slice(&checksum.to_be_bytes());
        }
    }
    Ok(())
}
