//! Frame parse entry point (spec §4.6 step 1): Ethernet + L3, leaving L4
//! as an offset into the same buffer so ICMP error recovery can re-parse
//! the embedded inner packet without a copy.

use std::net::IpAddr;

use bytes::Bytes;

use crate::transform::headers::{
    self, Ipv4Header, Ipv6Header, ParseError, ETHERTYPE_IPV4, ETHERTYPE_IPV6, IPPROTO_ICMP,
    IPPROTO_ICMPV6,
};

pub const ETH_HEADER_LEN: usize = 14;

#[derive(Debug, Clone, Copy)]
pub struct EthernetHeader {
    pub dst: [u8; 6],
    pub src: [u8; 6],
    pub ethertype: u16,
}

impl EthernetHeader {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < ETH_HEADER_LEN {
            return Err(ParseError("ethernet header truncated"));
        }
        let mut dst = [0u8; 6];
        dst.copy_from_slice(&data[0..6]);
        let mut src = [0u8; 6];
        src.copy_from_slice(&data[6..12]);
        Ok(Self {
            dst,
            src,
            ethertype: u16::from_be_bytes([data[12], data[13]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; ETH_HEADER_LEN] {
        let mut out = [0u8; ETH_HEADER_LEN];
        out[0..6].copy_from_slice(&self.dst);
        out[6..12].copy_from_slice(&self.src);
        out[12..14].copy_from_slice(&self.ethertype.to_be_bytes());
        out
    }

    pub fn swapped(&self) -> Self {
        Self {
            dst: self.src,
            src: self.dst,
            ethertype: self.ethertype,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum L3Header {
    V4(Ipv4Header),
    V6(Ipv6Header),
}

impl L3Header {
    pub fn dst_ip(&self) -> IpAddr {
        match self {
            L3Header::V4(h) => IpAddr::V4(h.dst),
            L3Header::V6(h) => IpAddr::V6(h.dst),
        }
    }

    pub fn src_ip(&self) -> IpAddr {
        match self {
            L3Header::V4(h) => IpAddr::V4(h.src),
            L3Header::V6(h) => IpAddr::V6(h.src),
        }
    }

    pub fn next_proto(&self) -> u8 {
        match self {
            L3Header::V4(h) => h.proto,
            L3Header::V6(h) => h.next_header,
        }
    }

    pub fn header_len(&self) -> usize {
        match self {
            L3Header::V4(_) => Ipv4Header::LEN,
            L3Header::V6(_) => Ipv6Header::LEN,
        }
    }

    pub fn is_icmp(&self) -> bool {
        match self {
            L3Header::V4(_) => self.next_proto() == IPPROTO_ICMP,
            L3Header::V6(_) => self.next_proto() == IPPROTO_ICMPV6,
        }
    }
}

/// A parsed frame: Ethernet + L3 eagerly decoded, L4 left as a byte
/// offset so ICMP and transform can each interpret it their own way.
#[derive(Debug, Clone)]
pub struct ParsedFrame {
    pub ethernet: EthernetHeader,
    pub l3: L3Header,
    pub l4_offset: usize,
    pub raw: Bytes,
}

impl ParsedFrame {
    pub fn l4(&self) -> &[u8] {
        &self.raw[self.l4_offset..]
    }

    pub fn l3_bytes(&self) -> &[u8] {
        &self.raw[ETH_HEADER_LEN..]
    }
}

pub fn parse(raw: Bytes) -> Result<ParsedFrame, ParseError> {
    let ethernet = EthernetHeader::parse(&raw)?;
    let l3_start = ETH_HEADER_LEN;
    let l3 = match ethernet.ethertype {
        ETHERTYPE_IPV4 => L3Header::V4(Ipv4Header::parse(&raw[l3_start..])?),
        ETHERTYPE_IPV6 => L3Header::V6(Ipv6Header::parse(&raw[l3_start..])?),
        _ => return Err(ParseError("unsupported ethertype")),
    };
    let l4_offset = l3_start + l3.header_len();
    if raw.len() < l4_offset {
        return Err(ParseError("packet shorter than its own l3 header"));
    }
    Ok(ParsedFrame {
        ethernet,
        l3,
        l4_offset,
        raw,
    })
}

/// Parses an inner packet embedded in an ICMP error payload: no
/// Ethernet framing, starts directly at L3 (spec §4.5 step 1).
pub fn parse_embedded(data: &[u8]) -> Result<(L3Header, usize), ParseError> {
    if data.is_empty() {
        return Err(ParseError("empty icmp payload"));
    }
    let version = data[0] >> 4;
    let l3 = match version {
        4 => L3Header::V4(Ipv4Header::parse(data)?),
        6 => L3Header::V6(Ipv6Header::parse(data)?),
        _ => return Err(ParseError("unrecognized embedded ip version")),
    };
    let offset = l3.header_len();
    Ok((l3, offset))
}

pub use headers::ParseError as FrameParseError;
