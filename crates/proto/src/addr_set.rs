//! Address-set matcher (spec §4.1).
//!
//! Answers `contains(addr) -> bool` for an ordered list of IPv4/IPv6 CIDRs.
//! IPv4 and IPv6 prefixes are stored in disjoint lists; a lookup against an
//! address whose family has no entries returns `false` rather than falling
//! back to the other family.
//!
//! Membership, not ranking, is all `contains` needs, so no trie is built:
//! an address matches the set if *any* prefix covers it. This keeps the
//! matcher to a handful of `u32`/`u128` mask comparisons, which is plenty
//! for the allow-list and decap-address sizes this module serves.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

#[derive(Debug, Clone, Copy)]
struct Prefix<T> {
    addr: T,
    len: u8,
}

impl Prefix<u32> {
    fn covers(&self, addr: u32) -> bool {
        if self.len == 0 {
            return true;
        }
        let mask = u32::MAX.checked_shl(32 - self.len as u32).unwrap_or(0);
        (addr & mask) == (self.addr & mask)
    }
}

impl Prefix<u128> {
    fn covers(&self, addr: u128) -> bool {
        if self.len == 0 {
            return true;
        }
        let mask = u128::MAX.checked_shl(128 - self.len as u32).unwrap_or(0);
        (addr & mask) == (self.addr & mask)
    }
}

/// An ordered set of IPv4 and IPv6 CIDRs, queried by membership only.
#[derive(Debug, Clone, Default)]
pub struct AddressSet {
    v4: Vec<Prefix<u32>>,
    v6: Vec<Prefix<u128>>,
}

impl AddressSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from an ordered `(addr, prefix_len)` list. Invalid
    /// prefix lengths (> 32 for v4, > 128 for v6) are dropped silently —
    /// callers validate config shape before this point.
    pub fn from_entries(entries: impl IntoIterator<Item = (IpAddr, u8)>) -> Self {
        let mut set = Self::default();
        for (addr, len) in entries {
            set.insert(addr, len);
        }
        set
    }

    pub fn insert(&mut self, addr: IpAddr, len: u8) {
        match addr {
            IpAddr::V4(v4) if len <= 32 => self.v4.push(Prefix {
                addr: u32::from(v4),
                len,
            }),
            IpAddr::V6(v6) if len <= 128 => self.v6.push(Prefix {
                addr: u128::from(v6),
                len,
            }),
            _ => {}
        }
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }

    /// Returns whether `addr` is covered by any prefix of the matching
    /// family. An empty set always returns `false` here — "empty means
    /// allow all" is a caller-side policy, not this matcher's.
    pub fn contains(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(v4) => {
                let bits = u32::from(v4);
                self.v4.iter().any(|p| p.covers(bits))
            }
            IpAddr::V6(v6) => {
                let bits = u128::from(v6);
                self.v6.iter().any(|p| p.covers(bits))
            }
        }
    }
}

/// Well-known split-default-route pair: `0.0.0.0/1` + `128.0.0.0/1`
/// together cover all of IPv4, same as `0.0.0.0/0`.
pub fn is_v4_default(addr: Ipv4Addr, len: u8) -> bool {
    len == 0 && addr == Ipv4Addr::UNSPECIFIED
}

pub fn is_v6_default(addr: Ipv6Addr, len: u8) -> bool {
    len == 0 && addr == Ipv6Addr::UNSPECIFIED
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn empty_set_blocks() {
        let set = AddressSet::new();
        assert!(!set.contains(v4("1.2.3.4")));
    }

    #[test]
    fn exact_cidr_match() {
        let set = AddressSet::from_entries([(v4("3.3.3.0"), 24)]);
        assert!(set.contains(v4("3.3.3.3")));
        assert!(!set.contains(v4("3.3.4.1")));
    }

    #[test]
    fn default_route_allows_all_v4() {
        let set = AddressSet::from_entries([(v4("0.0.0.0"), 0)]);
        assert!(set.contains(v4("255.255.255.255")));
        assert!(set.contains(v4("0.0.0.1")));
    }

    #[test]
    fn split_default_route_allows_all_v4() {
        let set = AddressSet::from_entries([(v4("0.0.0.0"), 1), (v4("128.0.0.0"), 1)]);
        assert!(set.contains(v4("1.2.3.4")));
        assert!(set.contains(v4("200.1.1.1")));
    }

    #[test]
    fn family_mismatch_blocks() {
        let set = AddressSet::from_entries([(v4("10.0.0.0"), 8)]);
        let v6addr: IpAddr = "::1".parse().unwrap();
        assert!(!set.contains(v6addr));
    }

    #[test]
    fn ipv6_prefix_match() {
        let set = AddressSet::from_entries([("2001:db8::".parse().unwrap(), 32)]);
        assert!(set.contains("2001:db8::1".parse().unwrap()));
        assert!(!set.contains("2001:db9::1".parse().unwrap()));
    }
}
