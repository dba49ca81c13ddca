use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Transport protocol a virtual service speaks. Matches spec §6's wire
/// enum numbering (`TCP=0, UDP=1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp = 0,
    Udp = 1,
}

/// Identifies a virtual service: `(address, port, protocol)`.
///
/// `port == 0` is only a valid identifier when the owning VS has the
/// `pure_l3` flag set (spec §3); this type does not itself enforce that —
/// the `VirtualService` constructor does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VsIdentifier {
    pub addr: IpAddr,
    pub port: u16,
    pub proto: Protocol,
}

impl VsIdentifier {
    pub fn new(addr: IpAddr, port: u16, proto: Protocol) -> Self {
        Self { addr, port, proto }
    }
}

/// Identifies a real within a VS: the real's own IP. Reals always reuse
/// their VS's port (spec §3), so a bare IP is enough to disambiguate them
/// inside a VS's real list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelativeRealIdentifier {
    pub ip: IpAddr,
}

/// Fully-qualified real identifier: `(vs, real)`. Used by `RealUpdate` and
/// by per-real stats/session lookups that cross VS boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RealIdentifier {
    pub vs: VsIdentifier,
    pub real: RelativeRealIdentifier,
}
