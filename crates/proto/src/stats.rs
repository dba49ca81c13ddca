//! Counter schema (spec §3/§8), field names taken from `yanet2`'s balancer
//! stats payload (`other_examples/9a970b5c_...json_output.rs`). Every
//! counter is `u64` and monotonic for the lifetime of a `Manager`.

use serde::{Deserialize, Serialize};

use crate::identifiers::{RealIdentifier, VsIdentifier};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VsStats {
    pub incoming_packets: u64,
    pub incoming_bytes: u64,
    pub packet_src_not_allowed: u64,
    pub select_real_failed: u64,
    pub ops_packets: u64,
    pub session_table_overflow: u64,
    pub echo_icmp_packets: u64,
    pub error_icmp_packets: u64,
    pub real_is_disabled: u64,
    pub real_is_removed: u64,
    pub not_rescheduled_packets: u64,
    pub broadcasted_icmp_packets: u64,
    pub created_sessions: u64,
    pub active_sessions: u64,
    pub outgoing_packets: u64,
    pub outgoing_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealStats {
    pub packets_real_disabled: u64,
    /// Kept for wire-format parity with `yanet2`'s payload, where it is
    /// hardcoded to zero ("field removed in new proto") rather than driven by
    /// any counter — this field is never incremented here either. A real
    /// that a session is still bound to always resolves through the live
    /// config before this stat group would be the one to reflect its
    /// absence; see `DESIGN.md`.
    pub packets_real_not_present: u64,
    pub ops_packets: u64,
    pub error_icmp_packets: u64,
    pub created_sessions: u64,
    pub active_sessions: u64,
    pub packets: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct L4Stats {
    pub incoming_packets: u64,
    pub select_vs_failed: u64,
    pub invalid_packets: u64,
    pub select_real_failed: u64,
    pub outgoing_packets: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IcmpStats {
    pub incoming_packets: u64,
    pub src_not_allowed: u64,
    pub echo_responses: u64,
    pub payload_too_short_ip: u64,
    pub unmatching_src_from_original: u64,
    pub payload_too_short_port: u64,
    pub unexpected_transport: u64,
    pub unrecognized_vs: u64,
    pub forwarded_packets: u64,
    pub broadcasted_packets: u64,
    pub packet_clones_sent: u64,
    pub packet_clones_received: u64,
    pub packet_clone_failures: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonStats {
    pub incoming_packets: u64,
    pub incoming_bytes: u64,
    pub unexpected_network_proto: u64,
    pub decap_successful: u64,
    pub decap_failed: u64,
    pub outgoing_packets: u64,
    pub outgoing_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedRealStats {
    pub real: RealIdentifier,
    pub stats: RealStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedVsStats {
    pub vs: VsIdentifier,
    pub stats: VsStats,
    pub reals: Vec<NamedRealStats>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BalancerStats {
    pub l4: L4Stats,
    pub icmpv4: IcmpStats,
    pub icmpv6: IcmpStats,
    pub common: CommonStats,
    pub vs: Vec<NamedVsStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealInfo {
    pub id: RealIdentifier,
    pub active_sessions: u64,
    pub effective_weight: u32,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VsInfo {
    pub id: VsIdentifier,
    pub active_sessions: u64,
    pub reals: Vec<RealInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerInfo {
    pub active_sessions: u64,
    pub vs: Vec<VsInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub client_addr: std::net::IpAddr,
    pub client_port: u16,
    pub vs_id: VsIdentifier,
    pub real_id: RealIdentifier,
    pub created_at_secs: u64,
    pub last_seen_secs: u64,
}
