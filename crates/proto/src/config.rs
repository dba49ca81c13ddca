//! Flat, versionable configuration DTOs (spec §6), `serde`-derived so an
//! outer layer can ship them over whatever wire format it likes. Field
//! names follow `yanet2`'s balancer module
//! (`other_examples/4ba4b37f_...entities.rs`) where spec.md names a group
//! but not every field.

use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::identifiers::VsIdentifier;

/// Scheduler algorithm used to draw a real for a fresh flow (spec §6: wire
/// enum `{ROUND_ROBIN=0, SOURCE_HASH=1}`). Weighted-least-connection is not
/// a third variant here: it is the `wlc` flag below, which reweights the
/// table that round-robin or source-hash draw from (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scheduler {
    RoundRobin = 0,
    SourceHash = 1,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VsFlags {
    #[serde(default)]
    pub gre: bool,
    #[serde(default)]
    pub fix_mss: bool,
    #[serde(default)]
    pub ops: bool,
    #[serde(default)]
    pub pure_l3: bool,
    #[serde(default)]
    pub wlc: bool,
}

/// A CIDR entry in an allow-list: `(addr, prefix_len)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Subnet {
    pub addr: IpAddr,
    pub prefix_len: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Real {
    pub ip: IpAddr,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_true")]
    pub enable: bool,
    pub src_addr: IpAddr,
    pub src_mask: IpAddr,
}

fn default_weight() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VirtualService {
    pub addr: IpAddr,
    pub port: u16,
    pub proto: crate::identifiers::Protocol,
    pub scheduler: Scheduler,
    #[serde(default)]
    pub flags: VsFlags,
    #[serde(default)]
    pub allowed_srcs: Vec<Subnet>,
    pub reals: Vec<Real>,
    #[serde(default)]
    pub peers: Vec<IpAddr>,
}

impl VirtualService {
    pub fn identifier(&self) -> VsIdentifier {
        VsIdentifier::new(self.addr, self.port, self.proto)
    }

    /// Validates the invariants spec §3 requires of a single VS:
    /// `pure_l3 => port == 0`, `fix_mss` only meaningful for TCP, and a
    /// non-empty real list.
    pub fn validate(&self) -> Result<(), Error> {
        if self.flags.pure_l3 && self.port != 0 {
            return Err(Error::InvalidConfig(
                "pure_l3 virtual services must use port 0".into(),
            ));
        }
        if !self.flags.pure_l3 && self.port == 0 {
            return Err(Error::InvalidConfig(
                "port 0 is only permitted for pure_l3 virtual services".into(),
            ));
        }
        if self.reals.is_empty() {
            return Err(Error::InvalidConfig(
                "virtual service must have at least one real".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SessionsTimeouts {
    #[serde(default = "default_syn_timeout")]
    pub tcp_syn: u32,
    #[serde(default = "default_syn_timeout")]
    pub tcp_synack: u32,
    #[serde(default = "default_syn_timeout")]
    pub tcp_fin: u32,
    #[serde(default = "default_tcp_timeout")]
    pub tcp: u32,
    #[serde(default = "default_udp_timeout")]
    pub udp: u32,
    #[serde(default = "default_default_timeout")]
    pub default: u32,
}

fn default_syn_timeout() -> u32 {
    10
}
fn default_tcp_timeout() -> u32 {
    60
}
fn default_udp_timeout() -> u32 {
    30
}
fn default_default_timeout() -> u32 {
    60
}

impl Default for SessionsTimeouts {
    fn default() -> Self {
        Self {
            tcp_syn: default_syn_timeout(),
            tcp_synack: default_syn_timeout(),
            tcp_fin: default_syn_timeout(),
            tcp: default_tcp_timeout(),
            udp: default_udp_timeout(),
            default: default_default_timeout(),
        }
    }
}

impl SessionsTimeouts {
    pub fn duration(&self, seconds: u32) -> Duration {
        Duration::from_secs(seconds as u64)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WlcParams {
    #[serde(default = "default_wlc_power")]
    pub power: u64,
    #[serde(default = "default_max_weight")]
    pub max_weight: u32,
}

fn default_wlc_power() -> u64 {
    10
}
fn default_max_weight() -> u32 {
    1000
}

impl Default for WlcParams {
    fn default() -> Self {
        Self {
            power: default_wlc_power(),
            max_weight: default_max_weight(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StateConfig {
    #[serde(default = "default_table_capacity")]
    pub session_table_capacity: u64,
    #[serde(default = "default_load_factor")]
    pub session_table_max_load_factor: f32,
    #[serde(default = "default_refresh_period_ms")]
    pub refresh_period_ms: u64,
    #[serde(default)]
    pub wlc: WlcParams,
}

fn default_table_capacity() -> u64 {
    4096
}
fn default_load_factor() -> f32 {
    0.75
}
fn default_refresh_period_ms() -> u64 {
    1000
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            session_table_capacity: default_table_capacity(),
            session_table_max_load_factor: default_load_factor(),
            refresh_period_ms: default_refresh_period_ms(),
            wlc: WlcParams::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PacketHandlerConfig {
    pub source_address_v4: IpAddr,
    pub source_address_v6: IpAddr,
    #[serde(default)]
    pub decap_addresses: Vec<IpAddr>,
    #[serde(default)]
    pub vs: Vec<VirtualService>,
    #[serde(default)]
    pub sessions_timeouts: SessionsTimeouts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BalancerConfig {
    pub packet_handler: PacketHandlerConfig,
    #[serde(default)]
    pub state: StateConfig,
}

impl BalancerConfig {
    /// Validates every VS and rejects duplicate `(addr, port, proto)`
    /// identifiers before a full-replace is accepted.
    pub fn validate(&self) -> Result<(), Error> {
        let mut seen = std::collections::HashSet::new();
        for vs in &self.packet_handler.vs {
            vs.validate()?;
            if !seen.insert(vs.identifier()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate virtual service {:?}:{}",
                    vs.addr, vs.port
                )));
            }
        }
        Ok(())
    }
}

/// Incremental real enable/disable/weight change (spec §6). `None` leaves
/// the field untouched.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RealUpdate {
    pub real_id: crate::identifiers::RealIdentifier,
    pub enable: Option<bool>,
    pub weight: Option<u32>,
}
