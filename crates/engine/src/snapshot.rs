//! The live configuration snapshot (spec §4.6, §5, §9): VSes and reals
//! live as values indexed by stable position inside one generation,
//! published behind an `Arc` so workers hold a reference count while
//! processing a batch and never block the control thread's next
//! `update`. Per-VS mutable state (reals, the scheduler built from
//! them) still needs in-place updates for `update_reals`/`refresh`
//! without forcing a whole-snapshot republish, so each `VsRuntime` owns
//! its own small `RwLock`s — the same per-bucket-lock trade-off as the
//! session table, at VS granularity instead of shard granularity.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use parking_lot::RwLock;

use proto::addr_set::AddressSet;
use proto::config::{BalancerConfig, Scheduler, SessionsTimeouts, VsFlags, WlcParams};
use proto::identifiers::{RealIdentifier, RelativeRealIdentifier, VsIdentifier};

use crate::scheduler::round_robin::RoundRobinScheduler;
use crate::scheduler::source_hash::SourceHashScheduler;
use crate::scheduler::RealCandidate;

#[derive(Debug, Clone, Copy)]
pub struct RealState {
    pub ip: IpAddr,
    pub src_addr: IpAddr,
    pub src_mask: IpAddr,
    pub weight: u32,
    pub enabled: bool,
}

impl RealState {
    pub fn identifier(&self, vs: VsIdentifier) -> RealIdentifier {
        RealIdentifier {
            vs,
            real: RelativeRealIdentifier { ip: self.ip },
        }
    }
}

pub enum VsScheduler {
    RoundRobin(RoundRobinScheduler),
    SourceHash(SourceHashScheduler),
}

/// A VS's view of the world: identity, flags, allow-list, peers, and the
/// mutable real list + scheduler built from it. `reals`' index is its
/// `RealCandidate::index`, stable for the lifetime of this `VsRuntime`
/// (a full `update()` creates a brand new one; `update_reals` mutates
/// the existing one in place, per spec §9's "only the former
/// invalidates reals not present in the new set").
pub struct VsRuntime {
    pub identifier: VsIdentifier,
    pub flags: VsFlags,
    pub scheduler_kind: Scheduler,
    pub allowed: AddressSet,
    pub peers: Vec<IpAddr>,
    pub reals: RwLock<Vec<RealState>>,
    pub scheduler: RwLock<VsScheduler>,
    /// Per-VS monotonic cursor backing round-robin's effective-weight
    /// table rebuilds aren't atomic across a rebuild race; used only to
    /// log/debug generation skew, not correctness-critical.
    pub generation: AtomicU32,
}

impl VsRuntime {
    pub fn from_config(vs: &proto::config::VirtualService) -> Self {
        let mut addresses = AddressSet::new();
        for subnet in &vs.allowed_srcs {
            addresses.insert(subnet.addr, subnet.prefix_len);
        }
        let reals: Vec<RealState> = vs
            .reals
            .iter()
            .map(|r| RealState {
                ip: r.ip,
                src_addr: r.src_addr,
                src_mask: r.src_mask,
                weight: r.weight,
                enabled: r.enable,
            })
            .collect();
        let candidates = candidates_from_reals(&reals, None);
        let scheduler = build_scheduler(vs.scheduler, &candidates);
        Self {
            identifier: vs.identifier(),
            flags: vs.flags,
            scheduler_kind: vs.scheduler,
            allowed: addresses,
            peers: vs.peers.clone(),
            reals: RwLock::new(reals),
            scheduler: RwLock::new(scheduler),
            generation: AtomicU32::new(0),
        }
    }

    /// Rebuilds the scheduler from the current real list, applying WLC
    /// effective weights when the VS has the `wlc` flag (spec §4.3).
    /// `effective_weights` is indexed the same way as `self.reals`.
    pub fn rebuild_scheduler(&self, effective_weights: Option<&[u32]>) {
        let reals = self.reals.read();
        let candidates = candidates_from_reals(&reals, effective_weights);
        drop(reals);
        let mut scheduler = self.scheduler.write();
        *scheduler = build_scheduler(self.scheduler_kind, &candidates);
        self.generation.fetch_add(1, Ordering::Relaxed);
    }
}

/// Builds the ordered candidate list a scheduler is built from: disabled
/// reals are excluded entirely (spec §4.3 — a disabled real never
/// receives new flows), and each candidate keeps its position in
/// `reals` as `index` so `update_reals` can address it later.
fn candidates_from_reals(reals: &[RealState], effective_weights: Option<&[u32]>) -> Vec<RealCandidate> {
    reals
        .iter()
        .enumerate()
        .filter(|(_, r)| r.enabled)
        .map(|(i, r)| RealCandidate {
            index: i,
            ip: r.ip,
            weight: effective_weights.map(|w| w[i]).unwrap_or(r.weight),
        })
        .collect()
}

fn build_scheduler(kind: Scheduler, candidates: &[RealCandidate]) -> VsScheduler {
    match kind {
        Scheduler::RoundRobin => VsScheduler::RoundRobin(RoundRobinScheduler::build(candidates)),
        Scheduler::SourceHash => VsScheduler::SourceHash(SourceHashScheduler::build(candidates)),
    }
}

/// One generation of the whole live configuration: the per-VS runtimes
/// plus the handler-wide values that don't belong to any single VS
/// (decap addresses, default tunnel sources, session timeouts, WLC
/// parameters). Published as a single `Arc` so a worker reading it
/// mid-batch never observes a torn update (spec §5).
pub struct Snapshot {
    pub vs: AHashMap<VsIdentifier, Arc<VsRuntime>>,
    /// Distinct VS addresses, ignoring port/protocol — an ICMP echo
    /// request has neither, so "directed to a VS address" (spec §4.5)
    /// is checked against this set rather than the `vs` map's keys.
    pub vs_addresses: AHashSet<IpAddr>,
    pub decap_addresses: Vec<IpAddr>,
    pub source_address_v4: IpAddr,
    pub source_address_v6: IpAddr,
    pub timeouts: SessionsTimeouts,
    pub wlc: WlcParams,
}

impl Snapshot {
    pub fn vs_ids(&self) -> Vec<VsIdentifier> {
        self.vs.keys().copied().collect()
    }

    /// First VS runtime configured at `addr`, ignoring port/protocol — the
    /// lookup an ICMP echo request (which carries neither) needs to credit
    /// the right VS's `echo_icmp_packets`/`src_not_allowed` counters.
    pub fn vs_by_addr(&self, addr: IpAddr) -> Option<&Arc<VsRuntime>> {
        self.vs.values().find(|vs| vs.identifier.addr == addr)
    }

    pub fn real_ids(&self) -> Vec<RealIdentifier> {
        self.vs
            .iter()
            .flat_map(|(id, runtime)| {
                runtime
                    .reals
                    .read()
                    .iter()
                    .map(|r| r.identifier(*id))
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

pub fn build_snapshot(config: &BalancerConfig) -> Arc<Snapshot> {
    let mut vs = AHashMap::new();
    let mut vs_addresses = AHashSet::new();
    for entry in &config.packet_handler.vs {
        vs_addresses.insert(entry.addr);
        vs.insert(entry.identifier(), Arc::new(VsRuntime::from_config(entry)));
    }
    Arc::new(Snapshot {
        vs,
        vs_addresses,
        decap_addresses: config.packet_handler.decap_addresses.clone(),
        source_address_v4: config.packet_handler.source_address_v4,
        source_address_v6: config.packet_handler.source_address_v6,
        timeouts: config.packet_handler.sessions_timeouts,
        wlc: config.state.wlc,
    })
}
