//! Per-worker sharded counters (spec §3, §5): each worker increments its
//! own shard with no cross-worker contention; `stats`/`info` aggregate
//! shards on demand. Keyed by identity (`VsIdentifier`/`RealIdentifier`)
//! rather than position, so a config update that keeps a VS or real
//! around keeps its cumulative counters, and dropping one drops its
//! slot instead of requiring index remapping (spec §4.6: "Stats for
//! surviving VSes are preserved; stats for removed VSes disappear").

use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use ahash::AHashMap;
use parking_lot::RwLock;

use proto::identifiers::{RealIdentifier, VsIdentifier};
use proto::stats::{CommonStats, IcmpStats, L4Stats, RealStats, VsStats};

const REL: Ordering = Ordering::Relaxed;

#[derive(Default)]
pub struct AtomicVsCounters {
    pub incoming_packets: AtomicU64,
    pub incoming_bytes: AtomicU64,
    pub packet_src_not_allowed: AtomicU64,
    pub select_real_failed: AtomicU64,
    pub ops_packets: AtomicU64,
    pub session_table_overflow: AtomicU64,
    pub echo_icmp_packets: AtomicU64,
    pub error_icmp_packets: AtomicU64,
    pub real_is_disabled: AtomicU64,
    pub real_is_removed: AtomicU64,
    pub not_rescheduled_packets: AtomicU64,
    pub broadcasted_icmp_packets: AtomicU64,
    pub created_sessions: AtomicU64,
    pub active_sessions: AtomicI64,
    pub outgoing_packets: AtomicU64,
    pub outgoing_bytes: AtomicU64,
}

impl AtomicVsCounters {
    fn snapshot(&self) -> VsStats {
        VsStats {
            incoming_packets: self.incoming_packets.load(REL),
            incoming_bytes: self.incoming_bytes.load(REL),
            packet_src_not_allowed: self.packet_src_not_allowed.load(REL),
            select_real_failed: self.select_real_failed.load(REL),
            ops_packets: self.ops_packets.load(REL),
            session_table_overflow: self.session_table_overflow.load(REL),
            echo_icmp_packets: self.echo_icmp_packets.load(REL),
            error_icmp_packets: self.error_icmp_packets.load(REL),
            real_is_disabled: self.real_is_disabled.load(REL),
            real_is_removed: self.real_is_removed.load(REL),
            not_rescheduled_packets: self.not_rescheduled_packets.load(REL),
            broadcasted_icmp_packets: self.broadcasted_icmp_packets.load(REL),
            created_sessions: self.created_sessions.load(REL),
            active_sessions: self.active_sessions.load(REL).max(0) as u64,
            outgoing_packets: self.outgoing_packets.load(REL),
            outgoing_bytes: self.outgoing_bytes.load(REL),
        }
    }

    fn merge_into(&self, acc: &mut VsStats) {
        let s = self.snapshot();
        acc.incoming_packets += s.incoming_packets;
        acc.incoming_bytes += s.incoming_bytes;
        acc.packet_src_not_allowed += s.packet_src_not_allowed;
        acc.select_real_failed += s.select_real_failed;
        acc.ops_packets += s.ops_packets;
        acc.session_table_overflow += s.session_table_overflow;
        acc.echo_icmp_packets += s.echo_icmp_packets;
        acc.error_icmp_packets += s.error_icmp_packets;
        acc.real_is_disabled += s.real_is_disabled;
        acc.real_is_removed += s.real_is_removed;
        acc.not_rescheduled_packets += s.not_rescheduled_packets;
        acc.broadcasted_icmp_packets += s.broadcasted_icmp_packets;
        acc.created_sessions += s.created_sessions;
        acc.active_sessions += s.active_sessions;
        acc.outgoing_packets += s.outgoing_packets;
        acc.outgoing_bytes += s.outgoing_bytes;
    }
}

#[derive(Default)]
pub struct AtomicRealCounters {
    pub packets_real_disabled: AtomicU64,
    pub packets_real_not_present: AtomicU64,
    pub ops_packets: AtomicU64,
    pub error_icmp_packets: AtomicU64,
    pub created_sessions: AtomicU64,
    pub active_sessions: AtomicI64,
    pub packets: AtomicU64,
    pub bytes: AtomicU64,
}

impl AtomicRealCounters {
    fn snapshot(&self) -> RealStats {
        RealStats {
            packets_real_disabled: self.packets_real_disabled.load(REL),
            packets_real_not_present: self.packets_real_not_present.load(REL),
            ops_packets: self.ops_packets.load(REL),
            error_icmp_packets: self.error_icmp_packets.load(REL),
            created_sessions: self.created_sessions.load(REL),
            active_sessions: self.active_sessions(),
            packets: self.packets.load(REL),
            bytes: self.bytes.load(REL),
        }
    }

    fn merge_into(&self, acc: &mut RealStats) {
        let s = self.snapshot();
        acc.packets_real_disabled += s.packets_real_disabled;
        acc.packets_real_not_present += s.packets_real_not_present;
        acc.ops_packets += s.ops_packets;
        acc.error_icmp_packets += s.error_icmp_packets;
        acc.created_sessions += s.created_sessions;
        acc.active_sessions += s.active_sessions;
        acc.packets += s.packets;
        acc.bytes += s.bytes;
    }

    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.load(REL).max(0) as u64
    }
}

#[derive(Default)]
pub struct AtomicL4Stats {
    pub incoming_packets: AtomicU64,
    pub select_vs_failed: AtomicU64,
    pub invalid_packets: AtomicU64,
    pub select_real_failed: AtomicU64,
    pub outgoing_packets: AtomicU64,
}

impl AtomicL4Stats {
    fn merge_into(&self, acc: &mut L4Stats) {
        acc.incoming_packets += self.incoming_packets.load(REL);
        acc.select_vs_failed += self.select_vs_failed.load(REL);
        acc.invalid_packets += self.invalid_packets.load(REL);
        acc.select_real_failed += self.select_real_failed.load(REL);
        acc.outgoing_packets += self.outgoing_packets.load(REL);
    }
}

#[derive(Default)]
pub struct AtomicIcmpStats {
    pub incoming_packets: AtomicU64,
    pub src_not_allowed: AtomicU64,
    pub echo_responses: AtomicU64,
    pub payload_too_short_ip: AtomicU64,
    pub unmatching_src_from_original: AtomicU64,
    pub payload_too_short_port: AtomicU64,
    pub unexpected_transport: AtomicU64,
    pub unrecognized_vs: AtomicU64,
    pub forwarded_packets: AtomicU64,
    pub broadcasted_packets: AtomicU64,
    pub packet_clones_sent: AtomicU64,
    pub packet_clones_received: AtomicU64,
    pub packet_clone_failures: AtomicU64,
}

impl AtomicIcmpStats {
    fn merge_into(&self, acc: &mut IcmpStats) {
        acc.incoming_packets += self.incoming_packets.load(REL);
        acc.src_not_allowed += self.src_not_allowed.load(REL);
        acc.echo_responses += self.echo_responses.load(REL);
        acc.payload_too_short_ip += self.payload_too_short_ip.load(REL);
        acc.unmatching_src_from_original += self.unmatching_src_from_original.load(REL);
        acc.payload_too_short_port += self.payload_too_short_port.load(REL);
        acc.unexpected_transport += self.unexpected_transport.load(REL);
        acc.unrecognized_vs += self.unrecognized_vs.load(REL);
        acc.forwarded_packets += self.forwarded_packets.load(REL);
        acc.broadcasted_packets += self.broadcasted_packets.load(REL);
        acc.packet_clones_sent += self.packet_clones_sent.load(REL);
        acc.packet_clones_received += self.packet_clones_received.load(REL);
        acc.packet_clone_failures += self.packet_clone_failures.load(REL);
    }
}

#[derive(Default)]
pub struct AtomicCommonStats {
    pub incoming_packets: AtomicU64,
    pub incoming_bytes: AtomicU64,
    pub unexpected_network_proto: AtomicU64,
    pub decap_successful: AtomicU64,
    pub decap_failed: AtomicU64,
    pub outgoing_packets: AtomicU64,
    pub outgoing_bytes: AtomicU64,
}

impl AtomicCommonStats {
    fn merge_into(&self, acc: &mut CommonStats) {
        acc.incoming_packets += self.incoming_packets.load(REL);
        acc.incoming_bytes += self.incoming_bytes.load(REL);
        acc.unexpected_network_proto += self.unexpected_network_proto.load(REL);
        acc.decap_successful += self.decap_successful.load(REL);
        acc.decap_failed += self.decap_failed.load(REL);
        acc.outgoing_packets += self.outgoing_packets.load(REL);
        acc.outgoing_bytes += self.outgoing_bytes.load(REL);
    }
}

struct Shard {
    vs: AHashMap<VsIdentifier, AtomicVsCounters>,
    real: AHashMap<RealIdentifier, AtomicRealCounters>,
    l4: AtomicL4Stats,
    icmpv4: AtomicIcmpStats,
    icmpv6: AtomicIcmpStats,
    common: AtomicCommonStats,
}

impl Default for Shard {
    fn default() -> Self {
        Self {
            vs: AHashMap::new(),
            real: AHashMap::new(),
            l4: AtomicL4Stats::default(),
            icmpv4: AtomicIcmpStats::default(),
            icmpv6: AtomicIcmpStats::default(),
            common: AtomicCommonStats::default(),
        }
    }
}

/// Owns one [`Shard`] per worker. Workers only ever read their own shard
/// (via [`Counters::shard`]) so no atomic is ever contended across
/// threads in the intended usage; the `RwLock` around the whole
/// collection only guards the rare structural change a config update
/// makes.
pub struct Counters {
    shards: Vec<RwLock<Shard>>,
}

impl Counters {
    pub fn new(worker_count: usize) -> Self {
        Self {
            shards: (0..worker_count.max(1)).map(|_| RwLock::new(Shard::default())).collect(),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.shards.len()
    }

    /// Ensures every shard has an entry for each VS/real in the new
    /// configuration, preserving any survivor's existing counters and
    /// dropping entries for anything no longer present.
    pub fn sync_topology(&self, vs_ids: &[VsIdentifier], real_ids: &[RealIdentifier]) {
        for shard_lock in &self.shards {
            let mut shard = shard_lock.write();
            shard.vs.retain(|id, _| vs_ids.contains(id));
            for id in vs_ids {
                if let Entry::Vacant(e) = shard.vs.entry(*id) {
                    e.insert(AtomicVsCounters::default());
                }
            }
            shard.real.retain(|id, _| real_ids.contains(id));
            for id in real_ids {
                if let Entry::Vacant(e) = shard.real.entry(*id) {
                    e.insert(AtomicRealCounters::default());
                }
            }
        }
    }

    pub fn with_vs<R>(&self, worker: usize, vs: VsIdentifier, f: impl FnOnce(&AtomicVsCounters) -> R) -> Option<R> {
        let shard = self.shards[worker % self.shards.len()].read();
        shard.vs.get(&vs).map(f)
    }

    pub fn with_real<R>(&self, worker: usize, real: RealIdentifier, f: impl FnOnce(&AtomicRealCounters) -> R) -> Option<R> {
        let shard = self.shards[worker % self.shards.len()].read();
        shard.real.get(&real).map(f)
    }

    pub fn with_l4<R>(&self, worker: usize, f: impl FnOnce(&AtomicL4Stats) -> R) -> R {
        let shard = self.shards[worker % self.shards.len()].read();
        f(&shard.l4)
    }

    pub fn with_icmp<R>(&self, worker: usize, is_v6: bool, f: impl FnOnce(&AtomicIcmpStats) -> R) -> R {
        let shard = self.shards[worker % self.shards.len()].read();
        f(if is_v6 { &shard.icmpv6 } else { &shard.icmpv4 })
    }

    pub fn with_common<R>(&self, worker: usize, f: impl FnOnce(&AtomicCommonStats) -> R) -> R {
        let shard = self.shards[worker % self.shards.len()].read();
        f(&shard.common)
    }

    pub fn aggregate_vs(&self, vs: VsIdentifier) -> VsStats {
        let mut acc = VsStats::default();
        for shard_lock in &self.shards {
            if let Some(entry) = shard_lock.read().vs.get(&vs) {
                entry.merge_into(&mut acc);
            }
        }
        acc
    }

    pub fn aggregate_real(&self, real: RealIdentifier) -> RealStats {
        let mut acc = RealStats::default();
        for shard_lock in &self.shards {
            if let Some(entry) = shard_lock.read().real.get(&real) {
                entry.merge_into(&mut acc);
            }
        }
        acc
    }

    pub fn known_vs_ids(&self) -> Vec<VsIdentifier> {
        self.shards[0].read().vs.keys().copied().collect()
    }

    pub fn known_real_ids_for_vs(&self, vs: VsIdentifier) -> Vec<RealIdentifier> {
        self.shards[0]
            .read()
            .real
            .keys()
            .filter(|r| r.vs == vs)
            .copied()
            .collect()
    }

    pub fn aggregate_l4(&self) -> L4Stats {
        let mut acc = L4Stats::default();
        for shard_lock in &self.shards {
            shard_lock.read().l4.merge_into(&mut acc);
        }
        acc
    }

    pub fn aggregate_icmp(&self, is_v6: bool) -> IcmpStats {
        let mut acc = IcmpStats::default();
        for shard_lock in &self.shards {
            let shard = shard_lock.read();
            let group = if is_v6 { &shard.icmpv6 } else { &shard.icmpv4 };
            group.merge_into(&mut acc);
        }
        acc
    }

    pub fn aggregate_common(&self) -> CommonStats {
        let mut acc = CommonStats::default();
        for shard_lock in &self.shards {
            shard_lock.read().common.merge_into(&mut acc);
        }
        acc
    }

    pub fn active_sessions_total(&self) -> u64 {
        self.known_vs_ids()
            .iter()
            .map(|id| self.aggregate_vs(*id).active_sessions)
            .sum()
    }
}
