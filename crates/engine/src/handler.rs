//! Top-level per-packet dispatch (spec §4.6). `PacketHandler` owns the
//! live configuration snapshot, the shared session table, and the
//! per-worker counter shards, and exposes `process_frame` as the single
//! call-site N worker threads drive concurrently without any
//! synchronization beyond what the snapshot/table/counters already do
//! internally (spec §5).

use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use proto::config::BalancerConfig;
use proto::identifiers::{Protocol, RealIdentifier, RelativeRealIdentifier, VsIdentifier};

use crate::counters::Counters;
use crate::icmp::{self, IcmpKind};
use crate::packet::{self, L3Header, ParsedFrame};
use crate::scheduler::wlc::{self, RealLoad};
use crate::scheduler::FlowKey;
use crate::session::table::{SessionTable, TableError};
use crate::session::SessionKey;
use crate::snapshot::{self, RealState, Snapshot, VsRuntime, VsScheduler};
use crate::transform::headers::{
    IcmpHeader, TcpHeader, UdpHeader, IPPROTO_GRE, IPPROTO_IPIP, IPPROTO_IPV6, IPPROTO_TCP,
    IPPROTO_UDP, TCP_FLAG_ACK, TCP_FLAG_FIN, TCP_FLAG_RST, TCP_FLAG_SYN,
};
use crate::transform::{self, RealTarget};

const REL: Ordering = Ordering::Relaxed;

/// Outer protocols this engine's own `transform::encapsulate` stamps on
/// every tunneled frame it produces (IP-in-IP, 4-in-6, GRE) — recognizing
/// them here is what lets an incoming tunneled ICMP error addressed to a
/// local decap address reach `dispatch_icmp` instead of being dropped as
/// an unrecognized network protocol (spec §4.5 step 3).
fn is_tunnel_proto(proto: u8) -> bool {
    matches!(proto, IPPROTO_IPIP | IPPROTO_IPV6 | IPPROTO_GRE)
}

/// The reasons `recover_embedded_flow` can fail, folded into the ICMP
/// stats group spec §3 names. Matching on the `&'static str` message
/// `icmp::recover_embedded_flow` already returns keeps this mapping in
/// one place without widening that function's error type just for
/// counter bookkeeping.
fn classify_embedded_flow_error(message: &str) -> &'static str {
    match message {
        "embedded packet truncated" | "unrecognized embedded ip version" => "payload_too_short_ip",
        "embedded packet has no l4" | "embedded tcp truncated" | "embedded udp truncated" => {
            "payload_too_short_port"
        }
        _ => "unexpected_transport",
    }
}

pub struct PacketHandler {
    snapshot: RwLock<Arc<Snapshot>>,
    sessions: SessionTable,
    counters: Counters,
}

impl PacketHandler {
    pub fn new(config: &BalancerConfig, worker_count: usize) -> Self {
        let snapshot = snapshot::build_snapshot(config);
        let sessions = SessionTable::new(
            config.state.session_table_capacity,
            config.state.session_table_max_load_factor,
        );
        let counters = Counters::new(worker_count);
        counters.sync_topology(&snapshot.vs_ids(), &snapshot.real_ids());
        Self {
            snapshot: RwLock::new(snapshot),
            sessions,
            counters,
        }
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.read().clone()
    }

    /// Installs a freshly-built snapshot, called by the manager after a
    /// full config replace (spec §4.6: `update`).
    pub fn publish_snapshot(&self, snapshot: Arc<Snapshot>) {
        self.counters.sync_topology(&snapshot.vs_ids(), &snapshot.real_ids());
        *self.snapshot.write() = snapshot;
    }

    /// Runs the per-tick maintenance pass (spec §4.6: `refresh`): recompute
    /// WLC effective weights, sweep expired sessions, evict sessions whose
    /// real no longer exists, grow session-table shards under pressure.
    /// Uses counter shard 0 as the control thread's shard, the same
    /// convention `Manager` uses for every control-surface counter touch.
    pub fn refresh(&self, now: u64) -> usize {
        let snapshot = self.snapshot.read().clone();

        for (vs_id, vs) in &snapshot.vs {
            if !vs.flags.wlc {
                continue;
            }
            let loads: Vec<RealLoad> = {
                let reals = vs.reals.read();
                reals
                    .iter()
                    .map(|r| {
                        let real_id = r.identifier(*vs_id);
                        let active = self
                            .counters
                            .with_real(0, real_id, |c| c.active_sessions())
                            .unwrap_or(0);
                        RealLoad {
                            weight: r.weight,
                            active_sessions: active as u32,
                            enabled: r.enabled,
                        }
                    })
                    .collect()
            };
            let weights = wlc::recompute_effective_weights(&loads, snapshot.wlc.power, snapshot.wlc.max_weight);
            vs.rebuild_scheduler(Some(&weights));
        }

        let evicted = self.sessions.refresh(now, &snapshot.timeouts, |key, entry| {
            vs_for_key(&snapshot, key)
                .map(|vs| vs.reals.read().iter().any(|r| r.ip == entry.real_ip))
                .unwrap_or(false)
        });

        for (key, entry) in &evicted {
            if let Some(vs) = vs_for_key(&snapshot, key) {
                self.counters.with_vs(0, vs.identifier, |c| {
                    c.active_sessions.fetch_sub(1, REL);
                });
                let real_id = RealIdentifier {
                    vs: vs.identifier,
                    real: RelativeRealIdentifier { ip: entry.real_ip },
                };
                self.counters.with_real(0, real_id, |c| {
                    c.active_sessions.fetch_sub(1, REL);
                });
            }
        }
        evicted.len()
    }

    /// Selects a real for `flow` from `vs`'s current scheduler, resolving
    /// the chosen index back into a full [`RealState`] snapshot.
    fn select_real(&self, vs: &VsRuntime, flow: FlowKey) -> Option<RealState> {
        let idx = {
            let scheduler = vs.scheduler.read();
            match &*scheduler {
                VsScheduler::RoundRobin(s) => s.select(),
                VsScheduler::SourceHash(s) => s.select(flow, vs.flags.pure_l3),
            }
        }?;
        vs.reals.read().get(idx).copied()
    }

    /// Processes one raw Ethernet frame, returning every frame the
    /// balancer emits in response (zero, one, or — for ICMP broadcast —
    /// many). All per-packet failures are absorbed into counters; none
    /// propagate (spec §7).
    pub fn process_frame(&self, raw: Bytes, worker: usize, now: u64) -> Vec<Bytes> {
        let raw_len = raw.len() as u64;
        self.counters.with_common(worker, |c| {
            c.incoming_packets.fetch_add(1, REL);
            c.incoming_bytes.fetch_add(raw_len, REL);
        });

        let frame = match packet::parse(raw) {
            Ok(f) => f,
            Err(_) => return vec![],
        };

        let snapshot = self.snapshot.read().clone();
        let next_proto = frame.l3.next_proto();
        let tunneled_to_decap_address =
            is_tunnel_proto(next_proto) && snapshot.decap_addresses.contains(&frame.l3.dst_ip());

        if frame.l3.is_icmp() || tunneled_to_decap_address {
            log::trace!(
                "dispatch: proto={} dst={:?} -> icmp (tunneled={})",
                next_proto,
                frame.l3.dst_ip(),
                tunneled_to_decap_address
            );
            return self.dispatch_icmp(frame, &snapshot, worker, now);
        }

        match next_proto {
            IPPROTO_TCP | IPPROTO_UDP => self.dispatch_l4(frame, &snapshot, worker, now),
            _ => {
                log::trace!("dropping frame with unexpected network proto={}", next_proto);
                self.counters
                    .with_common(worker, |c| c.unexpected_network_proto.fetch_add(1, REL));
                vec![]
            }
        }
    }

    fn dispatch_l4(&self, frame: ParsedFrame, snapshot: &Arc<Snapshot>, worker: usize, now: u64) -> Vec<Bytes> {
        let raw_len = frame.raw.len() as u64;
        self.counters.with_l4(worker, |c| c.incoming_packets.fetch_add(1, REL));

        let l4 = frame.l4();
        let tcp_flags;
        let proto;
        let src_port;
        let dst_port;
        match frame.l3.next_proto() {
            IPPROTO_TCP => match TcpHeader::parse(l4) {
                Ok(tcp) => {
                    proto = Protocol::Tcp;
                    src_port = tcp.src_port;
                    dst_port = tcp.dst_port;
                    tcp_flags = Some((
                        tcp.has_flag(TCP_FLAG_SYN),
                        tcp.has_flag(TCP_FLAG_ACK),
                        tcp.has_flag(TCP_FLAG_FIN),
                        tcp.has_flag(TCP_FLAG_RST),
                    ));
                }
                Err(_) => {
                    self.counters.with_l4(worker, |c| c.invalid_packets.fetch_add(1, REL));
                    return vec![];
                }
            },
            IPPROTO_UDP => match UdpHeader::parse(l4) {
                Ok(udp) => {
                    proto = Protocol::Udp;
                    src_port = udp.src_port;
                    dst_port = udp.dst_port;
                    tcp_flags = None;
                }
                Err(_) => {
                    self.counters.with_l4(worker, |c| c.invalid_packets.fetch_add(1, REL));
                    return vec![];
                }
            },
            _ => unreachable!("caller already filtered to TCP/UDP"),
        }

        let dst_ip = frame.l3.dst_ip();
        let vs = snapshot
            .vs
            .get(&VsIdentifier::new(dst_ip, dst_port, proto))
            .or_else(|| {
                snapshot
                    .vs
                    .get(&VsIdentifier::new(dst_ip, 0, proto))
                    .filter(|vs| vs.flags.pure_l3)
            })
            .cloned();
        let vs = match vs {
            Some(v) => v,
            None => {
                self.counters.with_l4(worker, |c| c.select_vs_failed.fetch_add(1, REL));
                return vec![];
            }
        };

        self.counters.with_vs(worker, vs.identifier, |c| {
            c.incoming_packets.fetch_add(1, REL);
            c.incoming_bytes.fetch_add(raw_len, REL);
        });

        let client_ip = frame.l3.src_ip();
        if !vs.allowed.is_empty() && !vs.allowed.contains(client_ip) {
            self.counters
                .with_vs(worker, vs.identifier, |c| c.packet_src_not_allowed.fetch_add(1, REL));
            return vec![];
        }

        let key = SessionKey {
            client_ip,
            client_port: src_port,
            vs_ip: vs.identifier.addr,
            vs_port: dst_port,
            proto,
        };
        let flow = FlowKey {
            client_ip,
            client_port: src_port,
            dst_port,
        };

        let real = if vs.flags.ops {
            self.counters.with_vs(worker, vs.identifier, |c| c.ops_packets.fetch_add(1, REL));
            self.select_real(&vs, flow).inspect(|real| {
                self.counters
                    .with_real(worker, real.identifier(vs.identifier), |c| c.ops_packets.fetch_add(1, REL));
            })
        } else {
            self.dispatch_session(&vs, &key, flow, worker, now)
        };

        let real = match real {
            Some(r) => r,
            None => {
                self.counters
                    .with_vs(worker, vs.identifier, |c| c.select_real_failed.fetch_add(1, REL));
                self.counters.with_l4(worker, |c| c.select_real_failed.fetch_add(1, REL));
                return vec![];
            }
        };

        if let (Some((syn, ack, fin, rst)), false) = (tcp_flags, vs.flags.ops) {
            self.sessions.observe_tcp_flags(&key, syn, ack, fin, rst);
        }

        let target = RealTarget {
            real_ip: real.ip,
            src_addr: real.src_addr,
            use_gre: vs.flags.gre,
        };
        match transform::encapsulate(&frame, &target, vs.flags.fix_mss) {
            Ok(bytes) => {
                let out_len = bytes.len() as u64;
                self.counters.with_vs(worker, vs.identifier, |c| {
                    c.outgoing_packets.fetch_add(1, REL);
                    c.outgoing_bytes.fetch_add(out_len, REL);
                });
                self.counters
                    .with_real(worker, real.identifier(vs.identifier), |c| {
                        c.packets.fetch_add(1, REL);
                        c.bytes.fetch_add(out_len, REL);
                    });
                self.counters.with_l4(worker, |c| c.outgoing_packets.fetch_add(1, REL));
                vec![bytes]
            }
            Err(_) => vec![],
        }
    }

    /// The session-table half of step 6: hit → validate the bound real is
    /// still known, possibly rescheduling; miss → schedule and insert.
    fn dispatch_session(
        &self,
        vs: &Arc<VsRuntime>,
        key: &SessionKey,
        flow: FlowKey,
        worker: usize,
        now: u64,
    ) -> Option<RealState> {
        match self.sessions.lookup(key, now) {
            Some((bound_ip, _created)) => {
                let existing = vs.reals.read().iter().find(|r| r.ip == bound_ip).copied();
                match existing {
                    Some(real) => {
                        if !real.enabled {
                            self.counters
                                .with_vs(worker, vs.identifier, |c| c.real_is_disabled.fetch_add(1, REL));
                            self.counters.with_real(worker, real.identifier(vs.identifier), |c| {
                                c.packets_real_disabled.fetch_add(1, REL)
                            });
                        }
                        Some(real)
                    }
                    None => {
                        self.counters
                            .with_vs(worker, vs.identifier, |c| c.real_is_removed.fetch_add(1, REL));
                        match self.select_real(vs, flow) {
                            Some(real) => {
                                self.sessions.rebind(key, real.ip, now);
                                Some(real)
                            }
                            None => {
                                self.counters.with_vs(worker, vs.identifier, |c| {
                                    c.not_rescheduled_packets.fetch_add(1, REL);
                                });
                                None
                            }
                        }
                    }
                }
            }
            None => match self.select_real(vs, flow) {
                Some(real) => match self.sessions.insert(*key, real.ip, now) {
                    Ok(true) => {
                        self.counters.with_vs(worker, vs.identifier, |c| {
                            c.created_sessions.fetch_add(1, REL);
                            c.active_sessions.fetch_add(1, REL);
                        });
                        self.counters
                            .with_real(worker, real.identifier(vs.identifier), |c| {
                                c.created_sessions.fetch_add(1, REL);
                                c.active_sessions.fetch_add(1, REL);
                            });
                        Some(real)
                    }
                    Ok(false) => Some(real),
                    Err(TableError::Overflow) => {
                        log::warn!("session table overflow: vs={:?}", vs.identifier);
                        self.counters.with_vs(worker, vs.identifier, |c| {
                            c.session_table_overflow.fetch_add(1, REL);
                        });
                        None
                    }
                },
                None => None,
            },
        }
    }

    fn dispatch_icmp(&self, mut frame: ParsedFrame, snapshot: &Arc<Snapshot>, worker: usize, now: u64) -> Vec<Bytes> {
        let mut is_v6 = matches!(frame.l3, L3Header::V6(_));
        self.counters
            .with_icmp(worker, is_v6, |c| c.incoming_packets.fetch_add(1, REL));

        let mut decapsulated = false;
        if snapshot.decap_addresses.contains(&frame.l3.dst_ip()) {
            match icmp::decapsulate(&frame) {
                Ok(inner) => {
                    self.counters
                        .with_common(worker, |c| c.decap_successful.fetch_add(1, REL));
                    frame = inner;
                    is_v6 = matches!(frame.l3, L3Header::V6(_));
                    decapsulated = true;
                }
                Err(_) => {
                    log::debug!("failed to decapsulate frame at decap address={:?}", frame.l3.dst_ip());
                    self.counters.with_common(worker, |c| c.decap_failed.fetch_add(1, REL));
                    return vec![];
                }
            }
        }

        if !frame.l3.is_icmp() {
            return vec![];
        }

        let icmp_header = match IcmpHeader::parse(frame.l4()) {
            Ok(h) => h,
            Err(_) => return vec![],
        };

        match icmp::classify(icmp_header.icmp_type, is_v6) {
            IcmpKind::EchoRequest => {
                let vs = match snapshot.vs_by_addr(frame.l3.dst_ip()) {
                    Some(vs) => vs,
                    None => return vec![],
                };
                let client_ip = frame.l3.src_ip();
                if !vs.allowed.is_empty() && !vs.allowed.contains(client_ip) {
                    self.counters
                        .with_icmp(worker, is_v6, |c| c.src_not_allowed.fetch_add(1, REL));
                    return vec![];
                }
                match icmp::build_echo_reply(&frame) {
                    Ok(reply) => {
                        self.counters
                            .with_icmp(worker, is_v6, |c| c.echo_responses.fetch_add(1, REL));
                        self.counters
                            .with_vs(worker, vs.identifier, |c| c.echo_icmp_packets.fetch_add(1, REL));
                        vec![reply]
                    }
                    Err(_) => vec![],
                }
            }
            IcmpKind::Error => {
                if decapsulated && icmp::is_broadcast_marked(&frame).unwrap_or(false) {
                    self.counters
                        .with_icmp(worker, is_v6, |c| c.packet_clones_received.fetch_add(1, REL));
                    return vec![];
                }
                self.dispatch_icmp_error(&frame, snapshot, worker, now, is_v6)
            }
            IcmpKind::EchoReply | IcmpKind::Other => vec![],
        }
    }

    fn dispatch_icmp_error(
        &self,
        frame: &ParsedFrame,
        snapshot: &Snapshot,
        worker: usize,
        now: u64,
        is_v6: bool,
    ) -> Vec<Bytes> {
        let icmp_payload = frame.l4().get(IcmpHeader::LEN..).unwrap_or(&[]);
        let key = match icmp::recover_embedded_flow(icmp_payload) {
            Ok(key) => key,
            Err(e) => {
                let field = classify_embedded_flow_error(e.0);
                self.counters.with_icmp(worker, is_v6, |c| match field {
                    "payload_too_short_ip" => c.payload_too_short_ip.fetch_add(1, REL),
                    "payload_too_short_port" => c.payload_too_short_port.fetch_add(1, REL),
                    _ => c.unexpected_transport.fetch_add(1, REL),
                });
                return vec![];
            }
        };

        // An ICMP error is always addressed back to the sender of the
        // packet that triggered it, so the outer destination must equal
        // the embedded flow's own client address. A mismatch means the
        // error doesn't actually belong to the flow it claims to embed
        // (corrupted in transit, or a spoofed report) and is dropped.
        if frame.l3.dst_ip() != key.client_ip {
            log::debug!(
                "icmp error addressed to {:?} does not match embedded client {:?}",
                frame.l3.dst_ip(),
                key.client_ip
            );
            self.counters
                .with_icmp(worker, is_v6, |c| c.unmatching_src_from_original.fetch_add(1, REL));
            return vec![];
        }

        let vs = vs_for_key(snapshot, &key);
        let vs = match vs {
            Some(v) => v,
            None => {
                log::trace!("icmp error embeds unrecognized vs={:?}", key.vs_ip);
                self.counters
                    .with_icmp(worker, is_v6, |c| c.unrecognized_vs.fetch_add(1, REL));
                return vec![];
            }
        };

        match self.sessions.lookup(&key, now) {
            Some((real_ip, _)) => {
                let real = vs.reals.read().iter().find(|r| r.ip == real_ip).copied();
                let real = match real {
                    Some(r) => r,
                    None => return vec![],
                };
                let target = RealTarget {
                    real_ip: real.ip,
                    src_addr: real.src_addr,
                    use_gre: vs.flags.gre,
                };
                match transform::encapsulate(frame, &target, false) {
                    Ok(bytes) => {
                        self.counters
                            .with_icmp(worker, is_v6, |c| c.forwarded_packets.fetch_add(1, REL));
                        self.counters
                            .with_vs(worker, vs.identifier, |c| c.error_icmp_packets.fetch_add(1, REL));
                        self.counters
                            .with_real(worker, real.identifier(vs.identifier), |c| {
                                c.error_icmp_packets.fetch_add(1, REL)
                            });
                        vec![bytes]
                    }
                    Err(_) => vec![],
                }
            }
            None => {
                if vs.peers.is_empty() {
                    return vec![];
                }
                let marked_raw = match icmp::with_broadcast_marker(frame) {
                    Ok(b) => b,
                    Err(_) => return vec![],
                };
                let marked_frame = match packet::parse(marked_raw) {
                    Ok(f) => f,
                    Err(_) => return vec![],
                };
                let mut out = Vec::with_capacity(vs.peers.len());
                for peer in &vs.peers {
                    let src_addr = default_source_for(*peer, snapshot);
                    let target = RealTarget {
                        real_ip: *peer,
                        src_addr,
                        use_gre: vs.flags.gre,
                    };
                    match transform::encapsulate(&marked_frame, &target, false) {
                        Ok(bytes) => {
                            out.push(bytes);
                            self.counters
                                .with_icmp(worker, is_v6, |c| c.packet_clones_sent.fetch_add(1, REL));
                        }
                        Err(_) => {
                            self.counters
                                .with_icmp(worker, is_v6, |c| c.packet_clone_failures.fetch_add(1, REL));
                        }
                    }
                }
                self.counters
                    .with_icmp(worker, is_v6, |c| c.broadcasted_packets.fetch_add(1, REL));
                self.counters
                    .with_vs(worker, vs.identifier, |c| c.broadcasted_icmp_packets.fetch_add(1, REL));
                out
            }
        }
    }
}

pub(crate) fn vs_for_key<'a>(snapshot: &'a Snapshot, key: &SessionKey) -> Option<&'a Arc<VsRuntime>> {
    snapshot
        .vs
        .get(&VsIdentifier::new(key.vs_ip, key.vs_port, key.proto))
        .or_else(|| snapshot.vs.get(&VsIdentifier::new(key.vs_ip, 0, key.proto)))
}

fn default_source_for(peer: IpAddr, snapshot: &Snapshot) -> IpAddr {
    match peer {
        IpAddr::V4(_) => snapshot.source_address_v4,
        IpAddr::V6(_) => snapshot.source_address_v6,
    }
}
