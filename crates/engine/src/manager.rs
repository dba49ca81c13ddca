//! The control surface (spec §4.6, §5): full-config replace, incremental
//! real updates, the refresh tick, and the read-only stats/info/sessions
//! views. A [`BackingStore`] models the "shared backing store" spec §4.6 and
//! §9 describe: in production this would be a region a fresh agent attaches
//! to by name; here it is the in-process registry of [`PacketHandler`]s a
//! `Manager` is constructed against, cloned by `Arc` so handing the same
//! handler to a second `Manager` is exactly the persistence handoff spec §8's
//! "cross-agent persistence" scenario exercises.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use ahash::AHashMap;
use ahash::AHashSet;
use bytes::Bytes;
use parking_lot::RwLock;

use proto::config::{BalancerConfig, RealUpdate};
pub use proto::error::Error as ControlError;
use proto::identifiers::{RealIdentifier, RelativeRealIdentifier, VsIdentifier};
use proto::stats::{
    BalancerInfo, BalancerStats, NamedRealStats, NamedVsStats, RealInfo, SessionInfo, VsInfo,
};

use crate::handler::{vs_for_key, PacketHandler};
use crate::snapshot;

const REL: Ordering = Ordering::Relaxed;

type ControlResult<T> = std::result::Result<T, ControlError>;

/// The named registry a fresh agent attaches to. Holds one [`PacketHandler`]
/// per manager name; attaching clones the `Arc`, so the second agent shares
/// the exact session table, counters and live config the first one built.
#[derive(Default)]
pub struct BackingStore {
    handlers: RwLock<AHashMap<String, Arc<PacketHandler>>>,
}

impl BackingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

pub struct Manager {
    handler: Arc<PacketHandler>,
}

impl Manager {
    /// Builds a fresh handler from `config`, validates it, and registers it
    /// in `store` under `name` for later attachment (spec §4.6:
    /// `manager_attach`).
    pub fn create(
        store: &BackingStore,
        name: impl Into<String>,
        config: &BalancerConfig,
        worker_count: usize,
    ) -> ControlResult<Self> {
        config.validate()?;
        let handler = Arc::new(PacketHandler::new(config, worker_count));
        store.handlers.write().insert(name.into(), handler.clone());
        Ok(Self { handler })
    }

    /// A manager with no backing store entry, for tests and standalone use.
    pub fn standalone(config: &BalancerConfig, worker_count: usize) -> ControlResult<Self> {
        config.validate()?;
        Ok(Self {
            handler: Arc::new(PacketHandler::new(config, worker_count)),
        })
    }

    /// Discovers an existing manager by name and shares its session table,
    /// counters and config rather than building a new one (spec §4.6,
    /// §5's "shared backing store").
    pub fn attach(store: &BackingStore, name: &str) -> ControlResult<Self> {
        let handler = store
            .handlers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ControlError::UnknownManager(name.to_string()))?;
        Ok(Self { handler })
    }

    pub fn process_frame(&self, raw: Bytes, worker: usize, now: u64) -> Vec<Bytes> {
        self.handler.process_frame(raw, worker, now)
    }

    /// Atomically replaces the VS set (spec §4.6: `update`). Sessions whose
    /// `(vs, real)` pair still exists in the new config survive; a session
    /// bound to a real no longer listed under its VS is evicted immediately
    /// rather than waiting for the next timeout sweep, since spec §3 treats
    /// real removal — not merely disabling — as destroying its sessions.
    pub fn update(&self, config: &BalancerConfig, now: u64) -> ControlResult<()> {
        config.validate()?;
        let new_snapshot = snapshot::build_snapshot(config);

        let evicted = self.handler.sessions().refresh(now, &new_snapshot.timeouts, |key, entry| {
            vs_for_key(&new_snapshot, key)
                .map(|vs| vs.reals.read().iter().any(|r| r.ip == entry.real_ip))
                .unwrap_or(false)
        });
        for (key, _entry) in &evicted {
            if let Some(vs) = vs_for_key(&new_snapshot, key) {
                self.handler
                    .counters()
                    .with_vs(0, vs.identifier, |c| c.active_sessions.fetch_sub(1, REL));
            }
        }

        log::info!(
            "update: vs_count={}, sessions_evicted={}",
            new_snapshot.vs.len(),
            evicted.len()
        );
        self.handler.publish_snapshot(new_snapshot);
        Ok(())
    }

    /// Applies incremental enable/disable/weight changes (spec §4.6:
    /// `update_reals`). Every update is validated against the live
    /// configuration before any is applied — a reference to an unknown VS
    /// or real aborts the whole batch, leaving state unchanged (spec §7).
    /// `dry_run` validates without applying, still returning the count that
    /// would have been applied.
    pub fn update_reals(&self, updates: &[RealUpdate], dry_run: bool) -> ControlResult<usize> {
        log::debug!("update_reals: count={}, dry_run={}", updates.len(), dry_run);
        let snapshot = self.handler.snapshot();

        for update in updates {
            let vs = snapshot.vs.get(&update.real_id.vs).ok_or(ControlError::UnknownVs)?;
            let known = vs.reals.read().iter().any(|r| r.ip == update.real_id.real.ip);
            if !known {
                return Err(ControlError::UnknownReal);
            }
        }

        if dry_run {
            return Ok(updates.len());
        }

        let mut touched = AHashSet::new();
        for update in updates {
            let vs = snapshot.vs.get(&update.real_id.vs).expect("validated above");
            {
                let mut reals = vs.reals.write();
                if let Some(real) = reals.iter_mut().find(|r| r.ip == update.real_id.real.ip) {
                    if let Some(enable) = update.enable {
                        real.enabled = enable;
                    }
                    if let Some(weight) = update.weight {
                        real.weight = weight;
                    }
                }
            }
            touched.insert(update.real_id.vs);
        }
        for vs_id in touched {
            if let Some(vs) = snapshot.vs.get(&vs_id) {
                vs.rebuild_scheduler(None);
            }
        }
        Ok(updates.len())
    }

    /// Runs the session sweep / WLC reweight / resize pass (spec §4.6:
    /// `refresh`), returning how many sessions were evicted.
    pub fn refresh(&self, now: u64) -> usize {
        let evicted = self.handler.refresh(now);
        log::trace!("refresh: now={}, sessions_evicted={}", now, evicted);
        evicted
    }

    /// Aggregates per-worker counters into the wire stats payload (spec §6).
    pub fn stats(&self) -> BalancerStats {
        let counters = self.handler.counters();
        let vs = counters
            .known_vs_ids()
            .into_iter()
            .map(|vs_id| {
                let reals = counters
                    .known_real_ids_for_vs(vs_id)
                    .into_iter()
                    .map(|real_id| NamedRealStats {
                        real: real_id,
                        stats: counters.aggregate_real(real_id),
                    })
                    .collect();
                NamedVsStats {
                    vs: vs_id,
                    stats: counters.aggregate_vs(vs_id),
                    reals,
                }
            })
            .collect();
        BalancerStats {
            l4: counters.aggregate_l4(),
            icmpv4: counters.aggregate_icmp(false),
            icmpv6: counters.aggregate_icmp(true),
            common: counters.aggregate_common(),
            vs,
        }
    }

    /// Live topology + session-count view (spec §4.6: `info`). Reports each
    /// real's administrative weight, not the WLC-recomputed effective
    /// weight: the latter is ephemeral scheduler-build state recomputed at
    /// every refresh, and spec §9's open question on `power` semantics
    /// leaves no pinned value worth caching a duplicate copy of.
    pub fn info(&self, _now: u64) -> BalancerInfo {
        let snapshot = self.handler.snapshot();
        let counters = self.handler.counters();
        let mut vs = Vec::with_capacity(snapshot.vs.len());
        for (vs_id, runtime) in &snapshot.vs {
            let reals = runtime
                .reals
                .read()
                .iter()
                .map(|r| {
                    let real_id = r.identifier(*vs_id);
                    RealInfo {
                        id: real_id,
                        active_sessions: counters
                            .with_real(0, real_id, |c| c.active_sessions())
                            .unwrap_or(0),
                        effective_weight: r.weight,
                        enabled: r.enabled,
                    }
                })
                .collect();
            vs.push(VsInfo {
                id: *vs_id,
                active_sessions: counters.aggregate_vs(*vs_id).active_sessions,
                reals,
            });
        }
        BalancerInfo {
            active_sessions: counters.active_sessions_total(),
            vs,
        }
    }

    /// Weakly-consistent live session list (spec §4.2, §4.6: `sessions`).
    /// Entries whose protocol timeout has already elapsed are filtered out
    /// even though the sweep that would formally evict them hasn't run yet.
    pub fn sessions(&self, now: u64) -> Vec<SessionInfo> {
        let snapshot = self.handler.snapshot();
        self.handler
            .sessions()
            .snapshot()
            .into_iter()
            .filter_map(|(key, entry)| {
                if entry.is_expired(now, key.proto, &snapshot.timeouts) {
                    return None;
                }
                let vs = vs_for_key(&snapshot, &key)?;
                Some(SessionInfo {
                    client_addr: key.client_ip,
                    client_port: key.client_port,
                    vs_id: vs.identifier,
                    real_id: RealIdentifier {
                        vs: vs.identifier,
                        real: RelativeRealIdentifier { ip: entry.real_ip },
                    },
                    created_at_secs: entry.created_at,
                    last_seen_secs: entry.last_seen,
                })
            })
            .collect()
    }
}
