//! Open-addressed, resizable session table (spec §4.2).
//!
//! The table is split into a fixed number of independent shards, each
//! guarded by its own `parking_lot::RwLock`. Sharding bounds the blast
//! radius of a resize (only one shard's slot array is rebuilt at a time)
//! and gives workers on different shards true concurrency; within a shard,
//! lookups take a write lock because a hit always refreshes `last_seen`.
//! This is a fully-safe stand-in for the epoch/hazard-pointer scheme spec
//! §9 gestures at — see DESIGN.md for why no `unsafe` lock-free structure
//! was written for this exercise.

use std::hash::{BuildHasher, Hasher};
use std::net::IpAddr;

use ahash::RandomState;
use parking_lot::RwLock;
use proto::config::SessionsTimeouts;

use super::{SessionEntry, SessionKey};

const SHARD_COUNT: usize = 16;

#[derive(Debug)]
pub enum TableError {
    Overflow,
}

#[derive(Clone)]
enum Slot {
    Empty,
    Occupied {
        fingerprint: u8,
        key: SessionKey,
        entry: SessionEntry,
    },
}

struct Shard {
    slots: Vec<Slot>,
    len: usize,
    max_load_factor: f32,
}

impl Shard {
    fn with_capacity(capacity: usize, max_load_factor: f32) -> Self {
        Self {
            slots: vec![Slot::Empty; capacity.max(8)],
            len: 0,
            max_load_factor,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn would_overflow(&self, extra: usize) -> bool {
        (self.len + extra) as f32 > self.capacity() as f32 * self.max_load_factor
    }

    fn probe_start(&self, hash: u64) -> usize {
        (hash as usize) % self.slots.len()
    }

    fn find_slot(&self, key: &SessionKey, hash: u64, fingerprint: u8) -> Option<usize> {
        let start = self.probe_start(hash);
        for step in 0..self.slots.len() {
            let idx = (start + step) % self.slots.len();
            match &self.slots[idx] {
                Slot::Occupied {
                    fingerprint: fp,
                    key: k,
                    ..
                } if *fp == fingerprint && k == key => return Some(idx),
                Slot::Empty => return None,
                _ => continue,
            }
        }
        None
    }

    fn insert_at(&mut self, key: SessionKey, entry: SessionEntry, hash: u64, fingerprint: u8) {
        let start = self.probe_start(hash);
        for step in 0..self.slots.len() {
            let idx = (start + step) % self.slots.len();
            if matches!(self.slots[idx], Slot::Empty) {
                self.slots[idx] = Slot::Occupied {
                    fingerprint,
                    key,
                    entry,
                };
                self.len += 1;
                return;
            }
        }
        unreachable!("insert_at called on a full shard; caller must check would_overflow first");
    }

    fn grow(&mut self) {
        let new_capacity = self.slots.len() * 2;
        let old = std::mem::replace(&mut self.slots, vec![Slot::Empty; new_capacity]);
        self.len = 0;
        for slot in old {
            if let Slot::Occupied {
                fingerprint,
                key,
                entry,
            } = slot
            {
                self.insert_at(key, entry, fingerprint_hash(&key), fingerprint);
            }
        }
    }

    fn sweep_expired(
        &mut self,
        now: u64,
        timeouts: &SessionsTimeouts,
        mut is_still_valid: impl FnMut(&SessionKey, &SessionEntry) -> bool,
    ) -> Vec<(SessionKey, SessionEntry)> {
        let mut evicted = Vec::new();
        for slot in self.slots.iter_mut() {
            if let Slot::Occupied { key, entry, .. } = slot {
                let expired = entry.is_expired(now, key.proto, timeouts);
                if expired || !is_still_valid(key, entry) {
                    evicted.push((*key, *entry));
                    *slot = Slot::Empty;
                    self.len -= 1;
                }
            }
        }
        // Linear probing tolerates "holes" left by in-place deletion because
        // lookups stop at the first `Empty` slot; the assumption holds as
        // long as every deletion rebuilds the run, which a full sweep does
        // naturally by reinserting survivors through `grow`-style compaction
        // only when capacity changes. A plain sweep can otherwise strand a
        // reachable key behind a hole, so compact probe chains here too.
        self.compact();
        evicted
    }

    /// Re-seats every occupied slot via its own probe sequence so deletions
    /// mid-table never leave a live key unreachable behind an `Empty` hole.
    fn compact(&mut self) {
        let capacity = self.slots.len();
        let old = std::mem::replace(&mut self.slots, vec![Slot::Empty; capacity]);
        self.len = 0;
        for slot in old {
            if let Slot::Occupied {
                fingerprint,
                key,
                entry,
            } = slot
            {
                self.insert_at(key, entry, fingerprint_hash(&key), fingerprint);
            }
        }
    }
}

fn hasher() -> RandomState {
    // Fixed seed: determinism matters for tests (source-hash stability) far
    // more than DoS resistance inside a load balancer's own session table.
    RandomState::with_seeds(0x5151_1919, 0x1919_5151, 0xA5A5_5A5A, 0x0F0F_F0F0)
}

fn fingerprint_hash(key: &SessionKey) -> u64 {
    let mut h = hasher().build_hasher();
    h.write_u16(key.client_port);
    h.write_u16(key.vs_port);
    h.write_u8(key.proto as u8);
    match key.client_ip {
        IpAddr::V4(v) => h.write_u32(u32::from(v)),
        IpAddr::V6(v) => h.write_u128(u128::from(v)),
    }
    match key.vs_ip {
        IpAddr::V4(v) => h.write_u32(u32::from(v)),
        IpAddr::V6(v) => h.write_u128(u128::from(v)),
    }
    h.finish()
}

fn fingerprint_byte(hash: u64) -> u8 {
    (hash >> 56) as u8
}

fn shard_index(hash: u64) -> usize {
    (hash as usize / SHARD_COUNT.max(1)) % SHARD_COUNT + 0
}

pub struct SessionTable {
    shards: Vec<RwLock<Shard>>,
    max_load_factor: f32,
}

impl SessionTable {
    pub fn new(capacity: u64, max_load_factor: f32) -> Self {
        let per_shard = ((capacity as usize).max(SHARD_COUNT) / SHARD_COUNT).max(8);
        let shards = (0..SHARD_COUNT)
            .map(|_| RwLock::new(Shard::with_capacity(per_shard, max_load_factor)))
            .collect();
        Self {
            shards,
            max_load_factor,
        }
    }

    fn route(&self, key: &SessionKey) -> (usize, u64, u8) {
        let hash = fingerprint_hash(key);
        // `hash % SHARD_COUNT` picks the shard; the raw hash is reused
        // inside the shard as the probe seed, and its top byte as the
        // fingerprint, so we only ever hash a key once per operation.
        let shard_idx = (hash as usize) % self.shards.len();
        (shard_idx, hash, fingerprint_byte(hash))
    }

    /// Returns `(real_ip, created)`, refreshing `last_seen` on a hit.
    pub fn lookup(&self, key: &SessionKey, now: u64) -> Option<(IpAddr, bool)> {
        let (shard_idx, hash, fingerprint) = self.route(key);
        let mut shard = self.shards[shard_idx].write();
        let idx = shard.find_slot(key, hash, fingerprint)?;
        if let Slot::Occupied { entry, .. } = &mut shard.slots[idx] {
            entry.last_seen = now;
            return Some((entry.real_ip, false));
        }
        None
    }

    /// Observe TCP flags on an already-open session without treating the
    /// packet as a fresh lookup miss; used by the handler to advance
    /// `TcpState` so the right timeout bucket applies at the next sweep.
    pub fn observe_tcp_flags(&self, key: &SessionKey, syn: bool, ack: bool, fin: bool, rst: bool) {
        let (shard_idx, hash, fingerprint) = self.route(key);
        let mut shard = self.shards[shard_idx].write();
        if let Some(idx) = shard.find_slot(key, hash, fingerprint) {
            if let Slot::Occupied { entry, .. } = &mut shard.slots[idx] {
                entry.tcp_state = entry.tcp_state.advance(syn, ack, fin, rst);
            }
        }
    }

    pub fn insert(
        &self,
        key: SessionKey,
        real_ip: IpAddr,
        now: u64,
    ) -> Result<bool, TableError> {
        let (shard_idx, hash, fingerprint) = self.route(&key);
        let mut shard = self.shards[shard_idx].write();
        if let Some(idx) = shard.find_slot(&key, hash, fingerprint) {
            if let Slot::Occupied { entry, .. } = &mut shard.slots[idx] {
                entry.last_seen = now;
            }
            return Ok(false);
        }
        if shard.would_overflow(1) {
            return Err(TableError::Overflow);
        }
        shard.insert_at(key, SessionEntry::new(real_ip, now), hash, fingerprint);
        Ok(true)
    }

    /// Rebinds an existing entry to a different real, used when the
    /// packet handler reschedules a flow whose original real has been
    /// removed from its VS entirely (spec §4.6's `real_is_removed` path).
    /// Does nothing if the key is not present — the caller is expected to
    /// have just observed a hit for it.
    pub fn rebind(&self, key: &SessionKey, new_real_ip: IpAddr, now: u64) -> bool {
        let (shard_idx, hash, fingerprint) = self.route(key);
        let mut shard = self.shards[shard_idx].write();
        if let Some(idx) = shard.find_slot(key, hash, fingerprint) {
            if let Slot::Occupied { entry, .. } = &mut shard.slots[idx] {
                entry.real_ip = new_real_ip;
                entry.last_seen = now;
                return true;
            }
        }
        false
    }

    /// Sweeps expired entries and, if any shard is now over its load
    /// threshold, doubles that shard's capacity. `is_still_valid` lets the
    /// caller evict sessions whose real has since been removed from its VS.
    /// Returns every evicted `(key, entry)` pair so the caller can adjust
    /// gauges against the real each session was bound to.
    pub fn refresh(
        &self,
        now: u64,
        timeouts: &SessionsTimeouts,
        mut is_still_valid: impl FnMut(&SessionKey, &SessionEntry) -> bool,
    ) -> Vec<(SessionKey, SessionEntry)> {
        let mut evicted = Vec::new();
        for shard_lock in &self.shards {
            let mut shard = shard_lock.write();
            evicted.extend(shard.sweep_expired(now, timeouts, &mut is_still_valid));
            if shard.would_overflow(0) {
                shard.grow();
            }
        }
        evicted
    }

    /// Weakly-consistent snapshot for the `sessions` control API: each
    /// shard is locked and copied in turn, so an insert landing in a shard
    /// already iterated past is simply absent from this snapshot.
    pub fn snapshot(&self) -> Vec<(SessionKey, SessionEntry)> {
        let mut out = Vec::new();
        for shard_lock in &self.shards {
            let shard = shard_lock.read();
            for slot in &shard.slots {
                if let Slot::Occupied { key, entry, .. } = slot {
                    out.push((*key, *entry));
                }
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len).sum()
    }

    pub fn max_load_factor(&self) -> f32 {
        self.max_load_factor
    }
}
