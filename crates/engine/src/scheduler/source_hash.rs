//! Deterministic, weighted consistent hashing over a flow key (spec
//! §4.3). Built as a Maglev-style lookup table: each real gets a
//! permutation of table slots derived from two independent hashes of its
//! address, and candidates take turns claiming their next free slot in
//! round order, weight-many times each. Regenerating the table after a
//! single real is added or removed leaves most existing slot owners
//! unchanged, which is the property source-hash needs under `update`.

use std::hash::{BuildHasher, Hasher};
use std::net::IpAddr;

use ahash::RandomState;

use super::{FlowKey, RealCandidate};

/// Lookup table size. Fixed and prime-ish (not a strict requirement for
/// Maglev's permutation construction, but avoids small common factors
/// with typical real counts); large relative to any realistic real
/// count so weight ratios are represented with reasonable precision.
const TABLE_SIZE: usize = 65537;

fn hasher_seed(salt: u64) -> RandomState {
    RandomState::with_seeds(0xC0FF_EE00 ^ salt, 0xDEAD_BEEF, 0xFEED_FACE, salt)
}

fn hash_ip(ip: IpAddr, salt: u64) -> u64 {
    let mut h = hasher_seed(salt).build_hasher();
    match ip {
        IpAddr::V4(v) => h.write_u32(u32::from(v)),
        IpAddr::V6(v) => h.write_u128(u128::from(v)),
    }
    h.finish()
}

pub struct SourceHashScheduler {
    table: Vec<Option<usize>>,
}

impl SourceHashScheduler {
    pub fn build(candidates: &[RealCandidate]) -> Self {
        if candidates.is_empty() {
            return Self {
                table: vec![None; TABLE_SIZE],
            };
        }

        let n = candidates.len();
        let permutations: Vec<Vec<usize>> = candidates
            .iter()
            .map(|c| {
                let offset = (hash_ip(c.ip, 1) as usize) % TABLE_SIZE;
                let skip = 1 + (hash_ip(c.ip, 2) as usize) % (TABLE_SIZE - 1);
                (0..TABLE_SIZE)
                    .map(|i| (offset + i * skip) % TABLE_SIZE)
                    .collect()
            })
            .collect();

        let total_weight: u64 = candidates.iter().map(|c| c.weight.max(1) as u64).sum();
        let mut table: Vec<Option<usize>> = vec![None; TABLE_SIZE];
        let mut next: Vec<usize> = vec![0; n];
        // Each real claims `weight / total_weight` of the table by taking
        // that many turns per pass instead of one slot per round (the
        // weighted extension of Maglev's base one-slot-per-round
        // algorithm).
        let mut filled = 0usize;
        let mut round = 0u64;
        while filled < TABLE_SIZE {
            for (i, candidate) in candidates.iter().enumerate() {
                if filled >= TABLE_SIZE {
                    break;
                }
                let share = (candidate.weight.max(1) as u64 * TABLE_SIZE as u64) / total_weight;
                let turns = share.max(1).min(TABLE_SIZE as u64 - filled as u64);
                for _ in 0..turns {
                    if filled >= TABLE_SIZE {
                        break;
                    }
                    let mut slot = permutations[i][next[i] % TABLE_SIZE];
                    while table[slot].is_some() {
                        next[i] += 1;
                        slot = permutations[i][next[i] % TABLE_SIZE];
                    }
                    table[slot] = Some(candidate.index);
                    next[i] += 1;
                    filled += 1;
                }
            }
            round += 1;
            if round > TABLE_SIZE as u64 {
                break; // pathological weights; leftover slots stay None
            }
        }

        Self { table }
    }

    pub fn select(&self, key: FlowKey, pure_l3: bool) -> Option<usize> {
        let mut h = hasher_seed(0).build_hasher();
        match key.client_ip {
            IpAddr::V4(v) => h.write_u32(u32::from(v)),
            IpAddr::V6(v) => h.write_u128(u128::from(v)),
        }
        h.write_u16(key.client_port);
        if pure_l3 {
            h.write_u16(key.dst_port);
        }
        let slot = (h.finish() as usize) % TABLE_SIZE;
        self.table[slot]
    }
}
