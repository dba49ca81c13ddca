//! Round-robin over an expanded weight table: each enabled real appears
//! `weight` times, and a per-VS atomic cursor walks the table modulo its
//! length. This is also the draw WLC uses once it has recomputed
//! per-real effective weights (spec §4.3: "the data-plane draw is
//! round-robin over the recomputed expanded table").

use std::sync::atomic::{AtomicUsize, Ordering};

use super::RealCandidate;

pub struct RoundRobinScheduler {
    /// Expanded table of real indices; empty iff no real is enabled.
    table: Vec<usize>,
    cursor: AtomicUsize,
}

impl RoundRobinScheduler {
    pub fn build(candidates: &[RealCandidate]) -> Self {
        let mut table = Vec::new();
        for candidate in candidates {
            for _ in 0..candidate.weight.max(0) {
                table.push(candidate.index);
            }
        }
        Self {
            table,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn select(&self) -> Option<usize> {
        if self.table.is_empty() {
            return None;
        }
        let slot = self.cursor.fetch_add(1, Ordering::Relaxed) % self.table.len();
        Some(self.table[slot])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(index: usize, weight: u32) -> RealCandidate {
        RealCandidate {
            index,
            ip: "1.1.1.1".parse().unwrap(),
            weight,
        }
    }

    #[test]
    fn distributes_by_weight() {
        let scheduler = RoundRobinScheduler::build(&[candidate(0, 1), candidate(1, 2)]);
        let draws: Vec<usize> = (0..6).map(|_| scheduler.select().unwrap()).collect();
        let zeros = draws.iter().filter(|&&i| i == 0).count();
        let ones = draws.iter().filter(|&&i| i == 1).count();
        assert_eq!(zeros, 2);
        assert_eq!(ones, 4);
    }

    #[test]
    fn empty_candidates_select_none() {
        let scheduler = RoundRobinScheduler::build(&[]);
        assert_eq!(scheduler.select(), None);
    }

    #[test]
    fn equal_weights_split_evenly_over_fifteen_draws() {
        let scheduler = RoundRobinScheduler::build(&[
            candidate(0, 1),
            candidate(1, 1),
            candidate(2, 1),
        ]);
        let mut counts = [0usize; 3];
        for _ in 0..15 {
            counts[scheduler.select().unwrap()] += 1;
        }
        assert_eq!(counts, [5, 5, 5]);
    }
}
