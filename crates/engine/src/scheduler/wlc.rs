//! Weighted-least-connection reweighting (spec §4.3). WLC isn't a
//! distinct scheduler variant on the wire (`Scheduler` only enumerates
//! round-robin and source-hash) — it's a flag that, at each `refresh`,
//! recomputes the weight the underlying round-robin or source-hash
//! scheduler is rebuilt from, biasing the expanded table towards
//! currently under-loaded reals.

/// One real's administrative weight and its current session load, as
/// seen at a refresh tick.
#[derive(Debug, Clone, Copy)]
pub struct RealLoad {
    pub weight: u32,
    pub active_sessions: u32,
    pub enabled: bool,
}

/// Recomputes effective weights: `weight * max(1, ceil(avg_load /
/// (active_sessions + 1)))^power`, clamped to `max_weight`. `avg_load` is
/// the mean active-session count over enabled reals; disabled reals keep
/// their raw weight (they draw no fresh traffic regardless, spec §4.3:
/// "disabled reals never receive a fresh selection").
///
/// `power` (the `α` knob, spec §9) is left undocumented beyond "higher α
/// concentrates traffic on less-loaded reals" by the open question it
/// answers from; this implementation applies it as an exponent on the
/// load ratio, which satisfies that description and is recorded as the
/// chosen interpretation in the design ledger.
pub fn recompute_effective_weights(reals: &[RealLoad], power: u64, max_weight: u32) -> Vec<u32> {
    let enabled_count = reals.iter().filter(|r| r.enabled).count().max(1);
    let avg_load = reals
        .iter()
        .filter(|r| r.enabled)
        .map(|r| r.active_sessions as u64)
        .sum::<u64>() as f64
        / enabled_count as f64;

    reals
        .iter()
        .map(|r| {
            if !r.enabled {
                return r.weight;
            }
            let ratio = (avg_load / (r.active_sessions as f64 + 1.0)).max(1.0);
            let factor = ratio.powf(power as f64).max(1.0);
            let effective = (r.weight as f64 * factor).round();
            if effective.is_finite() {
                (effective as u64).min(max_weight as u64).max(1) as u32
            } else {
                max_weight
            }
        })
        .collect()
}
