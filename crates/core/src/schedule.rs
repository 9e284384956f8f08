//! Merge planner: expands a merge setting into a per-layer schedule.
//!
//! The shaping function is linear across depth. For a base per-layer count
//! `r` and an inflection `inflect` in `[-1, 1]`, layer `i` of `L` merges
//!
//! ```text
//! floor(r * ((1 - inflect) + 2 * inflect * i / (L - 1)))
//! ```
//!
//! tokens, so a negative inflection front-loads merging, zero keeps it
//! constant and a positive inflection back-loads it. The coefficients always
//! average to one, so the unrounded schedule sums to `r * L`.
//!
//! Every schedule handed to a forward pass is clamped to what bipartite
//! matching can actually remove at each depth (at most half of the
//! unprotected tokens still present), so the planned counts are the counts
//! that get executed.

use tracing::debug;

use crate::config::MergeSetting;
use crate::error::{Result, TomeError};

/// Iteration budget for the bisection in [`derive_uniform_ratio`].
pub const RATIO_SOLVE_MAX_ITERS: usize = 64;

/// Per-layer merge counts for one forward pass.
///
/// Immutable once built; blocks read it through an index cursor held by
/// [`MergeContext`](crate::context::MergeContext).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MergeSchedule {
    counts: Vec<usize>,
}

impl MergeSchedule {
    pub fn new(counts: Vec<usize>) -> Self {
        Self { counts }
    }

    /// A schedule that never merges.
    pub fn zeros(num_layers: usize) -> Self {
        Self::new(vec![0; num_layers])
    }

    /// Expand a merge setting for a model with `num_layers` blocks whose first
    /// block sees `seq_len` tokens, `protected` of which may never merge.
    pub fn from_setting(
        setting: &MergeSetting,
        num_layers: usize,
        seq_len: usize,
        protected: usize,
    ) -> Result<Self> {
        if num_layers == 0 {
            return Err(TomeError::invalid("model has no transformer blocks"));
        }
        let counts = match setting {
            MergeSetting::Constant { r } => vec![*r; num_layers],
            MergeSetting::Decay { r, inflect } => {
                check_inflect(*inflect)?;
                expand_r(num_layers, *r as f64, *inflect)
            }
            MergeSetting::PerLayer { counts } => {
                if counts.len() > num_layers {
                    return Err(TomeError::invalid(format!(
                        "{} per-layer merge counts given for {} layers",
                        counts.len(),
                        num_layers
                    )));
                }
                let mut counts = counts.clone();
                counts.resize(num_layers, 0);
                counts
            }
            MergeSetting::Target { total, inflect } => {
                return plan(num_layers, *total, seq_len, *inflect, protected);
            }
        };
        Ok(Self::new(clamp_to_capacity(counts, seq_len, protected)))
    }

    pub fn counts(&self) -> &[usize] {
        &self.counts
    }

    pub fn get(&self, layer: usize) -> Option<usize> {
        self.counts.get(layer).copied()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Total number of tokens removed over the whole pass.
    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }

    /// Sequence length after the last block, given the length before the first.
    pub fn final_len(&self, seq_len: usize) -> usize {
        seq_len.saturating_sub(self.total())
    }
}

/// Most tokens `num_layers` bipartite steps could remove, each working on
/// the un-merged sequence.
pub fn merge_capacity(num_layers: usize, seq_len: usize, protected: usize) -> usize {
    num_layers * (seq_len.saturating_sub(protected) / 2)
}

/// Plan a schedule that merges `total` tokens over `num_layers` blocks.
///
/// The uniform ratio is derived with [`derive_uniform_ratio`], expanded
/// through the shaping function, and the rounding remainder is pushed onto
/// the first layer (negative inflection) or the last layer (otherwise) before
/// clamping each layer to its feasible count.
pub fn plan(
    num_layers: usize,
    total: usize,
    seq_len: usize,
    inflect: f64,
    protected: usize,
) -> Result<MergeSchedule> {
    let capacity = merge_capacity(num_layers, seq_len, protected);
    if total > capacity {
        return Err(TomeError::BudgetExceedsCapacity {
            requested: total,
            capacity,
        });
    }
    let ratio = derive_uniform_ratio(num_layers, total, seq_len, inflect)?;
    let mut counts = expand_ratio(num_layers, ratio, seq_len, inflect)?;
    assign_remainder(&mut counts, total, inflect);
    let counts = clamp_to_capacity(counts, seq_len, protected);

    debug!(
        num_layers,
        total,
        seq_len,
        inflect,
        ratio,
        planned = counts.iter().sum::<usize>(),
        ?counts,
        "planned merge schedule"
    );
    Ok(MergeSchedule::new(counts))
}

/// Solve for the per-layer merge ratio whose shaped expansion removes
/// `total` tokens.
///
/// The ratio is relative to `seq_len`: a ratio of `0.05` on a 197-token
/// sequence is a base of ~9.85 merges per layer. The closed-form inverse
/// `total / num_layers` is exact whenever rounding loses nothing; otherwise a
/// bisection bounded by [`RATIO_SOLVE_MAX_ITERS`] refines it. The solve fails
/// if the closest expansion overshoots `total` or falls `num_layers` or more
/// tokens short of it.
pub fn derive_uniform_ratio(
    num_layers: usize,
    total: usize,
    seq_len: usize,
    inflect: f64,
) -> Result<f64> {
    if num_layers == 0 {
        return Err(TomeError::invalid("model has no transformer blocks"));
    }
    if seq_len == 0 {
        return Err(TomeError::invalid("sequence length must be positive"));
    }
    check_inflect(inflect)?;
    if total == 0 {
        return Ok(0.0);
    }

    let layers = num_layers as f64;
    let summed = |r: f64| -> usize { expand_r(num_layers, r, inflect).iter().sum() };

    let closed_form = total as f64 / layers;
    let mut best_r = closed_form;
    let mut best_sum = summed(closed_form);
    if best_sum != total {
        // Flooring loses less than one token per layer, so the answer lies in
        // [total / L, (total + L) / L].
        let mut lo = closed_form;
        let mut hi = (total as f64 + layers) / layers;
        for _ in 0..RATIO_SOLVE_MAX_ITERS {
            let mid = 0.5 * (lo + hi);
            let s = summed(mid);
            // Only undershoots are kept so the remainder is always added.
            if s <= total && s > best_sum {
                best_r = mid;
                best_sum = s;
            }
            if s == total {
                break;
            }
            if s < total {
                lo = mid;
            } else {
                hi = mid;
            }
        }
    }

    // Each layer's floor steps by at most one at the bisection's limit, so a
    // converged solve undershoots by fewer than `num_layers` tokens. Totals
    // past f64's integer precision can miss by more.
    if best_sum > total || total - best_sum >= num_layers || !best_r.is_finite() {
        return Err(TomeError::RatioDidNotConverge {
            target: total,
            best: best_sum,
            iterations: RATIO_SOLVE_MAX_ITERS,
        });
    }
    Ok(best_r / seq_len as f64)
}

/// Expand a ratio (relative to `seq_len`) into unclamped per-layer counts.
pub fn expand_ratio(
    num_layers: usize,
    ratio: f64,
    seq_len: usize,
    inflect: f64,
) -> Result<Vec<usize>> {
    if !(ratio.is_finite() && ratio >= 0.0) {
        return Err(TomeError::invalid(format!(
            "merge ratio must be a non-negative number, got {ratio}"
        )));
    }
    check_inflect(inflect)?;
    Ok(expand_r(num_layers, ratio * seq_len as f64, inflect))
}

fn expand_r(num_layers: usize, r: f64, inflect: f64) -> Vec<usize> {
    shape_coefficients(num_layers, inflect)
        .into_iter()
        // The epsilon keeps exact products like 0.5 * 20.0 from flooring to 9.
        .map(|c| (r * c + 1e-9).floor().max(0.0) as usize)
        .collect()
}

fn shape_coefficients(num_layers: usize, inflect: f64) -> Vec<f64> {
    if num_layers <= 1 {
        return vec![1.0; num_layers];
    }
    let last = (num_layers - 1) as f64;
    (0..num_layers)
        .map(|i| (1.0 - inflect) + 2.0 * inflect * i as f64 / last)
        .collect()
}

fn check_inflect(inflect: f64) -> Result<()> {
    if inflect.is_finite() && (-1.0..=1.0).contains(&inflect) {
        Ok(())
    } else {
        Err(TomeError::invalid(format!(
            "inflection must lie in [-1, 1], got {inflect}"
        )))
    }
}

fn assign_remainder(counts: &mut [usize], total: usize, inflect: f64) {
    let sum: usize = counts.iter().sum();
    // Heaviest end first; trimming walks from the light end so the shape stays
    // monotonic.
    let order: Vec<usize> = if inflect < 0.0 {
        (0..counts.len()).collect()
    } else {
        (0..counts.len()).rev().collect()
    };
    if sum < total {
        if let Some(&first) = order.first() {
            counts[first] += total - sum;
        }
        return;
    }
    let mut excess = sum - total;
    for i in order.into_iter().rev() {
        if excess == 0 {
            break;
        }
        let take = excess.min(counts[i]);
        counts[i] -= take;
        excess -= take;
    }
}

fn clamp_to_capacity(counts: Vec<usize>, seq_len: usize, protected: usize) -> Vec<usize> {
    let mut remaining = seq_len;
    counts
        .into_iter()
        .map(|r| {
            let r = r.min(remaining.saturating_sub(protected) / 2);
            remaining -= r;
            r
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_a_front_loaded_and_clamped() {
        let schedule = plan(12, 980, 197, -0.5, 1).unwrap();
        assert_eq!(schedule.len(), 12);
        assert!(schedule.total() <= 980);
        assert_eq!(
            schedule.counts(),
            &[98, 49, 24, 12, 6, 3, 2, 1, 0, 0, 0, 0]
        );
        assert!(schedule.counts().windows(2).all(|w| w[0] >= w[1]));
        assert_eq!(schedule.final_len(197), 2);
    }

    #[test]
    fn zero_budget_is_all_zeros() {
        let schedule = plan(12, 0, 197, -0.5, 1).unwrap();
        assert_eq!(schedule, MergeSchedule::zeros(12));
    }

    #[test]
    fn feasible_budget_is_met_exactly() {
        let schedule = plan(12, 96, 197, 0.0, 1).unwrap();
        assert_eq!(schedule.total(), 96);
        assert_eq!(schedule.counts(), &[8; 12]);
    }

    #[test]
    fn decreasing_budget_front_loads() {
        let schedule = plan(12, 120, 197, -1.0, 1).unwrap();
        assert_eq!(schedule.total(), 120);
        assert!(schedule.counts()[0] > schedule.counts()[11]);
        assert!(schedule.counts().windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn increasing_budget_back_loads() {
        let schedule = plan(12, 120, 197, 1.0, 1).unwrap();
        assert_eq!(schedule.total(), 120);
        assert_eq!(schedule.counts()[0], 0);
        assert!(schedule.counts()[11] > schedule.counts()[5]);
    }

    #[test]
    fn budget_over_capacity_is_rejected() {
        let err = plan(12, 1200, 197, 0.0, 1).unwrap_err();
        match err {
            TomeError::BudgetExceedsCapacity {
                requested,
                capacity,
            } => {
                assert_eq!(requested, 1200);
                assert_eq!(capacity, 12 * 98);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn ratio_round_trip_within_tolerance() {
        let cases = [
            (12, 980, 197, -0.5),
            (12, 96, 197, 0.0),
            (12, 7, 197, -1.0),
            (24, 300, 577, 0.5),
            (1, 10, 50, 0.0),
            (7, 33, 65, 0.3),
        ];
        for (layers, total, seq, inflect) in cases {
            let ratio = derive_uniform_ratio(layers, total, seq, inflect).unwrap();
            let sum: usize = expand_ratio(layers, ratio, seq, inflect)
                .unwrap()
                .iter()
                .sum();
            assert!(
                sum.abs_diff(total) <= layers,
                "layers={layers} total={total}: expanded to {sum}"
            );
        }
    }

    #[test]
    fn unresolvable_total_does_not_converge() {
        // 2^60 + 1 has no f64 representation, so no ratio expands to it.
        let total = (1usize << 60) + 1;
        match derive_uniform_ratio(1, total, 197, 0.0) {
            Err(TomeError::RatioDidNotConverge { target, best, .. }) => {
                assert_eq!(target, total);
                assert_eq!(best, 1usize << 60);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn closed_form_ratio_is_exact_for_even_split() {
        let ratio = derive_uniform_ratio(12, 96, 200, 0.0).unwrap();
        assert!((ratio - 8.0 / 200.0).abs() < 1e-12);
    }

    #[test]
    fn inflection_out_of_range_is_rejected() {
        assert!(derive_uniform_ratio(12, 10, 197, 1.5).is_err());
        assert!(derive_uniform_ratio(12, 10, 197, f64::NAN).is_err());
        let setting = MergeSetting::Decay { r: 4, inflect: -2.0 };
        assert!(MergeSchedule::from_setting(&setting, 12, 197, 1).is_err());
    }

    #[test]
    fn constant_setting_repeats_r() {
        let setting = MergeSetting::Constant { r: 8 };
        let schedule = MergeSchedule::from_setting(&setting, 12, 197, 1).unwrap();
        assert_eq!(schedule.counts(), &[8; 12]);
    }

    #[test]
    fn decay_setting_matches_reference_shape() {
        let setting = MergeSetting::Decay { r: 10, inflect: -0.5 };
        let schedule = MergeSchedule::from_setting(&setting, 5, 197, 1).unwrap();
        // Coefficients 1.5, 1.25, 1.0, 0.75, 0.5.
        assert_eq!(schedule.counts(), &[15, 12, 10, 7, 5]);
    }

    #[test]
    fn per_layer_setting_is_padded() {
        let setting = MergeSetting::PerLayer {
            counts: vec![4, 2],
        };
        let schedule = MergeSchedule::from_setting(&setting, 4, 197, 1).unwrap();
        assert_eq!(schedule.counts(), &[4, 2, 0, 0]);
    }

    #[test]
    fn per_layer_setting_longer_than_depth_is_rejected() {
        let setting = MergeSetting::PerLayer {
            counts: vec![1, 1, 1],
        };
        assert!(MergeSchedule::from_setting(&setting, 2, 197, 1).is_err());
    }

    #[test]
    fn clamping_never_eats_protected_tokens() {
        let setting = MergeSetting::Constant { r: 100 };
        let schedule = MergeSchedule::from_setting(&setting, 6, 10, 2).unwrap();
        assert_eq!(schedule.counts(), &[4, 2, 1, 0, 0, 0]);
        assert_eq!(schedule.final_len(10), 3);
    }

    #[test]
    fn planning_is_deterministic() {
        let a = plan(12, 490, 197, -0.5, 1).unwrap();
        let b = plan(12, 490, 197, -0.5, 1).unwrap();
        assert_eq!(a, b);
    }
}
