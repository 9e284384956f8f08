//! Bipartite soft matching.
//!
//! Unprotected tokens alternate between set A (even offsets) and set B (odd
//! offsets). Each A token proposes the B token it is most similar to (cosine
//! similarity of the metric), and the `r` A tokens with the strongest
//! proposals are merged into their partners. Several A tokens may land on the
//! same B token; an A token merges at most once. Protected tokens (class and
//! distillation) never enter either set.
//!
//! The score matrix is computed on the tensor's device. Only the per-A best
//! edge (`[batch, n_a]` scores and partner indices) is copied back to rank on
//! the host, which keeps tie-breaking stable: equal scores are ranked by
//! token order.

use candle_core::{DType, Device, Tensor, D};
use tracing::warn;

use crate::error::Result;
use crate::merge::{set_sizes, MergePlan};

/// Which tokens are eligible and how far partners may be apart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchOptions {
    /// Position 0 holds a class token.
    pub class_token: bool,
    /// The position after the class token holds a distillation token.
    pub distill_token: bool,
    /// Only pair A token `i` with B token `j` when `|i - j| <= window`.
    pub locality_window: Option<usize>,
}

impl MatchOptions {
    /// Number of leading tokens excluded from matching.
    pub fn protected(&self) -> usize {
        usize::from(self.class_token) + usize::from(self.distill_token)
    }
}

/// Largest `r` a sequence of `num_tokens` can honour.
pub fn max_merges(num_tokens: usize, protected: usize) -> usize {
    let (n_a, n_b) = set_sizes(num_tokens.saturating_sub(protected));
    n_a.min(n_b)
}

/// Choose up to `r` merges for `metric` (`[batch, tokens, channels]`).
///
/// `r` is clamped to the number of available pairs; a request that cannot be
/// honoured at all yields the identity plan.
pub fn bipartite_soft_matching(
    metric: &Tensor,
    r: usize,
    options: &MatchOptions,
) -> Result<MergePlan> {
    let (batch, num_tokens, _) = metric.dims3()?;
    let protected = options.protected().min(num_tokens);
    let span = num_tokens - protected;
    let (n_a, n_b) = set_sizes(span);
    let r = r.min(n_a).min(n_b);
    if r == 0 {
        return Ok(MergePlan::identity(batch, num_tokens, protected));
    }
    let device = metric.device();

    let metric = metric.to_dtype(DType::F32)?;
    let norm = metric
        .sqr()?
        .sum_keepdim(D::Minus1)?
        .sqrt()?
        .maximum(1e-12f32)?;
    let metric = metric.broadcast_div(&norm)?;

    let tokens = metric.narrow(1, protected, span)?.contiguous()?;
    let a_idx: Vec<u32> = (0..n_a).map(|i| (2 * i) as u32).collect();
    let b_idx: Vec<u32> = (0..n_b).map(|j| (2 * j + 1) as u32).collect();
    let a = tokens.index_select(&Tensor::from_vec(a_idx, n_a, device)?, 1)?;
    let b = tokens.index_select(&Tensor::from_vec(b_idx, n_b, device)?, 1)?;

    let mut scores = a.matmul(&b.transpose(1, 2)?.contiguous()?)?;
    if let Some(window) = options.locality_window {
        scores = scores.broadcast_add(&locality_mask(n_a, n_b, window, device)?)?;
    }

    let node_max: Vec<Vec<f32>> = scores.max(D::Minus1)?.to_vec2()?;
    let node_idx: Vec<Vec<u32>> = scores.argmax(D::Minus1)?.to_vec2()?;

    // Every batch row has to shrink by the same amount, so rows with fewer
    // admissible edges cap the whole batch.
    let admissible = node_max
        .iter()
        .map(|row| row.iter().filter(|s| s.is_finite()).count())
        .min()
        .unwrap_or(0);
    let r_eff = r.min(admissible);
    if r_eff < r {
        warn!(
            requested = r,
            merged = r_eff,
            "not enough admissible partners, merging fewer tokens"
        );
    }
    if r_eff == 0 {
        return Ok(MergePlan::identity(batch, num_tokens, protected));
    }

    let mut unm = Vec::with_capacity(batch);
    let mut src = Vec::with_capacity(batch);
    let mut dst = Vec::with_capacity(batch);
    for (scores, partners) in node_max.iter().zip(&node_idx) {
        let order = rank_descending(scores);
        let chosen = order[..r_eff].to_vec();
        let mut kept = order[r_eff..].to_vec();
        kept.sort_unstable();
        dst.push(chosen.iter().map(|&i| partners[i] as usize).collect());
        src.push(chosen);
        unm.push(kept);
    }
    MergePlan::from_assignments(num_tokens, protected, unm, src, dst, device)
}

/// Indices sorted by descending score; ties keep index order, NaN ranks last.
fn rank_descending(scores: &[f32]) -> Vec<usize> {
    let key = |i: usize| {
        let s = scores[i];
        if s.is_nan() {
            f32::NEG_INFINITY
        } else {
            s
        }
    };
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&i, &j| key(j).total_cmp(&key(i)));
    order
}

fn locality_mask(n_a: usize, n_b: usize, window: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..n_a)
        .flat_map(|i| {
            (0..n_b).map(move |j| {
                if i.abs_diff(j) <= window {
                    0.0
                } else {
                    f32::NEG_INFINITY
                }
            })
        })
        .collect();
    Ok(Tensor::from_vec(mask, (n_a, n_b), device)?)
}
