//! Merge applicator: fuses matched token pairs and compacts the sequence.
//!
//! A [`MergePlan`] is produced by
//! [`bipartite_soft_matching`](crate::matching::bipartite_soft_matching).
//! Applying it to a `[batch, tokens, channels]` tensor yields
//!
//! ```text
//! [protected tokens | unmerged A tokens | B tokens (with merged mass)]
//! ```
//!
//! with each group in original relative order. Merged-away A tokens are
//! physically removed.

use candle_core::{DType, Device, Tensor};

use crate::error::{Result, TomeError};

/// Device-side indices of a non-trivial plan.
#[derive(Debug, Clone)]
struct PlanIndices {
    /// Positions of set A inside the unprotected span, `[n_a]`.
    a_idx: Tensor,
    /// Positions of set B inside the unprotected span, `[n_b]`.
    b_idx: Tensor,
    /// A-set indices that survive, ascending, `[batch, n_a - r]`.
    unm_idx: Tensor,
    /// A-set indices merged away, `[batch, r]`.
    src_idx: Tensor,
    /// B-set destination of each merged A token, `[batch, r]`.
    dst_idx: Tensor,
}

/// Which tokens merge into which, for one block and one batch.
#[derive(Debug, Clone)]
pub struct MergePlan {
    batch: usize,
    num_tokens: usize,
    protected: usize,
    r: usize,
    unm: Vec<Vec<usize>>,
    src: Vec<Vec<usize>>,
    dst: Vec<Vec<usize>>,
    indices: Option<PlanIndices>,
}

impl MergePlan {
    /// A plan that leaves the sequence untouched.
    pub fn identity(batch: usize, num_tokens: usize, protected: usize) -> Self {
        Self {
            batch,
            num_tokens,
            protected: protected.min(num_tokens),
            r: 0,
            unm: Vec::new(),
            src: Vec::new(),
            dst: Vec::new(),
            indices: None,
        }
    }

    /// Build a plan from per-batch set indices.
    ///
    /// `unm`, `src` and `dst` index into the A and B sets; every batch row must
    /// merge the same number of tokens.
    pub(crate) fn from_assignments(
        num_tokens: usize,
        protected: usize,
        unm: Vec<Vec<usize>>,
        src: Vec<Vec<usize>>,
        dst: Vec<Vec<usize>>,
        device: &Device,
    ) -> Result<Self> {
        let batch = src.len();
        let r = src.first().map_or(0, Vec::len);
        if r == 0 {
            return Ok(Self::identity(batch, num_tokens, protected));
        }
        let span = num_tokens - protected;
        let (n_a, n_b) = set_sizes(span);
        let a_idx: Vec<u32> = (0..n_a).map(|i| (2 * i) as u32).collect();
        let b_idx: Vec<u32> = (0..n_b).map(|j| (2 * j + 1) as u32).collect();

        let indices = PlanIndices {
            a_idx: Tensor::from_vec(a_idx, n_a, device)?,
            b_idx: Tensor::from_vec(b_idx, n_b, device)?,
            unm_idx: index_matrix(&unm, n_a - r, device)?,
            src_idx: index_matrix(&src, r, device)?,
            dst_idx: index_matrix(&dst, r, device)?,
        };
        Ok(Self {
            batch,
            num_tokens,
            protected,
            r,
            unm,
            src,
            dst,
            indices: Some(indices),
        })
    }

    /// Number of tokens removed by this plan.
    pub fn r(&self) -> usize {
        self.r
    }

    pub fn is_identity(&self) -> bool {
        self.indices.is_none()
    }

    pub fn batch_size(&self) -> usize {
        self.batch
    }

    /// Sequence length the plan was built for.
    pub fn input_len(&self) -> usize {
        self.num_tokens
    }

    pub fn output_len(&self) -> usize {
        self.num_tokens - self.r
    }

    pub fn protected(&self) -> usize {
        self.protected
    }

    /// `(source, destination)` input positions of every merge in batch row `b`.
    pub fn merged_pairs(&self, b: usize) -> Vec<(usize, usize)> {
        match (self.src.get(b), self.dst.get(b)) {
            (Some(src), Some(dst)) => src
                .iter()
                .zip(dst)
                .map(|(&i, &j)| (self.a_position(i), self.b_position(j)))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Input position that anchors each output token of batch row `b`.
    ///
    /// For B tokens that absorbed merges this is the B token's own position.
    pub fn output_positions(&self, b: usize) -> Vec<usize> {
        if self.is_identity() {
            return (0..self.num_tokens).collect();
        }
        let span = self.num_tokens - self.protected;
        let (_, n_b) = set_sizes(span);
        let mut positions: Vec<usize> = (0..self.protected).collect();
        if let Some(unm) = self.unm.get(b) {
            positions.extend(unm.iter().map(|&i| self.a_position(i)));
        }
        positions.extend((0..n_b).map(|j| self.b_position(j)));
        positions
    }

    /// Apply the plan, summing every merged A token into its destination.
    pub fn merge(&self, x: &Tensor) -> Result<Tensor> {
        let Some(idx) = &self.indices else {
            return Ok(x.clone());
        };
        let (b, n, c) = x.dims3()?;
        if b != self.batch || n != self.num_tokens {
            return Err(TomeError::Candle(candle_core::Error::Msg(format!(
                "merge plan built for [{}, {}], got [{b}, {n}]",
                self.batch, self.num_tokens
            ))));
        }
        let p = self.protected;
        let rest = x.narrow(1, p, n - p)?.contiguous()?;
        let src_set = rest.index_select(&idx.a_idx, 1)?;
        let dst_set = rest.index_select(&idx.b_idx, 1)?;

        let moved = src_set.gather(&expand_index(&idx.src_idx, c)?, 1)?;
        let dst = dst_set.scatter_add(&expand_index(&idx.dst_idx, c)?, &moved, 1)?;

        let mut parts = Vec::with_capacity(3);
        if p > 0 {
            parts.push(x.narrow(1, 0, p)?);
        }
        if idx.unm_idx.dim(1)? > 0 {
            parts.push(src_set.gather(&expand_index(&idx.unm_idx, c)?, 1)?);
        }
        parts.push(dst);
        Ok(Tensor::cat(&parts, 1)?)
    }

    /// Size-weighted average merge.
    ///
    /// Returns the merged tokens (in the input dtype) and the merged size
    /// vector `[batch, tokens', 1]` (F32). A missing `size` counts every token
    /// once. Accumulation happens in F32.
    pub fn merge_wavg(&self, x: &Tensor, size: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        let (b, n, _) = x.dims3()?;
        let size = match size {
            Some(size) => size.to_dtype(DType::F32)?,
            None => Tensor::ones((b, n, 1), DType::F32, x.device())?,
        };
        if self.is_identity() {
            return Ok((x.clone(), size));
        }
        let weighted = x.to_dtype(DType::F32)?.broadcast_mul(&size)?;
        let merged = self.merge(&weighted)?;
        let size = self.merge(&size)?;
        let x = merged.broadcast_div(&size)?.to_dtype(x.dtype())?;
        Ok((x, size))
    }

    /// Union the source indicators of merged tokens.
    ///
    /// A missing `source` starts from the identity trace for `num_tokens`
    /// original tokens.
    pub fn merge_source(&self, source: Option<&Tensor>, device: &Device) -> Result<Tensor> {
        let source = match source {
            Some(source) => source.clone(),
            None => identity_source(self.batch, self.num_tokens, device)?,
        };
        if self.is_identity() {
            return Ok(source);
        }
        Ok(self.merge(&source)?.minimum(1f32)?)
    }

    fn a_position(&self, i: usize) -> usize {
        self.protected + 2 * i
    }

    fn b_position(&self, j: usize) -> usize {
        self.protected + 2 * j + 1
    }
}

/// Sizes of the A (even) and B (odd) sets for an unprotected span.
pub(crate) fn set_sizes(span: usize) -> (usize, usize) {
    (span.div_ceil(2), span / 2)
}

/// `[batch, n, n]` identity trace: every token is its own source.
pub fn identity_source(batch: usize, num_tokens: usize, device: &Device) -> Result<Tensor> {
    Ok(Tensor::eye(num_tokens, DType::F32, device)?
        .unsqueeze(0)?
        .broadcast_as((batch, num_tokens, num_tokens))?
        .contiguous()?)
}

fn index_matrix(rows: &[Vec<usize>], width: usize, device: &Device) -> Result<Tensor> {
    let flat: Vec<u32> = rows.iter().flatten().map(|&i| i as u32).collect();
    Ok(Tensor::from_vec(flat, (rows.len(), width), device)?)
}

fn expand_index(idx: &Tensor, channels: usize) -> Result<Tensor> {
    let (b, k) = idx.dims2()?;
    Ok(idx
        .unsqueeze(2)?
        .broadcast_as((b, k, channels))?
        .contiguous()?)
}
