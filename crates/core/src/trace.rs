//! Reading a source trace back on the host.
//!
//! The trace tensor `[batch, tokens, original_tokens]` holds a 1 where a
//! current token contains an original token. [`SourceTrace`] turns it into
//! per-token groups, an original-to-current assignment and a patch-grid
//! layout for visualisation.

use candle_core::{DType, Tensor};

use crate::error::{Result, TomeError};

/// Host-side view of a source trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTrace {
    /// `groups[b][t]` lists the original tokens merged into token `t`.
    groups: Vec<Vec<Vec<usize>>>,
    num_original: usize,
}

impl SourceTrace {
    pub fn from_tensor(source: &Tensor) -> Result<Self> {
        let (_, _, num_original) = source.dims3()?;
        let rows: Vec<Vec<Vec<f32>>> = source.to_dtype(DType::F32)?.to_vec3()?;
        let groups = rows
            .iter()
            .map(|tokens| {
                tokens
                    .iter()
                    .map(|row| {
                        row.iter()
                            .enumerate()
                            .filter(|&(_, &v)| v > 0.5)
                            .map(|(i, _)| i)
                            .collect()
                    })
                    .collect()
            })
            .collect();
        Ok(Self {
            groups,
            num_original,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.groups.len()
    }

    pub fn num_original(&self) -> usize {
        self.num_original
    }

    pub fn num_tokens(&self) -> usize {
        self.groups.first().map_or(0, Vec::len)
    }

    /// Original tokens behind every current token of batch row `b`, or
    /// `None` when the row does not exist.
    pub fn groups(&self, b: usize) -> Option<&[Vec<usize>]> {
        self.groups.get(b).map(Vec::as_slice)
    }

    /// Number of original tokens behind every current token.
    pub fn group_sizes(&self, b: usize) -> Option<Vec<usize>> {
        Some(self.groups(b)?.iter().map(Vec::len).collect())
    }

    /// For each original token, the current token that contains it.
    pub fn assignment(&self, b: usize) -> Option<Vec<Option<usize>>> {
        let mut owner = vec![None; self.num_original];
        for (t, group) in self.groups(b)?.iter().enumerate() {
            for &o in group {
                owner[o] = Some(t);
            }
        }
        Some(owner)
    }

    /// Every original token belongs to exactly one current token in every
    /// batch row.
    pub fn is_partition(&self) -> bool {
        self.groups.iter().all(|tokens| {
            let mut seen = vec![0usize; self.num_original];
            for &o in tokens.iter().flatten() {
                seen[o] += 1;
            }
            seen.iter().all(|&c| c == 1)
        })
    }

    /// Lay out the assignment of the patch tokens on a `side x side` grid,
    /// skipping `protected` leading tokens. Fails when the row does not exist
    /// or the patch count is not `side * side`.
    pub fn patch_grid(&self, b: usize, protected: usize) -> Result<Vec<Vec<usize>>> {
        if protected > self.num_original {
            return Err(TomeError::invalid(format!(
                "{protected} protected tokens exceed {} original tokens",
                self.num_original
            )));
        }
        let patches = self.num_original - protected;
        let side = (patches as f64).sqrt().round() as usize;
        if side * side != patches {
            return Err(TomeError::invalid(format!(
                "{patches} patch tokens do not form a square grid"
            )));
        }
        let assignment = self.assignment(b).ok_or_else(|| {
            TomeError::invalid(format!(
                "batch row {b} out of range for {} rows",
                self.batch_size()
            ))
        })?;
        let cells: Vec<usize> = assignment[protected..]
            .iter()
            .map(|owner| owner.unwrap_or(usize::MAX))
            .collect();
        Ok(cells.chunks(side).map(<[usize]>::to_vec).collect())
    }
}
