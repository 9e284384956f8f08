//! Call-scoped merge state.
//!
//! A [`MergeContext`] is created by the forward-pass prologue and threaded
//! through every block by `&mut` reference. It owns the schedule cursor, the
//! running size vector and the optional source trace, so concurrent forward
//! passes on one model each work on their own state.

use candle_core::{DType, Tensor};

use crate::error::{Result, TomeError};
use crate::matching::MatchOptions;
use crate::merge::{identity_source, MergePlan};
use crate::schedule::MergeSchedule;

/// Flags fixed for the lifetime of a patched model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeFlags {
    pub matching: MatchOptions,
    pub prop_attn: bool,
    pub trace_source: bool,
}

/// Per-forward-pass state shared by all blocks of one call.
#[derive(Debug)]
pub struct MergeContext {
    schedule: MergeSchedule,
    cursor: usize,
    flags: MergeFlags,
    size: Option<Tensor>,
    source: Option<Tensor>,
    tokens_per_block: Vec<usize>,
}

impl MergeContext {
    pub fn new(schedule: MergeSchedule, flags: MergeFlags) -> Self {
        let tokens_per_block = Vec::with_capacity(schedule.len());
        Self {
            schedule,
            cursor: 0,
            flags,
            size: None,
            source: None,
            tokens_per_block,
        }
    }

    pub fn flags(&self) -> &MergeFlags {
        &self.flags
    }

    pub fn schedule(&self) -> &MergeSchedule {
        &self.schedule
    }

    /// Index of the next block to consume a schedule entry.
    pub fn block_index(&self) -> usize {
        self.cursor
    }

    /// Lazily materialise the size vector (all ones) and, when tracing, the
    /// identity source trace for the incoming sequence.
    pub fn begin_block(&mut self, x: &Tensor) -> Result<()> {
        let (b, n, _) = x.dims3()?;
        if self.size.is_none() {
            self.size = Some(Tensor::ones((b, n, 1), DType::F32, x.device())?);
        }
        if self.flags.trace_source && self.source.is_none() {
            self.source = Some(identity_source(b, n, x.device())?);
        }
        self.tokens_per_block.push(n);
        Ok(())
    }

    /// Size vector to bias attention with, if proportional attention is on.
    pub fn attention_size(&self) -> Option<&Tensor> {
        if self.flags.prop_attn {
            self.size.as_ref()
        } else {
            None
        }
    }

    /// Consume this block's schedule entry.
    pub fn next_merge_count(&mut self) -> Result<usize> {
        let r = self
            .schedule
            .get(self.cursor)
            .ok_or(TomeError::ScheduleExhausted {
                block: self.cursor,
                len: self.schedule.len(),
            })?;
        self.cursor += 1;
        Ok(r)
    }

    /// Apply a merge plan to the working sequence, updating size and source.
    pub fn apply(&mut self, plan: &MergePlan, x: &Tensor) -> Result<Tensor> {
        if self.flags.trace_source {
            self.source = Some(plan.merge_source(self.source.as_ref(), x.device())?);
        }
        let (x, size) = plan.merge_wavg(x, self.size.as_ref())?;
        self.size = Some(size);
        Ok(x)
    }

    pub fn size(&self) -> Option<&Tensor> {
        self.size.as_ref()
    }

    pub fn source(&self) -> Option<&Tensor> {
        self.source.as_ref()
    }

    /// Close the pass, checking that every block took exactly one entry.
    pub fn finish(self) -> Result<MergeTrace> {
        if self.cursor != self.schedule.len() {
            return Err(TomeError::ScheduleNotConsumed {
                consumed: self.cursor,
                len: self.schedule.len(),
            });
        }
        Ok(MergeTrace {
            schedule: self.schedule,
            size: self.size,
            source: self.source,
            tokens_per_block: self.tokens_per_block,
        })
    }
}

/// What a forward pass leaves behind for introspection.
#[derive(Debug, Clone)]
pub struct MergeTrace {
    /// The schedule that was executed.
    pub schedule: MergeSchedule,
    /// Final size vector, `[batch, tokens, 1]`.
    pub size: Option<Tensor>,
    /// Final source trace, `[batch, tokens, original_tokens]`.
    pub source: Option<Tensor>,
    /// Number of tokens entering each block.
    pub tokens_per_block: Vec<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn tokens(n: usize) -> Tensor {
        Tensor::zeros((2, n, 4), DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn schedule_is_consumed_in_order() {
        let mut ctx = MergeContext::new(MergeSchedule::new(vec![3, 0, 1]), MergeFlags::default());
        assert_eq!(ctx.next_merge_count().unwrap(), 3);
        assert_eq!(ctx.next_merge_count().unwrap(), 0);
        assert_eq!(ctx.block_index(), 2);
        assert_eq!(ctx.next_merge_count().unwrap(), 1);
        assert!(matches!(
            ctx.next_merge_count(),
            Err(TomeError::ScheduleExhausted { block: 3, len: 3 })
        ));
    }

    #[test]
    fn unfinished_schedule_is_an_error() {
        let mut ctx = MergeContext::new(MergeSchedule::zeros(2), MergeFlags::default());
        ctx.next_merge_count().unwrap();
        assert!(matches!(
            ctx.finish(),
            Err(TomeError::ScheduleNotConsumed { consumed: 1, len: 2 })
        ));
    }

    #[test]
    fn size_and_source_start_lazily() {
        let flags = MergeFlags {
            trace_source: true,
            prop_attn: true,
            ..Default::default()
        };
        let mut ctx = MergeContext::new(MergeSchedule::zeros(1), flags);
        assert!(ctx.size().is_none());
        assert!(ctx.attention_size().is_none());

        ctx.begin_block(&tokens(5)).unwrap();
        assert_eq!(ctx.size().unwrap().dims(), &[2, 5, 1]);
        assert_eq!(ctx.source().unwrap().dims(), &[2, 5, 5]);
        assert!(ctx.attention_size().is_some());

        ctx.next_merge_count().unwrap();
        let trace = ctx.finish().unwrap();
        assert_eq!(trace.tokens_per_block, vec![5]);
    }

    #[test]
    fn attention_size_requires_prop_attn() {
        let mut ctx = MergeContext::new(MergeSchedule::zeros(1), MergeFlags::default());
        ctx.begin_block(&tokens(3)).unwrap();
        assert!(ctx.size().is_some());
        assert!(ctx.attention_size().is_none());
        assert!(ctx.source().is_none());
    }
}
