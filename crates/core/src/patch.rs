//! Installing token merging into a [`VisionTransformer`].
//!
//! [`apply_patch`] swaps every block for its merging variant and returns a
//! [`TomeVisionTransformer`] that owns the model plus a [`TomeConfig`]. Each
//! call to `forward` expands the config into a fresh schedule and a fresh
//! [`MergeContext`], so a shared `&TomeVisionTransformer` can serve
//! concurrent forward passes.

use candle_core::{Device, Tensor};
use tracing::debug;

use crate::block::EncoderBlock;
use crate::config::{MergeSetting, TomeConfig};
use crate::context::{MergeContext, MergeFlags, MergeTrace};
use crate::error::Result;
use crate::model::VisionTransformer;
use crate::schedule::MergeSchedule;

/// Options fixed when the model is patched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchOptions {
    /// Keep a source trace (for visualisation).
    pub trace_source: bool,
    /// Proportional attention; turn off for models trained with merging.
    pub prop_attn: bool,
}

impl Default for PatchOptions {
    fn default() -> Self {
        Self {
            trace_source: false,
            prop_attn: true,
        }
    }
}

/// Convert every block of `model` into a merging block.
///
/// The returned model merges nothing until [`TomeVisionTransformer::set_merge`]
/// is called.
pub fn apply_patch(model: VisionTransformer, options: PatchOptions) -> TomeVisionTransformer {
    let model = model.map_blocks(EncoderBlock::into_merging);
    let config = TomeConfig::default()
        .with_prop_attn(options.prop_attn)
        .with_trace_source(options.trace_source);
    debug!(
        layers = model.num_layers(),
        prop_attn = options.prop_attn,
        trace_source = options.trace_source,
        "patched model for token merging"
    );
    TomeVisionTransformer { model, config }
}

/// Final hidden states plus what the pass did to the sequence.
#[derive(Debug, Clone)]
pub struct TomeOutput {
    pub hidden: Tensor,
    pub trace: MergeTrace,
}

/// A [`VisionTransformer`] whose blocks merge tokens.
#[derive(Debug, Clone)]
pub struct TomeVisionTransformer {
    model: VisionTransformer,
    config: TomeConfig,
}

impl TomeVisionTransformer {
    pub fn config(&self) -> &TomeConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut TomeConfig {
        &mut self.config
    }

    pub fn set_merge(&mut self, merge: MergeSetting) {
        self.config.merge = merge;
    }

    pub fn model(&self) -> &VisionTransformer {
        &self.model
    }

    pub fn device(&self) -> &Device {
        self.model.device()
    }

    /// Schedule for a pass whose first block sees `seq_len` tokens.
    pub fn schedule_for(&self, seq_len: usize) -> Result<MergeSchedule> {
        MergeSchedule::from_setting(
            &self.config.merge,
            self.model.num_layers(),
            seq_len,
            self.model.config().protected_tokens(),
        )
    }

    /// Schedule for inputs at the model's native resolution.
    pub fn schedule(&self) -> Result<MergeSchedule> {
        self.schedule_for(self.model.seq_len())
    }

    /// Forward-pass prologue: a fresh context for `seq_len` input tokens.
    pub fn new_context(&self, seq_len: usize) -> Result<MergeContext> {
        let mut matching = self.model.config().match_options();
        matching.locality_window = self.config.locality_window;
        let flags = MergeFlags {
            matching,
            prop_attn: self.config.prop_attn,
            trace_source: self.config.trace_source,
        };
        Ok(MergeContext::new(self.schedule_for(seq_len)?, flags))
    }

    /// Run already-embedded tokens `[batch, seq_len, hidden]` through the
    /// merging stack.
    pub fn forward_tokens(&self, tokens: &Tensor) -> Result<TomeOutput> {
        let mut ctx = self.new_context(tokens.dim(1)?)?;
        let hidden = self.model.encode_tokens(tokens, &mut ctx)?;
        let trace = ctx.finish()?;
        Ok(TomeOutput { hidden, trace })
    }

    /// Encode images and keep the merge trace.
    pub fn forward_traced(&self, pixel_values: &Tensor) -> Result<TomeOutput> {
        let tokens = self.model.embed(pixel_values)?;
        self.forward_tokens(&tokens)
    }

    /// Encode images `[batch, channels, height, width]`.
    pub fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        Ok(self.forward_traced(pixel_values)?.hidden)
    }

    /// Restore the plain model.
    pub fn unpatch(self) -> VisionTransformer {
        self.model.map_blocks(EncoderBlock::into_plain)
    }
}
