//! Encoder blocks and the merge-aware forward pass.
//!
//! A [`TransformerBlock`] is a plain pre-norm block. Wrapping it in a
//! [`TomeBlock`] inserts matching and merging between the attention and MLP
//! residual stages:
//!
//! 1. attend, biasing logits by `log(size)` when proportional attention is on
//! 2. add the attention residual
//! 3. pop this block's merge count from the context
//! 4. match tokens on the attention metric
//! 5. merge tokens, size and source with the resulting plan
//! 6. run the MLP residual on the shorter sequence

use candle_core::{Module, Tensor};
use candle_nn::{LayerNorm, VarBuilder};
use tracing::trace;

use crate::context::MergeContext;
use crate::error::{Result, TomeError};
use crate::layers::{AttentionOutput, TokenAttention, VitAttention, VitMlp, METRIC_KEY};
use crate::matching::bipartite_soft_matching;
use crate::model::VisionTransformerConfig;

/// A block that can take part in a merge-aware forward pass.
pub trait MergeableBlock {
    fn forward(&self, xs: &Tensor, ctx: &mut MergeContext) -> Result<Tensor>;
}

// ─── Plain Block ─────────────────────────────────────────────────────────────

/// Pre-norm transformer block: `x + attn(norm1(x))`, then `x + mlp(norm2(x))`.
#[derive(Debug, Clone)]
pub struct TransformerBlock<A = VitAttention, M = VitMlp> {
    layer_norm1: LayerNorm,
    self_attn: A,
    layer_norm2: LayerNorm,
    mlp: M,
}

impl TransformerBlock {
    pub fn new(cfg: &VisionTransformerConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let self_attn = VitAttention::new(
            cfg.hidden_size,
            cfg.num_attention_heads,
            cfg.qkv_bias,
            vb.pp("self_attn"),
        )?;
        let mlp = VitMlp::new(
            cfg.hidden_size,
            cfg.intermediate_size,
            cfg.activation,
            vb.pp("mlp"),
        )?;
        let layer_norm1 =
            candle_nn::layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("layer_norm1"))?;
        let layer_norm2 =
            candle_nn::layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("layer_norm2"))?;
        Ok(Self::from_parts(layer_norm1, self_attn, layer_norm2, mlp))
    }
}

impl<A: TokenAttention, M: Module> TransformerBlock<A, M> {
    pub fn from_parts(layer_norm1: LayerNorm, self_attn: A, layer_norm2: LayerNorm, mlp: M) -> Self {
        Self {
            layer_norm1,
            self_attn,
            layer_norm2,
            mlp,
        }
    }

    /// Attention stage without the residual.
    fn attend(&self, xs: &Tensor, size: Option<&Tensor>) -> candle_core::Result<AttentionOutput> {
        let normed = self.layer_norm1.forward(xs)?;
        self.self_attn.forward(&normed, size)
    }

    /// MLP stage including its residual.
    fn feed_forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let hidden = self.mlp.forward(&self.layer_norm2.forward(xs)?)?;
        xs + hidden
    }

    /// Size-agnostic forward pass.
    pub fn forward_plain(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let attn = self.attend(xs, None)?;
        let xs = (xs + attn.hidden)?;
        self.feed_forward(&xs)
    }
}

impl<A: TokenAttention, M: Module> MergeableBlock for TransformerBlock<A, M> {
    fn forward(&self, xs: &Tensor, _ctx: &mut MergeContext) -> Result<Tensor> {
        Ok(self.forward_plain(xs)?)
    }
}

// ─── Merging Block ───────────────────────────────────────────────────────────

/// A transformer block that merges tokens between attention and MLP.
#[derive(Debug, Clone)]
pub struct TomeBlock<A = VitAttention, M = VitMlp> {
    inner: TransformerBlock<A, M>,
}

impl<A: TokenAttention, M: Module> TomeBlock<A, M> {
    pub fn new(inner: TransformerBlock<A, M>) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &TransformerBlock<A, M> {
        &self.inner
    }

    pub fn into_inner(self) -> TransformerBlock<A, M> {
        self.inner
    }
}

impl<A: TokenAttention, M: Module> MergeableBlock for TomeBlock<A, M> {
    fn forward(&self, xs: &Tensor, ctx: &mut MergeContext) -> Result<Tensor> {
        let block = ctx.block_index();
        ctx.begin_block(xs)?;

        let attn = self.inner.attend(xs, ctx.attention_size())?;
        let metric = checked_metric(&attn, xs)?;
        let xs = (xs + &attn.hidden)?;

        let r = ctx.next_merge_count()?;
        let tokens_in = xs.dim(1)?;
        let xs = if r > 0 {
            let plan = bipartite_soft_matching(metric, r, &ctx.flags().matching)?;
            if plan.is_identity() {
                xs
            } else {
                ctx.apply(&plan, &xs)?
            }
        } else {
            xs
        };
        let tokens_out = xs.dim(1)?;
        trace!(block, tokens_in, r, tokens_out, "merge block");

        Ok(self.inner.feed_forward(&xs)?)
    }
}

/// The attention metric, checked to be a float `[batch, tokens, channels]`
/// tensor matching the block input.
fn checked_metric<'a>(attn: &'a AttentionOutput, xs: &Tensor) -> Result<&'a Tensor> {
    let metric = attn
        .metric()
        .ok_or(TomeError::MissingMetric { key: METRIC_KEY })?;
    if !metric.dtype().is_float() {
        return Err(TomeError::MetricNotNumeric {
            dtype: metric.dtype(),
        });
    }
    let (batch, tokens, _) = xs.dims3()?;
    match metric.dims() {
        [b, n, _] if *b == batch && *n == tokens => Ok(metric),
        actual => Err(TomeError::MetricShape {
            expected: tokens,
            actual: actual.to_vec(),
        }),
    }
}

// ─── Encoder Block ───────────────────────────────────────────────────────────

/// An encoder slot, either plain or merge-aware.
#[derive(Debug, Clone)]
pub enum EncoderBlock<A = VitAttention, M = VitMlp> {
    Plain(TransformerBlock<A, M>),
    Merging(TomeBlock<A, M>),
}

impl<A: TokenAttention, M: Module> EncoderBlock<A, M> {
    pub fn is_merging(&self) -> bool {
        matches!(self, Self::Merging(_))
    }

    pub fn into_merging(self) -> Self {
        match self {
            Self::Plain(block) => Self::Merging(TomeBlock::new(block)),
            merging => merging,
        }
    }

    pub fn into_plain(self) -> Self {
        match self {
            Self::Merging(block) => Self::Plain(block.into_inner()),
            plain => plain,
        }
    }

    pub fn forward_plain(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Plain(block) => block.forward_plain(xs),
            Self::Merging(block) => block.inner().forward_plain(xs),
        }
    }
}

impl<A: TokenAttention, M: Module> MergeableBlock for EncoderBlock<A, M> {
    fn forward(&self, xs: &Tensor, ctx: &mut MergeContext) -> Result<Tensor> {
        match self {
            Self::Plain(block) => MergeableBlock::forward(block, xs, ctx),
            Self::Merging(block) => block.forward(xs, ctx),
        }
    }
}
