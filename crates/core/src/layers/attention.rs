//! Self-attention that reports a similarity metric alongside its output.

use std::collections::HashMap;

use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder};

/// Key under which attention publishes the matching metric.
pub const METRIC_KEY: &str = "metric";

/// Output of an attention step: the attended hidden states plus named
/// side tensors. A merging block requires [`METRIC_KEY`] to be present.
#[derive(Debug, Clone)]
pub struct AttentionOutput {
    pub hidden: Tensor,
    pub extras: HashMap<&'static str, Tensor>,
}

impl AttentionOutput {
    pub fn new(hidden: Tensor) -> Self {
        Self {
            hidden,
            extras: HashMap::new(),
        }
    }

    pub fn with_metric(hidden: Tensor, metric: Tensor) -> Self {
        let mut out = Self::new(hidden);
        out.extras.insert(METRIC_KEY, metric);
        out
    }

    pub fn metric(&self) -> Option<&Tensor> {
        self.extras.get(METRIC_KEY)
    }
}

/// Attention over a token sequence that may carry a per-token size.
///
/// `size`, when given, is `[batch, tokens, 1]` and biases every key's logit
/// by `log(size)`, so a merged token attracts attention in proportion to the
/// number of tokens it stands for.
pub trait TokenAttention {
    fn forward(&self, xs: &Tensor, size: Option<&Tensor>) -> Result<AttentionOutput>;
}

/// Multi-head self-attention with separate q/k/v projections.
///
/// The published metric is the per-token key averaged over heads,
/// `[batch, tokens, head_dim]`.
#[derive(Debug, Clone)]
pub struct VitAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl VitAttention {
    pub fn new(hidden_size: usize, num_heads: usize, qkv_bias: bool, vb: VarBuilder) -> Result<Self> {
        if num_heads == 0 || hidden_size % num_heads != 0 {
            candle_core::bail!("hidden size {hidden_size} is not divisible by {num_heads} heads");
        }
        let head_dim = hidden_size / num_heads;
        let proj = |name: &str| {
            if qkv_bias {
                candle_nn::linear(hidden_size, hidden_size, vb.pp(name))
            } else {
                candle_nn::linear_no_bias(hidden_size, hidden_size, vb.pp(name))
            }
        };
        let q_proj = proj("q_proj")?;
        let k_proj = proj("k_proj")?;
        let v_proj = proj("v_proj")?;
        let out_proj = candle_nn::linear(hidden_size, hidden_size, vb.pp("out_proj"))?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            out_proj,
            num_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
        })
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    fn split_heads(&self, xs: &Tensor, batch_size: usize, seq_len: usize) -> Result<Tensor> {
        xs.reshape((batch_size, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }
}

impl TokenAttention for VitAttention {
    fn forward(&self, xs: &Tensor, size: Option<&Tensor>) -> Result<AttentionOutput> {
        let (batch_size, seq_len, _) = xs.dims3()?;

        // [batch, num_heads, seq_len, head_dim]
        let q = self.split_heads(&self.q_proj.forward(xs)?, batch_size, seq_len)?;
        let k = self.split_heads(&self.k_proj.forward(xs)?, batch_size, seq_len)?;
        let v = self.split_heads(&self.v_proj.forward(xs)?, batch_size, seq_len)?;

        let mut attn_weights = (q.matmul(&k.transpose(2, 3)?)? * self.scale)?;

        // Proportional attention
        if let Some(size) = size {
            let bias = size
                .to_dtype(DType::F32)?
                .log()?
                .to_dtype(attn_weights.dtype())?
                .reshape((batch_size, 1, 1, seq_len))?;
            attn_weights = attn_weights.broadcast_add(&bias)?;
        }
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;

        let attn_output = attn_weights.matmul(&v)?.transpose(1, 2)?.reshape((
            batch_size,
            seq_len,
            self.num_heads * self.head_dim,
        ))?;
        let hidden = self.out_proj.forward(&attn_output)?;

        Ok(AttentionOutput::with_metric(hidden, k.mean(1)?))
    }
}
