//! Plain ViT encoder stack.
//!
//! Patch embedding, optional class and distillation tokens, learned position
//! embeddings, a stack of [`EncoderBlock`]s and a final layer norm. Weight
//! names follow the HF CLIP vision layout (`encoder.layers.{i}.self_attn`).

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Embedding, LayerNorm, VarBuilder};

use crate::block::{EncoderBlock, MergeableBlock, TransformerBlock};
use crate::context::MergeContext;
use crate::layers::Activation;
use crate::matching::MatchOptions;

/// Configuration for a ViT-style encoder.
#[derive(Debug, Clone, PartialEq)]
pub struct VisionTransformerConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    pub num_hidden_layers: usize,
    /// Image size (square).
    pub image_size: usize,
    /// Patch size (square).
    pub patch_size: usize,
    pub num_channels: usize,
    pub layer_norm_eps: f64,
    /// Prepend a learned class token.
    pub class_token: bool,
    /// Prepend a learned distillation token after the class token.
    pub distill_token: bool,
    /// Layer norm on the embeddings before the first block (CLIP).
    pub pre_layernorm: bool,
    pub qkv_bias: bool,
    pub activation: Activation,
}

impl Default for VisionTransformerConfig {
    fn default() -> Self {
        // ViT-B/16 @ 224px
        Self {
            hidden_size: 768,
            intermediate_size: 3072,
            num_attention_heads: 12,
            num_hidden_layers: 12,
            image_size: 224,
            patch_size: 16,
            num_channels: 3,
            layer_norm_eps: 1e-6,
            class_token: true,
            distill_token: false,
            pre_layernorm: false,
            qkv_bias: true,
            activation: Activation::Gelu,
        }
    }
}

impl VisionTransformerConfig {
    pub fn vit_tiny(patch_size: usize, image_size: usize) -> Self {
        Self {
            hidden_size: 192,
            intermediate_size: 768,
            num_attention_heads: 3,
            patch_size,
            image_size,
            ..Self::default()
        }
    }

    pub fn vit_small(patch_size: usize, image_size: usize) -> Self {
        Self {
            hidden_size: 384,
            intermediate_size: 1536,
            num_attention_heads: 6,
            patch_size,
            image_size,
            ..Self::default()
        }
    }

    pub fn vit_base(patch_size: usize, image_size: usize) -> Self {
        Self {
            patch_size,
            image_size,
            ..Self::default()
        }
    }

    pub fn vit_large(patch_size: usize, image_size: usize) -> Self {
        Self {
            hidden_size: 1024,
            intermediate_size: 4096,
            num_attention_heads: 16,
            num_hidden_layers: 24,
            patch_size,
            image_size,
            ..Self::default()
        }
    }

    /// CLIP ViT-B/16 vision tower.
    pub fn clip_vit_b(patch_size: usize, image_size: usize) -> Self {
        Self {
            layer_norm_eps: 1e-5,
            pre_layernorm: true,
            activation: Activation::QuickGelu,
            ..Self::vit_base(patch_size, image_size)
        }
    }

    /// DeiT-style variant with a distillation token.
    pub fn distilled(self) -> Self {
        Self {
            distill_token: true,
            ..self
        }
    }

    /// Parse an HF-style `config.json` value; missing keys fall back to
    /// ViT-B/16 defaults.
    pub fn from_json(v: &serde_json::Value) -> Self {
        let defaults = Self::default();
        let g = |key, default: usize| {
            v.get(key)
                .and_then(|x| x.as_u64())
                .map_or(default, |x| x as usize)
        };
        let flag = |key, default: bool| v.get(key).and_then(|x| x.as_bool()).unwrap_or(default);
        let activation = match v.get("hidden_act").and_then(|x| x.as_str()) {
            Some("quick_gelu") => Activation::QuickGelu,
            _ => Activation::Gelu,
        };
        Self {
            hidden_size: g("hidden_size", defaults.hidden_size),
            intermediate_size: g("intermediate_size", defaults.intermediate_size),
            num_attention_heads: g("num_attention_heads", defaults.num_attention_heads),
            num_hidden_layers: g("num_hidden_layers", defaults.num_hidden_layers),
            image_size: g("image_size", defaults.image_size),
            patch_size: g("patch_size", defaults.patch_size),
            num_channels: g("num_channels", defaults.num_channels),
            layer_norm_eps: v
                .get("layer_norm_eps")
                .and_then(|x| x.as_f64())
                .unwrap_or(defaults.layer_norm_eps),
            class_token: flag("class_token", defaults.class_token),
            distill_token: flag("distill_token", defaults.distill_token),
            pre_layernorm: flag("pre_layernorm", defaults.pre_layernorm),
            qkv_bias: flag("qkv_bias", defaults.qkv_bias),
            activation,
        }
    }

    /// Number of patches per image dimension.
    pub fn num_patches_per_side(&self) -> usize {
        self.image_size / self.patch_size
    }

    pub fn num_patches(&self) -> usize {
        let n = self.num_patches_per_side();
        n * n
    }

    /// Leading tokens that are never merged.
    pub fn protected_tokens(&self) -> usize {
        usize::from(self.class_token) + usize::from(self.distill_token)
    }

    /// Sequence length entering the first block.
    pub fn seq_len(&self) -> usize {
        self.num_patches() + self.protected_tokens()
    }

    pub fn match_options(&self) -> MatchOptions {
        MatchOptions {
            class_token: self.class_token,
            distill_token: self.distill_token,
            locality_window: None,
        }
    }
}

// ─── Patch Embedding ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct PatchEmbedding {
    proj: Conv2d,
}

impl PatchEmbedding {
    fn new(cfg: &VisionTransformerConfig, vb: VarBuilder) -> Result<Self> {
        let proj = candle_nn::conv2d(
            cfg.num_channels,
            cfg.hidden_size,
            cfg.patch_size,
            Conv2dConfig {
                stride: cfg.patch_size,
                padding: 0,
                dilation: 1,
                groups: 1,
                cudnn_fwd_algo: None,
            },
            vb.pp("patch_embedding"),
        )?;
        Ok(Self { proj })
    }

    fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        // [batch, hidden, h, w] -> [batch, h * w, hidden]
        self.proj.forward(pixel_values)?.flatten(2, 3)?.transpose(1, 2)
    }
}

// ─── Vision Transformer ──────────────────────────────────────────────────────

/// ViT encoder returning the final normalised token sequence.
#[derive(Debug, Clone)]
pub struct VisionTransformer {
    patch_embedding: PatchEmbedding,
    class_embedding: Option<Tensor>,
    distill_embedding: Option<Tensor>,
    position_embedding: Embedding,
    pre_layernorm: Option<LayerNorm>,
    blocks: Vec<EncoderBlock>,
    post_layernorm: LayerNorm,
    config: VisionTransformerConfig,
    device: Device,
    dtype: DType,
}

impl VisionTransformer {
    pub fn new(cfg: &VisionTransformerConfig, vb: VarBuilder) -> Result<Self> {
        let patch_embedding = PatchEmbedding::new(cfg, vb.clone())?;
        let class_embedding = if cfg.class_token {
            Some(vb.get((1, 1, cfg.hidden_size), "class_embedding")?)
        } else {
            None
        };
        let distill_embedding = if cfg.distill_token {
            Some(vb.get((1, 1, cfg.hidden_size), "distill_embedding")?)
        } else {
            None
        };
        let position_embedding =
            candle_nn::embedding(cfg.seq_len(), cfg.hidden_size, vb.pp("position_embedding"))?;

        let vb_layers = vb.pp("encoder.layers");
        let blocks = (0..cfg.num_hidden_layers)
            .map(|i| TransformerBlock::new(cfg, vb_layers.pp(i)).map(EncoderBlock::Plain))
            .collect::<Result<Vec<_>>>()?;

        let pre_layernorm = if cfg.pre_layernorm {
            Some(candle_nn::layer_norm(
                cfg.hidden_size,
                cfg.layer_norm_eps,
                vb.pp("pre_layernorm"),
            )?)
        } else {
            None
        };
        let post_layernorm =
            candle_nn::layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("post_layernorm"))?;

        Ok(Self {
            patch_embedding,
            class_embedding,
            distill_embedding,
            position_embedding,
            pre_layernorm,
            blocks,
            post_layernorm,
            config: cfg.clone(),
            device: vb.device().clone(),
            dtype: vb.dtype(),
        })
    }

    /// Embed images `[batch, channels, height, width]` into the token
    /// sequence `[batch, seq_len, hidden]` seen by the first block.
    pub fn embed(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let batch_size = pixel_values.dim(0)?;
        let hidden = self.config.hidden_size;
        let patches = self.patch_embedding.forward(pixel_values)?;

        let mut parts = Vec::with_capacity(3);
        for token in [&self.class_embedding, &self.distill_embedding]
            .into_iter()
            .flatten()
        {
            parts.push(token.broadcast_as((batch_size, 1, hidden))?.contiguous()?);
        }
        parts.push(patches);
        let embeddings = Tensor::cat(&parts, 1)?;

        let seq_len = embeddings.dim(1)?;
        let position_ids = Tensor::arange(0u32, seq_len as u32, &self.device)?;
        let embeddings =
            embeddings.broadcast_add(&self.position_embedding.forward(&position_ids)?)?;

        match &self.pre_layernorm {
            Some(ln) => ln.forward(&embeddings),
            None => Ok(embeddings),
        }
    }

    /// Encode a batch of images without any merging.
    pub fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let mut xs = self.embed(pixel_values)?;
        for block in &self.blocks {
            xs = block.forward_plain(&xs)?;
        }
        self.post_layernorm.forward(&xs)
    }

    /// Run embedded tokens through the block stack with a merge context and
    /// apply the final layer norm.
    pub fn encode_tokens(&self, tokens: &Tensor, ctx: &mut MergeContext) -> crate::Result<Tensor> {
        let mut xs = tokens.clone();
        for block in &self.blocks {
            xs = block.forward(&xs, ctx)?;
        }
        Ok(self.post_layernorm.forward(&xs)?)
    }

    pub(crate) fn map_blocks(mut self, f: impl Fn(EncoderBlock) -> EncoderBlock) -> Self {
        self.blocks = self.blocks.into_iter().map(f).collect();
        self
    }

    pub fn blocks(&self) -> &[EncoderBlock] {
        &self.blocks
    }

    pub fn num_layers(&self) -> usize {
        self.blocks.len()
    }

    pub fn seq_len(&self) -> usize {
        self.config.seq_len()
    }

    pub fn hidden_size(&self) -> usize {
        self.config.hidden_size
    }

    pub fn image_size(&self) -> usize {
        self.config.image_size
    }

    pub fn config(&self) -> &VisionTransformerConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }
}
