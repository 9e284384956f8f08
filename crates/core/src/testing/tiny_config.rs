use crate::model::VisionTransformerConfig;

/// Tiny ViT: 32px images in 8px patches, 16 patches plus a class token,
/// 4 blocks of width 32.
pub fn tiny_config() -> VisionTransformerConfig {
    VisionTransformerConfig {
        hidden_size: 32,
        intermediate_size: 64,
        num_attention_heads: 4,
        num_hidden_layers: 4,
        ..VisionTransformerConfig::vit_base(8, 32)
    }
}

/// [`tiny_config`] with a distillation token after the class token.
pub fn tiny_distilled_config() -> VisionTransformerConfig {
    tiny_config().distilled()
}
