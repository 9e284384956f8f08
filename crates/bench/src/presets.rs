//! Model presets addressed by timm-style names.
//!
//! A name such as `vit_base_patch16_224` or `deit_small_distilled_patch16_224`
//! picks a width/depth family from its prefix and a patch size from the
//! `_patch<N>` component. The image size is not taken from the name: the
//! sweep derives it from the requested sequence length.

use thiserror::Error;
use tome_core::VisionTransformerConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PresetError {
    #[error("model name `{0}` has no `_patch<N>` component")]
    MissingPatchSize(String),
    #[error("unknown model family in `{0}`")]
    UnknownFamily(String),
    #[error("sequence length {seq_len} is too short for a patch grid")]
    EmptyGrid { seq_len: usize },
}

/// Patch size encoded as `_patch<N>` in a timm model name.
pub fn patch_size_from_name(name: &str) -> Result<usize, PresetError> {
    name.split("_patch")
        .nth(1)
        .and_then(|rest| rest.split('_').next())
        .and_then(|n| n.parse().ok())
        .filter(|&n: &usize| n > 0)
        .ok_or_else(|| PresetError::MissingPatchSize(name.to_string()))
}

/// Image side length whose patch grid holds about `seq_len` patches:
/// `floor(sqrt(seq_len)) * patch_size`.
pub fn image_size_for(seq_len: usize, patch_size: usize) -> Result<usize, PresetError> {
    let side = (seq_len as f64).sqrt().floor() as usize;
    if side == 0 {
        return Err(PresetError::EmptyGrid { seq_len });
    }
    Ok(side * patch_size)
}

/// Resolve a timm-style model name to an encoder configuration for
/// `seq_len` patches.
pub fn resolve(name: &str, seq_len: usize) -> Result<VisionTransformerConfig, PresetError> {
    let patch_size = patch_size_from_name(name)?;
    let image_size = image_size_for(seq_len, patch_size)?;

    let family = name.split("_patch").next().unwrap_or_default();
    let (family, distilled) = match family.strip_suffix("_distilled") {
        Some(base) => (base, true),
        None => (family, false),
    };
    let cfg = match family {
        "vit_tiny" | "deit_tiny" => VisionTransformerConfig::vit_tiny(patch_size, image_size),
        "vit_small" | "deit_small" => VisionTransformerConfig::vit_small(patch_size, image_size),
        "vit_base" | "deit_base" => VisionTransformerConfig::vit_base(patch_size, image_size),
        "vit_large" | "deit_large" => VisionTransformerConfig::vit_large(patch_size, image_size),
        "clip_vit_base" => VisionTransformerConfig::clip_vit_b(patch_size, image_size),
        _ => return Err(PresetError::UnknownFamily(name.to_string())),
    };
    Ok(if distilled { cfg.distilled() } else { cfg })
}
