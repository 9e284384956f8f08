use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{VarBuilder, VarMap};

use crate::model::{VisionTransformer, VisionTransformerConfig};

/// A model with freshly initialised (random) weights on the CPU.
///
/// Zero weights make every token identical, which leaves matching nothing to
/// choose between; random weights keep the metric informative.
pub fn random_model(config: &VisionTransformerConfig) -> Result<VisionTransformer> {
    random_model_with_dtype(config, DType::F32)
}

/// [`random_model`] with weights stored in `dtype`.
pub fn random_model_with_dtype(
    config: &VisionTransformerConfig,
    dtype: DType,
) -> Result<VisionTransformer> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, dtype, &Device::Cpu);
    VisionTransformer::new(config, vb)
}

/// Largest absolute element-wise difference between two same-shaped tensors.
pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    (a - b)?
        .abs()?
        .flatten_all()?
        .to_dtype(DType::F32)?
        .max(0)?
        .to_scalar()
}
