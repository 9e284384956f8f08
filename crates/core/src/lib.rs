//! Token merging for vision transformers.
//!
//! Between the attention and MLP stages of every block, similar tokens are
//! paired by bipartite soft matching and averaged together, so later blocks
//! run on shorter sequences. A per-token size keeps track of how many
//! original tokens each current token stands for; it weights the averages
//! and, optionally, biases attention towards large tokens.
//!
//! ```no_run
//! use candle_core::{DType, Device, Tensor};
//! use candle_nn::VarBuilder;
//! use tome_core::{apply_patch, MergeSetting, PatchOptions, VisionTransformer, VisionTransformerConfig};
//!
//! # fn main() -> anyhow::Result<()> {
//! let cfg = VisionTransformerConfig::vit_base(16, 224);
//! let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
//! let mut model = apply_patch(VisionTransformer::new(&cfg, vb)?, PatchOptions::default());
//! model.set_merge(MergeSetting::target(980));
//! let pixels = Tensor::zeros((1, 3, 224, 224), DType::F32, &Device::Cpu)?;
//! let tokens = model.forward(&pixels)?;
//! assert_eq!(tokens.dim(1)?, 2);
//! # Ok(())
//! # }
//! ```

pub mod block;
pub mod config;
pub mod context;
pub mod error;
pub mod layers;
pub mod matching;
pub mod merge;
pub mod model;
pub mod patch;
pub mod schedule;
pub mod trace;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use block::{EncoderBlock, MergeableBlock, TomeBlock, TransformerBlock};
pub use config::{MergeSetting, TomeConfig};
pub use context::{MergeContext, MergeFlags, MergeTrace};
pub use error::{Result, TomeError};
pub use matching::{bipartite_soft_matching, max_merges, MatchOptions};
pub use merge::{identity_source, MergePlan};
pub use model::{VisionTransformer, VisionTransformerConfig};
pub use patch::{apply_patch, PatchOptions, TomeOutput, TomeVisionTransformer};
pub use schedule::{derive_uniform_ratio, expand_ratio, merge_capacity, plan, MergeSchedule};
pub use trace::SourceTrace;
