//! Shared test utilities for tome-core.
//!
//! Tiny model configurations and randomly initialised models for unit,
//! integration and benchmark code.

mod random_model;
mod tiny_config;

pub use random_model::{max_abs_diff, random_model, random_model_with_dtype};
pub use tiny_config::{tiny_config, tiny_distilled_config};
