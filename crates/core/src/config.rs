//! Merge configuration for a patched model.
//!
//! A [`TomeConfig`] is the handle callers adjust between forward passes. It is
//! plain data: every forward pass expands it into a fresh schedule and a fresh
//! call-scoped context, so changing it never races an in-flight pass.

use serde::{Deserialize, Serialize};

/// How many tokens to merge, in any of the forms the schedule parser accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MergeSetting {
    /// The same number of merges in every block.
    Constant { r: usize },
    /// A base `r` shaped by an inflection in `[-1, 1]`: `-1` merges most in
    /// early blocks, `0` is constant, `+1` merges most in late blocks.
    Decay { r: usize, inflect: f64 },
    /// Explicit counts; missing trailing layers merge nothing.
    PerLayer { counts: Vec<usize> },
    /// A total budget over the whole stack, shaped by `inflect`.
    Target { total: usize, inflect: f64 },
}

impl Default for MergeSetting {
    fn default() -> Self {
        Self::Constant { r: 0 }
    }
}

impl MergeSetting {
    /// A total merge budget with the decreasing shape used for benchmarking.
    pub fn target(total: usize) -> Self {
        Self::Target {
            total,
            inflect: -0.5,
        }
    }

    /// Whether this setting can never merge anything.
    pub fn is_disabled(&self) -> bool {
        match self {
            Self::Constant { r } | Self::Decay { r, .. } => *r == 0,
            Self::PerLayer { counts } => counts.iter().all(|&c| c == 0),
            Self::Target { total, .. } => *total == 0,
        }
    }
}

/// Token merging configuration for one patched model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TomeConfig {
    /// Merge schedule setting.
    pub merge: MergeSetting,
    /// Bias attention logits by `log(size)` of each key token.
    ///
    /// Helps off-the-shelf checkpoints; models trained with merging (or MAE
    /// checkpoints) usually want it off.
    pub prop_attn: bool,
    /// Keep a source trace mapping current tokens to original tokens.
    pub trace_source: bool,
    /// Restrict matching to partners at most this many pair positions away.
    /// `None` matches globally.
    pub locality_window: Option<usize>,
}

impl Default for TomeConfig {
    fn default() -> Self {
        Self {
            merge: MergeSetting::default(),
            prop_attn: true,
            trace_source: false,
            locality_window: None,
        }
    }
}

impl TomeConfig {
    pub fn with_merge(mut self, merge: MergeSetting) -> Self {
        self.merge = merge;
        self
    }

    pub fn with_prop_attn(mut self, prop_attn: bool) -> Self {
        self.prop_attn = prop_attn;
        self
    }

    pub fn with_trace_source(mut self, trace_source: bool) -> Self {
        self.trace_source = trace_source;
        self
    }

    pub fn with_locality_window(mut self, window: Option<usize>) -> Self {
        self.locality_window = window;
        self
    }
}
