//! Throughput benchmark for plain and token-merged encoders.
//!
//! Each trial builds a randomly initialised model from a timm-style name,
//! optionally patches it for token merging, runs warmup iterations and then
//! times a fixed number of forward passes. A trial that fails for any reason
//! is recorded with NaN metrics and a `failed` status; it never aborts the
//! sweep.

use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Instant;

use anyhow::Context;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use tome_core::{
    apply_patch, derive_uniform_ratio, MergeSetting, PatchOptions, TomeVisionTransformer,
    VisionTransformer,
};

use crate::presets;

/// Token reduction algorithm under test.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    /// The unpatched model.
    None,
    /// Token merging.
    Tome,
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Tome => write!(f, "tome"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Failed,
}

/// One point of a sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct Trial {
    pub model_name: String,
    pub algorithm: Algorithm,
    pub batch_size: usize,
    /// Patches per image.
    pub seq_len: usize,
    pub total_merge: usize,
    pub inflect: f64,
    pub locality_window: Option<usize>,
    pub warmup_iters: usize,
    pub benchmark_iters: usize,
    /// Log the number of tokens entering every block before timing.
    pub verbose: bool,
}

/// Result row for one trial.
#[derive(Debug, Clone, Serialize)]
pub struct BenchRecord {
    pub model_name: String,
    pub algorithm: Algorithm,
    pub batch_size: usize,
    pub seq_len: usize,
    pub target_total_merge: usize,
    /// Locality window, recorded for token merging only.
    pub h: Option<usize>,
    pub latency_ms: f64,
    #[serde(rename = "throughput_samples/s")]
    pub throughput: f64,
    /// NaN when the backend cannot report allocator statistics.
    pub peak_mem_mb: f64,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct Measurement {
    latency_ms: f64,
    throughput: f64,
    peak_mem_mb: f64,
}

enum Encoder {
    Plain(VisionTransformer),
    Tome(TomeVisionTransformer),
}

impl Encoder {
    fn forward(&self, pixel_values: &Tensor) -> anyhow::Result<Tensor> {
        Ok(match self {
            Self::Plain(model) => model.forward(pixel_values)?,
            Self::Tome(model) => model.forward(pixel_values)?,
        })
    }
}

/// Runs trials on one device and collects their records.
pub struct ThroughputBenchmark {
    device: Device,
    dtype: DType,
    results: Vec<BenchRecord>,
}

impl ThroughputBenchmark {
    pub fn new(device: Device, dtype: DType) -> Self {
        Self {
            device,
            dtype,
            results: Vec::new(),
        }
    }

    /// Run one trial and record its outcome.
    pub fn run(&mut self, trial: &Trial) -> &BenchRecord {
        let outcome = self.measure(trial);
        let (measurement, status, error) = match outcome {
            Ok(m) => (m, Status::Success, None),
            Err(e) => {
                warn!(
                    model = %trial.model_name,
                    algorithm = %trial.algorithm,
                    total_merge = trial.total_merge,
                    error = %format!("{e:#}"),
                    "trial failed"
                );
                let nan = Measurement {
                    latency_ms: f64::NAN,
                    throughput: f64::NAN,
                    peak_mem_mb: f64::NAN,
                };
                (nan, Status::Failed, Some(format!("{e:#}")))
            }
        };
        self.results.push(BenchRecord {
            model_name: trial.model_name.clone(),
            algorithm: trial.algorithm,
            batch_size: trial.batch_size,
            seq_len: trial.seq_len,
            target_total_merge: trial.total_merge,
            h: match trial.algorithm {
                Algorithm::Tome => trial.locality_window,
                Algorithm::None => None,
            },
            latency_ms: measurement.latency_ms,
            throughput: measurement.throughput,
            peak_mem_mb: measurement.peak_mem_mb,
            status,
            error,
        });
        &self.results[self.results.len() - 1]
    }

    fn measure(&self, trial: &Trial) -> anyhow::Result<Measurement> {
        anyhow::ensure!(trial.benchmark_iters > 0, "benchmark_iters must be positive");
        anyhow::ensure!(trial.batch_size > 0, "batch_size must be positive");

        let cfg = presets::resolve(&trial.model_name, trial.seq_len)?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, self.dtype, &self.device);
        let model = VisionTransformer::new(&cfg, vb).context("building model")?;

        let encoder = match trial.algorithm {
            Algorithm::None => Encoder::Plain(model),
            Algorithm::Tome => Encoder::Tome(self.patch(model, trial)?),
        };

        let pixels = Tensor::randn(
            0f32,
            1.0,
            (trial.batch_size, cfg.num_channels, cfg.image_size, cfg.image_size),
            &self.device,
        )?
        .to_dtype(self.dtype)?;

        if trial.verbose {
            if let Encoder::Tome(model) = &encoder {
                let out = model.forward_traced(&pixels)?;
                for (block, tokens) in out.trace.tokens_per_block.iter().enumerate() {
                    info!(block, tokens, "tokens entering block");
                }
            }
        }

        for _ in 0..trial.warmup_iters {
            encoder.forward(&pixels)?;
        }
        self.device.synchronize()?;

        let start = Instant::now();
        for _ in 0..trial.benchmark_iters {
            encoder.forward(&pixels)?;
        }
        self.device.synchronize()?;
        let mean_secs = start.elapsed().as_secs_f64() / trial.benchmark_iters as f64;

        let measurement = Measurement {
            latency_ms: mean_secs * 1000.0,
            throughput: trial.batch_size as f64 / mean_secs,
            peak_mem_mb: f64::NAN,
        };
        info!(
            model = %trial.model_name,
            algorithm = %trial.algorithm,
            batch_size = trial.batch_size,
            latency_ms = measurement.latency_ms,
            throughput = measurement.throughput,
            "trial finished"
        );
        Ok(measurement)
    }

    fn patch(&self, model: VisionTransformer, trial: &Trial) -> anyhow::Result<TomeVisionTransformer> {
        let options = PatchOptions {
            trace_source: true,
            prop_attn: false,
        };
        let num_layers = model.num_layers();
        let seq_len = model.seq_len();
        let mut patched = apply_patch(model, options);
        patched.config_mut().locality_window = trial.locality_window;

        if trial.total_merge > 0 {
            patched.set_merge(MergeSetting::Target {
                total: trial.total_merge,
                inflect: trial.inflect,
            });
            let schedule = patched.schedule()?;
            let ratio = derive_uniform_ratio(num_layers, trial.total_merge, seq_len, trial.inflect)?;
            info!(
                total_merge = trial.total_merge,
                ratio,
                inflect = trial.inflect,
                locality_window = ?trial.locality_window,
                schedule = ?schedule.counts(),
                "configured token merging"
            );
        }
        Ok(patched)
    }

    pub fn results(&self) -> &[BenchRecord] {
        &self.results
    }

    /// Results as a JSON array. NaN metrics are written as `null`.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.results)
    }

    pub fn write_json(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_json()?)
            .with_context(|| format!("writing results to {}", path.display()))
    }
}
