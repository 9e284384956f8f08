//! Sweep configuration persistence.
//!
//! Configuration is resolved with the following priority:
//! 1. CLI arguments (highest priority)
//! 2. Config file (~/.config/tome-bench/sweep.toml)
//! 3. Default values (lowest priority)

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::benchmark::Algorithm;

/// Persistent sweep configuration stored in TOML format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepConfig {
    /// timm-style model names.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub models: Option<Vec<String>>,

    /// Algorithms to compare.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub algorithms: Option<Vec<Algorithm>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_sizes: Option<Vec<usize>>,

    /// Patch counts per image; the image size is derived from each.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq_lens: Option<Vec<usize>>,

    /// Total merge budgets over the whole stack.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_merges: Option<Vec<usize>>,

    /// Schedule inflection in [-1, 1].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inflect: Option<f64>,

    /// Locality window for matching; absent means global.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locality_window: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub warmup_iters: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub benchmark_iters: Option<usize>,

    /// Weight dtype (f32, f16, bf16).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,

    /// JSON results path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
}

impl SweepConfig {
    /// Get the default config file path.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("tome-bench").join("sweep.toml"))
    }

    /// Load configuration from the default path, falling back to defaults.
    pub fn load() -> Self {
        Self::default_path()
            .and_then(|path| Self::load_from(&path).ok())
            .unwrap_or_default()
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::default_path().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)?;
        Ok(path)
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Merge with another config, preferring values from `other`.
    pub fn merge(&mut self, other: &SweepConfig) {
        fn take<T: Clone>(slot: &mut Option<T>, other: &Option<T>) {
            if other.is_some() {
                slot.clone_from(other);
            }
        }
        take(&mut self.models, &other.models);
        take(&mut self.algorithms, &other.algorithms);
        take(&mut self.batch_sizes, &other.batch_sizes);
        take(&mut self.seq_lens, &other.seq_lens);
        take(&mut self.total_merges, &other.total_merges);
        take(&mut self.inflect, &other.inflect);
        take(&mut self.locality_window, &other.locality_window);
        take(&mut self.warmup_iters, &other.warmup_iters);
        take(&mut self.benchmark_iters, &other.benchmark_iters);
        take(&mut self.dtype, &other.dtype);
        take(&mut self.output, &other.output);
    }

    /// Fill every unset field with its default.
    pub fn resolve(&self) -> SweepPlan {
        SweepPlan {
            models: self
                .models
                .clone()
                .unwrap_or_else(|| vec!["vit_base_patch16_224".to_string()]),
            algorithms: self
                .algorithms
                .clone()
                .unwrap_or_else(|| vec![Algorithm::None, Algorithm::Tome]),
            batch_sizes: self.batch_sizes.clone().unwrap_or_else(|| vec![1]),
            seq_lens: self.seq_lens.clone().unwrap_or_else(|| vec![196]),
            total_merges: self.total_merges.clone().unwrap_or_else(|| vec![0, 980]),
            inflect: self.inflect.unwrap_or(-0.5),
            locality_window: self.locality_window,
            warmup_iters: self.warmup_iters.unwrap_or(5),
            benchmark_iters: self.benchmark_iters.unwrap_or(20),
            dtype: self.dtype.clone().unwrap_or_else(|| "f32".to_string()),
            output: self.output.clone(),
        }
    }
}

/// A fully specified sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepPlan {
    pub models: Vec<String>,
    pub algorithms: Vec<Algorithm>,
    pub batch_sizes: Vec<usize>,
    pub seq_lens: Vec<usize>,
    pub total_merges: Vec<usize>,
    pub inflect: f64,
    pub locality_window: Option<usize>,
    pub warmup_iters: usize,
    pub benchmark_iters: usize,
    pub dtype: String,
    pub output: Option<PathBuf>,
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("No config directory available")]
    NoConfigDir,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sweep.toml");

        let config = SweepConfig {
            models: Some(vec!["vit_small_patch16_224".to_string()]),
            algorithms: Some(vec![Algorithm::Tome]),
            total_merges: Some(vec![0, 500, 980]),
            locality_window: Some(4),
            ..Default::default()
        };

        config.save_to(&path).unwrap();
        let loaded = SweepConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        let err = SweepConfig::load_from(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_load_rejects_bad_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "batch_sizes = \"eight\"").unwrap();
        assert!(matches!(
            SweepConfig::load_from(&path),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_merge() {
        let mut base = SweepConfig {
            models: Some(vec!["vit_base_patch16_224".to_string()]),
            batch_sizes: Some(vec![8]),
            ..Default::default()
        };
        let cli = SweepConfig {
            batch_sizes: Some(vec![32, 64]),
            inflect: Some(0.0),
            ..Default::default()
        };

        base.merge(&cli);

        assert_eq!(base.models, Some(vec!["vit_base_patch16_224".to_string()]));
        assert_eq!(base.batch_sizes, Some(vec![32, 64]));
        assert_eq!(base.inflect, Some(0.0));
    }

    #[test]
    fn test_resolve_defaults() {
        let plan = SweepConfig::default().resolve();
        assert_eq!(plan.models, vec!["vit_base_patch16_224"]);
        assert_eq!(plan.algorithms, vec![Algorithm::None, Algorithm::Tome]);
        assert_eq!(plan.total_merges, vec![0, 980]);
        assert_eq!(plan.inflect, -0.5);
        assert_eq!(plan.locality_window, None);
    }

    #[test]
    fn test_toml_uses_algorithm_names() {
        let config: SweepConfig = toml::from_str("algorithms = [\"none\", \"tome\"]").unwrap();
        assert_eq!(config.algorithms, Some(vec![Algorithm::None, Algorithm::Tome]));
    }
}
