//! Throughput and memory sweeps for token-merged vision transformers.

pub mod benchmark;
pub mod config;
pub mod logging;
pub mod presets;

pub use benchmark::{Algorithm, BenchRecord, Status, ThroughputBenchmark, Trial};
pub use config::{ConfigError, SweepConfig, SweepPlan};
