use std::path::PathBuf;

use anyhow::{bail, Context};
use candle_core::{DType, Device};
use clap::{Parser, Subcommand};
use tracing::info;

use tome_bench::benchmark::{Algorithm, Status, ThroughputBenchmark, Trial};
use tome_bench::config::SweepConfig;
use tome_bench::logging;
use tome_core::{plan, MergeSchedule};

#[derive(Parser)]
#[command(name = "tome-bench", about = "Token merging throughput benchmarks")]
struct Cli {
    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Time forward passes over a grid of models, batch sizes and budgets
    Sweep {
        /// Sweep config file (defaults to ~/.config/tome-bench/sweep.toml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// timm-style model names, e.g. vit_base_patch16_224
        #[arg(long, value_delimiter = ',')]
        models: Option<Vec<String>>,

        #[arg(long, value_enum, value_delimiter = ',')]
        algorithms: Option<Vec<Algorithm>>,

        #[arg(long, value_delimiter = ',')]
        batch_sizes: Option<Vec<usize>>,

        /// Patches per image; the image size is derived from each
        #[arg(long, value_delimiter = ',')]
        seq_lens: Option<Vec<usize>>,

        /// Total merge budgets over the whole stack
        #[arg(long, value_delimiter = ',')]
        total_merges: Option<Vec<usize>>,

        /// Schedule inflection in [-1, 1]
        #[arg(long, allow_hyphen_values = true)]
        inflect: Option<f64>,

        /// Restrict matching to partners at most this many pairs apart
        #[arg(long)]
        locality_window: Option<usize>,

        #[arg(long)]
        warmup_iters: Option<usize>,

        #[arg(long)]
        benchmark_iters: Option<usize>,

        /// Weight dtype: f32, f16 or bf16
        #[arg(long)]
        dtype: Option<String>,

        /// Device: cpu, cuda or metal
        #[arg(long, default_value = "cpu")]
        device: String,

        /// Write results as JSON to this path
        #[arg(long)]
        output: Option<PathBuf>,

        /// Log the tokens entering every block
        #[arg(long)]
        verbose: bool,

        /// Persist the merged configuration to the default config path
        #[arg(long)]
        save_config: bool,
    },
    /// Print the merge schedule for a model shape and budget
    Plan {
        #[arg(long, default_value_t = 12)]
        layers: usize,

        /// Tokens entering the first block, protected tokens included
        #[arg(long, default_value_t = 197)]
        seq_len: usize,

        #[arg(long)]
        total: usize,

        #[arg(long, default_value_t = -0.5, allow_hyphen_values = true)]
        inflect: f64,

        /// Leading tokens that never merge (class, distillation)
        #[arg(long, default_value_t = 1)]
        protected: usize,
    },
}

fn parse_dtype(name: &str) -> anyhow::Result<DType> {
    Ok(match name.to_lowercase().as_str() {
        "f32" | "fp32" | "float32" => DType::F32,
        "f16" | "fp16" | "float16" => DType::F16,
        "bf16" | "bfloat16" => DType::BF16,
        other => bail!("unsupported dtype `{other}`"),
    })
}

fn parse_device(name: &str) -> anyhow::Result<Device> {
    Ok(match name.to_lowercase().as_str() {
        "cpu" => Device::Cpu,
        "cuda" => Device::new_cuda(0)?,
        "metal" => Device::new_metal(0)?,
        other => bail!("unsupported device `{other}`"),
    })
}

fn print_schedule(schedule: &MergeSchedule, seq_len: usize) {
    let mut tokens = seq_len;
    for (layer, &r) in schedule.counts().iter().enumerate() {
        println!("block {layer:2}: {tokens:4} tokens, merge {r}");
        tokens = tokens.saturating_sub(r);
    }
    println!("total merged: {}, final tokens: {tokens}", schedule.total());
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_with_level(&cli.log_level)?;

    match cli.command {
        Command::Plan {
            layers,
            seq_len,
            total,
            inflect,
            protected,
        } => {
            let schedule = plan(layers, total, seq_len, inflect, protected)?;
            print_schedule(&schedule, seq_len);
        }
        Command::Sweep {
            config,
            models,
            algorithms,
            batch_sizes,
            seq_lens,
            total_merges,
            inflect,
            locality_window,
            warmup_iters,
            benchmark_iters,
            dtype,
            device,
            output,
            verbose,
            save_config,
        } => {
            let mut sweep = match &config {
                Some(path) => SweepConfig::load_from(path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => SweepConfig::load(),
            };
            sweep.merge(&SweepConfig {
                models,
                algorithms,
                batch_sizes,
                seq_lens,
                total_merges,
                inflect,
                locality_window,
                warmup_iters,
                benchmark_iters,
                dtype,
                output,
            });
            if save_config {
                let path = sweep.save()?;
                info!(path = %path.display(), "saved sweep config");
            }

            let resolved = sweep.resolve();
            let mut bench =
                ThroughputBenchmark::new(parse_device(&device)?, parse_dtype(&resolved.dtype)?);
            for model_name in &resolved.models {
                for &algorithm in &resolved.algorithms {
                    for &batch_size in &resolved.batch_sizes {
                        for &seq_len in &resolved.seq_lens {
                            // The unpatched model ignores the budget; time it once.
                            let budgets: &[usize] = match algorithm {
                                Algorithm::None => &[0],
                                Algorithm::Tome => &resolved.total_merges,
                            };
                            for &total_merge in budgets {
                                let trial = Trial {
                                    model_name: model_name.clone(),
                                    algorithm,
                                    batch_size,
                                    seq_len,
                                    total_merge,
                                    inflect: resolved.inflect,
                                    locality_window: resolved.locality_window,
                                    warmup_iters: resolved.warmup_iters,
                                    benchmark_iters: resolved.benchmark_iters,
                                    verbose,
                                };
                                bench.run(&trial);
                            }
                        }
                    }
                }
            }

            let failed = bench
                .results()
                .iter()
                .filter(|r| r.status == Status::Failed)
                .count();
            info!(trials = bench.results().len(), failed, "sweep finished");

            match &resolved.output {
                Some(path) => {
                    bench.write_json(path)?;
                    info!(path = %path.display(), "wrote results");
                }
                None => println!("{}", bench.to_json()?),
            }
        }
    }
    Ok(())
}
