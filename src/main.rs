//! TPM Pipeline CLI
//!
//! Plan token-bounded batches for a document set and simulate running them
//! through the rate-limited stage scheduler.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tpm_pipeline::input::load_documents;
use tpm_pipeline::{
    build_runtime, prepare_batches, Config, Document, DocumentChunker, PipelineScheduler,
    PipelineStage, RateLimiter, SchedulerConfig, StageContext, TokenEstimator, WorkError,
};

#[derive(Parser)]
#[command(name = "tpm-pipeline")]
#[command(about = "Token-aware batching and TPM rate-limited stage scheduling", long_about = None)]
struct Cli {
    /// Path to configuration file (defaults are used when omitted)
    #[arg(short, long, global = true, env = "TPM_PIPELINE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the number of chunking workers
    #[arg(long, global = true)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Chunk and pack documents, printing the batch plan
    Plan {
        /// Text files or directories of text files
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Write the full plan as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Estimate the token cost of one file
    Estimate {
        /// Text file to estimate
        file: PathBuf,
    },

    /// Run one simulated stage per batch through the scheduler
    Simulate {
        /// Text files or directories of text files
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Simulated service latency per request in milliseconds
        #[arg(long, default_value_t = 200)]
        latency_ms: u64,

        /// Report a transient rate limit on every Nth request
        #[arg(long)]
        throttle_every: Option<u64>,
    },

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Plan { inputs, output } => {
            let config = load_config(cli.config.as_ref(), cli.workers)?;
            plan_command(&config, &inputs, output)?;
        }

        Commands::Estimate { file } => {
            let config = load_config(cli.config.as_ref(), cli.workers)?;
            estimate_command(&config, file)?;
        }

        Commands::Simulate {
            inputs,
            latency_ms,
            throttle_every,
        } => {
            let config = load_config(cli.config.as_ref(), cli.workers)?;
            simulate_command(config, &inputs, latency_ms, throttle_every)?;
        }

        Commands::Validate => {
            load_config(cli.config.as_ref(), cli.workers)?;
            println!("Configuration is valid");
        }

        Commands::GenerateConfig { output } => {
            generate_config_command(output)?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&PathBuf>, workers: Option<usize>) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::from_file(path)?,
        None => {
            tracing::info!("No configuration file given, using defaults");
            Config::default()
        }
    };

    // Apply overrides
    if let Some(w) = workers {
        config.processing.chunk_workers = w;
    }

    config.validate()?;
    Ok(config)
}

fn plan_command(config: &Config, inputs: &[PathBuf], output: Option<PathBuf>) -> Result<()> {
    let documents = load_documents(inputs)?;
    let plan = prepare_batches(&documents, config)?;
    let ceiling = config.provider.max_tokens_per_batch;

    println!("\n=== Batch Plan ===");
    println!("Provider: {}", config.provider.name);
    println!("Batch ceiling: {} tokens", ceiling);
    println!("{}", plan);
    println!("Mean fill: {:.1}%", plan.fill_ratio(ceiling) * 100.0);

    for (i, batch) in plan.batches.iter().enumerate() {
        println!(
            "  batch {:>4}: {:>7} tokens, {:>3} chunks [{}]",
            i + 1,
            batch.estimated_tokens,
            batch.len(),
            batch.chunk_ids().join(", ")
        );
    }

    if !plan.skipped.is_empty() {
        println!("\nSkipped (larger than one batch):");
        for id in &plan.skipped {
            println!("  {}", id);
        }
    }
    println!("==================\n");

    if let Some(path) = output {
        std::fs::write(&path, serde_json::to_string_pretty(&plan)?)?;
        println!("Plan written to: {}", path.display());
    }

    Ok(())
}

fn estimate_command(config: &Config, file: PathBuf) -> Result<()> {
    let text = std::fs::read_to_string(&file)?;
    let estimator = Arc::new(TokenEstimator::new(config.processing.estimator_cache_entries));
    let tokens = estimator.estimate(&text);

    let chunker = DocumentChunker::from_profile(estimator, &config.provider);
    let ceiling = config
        .provider
        .max_tokens_per_request
        .min(config.provider.max_tokens_per_batch);
    let chunks = chunker.chunk(&Document::new(file.display().to_string(), text.as_str()), ceiling);

    println!("\n=== Estimate: {} ===", file.display());
    println!("Characters: {}", text.chars().count());
    println!("Words: {}", text.split_whitespace().count());
    println!("Estimated tokens: {}", tokens);
    println!("Chunks at {} tokens: {}", ceiling, chunks.len());
    println!(
        "Share of one minute's budget: {:.1}%",
        tokens as f64 / config.provider.effective_limit() as f64 * 100.0
    );
    println!("=====================\n");

    Ok(())
}

fn simulate_command(
    config: Config,
    inputs: &[PathBuf],
    latency_ms: u64,
    throttle_every: Option<u64>,
) -> Result<()> {
    let documents = load_documents(inputs)?;
    let plan = prepare_batches(&documents, &config)?;

    let latency = Duration::from_millis(latency_ms);
    let calls = Arc::new(AtomicU64::new(0));

    let stages: Vec<PipelineStage<u64>> = plan
        .batches
        .iter()
        .enumerate()
        .map(|(i, batch)| {
            let tokens = batch.estimated_tokens;
            let calls = calls.clone();
            PipelineStage::new(format!("batch-{}", i + 1), move |_ctx: StageContext<u64>| {
                let call = calls.fetch_add(1, Ordering::Relaxed) + 1;
                async move {
                    tokio::time::sleep(latency).await;
                    match throttle_every {
                        Some(n) if n > 0 && call % n == 0 => {
                            Err(WorkError::rate_limited_msg("simulated 429 Too Many Requests"))
                        }
                        _ => Ok(tokens),
                    }
                }
            })
            .with_static_estimate(tokens)
        })
        .collect();

    let runtime = build_runtime(config.processing.worker_threads)?;
    let result = runtime.block_on(async {
        let limiter = Arc::new(RateLimiter::new(config.provider.clone())?);
        let scheduler = PipelineScheduler::new(limiter, SchedulerConfig::from_config(&config));
        anyhow::Ok(scheduler.run_pipeline(stages).await)
    })?;

    println!("\n=== Simulation Summary ===");
    println!("{}", result);
    println!("Stages completed: {}/{}", result.completed_stages.len(), plan.batches.len());
    println!("{}", result.stats);
    println!("Total time: {:.1}s", result.stats.elapsed.as_secs_f64());
    println!("==========================\n");

    if let Some(err) = result.error {
        anyhow::bail!("Simulation aborted: {}", err);
    }
    Ok(())
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    // Generate a commented YAML config
    let yaml = r#"# TPM Pipeline Configuration

# === PROVIDER: Rate-limit policy of the text-generation service ===
provider:
  # Display name of the tier
  name: "default"

  # Tokens allowed per rolling minute
  tokens_per_minute: 30000

  # Fraction of tokens_per_minute actually used (0, 1]
  # The remainder absorbs estimation error
  safety_margin: 0.8

  # Ceiling for a single request (must not exceed the effective limit)
  max_tokens_per_request: 12000

  # Ceiling for the summed estimate of one batch
  max_tokens_per_batch: 8000

  # Word-fallback sub-chunk sizing for run-on sentences
  min_chunk_words: 50
  max_chunk_words: 2000

  # Attempts for work that reports a transient rate limit
  max_retries: 3

  # Backoff doubles from this base after each rate-limited attempt
  retry_base_delay_seconds: 2.0

  # Base pause between pipeline stages
  inter_phase_delay_seconds: 1.0

  # Longest single wait for budget before giving up
  max_wait_seconds: 120.0

# === PROCESSING: Chunking and reporting ===
processing:
  # Worker threads used to chunk documents in parallel
  chunk_workers: 4

  # Entries kept in the token estimate cache
  estimator_cache_entries: 4096

  # Tokio async worker threads (null = num CPUs)
  # worker_threads: 4

  # Log executor stats periodically while a pipeline runs
  enable_metrics: true

  # Stats reporting interval in seconds
  metrics_interval_secs: 10

  # Save final stats as JSON
  # metrics_output_path: "stats.json"

# === PIPELINE: Stage scheduling ===
pipeline:
  # Estimate used for stages without their own estimator
  default_stage_tokens: 2000

  # Usage ratio above which the inter-stage pause grows
  adaptive_delay_threshold: 0.6

  # Pause multiplier at 100% window usage
  adaptive_delay_max_multiplier: 3.0
"#;

    std::fs::write(&output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["tpm-pipeline"]).is_err());
    }

    #[test]
    fn test_cli_parse_plan_with_globals() {
        let cli = Cli::try_parse_from([
            "tpm-pipeline",
            "plan",
            "docs/",
            "notes.txt",
            "--workers",
            "8",
            "-c",
            "tier.yaml",
        ])
        .unwrap();

        assert_eq!(cli.workers, Some(8));
        assert_eq!(cli.config, Some(PathBuf::from("tier.yaml")));
        match cli.command {
            Commands::Plan { inputs, output } => {
                assert_eq!(inputs.len(), 2);
                assert!(output.is_none());
            }
            _ => panic!("expected plan"),
        }
    }

    #[test]
    fn test_cli_parse_simulate() {
        let cli = Cli::try_parse_from([
            "tpm-pipeline",
            "simulate",
            "docs/",
            "--latency-ms",
            "50",
            "--throttle-every",
            "4",
        ])
        .unwrap();

        match cli.command {
            Commands::Simulate {
                latency_ms,
                throttle_every,
                ..
            } => {
                assert_eq!(latency_ms, 50);
                assert_eq!(throttle_every, Some(4));
            }
            _ => panic!("expected simulate"),
        }
    }

    #[test]
    fn test_plan_requires_inputs() {
        assert!(Cli::try_parse_from(["tpm-pipeline", "plan"]).is_err());
    }

    #[test]
    fn test_generated_config_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        generate_config_command(path.clone()).unwrap();

        let config = load_config(Some(&path), None).unwrap();
        let defaults = Config::default();
        assert_eq!(config.provider.tokens_per_minute, defaults.provider.tokens_per_minute);
        assert_eq!(config.provider.max_tokens_per_batch, defaults.provider.max_tokens_per_batch);
        assert_eq!(config.pipeline.default_stage_tokens, defaults.pipeline.default_stage_tokens);
    }

    #[test]
    fn test_workers_override() {
        let config = load_config(None, Some(2)).unwrap();
        assert_eq!(config.processing.chunk_workers, 2);
        assert!(load_config(None, Some(0)).is_err());
    }
}
