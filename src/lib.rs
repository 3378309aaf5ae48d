//! TPM Pipeline
//!
//! Token-aware batching and rate-limited stage scheduling for feeding large
//! document sets into an external text-generation service that meters usage
//! in tokens per rolling minute.
//!
//! # Architecture
//!
//! - **Estimate**: deterministic token cost heuristic with a bounded LRU cache
//! - **Chunking**: sentence-aware splitting with a word fallback, parallel
//!   fan-out over documents, and best-fit-decreasing batch packing
//! - **Limiter**: sliding 60 s usage ledger and a retrying executor that waits
//!   for budget before running work
//! - **Pipeline**: sequential stages with adaptive inter-stage delays and
//!   abort-on-first-failure semantics
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use tpm_pipeline::{
//!     prepare_batches, Config, Document, PipelineScheduler, PipelineStage, RateLimiter,
//!     SchedulerConfig, StageContext,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(&"config.yaml".into())?;
//!     let plan = prepare_batches(&[Document::new("a", "Some text.")], &config)?;
//!     println!("{}", plan);
//!
//!     let limiter = Arc::new(RateLimiter::new(config.provider.clone())?);
//!     let scheduler = PipelineScheduler::new(limiter, SchedulerConfig::from_config(&config));
//!     let stages = vec![PipelineStage::new("summarize", |_ctx: StageContext<String>| async {
//!         Ok("summary".to_string())
//!     })];
//!     let result = scheduler.run_pipeline(stages).await;
//!     println!("{}", result);
//!     Ok(())
//! }
//! ```

pub mod chunking;
pub mod config;
pub mod error;
pub mod estimate;
pub mod input;
pub mod limiter;
pub mod pipeline;

pub use chunking::{Batch, BatchPacker, Chunk, ChunkPool, Document, DocumentChunker, PackingPlan};
pub use config::{Config, PipelineConfig, ProcessingConfig, ProviderProfile};
pub use error::{ExecutorError, WorkError, WorkErrorKind};
pub use estimate::{EstimatorWeights, TokenEstimator};
pub use limiter::{ExecutionStats, RateLimiter, UsageWindowTracker};
pub use pipeline::{PipelineResult, PipelineScheduler, PipelineStage, SchedulerConfig, StageContext};

use anyhow::Result;
use std::sync::Arc;

/// Chunk documents in parallel and pack the chunks into batches.
///
/// Each chunk is bounded by the smaller of the per-request and per-batch
/// ceilings so that every chunk can be submitted alone and placed in a batch.
pub fn prepare_batches(documents: &[Document], config: &Config) -> Result<PackingPlan> {
    config.validate()?;

    let profile = &config.provider;
    let estimator = Arc::new(TokenEstimator::new(config.processing.estimator_cache_entries));
    let chunker = DocumentChunker::from_profile(estimator.clone(), profile);
    let pool = ChunkPool::new(chunker, config.processing.chunk_workers)?;

    let max_tokens_per_chunk = profile.max_tokens_per_request.min(profile.max_tokens_per_batch);
    let chunks = pool.chunk_all(documents, max_tokens_per_chunk);
    let total_chunks = chunks.len();

    let (batches, skipped) = BatchPacker::new(profile.max_tokens_per_batch).pack(chunks);

    let plan = PackingPlan {
        batches,
        skipped,
        total_documents: documents.len(),
        total_chunks,
    };

    tracing::info!("{}", plan);
    tracing::debug!(
        "Estimator cache: {} entries, {} hits, {} misses",
        estimator.cached_entries(),
        estimator.cache_hits(),
        estimator.cache_misses()
    );

    Ok(plan)
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}
