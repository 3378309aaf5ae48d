//! Configuration for token-aware batching and rate-limited stage execution.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Rate-limit policy of the external text-generation service
    #[serde(default)]
    pub provider: ProviderProfile,

    /// Chunking and reporting configuration
    #[serde(default)]
    pub processing: ProcessingConfig,

    /// Stage scheduling configuration
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Numeric policy for one external-service tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderProfile {
    /// Display name of the tier
    #[serde(default = "default_provider_name")]
    pub name: String,

    /// Tokens allowed per rolling minute
    #[serde(default = "default_tokens_per_minute")]
    pub tokens_per_minute: u64,

    /// Fraction of `tokens_per_minute` actually used (0, 1].
    /// The remainder absorbs estimation error and concurrent callers.
    #[serde(default = "default_safety_margin")]
    pub safety_margin: f64,

    /// Absolute ceiling for a single request
    #[serde(default = "default_max_tokens_per_request")]
    pub max_tokens_per_request: u64,

    /// Ceiling for the summed estimate of one batch.
    /// Batches submitted as a single request should keep this at or below
    /// `max_tokens_per_request`.
    #[serde(default = "default_max_tokens_per_batch")]
    pub max_tokens_per_batch: u64,

    /// Soft lower bound for word-fallback sub-chunks
    #[serde(default = "default_min_chunk_words")]
    pub min_chunk_words: usize,

    /// Target upper bound for word-fallback sub-chunks; an undersized tail
    /// merged into its predecessor may exceed it
    #[serde(default = "default_max_chunk_words")]
    pub max_chunk_words: usize,

    /// Maximum attempts for work signalling a transient rate limit
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_seconds: f64,

    /// Base delay inserted between pipeline stages
    #[serde(default = "default_inter_phase_delay")]
    pub inter_phase_delay_seconds: f64,

    /// Hard ceiling on any single wait for budget
    #[serde(default = "default_max_wait")]
    pub max_wait_seconds: f64,
}

impl Default for ProviderProfile {
    fn default() -> Self {
        Self {
            name: default_provider_name(),
            tokens_per_minute: default_tokens_per_minute(),
            safety_margin: default_safety_margin(),
            max_tokens_per_request: default_max_tokens_per_request(),
            max_tokens_per_batch: default_max_tokens_per_batch(),
            min_chunk_words: default_min_chunk_words(),
            max_chunk_words: default_max_chunk_words(),
            max_retries: default_max_retries(),
            retry_base_delay_seconds: default_retry_base_delay(),
            inter_phase_delay_seconds: default_inter_phase_delay(),
            max_wait_seconds: default_max_wait(),
        }
    }
}

impl ProviderProfile {
    /// Usable tokens per minute after the safety margin is applied.
    pub fn effective_limit(&self) -> u64 {
        (self.tokens_per_minute as f64 * self.safety_margin).floor() as u64
    }

    /// Base retry delay as a `Duration`.
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_base_delay_seconds.max(0.0))
    }

    /// Base inter-stage delay as a `Duration`.
    pub fn inter_phase_delay(&self) -> Duration {
        Duration::from_secs_f64(self.inter_phase_delay_seconds.max(0.0))
    }

    /// Maximum budget wait as a `Duration`.
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs_f64(self.max_wait_seconds.max(0.0))
    }

    /// Validate the numeric policy.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tokens_per_minute == 0 {
            anyhow::bail!("tokens_per_minute must be > 0");
        }
        if !(self.safety_margin > 0.0 && self.safety_margin <= 1.0) {
            anyhow::bail!("safety_margin must be in (0, 1], got {}", self.safety_margin);
        }
        if self.effective_limit() == 0 {
            anyhow::bail!("Effective limit rounds down to 0 tokens");
        }
        if self.max_tokens_per_request == 0 {
            anyhow::bail!("max_tokens_per_request must be > 0");
        }
        if self.max_tokens_per_request > self.effective_limit() {
            anyhow::bail!(
                "max_tokens_per_request ({}) exceeds the effective limit ({}); such requests could never be admitted",
                self.max_tokens_per_request,
                self.effective_limit()
            );
        }
        if self.max_tokens_per_batch == 0 {
            anyhow::bail!("max_tokens_per_batch must be > 0");
        }
        if self.max_chunk_words == 0 {
            anyhow::bail!("max_chunk_words must be > 0");
        }
        if self.min_chunk_words > self.max_chunk_words {
            anyhow::bail!(
                "min_chunk_words ({}) must not exceed max_chunk_words ({})",
                self.min_chunk_words,
                self.max_chunk_words
            );
        }
        if self.max_retries == 0 {
            anyhow::bail!("max_retries must be >= 1");
        }
        for (name, value) in [
            ("retry_base_delay_seconds", self.retry_base_delay_seconds),
            ("inter_phase_delay_seconds", self.inter_phase_delay_seconds),
        ] {
            if !value.is_finite() || value < 0.0 {
                anyhow::bail!("{} must be a non-negative number, got {}", name, value);
            }
        }
        if !self.max_wait_seconds.is_finite() || self.max_wait_seconds <= 0.0 {
            anyhow::bail!("max_wait_seconds must be > 0, got {}", self.max_wait_seconds);
        }
        Ok(())
    }
}

/// Chunking and reporting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Worker threads in the chunking pool
    #[serde(default = "default_chunk_workers")]
    pub chunk_workers: usize,

    /// Maximum entries in the token estimate cache
    #[serde(default = "default_estimator_cache_entries")]
    pub estimator_cache_entries: usize,

    /// Number of Tokio worker threads
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Enable periodic stats reporting during pipeline runs
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Stats reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Optional path to save stats JSON after a run completes
    #[serde(default)]
    pub metrics_output_path: Option<String>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            chunk_workers: default_chunk_workers(),
            estimator_cache_entries: default_estimator_cache_entries(),
            worker_threads: None,
            enable_metrics: true,
            metrics_interval_secs: default_metrics_interval(),
            metrics_output_path: None,
        }
    }
}

/// Stage scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Token estimate used for stages that declare no estimator
    #[serde(default = "default_stage_tokens")]
    pub default_stage_tokens: u64,

    /// Usage ratio above which the inter-stage delay starts growing
    #[serde(default = "default_adaptive_threshold")]
    pub adaptive_delay_threshold: f64,

    /// Multiplier applied to the base delay at 100% usage
    #[serde(default = "default_adaptive_multiplier")]
    pub adaptive_delay_max_multiplier: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_stage_tokens: default_stage_tokens(),
            adaptive_delay_threshold: default_adaptive_threshold(),
            adaptive_delay_max_multiplier: default_adaptive_multiplier(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "yaml" | "yml" => serde_yaml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => {
                // YAML is a superset of JSON
                serde_yaml::from_str(&contents)?
            }
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.provider.validate()?;

        if self.processing.chunk_workers == 0 {
            anyhow::bail!("chunk_workers must be > 0");
        }
        if self.processing.estimator_cache_entries == 0 {
            anyhow::bail!("estimator_cache_entries must be > 0");
        }
        if self.processing.enable_metrics && self.processing.metrics_interval_secs == 0 {
            anyhow::bail!("metrics_interval_secs must be > 0 when metrics are enabled");
        }
        if !(0.0..1.0).contains(&self.pipeline.adaptive_delay_threshold) {
            anyhow::bail!(
                "adaptive_delay_threshold must be in [0, 1), got {}",
                self.pipeline.adaptive_delay_threshold
            );
        }
        if !self.pipeline.adaptive_delay_max_multiplier.is_finite()
            || self.pipeline.adaptive_delay_max_multiplier < 1.0
        {
            anyhow::bail!("adaptive_delay_max_multiplier must be >= 1.0");
        }
        if self.pipeline.default_stage_tokens > self.provider.max_tokens_per_request {
            anyhow::bail!(
                "default_stage_tokens ({}) exceeds max_tokens_per_request ({})",
                self.pipeline.default_stage_tokens,
                self.provider.max_tokens_per_request
            );
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_provider_name() -> String { "default".to_string() }
fn default_tokens_per_minute() -> u64 { 30_000 }
fn default_safety_margin() -> f64 { 0.8 }
fn default_max_tokens_per_request() -> u64 { 12_000 }
fn default_max_tokens_per_batch() -> u64 { 8_000 }
fn default_min_chunk_words() -> usize { 50 }
fn default_max_chunk_words() -> usize { 2_000 }
fn default_max_retries() -> u32 { 3 }
fn default_retry_base_delay() -> f64 { 2.0 }
fn default_inter_phase_delay() -> f64 { 1.0 }
fn default_max_wait() -> f64 { 120.0 }
fn default_chunk_workers() -> usize { 4 }
fn default_estimator_cache_entries() -> usize { 4_096 }
fn default_true() -> bool { true }
fn default_metrics_interval() -> u64 { 10 }
fn default_stage_tokens() -> u64 { 2_000 }
fn default_adaptive_threshold() -> f64 { 0.6 }
fn default_adaptive_multiplier() -> f64 { 3.0 }
