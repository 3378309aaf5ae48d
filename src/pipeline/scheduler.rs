//! Sequential execution of dependent stages under a shared token budget.
//!
//! Stages run strictly in declaration order. Between stages the scheduler
//! pauses for an adaptive delay that grows as the usage window fills, and the
//! first stage that fails aborts the run with the partial results intact.

use super::reporter::StatsReporter;
use super::stage::{PipelineResult, PipelineStage, StageContext};
use crate::config::{Config, PipelineConfig};
use crate::limiter::RateLimiter;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Configuration for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Token estimate for stages without an estimator
    pub default_stage_tokens: u64,

    /// Usage ratio above which the inter-stage delay grows
    pub adaptive_delay_threshold: f64,

    /// Delay multiplier at 100% usage
    pub adaptive_delay_max_multiplier: f64,

    /// Enable periodic stats reporting
    pub enable_metrics: bool,

    /// Stats reporting interval in seconds
    pub metrics_interval_secs: u64,

    /// Optional path to save stats JSON after the run completes
    pub metrics_output_path: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let pipeline = PipelineConfig::default();
        Self {
            default_stage_tokens: pipeline.default_stage_tokens,
            adaptive_delay_threshold: pipeline.adaptive_delay_threshold,
            adaptive_delay_max_multiplier: pipeline.adaptive_delay_max_multiplier,
            enable_metrics: true,
            metrics_interval_secs: 10,
            metrics_output_path: None,
        }
    }
}

impl SchedulerConfig {
    /// Build from the pipeline and processing sections of a [`Config`].
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_stage_tokens: config.pipeline.default_stage_tokens,
            adaptive_delay_threshold: config.pipeline.adaptive_delay_threshold,
            adaptive_delay_max_multiplier: config.pipeline.adaptive_delay_max_multiplier,
            enable_metrics: config.processing.enable_metrics,
            metrics_interval_secs: config.processing.metrics_interval_secs,
            metrics_output_path: config.processing.metrics_output_path.clone(),
        }
    }
}

/// Inter-stage delay for the given usage ratio.
///
/// Below `threshold` the delay is `base`. Above it the delay grows linearly to
/// `base * max_multiplier` at full usage. The result never exceeds `cap`.
pub fn adaptive_delay(
    base: Duration,
    usage_ratio: f64,
    threshold: f64,
    max_multiplier: f64,
    cap: Duration,
) -> Duration {
    let ratio = if usage_ratio.is_finite() {
        usage_ratio.clamp(0.0, 1.0)
    } else {
        0.0
    };

    let multiplier = if ratio > threshold && threshold < 1.0 {
        1.0 + (max_multiplier - 1.0) * (ratio - threshold) / (1.0 - threshold)
    } else {
        1.0
    };

    base.mul_f64(multiplier.max(1.0)).min(cap)
}

/// Runs pipelines of stages through one shared [`RateLimiter`].
pub struct PipelineScheduler {
    limiter: Arc<RateLimiter>,
    config: SchedulerConfig,
}

impl PipelineScheduler {
    /// Create a new scheduler.
    pub fn new(limiter: Arc<RateLimiter>, config: SchedulerConfig) -> Self {
        Self { limiter, config }
    }

    /// Shared executor.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Delay to insert before the next stage given current usage.
    pub fn inter_stage_delay(&self) -> Duration {
        let profile = self.limiter.profile();
        adaptive_delay(
            profile.inter_phase_delay(),
            self.limiter.usage_ratio(),
            self.config.adaptive_delay_threshold,
            self.config.adaptive_delay_max_multiplier,
            profile.max_wait(),
        )
    }

    /// Run `stages` in order, stopping at the first failure.
    pub async fn run_pipeline<T>(&self, stages: Vec<PipelineStage<T>>) -> PipelineResult<T>
    where
        T: Send + Sync + 'static,
    {
        let total_stages = stages.len();
        tracing::info!(
            "Running pipeline of {} stages against '{}' ({} tokens/min effective)",
            total_stages,
            self.limiter.profile().name,
            self.limiter.effective_limit()
        );

        let completed_count = Arc::new(AtomicUsize::new(0));
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let reporter_handle = if self.config.enable_metrics {
            let reporter = StatsReporter::new(
                self.limiter.clone(),
                self.config.metrics_interval_secs,
                total_stages,
                completed_count.clone(),
            );
            Some(tokio::spawn(reporter.run(shutdown_rx)))
        } else {
            drop(shutdown_rx);
            None
        };

        let mut context: StageContext<T> = StageContext::default();
        let mut completed_stages = Vec::with_capacity(total_stages);
        let mut failure = None;

        for (i, stage) in stages.iter().enumerate() {
            if i > 0 {
                let delay = self.inter_stage_delay();
                if !delay.is_zero() {
                    tracing::debug!(
                        "Pausing {:.2?} before stage '{}' (usage {:.0}%)",
                        delay,
                        stage.name(),
                        self.limiter.usage_ratio() * 100.0
                    );
                    tokio::time::sleep(delay).await;
                }
            }

            let estimated = stage.estimate_tokens(&context, self.config.default_stage_tokens);
            tracing::info!(
                "Stage {}/{} '{}' (~{} tokens)",
                i + 1,
                total_stages,
                stage.name(),
                estimated
            );

            let snapshot = context.clone();
            match self
                .limiter
                .run(|| stage.invoke(snapshot.clone()), estimated)
                .await
            {
                Ok(output) => {
                    completed_stages.push(stage.name().to_string());
                    context.push(stage.name().to_string(), output);
                    completed_count.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::error!("Stage '{}' failed, aborting pipeline: {}", stage.name(), e);
                    failure = Some((stage.name().to_string(), e));
                    break;
                }
            }
        }

        let _ = shutdown_tx.send(()).await;
        if let Some(handle) = reporter_handle {
            let _ = handle.await;
        }

        let stats = self.limiter.get_stats();
        if let Some(ref path) = self.config.metrics_output_path {
            if let Err(e) = stats.save_to_file(path) {
                tracing::warn!("Failed to save stats to {}: {}", path, e);
            }
        }

        let (failed_stage, error) = match failure {
            Some((stage, e)) => (Some(stage), Some(e)),
            None => (None, None),
        };

        let result = PipelineResult {
            success: failed_stage.is_none(),
            completed_stages,
            failed_stage,
            error,
            stats,
            outputs: context,
        };
        tracing::info!("Pipeline finished: {}", result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderProfile;
    use crate::error::{ExecutorError, WorkError};
    use std::sync::atomic::AtomicU32;
    use tokio::time::Instant;

    fn profile() -> ProviderProfile {
        ProviderProfile {
            tokens_per_minute: 1_000,
            safety_margin: 1.0,
            max_tokens_per_request: 500,
            max_tokens_per_batch: 500,
            max_retries: 3,
            retry_base_delay_seconds: 1.0,
            inter_phase_delay_seconds: 1.0,
            max_wait_seconds: 30.0,
            ..ProviderProfile::default()
        }
    }

    fn scheduler(profile: ProviderProfile) -> PipelineScheduler {
        let limiter = Arc::new(RateLimiter::new(profile).unwrap());
        PipelineScheduler::new(
            limiter,
            SchedulerConfig {
                enable_metrics: false,
                default_stage_tokens: 10,
                ..SchedulerConfig::default()
            },
        )
    }

    fn ok_stage(name: &str, value: u64) -> PipelineStage<u64> {
        PipelineStage::new(name, move |_ctx: StageContext<u64>| async move { Ok(value) })
    }

    #[test]
    fn test_adaptive_delay_below_threshold() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(60);
        assert_eq!(adaptive_delay(base, 0.0, 0.6, 3.0, cap), base);
        assert_eq!(adaptive_delay(base, 0.6, 0.6, 3.0, cap), base);
    }

    #[test]
    fn test_adaptive_delay_scales_linearly() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(60);
        assert_eq!(adaptive_delay(base, 0.8, 0.6, 3.0, cap), Duration::from_secs(2));
        assert_eq!(adaptive_delay(base, 1.0, 0.6, 3.0, cap), Duration::from_secs(3));
        // Ratios above 1 are treated as full usage
        assert_eq!(adaptive_delay(base, 1.7, 0.6, 3.0, cap), Duration::from_secs(3));
    }

    #[test]
    fn test_adaptive_delay_capped() {
        let delay = adaptive_delay(
            Duration::from_secs(10),
            1.0,
            0.6,
            3.0,
            Duration::from_secs(15),
        );
        assert_eq!(delay, Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_pipeline_succeeds() {
        let result = scheduler(profile()).run_pipeline::<u64>(Vec::new()).await;
        assert!(result.success);
        assert!(result.completed_stages.is_empty());
        assert!(result.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stages_run_in_order_with_outputs() {
        let stages = vec![
            ok_stage("load", 5),
            PipelineStage::new("double", |ctx: StageContext<u64>| async move {
                Ok(ctx.previous().copied().unwrap_or(0) * 2)
            }),
            PipelineStage::new("sum", |ctx: StageContext<u64>| async move {
                Ok(ctx.outputs().map(|o| o.output).sum())
            }),
        ];

        let result = scheduler(profile()).run_pipeline(stages).await;

        assert!(result.success);
        assert_eq!(result.completed_stages, vec!["load", "double", "sum"]);
        assert_eq!(result.output("double"), Some(&10));
        assert_eq!(result.output("sum"), Some(&15));
        assert_eq!(result.stats.total_requests, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_on_first_failure() {
        let c_calls = Arc::new(AtomicU32::new(0));
        let counter = c_calls.clone();

        let stages = vec![
            ok_stage("A", 1),
            PipelineStage::new("B", |_ctx: StageContext<u64>| async {
                Err(WorkError::fatal_msg("bad response"))
            }),
            PipelineStage::new("C", move |_ctx: StageContext<u64>| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(3) }
            }),
        ];

        let result = scheduler(profile()).run_pipeline(stages).await;

        assert!(!result.success);
        assert_eq!(result.completed_stages, vec!["A"]);
        assert_eq!(result.failed_stage.as_deref(), Some("B"));
        assert!(matches!(result.error, Some(ExecutorError::StageExecution(_))));
        assert_eq!(result.output("A"), Some(&1));
        assert_eq!(c_calls.load(Ordering::SeqCst), 0);
        assert_eq!(result.stats.failed_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_stage_aborts() {
        let stages = vec![ok_stage("small", 1), ok_stage("huge", 2).with_static_estimate(501)];

        let result = scheduler(profile()).run_pipeline(stages).await;

        assert!(!result.success);
        assert_eq!(result.failed_stage.as_deref(), Some("huge"));
        assert!(matches!(
            result.error,
            Some(ExecutorError::RequestTooLarge { estimated: 501, limit: 500 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_between_stages_only() {
        let stages = vec![ok_stage("a", 1), ok_stage("b", 2), ok_stage("c", 3)];
        let start = Instant::now();

        let result = scheduler(profile()).run_pipeline(stages).await;

        assert!(result.success);
        // Two gaps at the base delay; usage stays far below the threshold
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_millis(2_100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_estimates_use_previous_outputs() {
        let sched = scheduler(profile());
        let stages = vec![
            ok_stage("draft", 120).with_static_estimate(50),
            ok_stage("review", 0).with_estimate(|ctx| ctx.previous().copied().unwrap_or(0)),
        ];

        let result = sched.run_pipeline(stages).await;

        assert!(result.success);
        assert_eq!(sched.limiter().current_usage(), 170);
        assert_eq!(result.stats.tokens_processed, 170);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_stage_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let stages = vec![PipelineStage::new("flaky", move |_ctx: StageContext<u64>| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(WorkError::rate_limited_msg("429"))
                } else {
                    Ok(9)
                }
            }
        })];

        let result = scheduler(profile()).run_pipeline(stages).await;

        assert!(result.success);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(result.stats.throttled_requests, 1);
        assert_eq!(result.stats.rate_limit_retries, 1);
    }

    #[tokio::test]
    async fn test_stats_saved_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");
        let limiter = Arc::new(
            RateLimiter::new(ProviderProfile {
                inter_phase_delay_seconds: 0.0,
                ..profile()
            })
            .unwrap(),
        );
        let sched = PipelineScheduler::new(
            limiter,
            SchedulerConfig {
                enable_metrics: true,
                metrics_interval_secs: 1,
                default_stage_tokens: 10,
                metrics_output_path: Some(path.to_str().unwrap().to_string()),
                ..SchedulerConfig::default()
            },
        );

        let result = sched.run_pipeline(vec![ok_stage("only", 1)]).await;
        assert!(result.success);

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["total_requests"], 1);
    }
}
