//! Stage definitions and the context threaded between stages.

use crate::error::{ExecutorError, WorkError};
use crate::limiter::ExecutionStats;
use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::sync::Arc;

type EstimateFn<T> = Box<dyn Fn(&StageContext<T>) -> u64 + Send + Sync>;
type WorkFn<T> = Arc<dyn Fn(StageContext<T>) -> BoxFuture<'static, Result<T, WorkError>> + Send + Sync>;

/// Output recorded for one completed stage.
#[derive(Debug)]
pub struct StageOutput<T> {
    /// Name of the stage that produced the output
    pub stage: String,

    /// Value returned by the stage's work function
    pub output: T,
}

/// Outputs of every stage completed so far, in execution order.
///
/// Cloning is cheap: outputs are shared, never copied.
pub struct StageContext<T> {
    outputs: Vec<Arc<StageOutput<T>>>,
}

impl<T> Clone for StageContext<T> {
    fn clone(&self) -> Self {
        Self {
            outputs: self.outputs.clone(),
        }
    }
}

impl<T> Default for StageContext<T> {
    fn default() -> Self {
        Self { outputs: Vec::new() }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for StageContext<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.outputs.iter()).finish()
    }
}

impl<T> StageContext<T> {
    /// Output of the most recently completed stage.
    pub fn previous(&self) -> Option<&T> {
        self.outputs.last().map(|o| &o.output)
    }

    /// Output of the named stage, if it has completed.
    pub fn output(&self, stage: &str) -> Option<&T> {
        self.outputs
            .iter()
            .find(|o| o.stage == stage)
            .map(|o| &o.output)
    }

    /// Every completed stage's output in execution order.
    pub fn outputs(&self) -> impl Iterator<Item = &StageOutput<T>> {
        self.outputs.iter().map(|o| o.as_ref())
    }

    /// Number of completed stages.
    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub(crate) fn push(&mut self, stage: String, output: T) {
        self.outputs.push(Arc::new(StageOutput { stage, output }));
    }
}

/// A named unit of work run by the scheduler.
///
/// The work function may be invoked more than once when the service signals
/// a rate limit, so it must be safe to repeat.
pub struct PipelineStage<T> {
    name: String,
    estimate: Option<EstimateFn<T>>,
    work: WorkFn<T>,
}

impl<T: Send + Sync + 'static> PipelineStage<T> {
    /// Create a stage from an async work function.
    pub fn new<F, Fut>(name: impl Into<String>, work: F) -> Self
    where
        F: Fn(StageContext<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, WorkError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            estimate: None,
            work: Arc::new(move |ctx| work(ctx).boxed()),
        }
    }

    /// Estimate the stage's token cost from earlier outputs.
    pub fn with_estimate<E>(mut self, estimate: E) -> Self
    where
        E: Fn(&StageContext<T>) -> u64 + Send + Sync + 'static,
    {
        self.estimate = Some(Box::new(estimate));
        self
    }

    /// Use a fixed token estimate.
    pub fn with_static_estimate(self, tokens: u64) -> Self {
        self.with_estimate(move |_| tokens)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Estimated tokens for this stage, falling back to `default_tokens`.
    pub fn estimate_tokens(&self, ctx: &StageContext<T>, default_tokens: u64) -> u64 {
        self.estimate
            .as_ref()
            .map_or(default_tokens, |estimate| estimate(ctx))
    }

    pub(crate) fn invoke(&self, ctx: StageContext<T>) -> BoxFuture<'static, Result<T, WorkError>> {
        (self.work)(ctx)
    }
}

impl<T> std::fmt::Debug for PipelineStage<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineStage")
            .field("name", &self.name)
            .field("has_estimate", &self.estimate.is_some())
            .finish()
    }
}

/// Outcome of a pipeline run, including partial results on abort.
#[derive(Debug)]
pub struct PipelineResult<T> {
    /// Whether every stage completed
    pub success: bool,

    /// Names of completed stages, in order
    pub completed_stages: Vec<String>,

    /// Stage that aborted the run
    pub failed_stage: Option<String>,

    /// Error that aborted the run
    pub error: Option<ExecutorError>,

    /// Executor statistics at the end of the run
    pub stats: ExecutionStats,

    /// Outputs of the completed stages
    pub outputs: StageContext<T>,
}

impl<T> PipelineResult<T> {
    /// Output of the named stage, if it completed.
    pub fn output(&self, stage: &str) -> Option<&T> {
        self.outputs.output(stage)
    }
}

impl<T> std::fmt::Display for PipelineResult<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.failed_stage, &self.error) {
            (Some(stage), Some(err)) => write!(
                f,
                "Failed at stage '{}' after {} completed ({}): {}",
                stage,
                self.completed_stages.len(),
                err.category(),
                err
            ),
            _ => write!(f, "Completed {} stages", self.completed_stages.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_lookup() {
        let mut ctx: StageContext<u32> = StageContext::default();
        assert!(ctx.previous().is_none());
        assert!(ctx.is_empty());

        ctx.push("extract".to_string(), 1);
        ctx.push("summarize".to_string(), 2);

        assert_eq!(ctx.previous(), Some(&2));
        assert_eq!(ctx.output("extract"), Some(&1));
        assert_eq!(ctx.output("missing"), None);
        assert_eq!(
            ctx.outputs().map(|o| o.stage.as_str()).collect::<Vec<_>>(),
            vec!["extract", "summarize"]
        );
    }

    #[test]
    fn test_context_clone_shares_outputs() {
        let mut ctx: StageContext<String> = StageContext::default();
        ctx.push("a".to_string(), "alpha".to_string());
        let snapshot = ctx.clone();
        ctx.push("b".to_string(), "beta".to_string());

        assert_eq!(snapshot.len(), 1);
        assert_eq!(ctx.len(), 2);
    }

    #[test]
    fn test_stage_estimates() {
        let ctx: StageContext<u64> = StageContext::default();
        let plain = PipelineStage::new("plain", |_ctx: StageContext<u64>| async { Ok(0) });
        assert_eq!(plain.estimate_tokens(&ctx, 500), 500);

        let fixed = PipelineStage::new("fixed", |_ctx: StageContext<u64>| async { Ok(0) })
            .with_static_estimate(42);
        assert_eq!(fixed.estimate_tokens(&ctx, 500), 42);
        assert_eq!(fixed.name(), "fixed");
    }

    #[tokio::test]
    async fn test_stage_sees_previous_output() {
        let mut ctx: StageContext<u64> = StageContext::default();
        ctx.push("first".to_string(), 20);

        let stage = PipelineStage::new("double", |ctx: StageContext<u64>| async move {
            Ok(ctx.previous().copied().unwrap_or(0) * 2)
        });
        assert_eq!(stage.invoke(ctx).await.unwrap(), 40);
    }
}
