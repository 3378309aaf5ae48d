//! Sequential multi-stage execution under a shared token budget.

mod reporter;
mod scheduler;
mod stage;

pub use reporter::StatsReporter;
pub use scheduler::{adaptive_delay, PipelineScheduler, SchedulerConfig};
pub use stage::{PipelineResult, PipelineStage, StageContext, StageOutput};
