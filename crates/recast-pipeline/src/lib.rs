//! Recast pipeline - incremental, per-target stage execution.
//!
//! - [`scheduler`]: DAG of named artifacts with persisted freshness stamps
//! - [`stage`]: the fixed stage taxonomy and the rule behind each stage
//! - [`pipeline`]: one target's stage chain
//! - [`orchestrator`]: bounded parallel execution across targets
//! - [`report`]: aggregate status report

pub mod error;
pub mod orchestrator;
pub mod pipeline;
pub mod report;
pub mod scheduler;
pub mod stage;

pub use error::{SchedulerError, SchedulerResult};
pub use orchestrator::{load_targets, Orchestrator, Services};
pub use pipeline::TargetPipeline;
pub use report::{RunReport, StatusCounts, TargetReport};
pub use scheduler::{ArtifactSpec, EnsureOutcome, Rule, RuleError, Scheduler, Stamp};
pub use stage::BuiltinStage;
