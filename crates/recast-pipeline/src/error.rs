//! Scheduler errors.
//!
//! A rule that fails is not an error here: its failure is stamped and
//! downstream stages see it as data. These variants stop a target's chain.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("unknown artifact: {0}")]
    UnknownArtifact(String),

    #[error("artifact {artifact} depends on unknown artifact {input}")]
    UnknownInput { artifact: String, input: String },

    #[error("dependency cycle detected involving artifacts: {artifacts:?}")]
    DependencyCycle { artifacts: Vec<String> },

    /// A rule could not run at all, e.g. its compilation database is gone.
    #[error("prerequisite for {artifact} not met: {message}")]
    Prerequisite { artifact: String, message: String },

    #[error(transparent)]
    Recast(#[from] recast_core::RecastError),

    #[error(transparent)]
    Cas(#[from] recast_core::CasError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stamp error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
