//! Error taxonomy shared by every recast stage.
//!
//! Stage failures that belong to a target (a translation that did not build,
//! a vector that did not match) are data and never surface here. These
//! variants are the conditions that stop work: bad configuration, missing
//! prerequisites, broken tooling.

use thiserror::Error;

use crate::cas::CasError;

#[derive(Debug, Error)]
pub enum RecastError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("compilation database error: {0}")]
    CompileDb(String),

    #[error("target {target} has no compile units")]
    EmptyTarget { target: String },

    #[error("unknown target: {0}")]
    UnknownTarget(String),

    #[error("translation failed for {target}: {reason}")]
    Translation { target: String, reason: String },

    #[error("wrapper synthesis failed for {target}: {}", .errors.join("; "))]
    Synthesis { target: String, errors: Vec<String> },

    #[error("{tool} failed: {message}")]
    Tooling { tool: String, message: String },

    #[error("invalid test vector {name}: {reason}")]
    InvalidVector { name: String, reason: String },

    #[error("test vector {0} already exists with different content")]
    VectorConflict(String),

    #[error("process error: {0}")]
    Process(String),

    #[error("blob store error: {0}")]
    Cas(#[from] CasError),

    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RecastError {
    /// Configuration-class errors abort a target's pipeline instead of
    /// being recorded as a failed stage.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::CompileDb(_)
                | Self::EmptyTarget { .. }
                | Self::UnknownTarget(_)
                | Self::ConfigParse(_)
        )
    }

    pub fn tooling(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tooling {
            tool: tool.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RecastError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_are_classified() {
        assert!(RecastError::Config("missing".into()).is_config());
        assert!(RecastError::EmptyTarget {
            target: "demo".into()
        }
        .is_config());
        assert!(!RecastError::tooling("nm", "not found").is_config());
    }

    #[test]
    fn synthesis_error_lists_every_symbol() {
        let err = RecastError::Synthesis {
            target: "libm".into(),
            errors: vec!["add: arity 2 vs 3".into(), "sub: missing prototype".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("add: arity"));
        assert!(msg.contains("sub: missing"));
    }
}
