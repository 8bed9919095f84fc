//! Structured lifecycle events for pipeline runs.
//!
//! Every stage transition, cache hit, repair attempt and corpus addition is
//! emitted as an `info!` event with an `event` field, inside a
//! per-target span so JSON logs can be grouped by target.

use tracing::{info, warn};

/// RAII guard for the `recast.target` span.
///
/// ```ignore
/// let _span = TargetSpan::enter("libcalc", "lib");
/// ```
pub struct TargetSpan {
    _span: tracing::span::EnteredSpan,
}

impl TargetSpan {
    pub fn enter(target: &str, kind: &str) -> Self {
        let span = tracing::info_span!("recast.target", target = %target, kind = %kind);
        Self {
            _span: span.entered(),
        }
    }

    /// Span handle for use across `.await` points via `Instrument`.
    pub fn span(target: &str, kind: &str) -> tracing::Span {
        tracing::info_span!("recast.target", target = %target, kind = %kind)
    }
}

pub fn emit_stage_started(target: &str, stage: &str) {
    info!(event = "stage.started", target = %target, stage = %stage);
}

pub fn emit_stage_finished(target: &str, stage: &str, duration_ms: u64, success: bool) {
    info!(
        event = "stage.finished",
        target = %target,
        stage = %stage,
        duration_ms = duration_ms,
        success = success,
    );
}

pub fn emit_artifact_cached(artifact: &str) {
    info!(event = "artifact.cached", artifact = %artifact);
}

pub fn emit_repair_attempt(target: &str, attempt: u32, max_attempts: u32, accepted: bool) {
    info!(
        event = "repair.attempt",
        target = %target,
        attempt = attempt,
        max_attempts = max_attempts,
        accepted = accepted,
    );
}

pub fn emit_vector_added(target: &str, vector: &str, origin: &str) {
    info!(event = "corpus.vector_added", target = %target, vector = %vector, origin = %origin);
}

pub fn emit_status_classified(target: &str, status: &str, passed: usize, total: usize) {
    info!(
        event = "status.classified",
        target = %target,
        status = %status,
        passed = passed,
        total = total,
    );
}

/// External tool failure that was logged and skipped.
pub fn emit_tooling_error(tool: &str, error: &dyn std::fmt::Display) {
    warn!(event = "tooling.error", tool = %tool, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_span_enters() {
        let _span = TargetSpan::enter("demo", "bin");
        emit_stage_started("demo", "translate");
        emit_stage_finished("demo", "translate", 3, true);
    }
}
