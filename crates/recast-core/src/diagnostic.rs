//! Diagnostics handed from a failed build or test run to the repairer.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::build::BuildArtifact;
use crate::verify::{TestOutcome, TestResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticSource {
    Translation,
    Synthesis,
    Build,
    Test,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub source: DiagnosticSource,
    pub message: String,
    /// Test vector that produced this diagnostic.
    pub vector: Option<String>,
    /// Raw tool output backing the message.
    pub evidence: Option<String>,
}

impl Diagnostic {
    pub fn error(source: DiagnosticSource, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            source,
            message: message.into(),
            vector: None,
            evidence: None,
        }
    }

    pub fn with_vector(mut self, vector: impl Into<String>) -> Self {
        self.vector = Some(vector.into());
        self
    }

    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence = Some(evidence.into());
        self
    }
}

/// Evidence is capped so a runaway build log cannot blow up a request.
const MAX_EVIDENCE: usize = 16 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Diagnostics(pub Vec<Diagnostic>);

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.0.push(diagnostic);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.0.iter()
    }

    pub fn from_build(build: &BuildArtifact, log: &str) -> Self {
        let mut out = Self::new();
        if build.failed() {
            let message = match build.exit_code {
                Some(code) => format!("build failed with exit code {code}"),
                None => "build failed".to_string(),
            };
            out.push(Diagnostic::error(DiagnosticSource::Build, message).with_evidence(truncate(log)));
        }
        out
    }

    pub fn from_tests(results: &[TestResult]) -> Self {
        Self(
            results
                .iter()
                .filter(|r| r.outcome == TestOutcome::Fail)
                .map(|r| {
                    let d = Diagnostic::error(
                        DiagnosticSource::Test,
                        format!("test vector {} failed", r.vector),
                    )
                    .with_vector(&r.vector);
                    match &r.detail {
                        Some(detail) => d.with_evidence(truncate(detail)),
                        None => d,
                    }
                })
                .collect(),
        )
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.0.extend(other.0);
    }

    /// Plain-text rendering for a repair request.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for d in &self.0 {
            let _ = writeln!(out, "[{:?}/{:?}] {}", d.source, d.severity, d.message);
            if let Some(evidence) = &d.evidence {
                let _ = writeln!(out, "{evidence}");
            }
        }
        out
    }
}

fn truncate(text: &str) -> String {
    if text.len() <= MAX_EVIDENCE {
        return text.to_string();
    }
    let mut end = MAX_EVIDENCE;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n... ({} bytes truncated)", &text[..end], text.len() - end)
}
