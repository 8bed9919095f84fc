//! Translation requests and the driver that turns a response into an
//! installed crate.
//!
//! The translator is an opaque service behind [`CodeGenerator`]; the stock
//! implementation, [`CommandGenerator`], pipes a JSON request into an
//! external command and reads Rust source back from its stdout.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::assemble::{self, CrateSources};
use crate::build::BuildArtifact;
use crate::cas::Digest;
use crate::config::CommandSpec;
use crate::error::{RecastError, Result};
use crate::exec;
use crate::target::{Target, TargetKind};
use crate::workdir::WorkDir;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    Translate,
    Repair,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceUnit {
    pub path: PathBuf,
    pub text: String,
}

/// Everything the translation service sees for one request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenerationRequest {
    pub task: Task,
    pub target_language: String,
    pub target: String,
    pub kind: TargetKind,
    /// Preprocessed units in priority order.
    pub sources: Vec<SourceUnit>,
    pub exported_symbols: Vec<String>,
    /// Current translation, for repair requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
}

impl GenerationRequest {
    pub fn translate(target: &Target, language: &str, sources: Vec<SourceUnit>) -> Self {
        Self {
            task: Task::Translate,
            target_language: language.to_string(),
            target: target.name.clone(),
            kind: target.kind,
            sources,
            exported_symbols: target.exported_symbols.clone(),
            prior: None,
            diagnostics: None,
            attempt: None,
        }
    }

    pub fn repair(mut self, prior: String, diagnostics: String, attempt: u32) -> Self {
        self.task = Task::Repair;
        self.prior = Some(prior);
        self.diagnostics = Some(diagnostics);
        self.attempt = Some(attempt);
        self
    }

    pub fn combined_source(&self) -> String {
        self.sources
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// An opaque code generation service. Failures are reported, never retried
/// here; retry policy belongs to the caller.
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String>;
}

/// Runs an external command with the request as JSON on stdin.
pub struct CommandGenerator {
    command: CommandSpec,
    timeout: Option<Duration>,
}

impl CommandGenerator {
    pub fn new(command: CommandSpec) -> Self {
        Self {
            command,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl CodeGenerator for CommandGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let mut vars = HashMap::new();
        vars.insert("target", request.target.clone());
        vars.insert("language", request.target_language.clone());
        let mut inv = self
            .command
            .render(&vars)
            .stdin(serde_json::to_vec(request)?);
        if let Some(timeout) = self.timeout {
            inv = inv.timeout(timeout);
        }

        let out = exec::run(&inv).await?;
        let failure = |reason: String| RecastError::Translation {
            target: request.target.clone(),
            reason,
        };
        if out.timed_out {
            return Err(failure(format!("`{}` timed out", self.command.program)));
        }
        if !out.success() {
            return Err(failure(format!(
                "`{}` exited with {:?}: {}",
                self.command.program,
                out.exit_code,
                out.stderr_lossy().trim()
            )));
        }
        Ok(extract_code(&out.stdout_lossy()).to_string())
    }
}

/// The first fenced ```rust block of a response, or the whole response
/// when it has none.
pub fn extract_code(response: &str) -> &str {
    for fence in ["```rust\n", "```rs\n", "```\n"] {
        if let Some(start) = response.find(fence) {
            let body = &response[start + fence.len()..];
            if let Some(end) = body.find("```") {
                return &body[..end];
            }
        }
    }
    response
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TranslationStatus {
    Pending,
    Succeeded,
    Failed,
}

/// Persisted as `translation.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TranslationArtifact {
    pub target: String,
    pub status: TranslationStatus,
    /// C units the translation was produced from.
    pub sources: Vec<PathBuf>,
    pub digest: Option<Digest>,
    pub error: Option<String>,
    pub produced_at: DateTime<Utc>,
}

impl TranslationArtifact {
    pub fn save(&self, workdir: &WorkDir) -> Result<()> {
        std::fs::write(workdir.translation_record(), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(workdir: &WorkDir) -> Result<Option<Self>> {
        match std::fs::read_to_string(workdir.translation_record()) {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// A produced translation counts as succeeded only once a build of it
    /// went through without error.
    pub fn effective_status(&self, build: Option<&BuildArtifact>) -> TranslationStatus {
        match (self.status, build) {
            (TranslationStatus::Failed, _) => TranslationStatus::Failed,
            (_, Some(b)) if !b.failed() => TranslationStatus::Succeeded,
            _ => TranslationStatus::Pending,
        }
    }
}

#[derive(Serialize)]
struct LogRecord<'a> {
    target: &'a str,
    task: Task,
    source: String,
    translation: &'a str,
}

/// Append one request/response pair to `translation.jsonl`.
pub fn log_response(workdir: &WorkDir, request: &GenerationRequest, response: &str) -> Result<()> {
    let record = LogRecord {
        target: &request.target,
        task: request.task,
        source: request.combined_source(),
        translation: response,
    };
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(workdir.translation_log())?;
    writeln!(file, "{}", serde_json::to_string(&record)?)?;
    Ok(())
}

/// Read the target's units, preferring the preprocessed copies.
pub fn load_sources(target: &Target, workdir: &WorkDir) -> Result<Vec<SourceUnit>> {
    target
        .units
        .iter()
        .map(|unit| {
            let pre = workdir.preprocessed(unit);
            let text = match std::fs::read_to_string(&pre) {
                Ok(text) => text,
                Err(_) => std::fs::read_to_string(&unit.path)?,
            };
            Ok(SourceUnit {
                path: unit.path.clone(),
                text,
            })
        })
        .collect()
}

/// Translate `target` and install the result into its workdir.
///
/// A failing translator yields a `Failed` artifact, not an error.
pub async fn translate(
    generator: &dyn CodeGenerator,
    target: &Target,
    workdir: &WorkDir,
    language: &str,
) -> Result<TranslationArtifact> {
    workdir.create()?;
    let request = GenerationRequest::translate(target, language, load_sources(target, workdir)?);
    let sources = target.units.iter().map(|u| u.path.clone()).collect();

    let outcome = match generator.generate(&request).await {
        Ok(response) => {
            log_response(workdir, &request, &response)?;
            match CrateSources::from_response(&response, target) {
                Ok(crate_sources) if crate_sources.primary.trim().is_empty() => {
                    Err("translator returned an empty translation".to_string())
                }
                Ok(crate_sources) => Ok(crate_sources),
                Err(e) => Err(e.to_string()),
            }
        }
        Err(e) => Err(e.to_string()),
    };

    let artifact = match outcome {
        Ok(crate_sources) => {
            assemble::install(workdir, target, &crate_sources)?;
            debug!(target = %target.name, "translation installed");
            TranslationArtifact {
                target: target.name.clone(),
                status: TranslationStatus::Pending,
                sources,
                digest: Some(Digest::compute(crate_sources.primary.as_bytes())),
                error: None,
                produced_at: Utc::now(),
            }
        }
        Err(reason) => {
            warn!(target = %target.name, error = %reason, "translation failed");
            TranslationArtifact {
                target: target.name.clone(),
                status: TranslationStatus::Failed,
                sources,
                digest: None,
                error: Some(reason),
                produced_at: Utc::now(),
            }
        }
    };
    artifact.save(workdir)?;
    Ok(artifact)
}
