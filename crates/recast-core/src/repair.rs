//! Bounded repair of a translation that failed to build or to pass its
//! vectors.
//!
//! Each attempt sends the current translation and the latest diagnostics to
//! the repair service and fully replaces the translation with the response.
//! A response that fails acceptance is reverted from the blob store (the
//! whole `src/` tree and the manifest) and still consumes an attempt. The attempt budget is persisted in
//! `repair.json`, so a target that exhausted it stays failed across runs
//! until it is re-translated.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::assemble::{self, CrateSources};
use crate::cas::fs::FsCasStore;
use crate::cas::Digest;
use crate::diagnostic::Diagnostics;
use crate::error::{RecastError, Result};
use crate::obs;
use crate::target::Target;
use crate::translate::{self, CodeGenerator, GenerationRequest};
use crate::workdir::WorkDir;
use crate::wrapper;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepairPolicy {
    pub max_attempts: u32,
}

impl Default for RepairPolicy {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RepairOutcome {
    /// The last accepted attempt builds and passes every vector.
    Repaired { attempts: u32 },
    /// Budget used up; the target stays failed.
    Exhausted { attempts: u32 },
    /// Nothing failed.
    NothingToRepair,
    /// Repair disabled by a zero budget.
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepairAttempt {
    pub attempt: u32,
    pub diagnostics_digest: Digest,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<String>,
    /// Whether the target passed after this attempt.
    pub passed: bool,
    pub at: DateTime<Utc>,
}

/// Persisted as `repair.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepairLog {
    pub target: String,
    pub policy: RepairPolicy,
    pub attempts: Vec<RepairAttempt>,
    pub outcome: RepairOutcome,
    pub evaluated_at: DateTime<Utc>,
}

impl RepairLog {
    pub fn new(target: &str, policy: &RepairPolicy) -> Self {
        Self {
            target: target.to_string(),
            policy: policy.clone(),
            attempts: Vec::new(),
            outcome: RepairOutcome::NothingToRepair,
            evaluated_at: Utc::now(),
        }
    }

    pub fn attempts_used(&self) -> u32 {
        self.attempts.len() as u32
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self.outcome, RepairOutcome::Exhausted { .. })
    }

    pub fn save(&self, workdir: &WorkDir) -> Result<()> {
        std::fs::write(workdir.repair_record(), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(workdir: &WorkDir) -> Result<Option<Self>> {
        match std::fs::read_to_string(workdir.repair_record()) {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Rebuild and retest the target after an accepted attempt.
#[async_trait]
pub trait RepairCycle: Send {
    /// `None` when the target now passes, otherwise the fresh diagnostics.
    async fn verify(&mut self) -> Result<Option<Diagnostics>>;
}

/// Accept `candidate` as a replacement for `prior`?
///
/// Libraries must keep every exported function the prior translation had.
pub fn check_acceptance(target: &Target, prior: &str, candidate: &str) -> std::result::Result<(), String> {
    if candidate.trim().is_empty() {
        return Err("empty response".into());
    }
    if target.is_library() {
        let before = wrapper::scan_rust_fns(prior);
        let after = wrapper::scan_rust_fns(candidate);
        let lost: Vec<&str> = target
            .exported_symbols
            .iter()
            .filter(|s| before.contains_key(*s) && !after.contains_key(*s))
            .map(String::as_str)
            .collect();
        if !lost.is_empty() {
            return Err(format!("drops exported functions: {}", lost.join(", ")));
        }
    }
    Ok(())
}

/// The crate's sources as they were before an attempt, held in the blob store.
struct SourceSnapshot {
    manifest: Option<Digest>,
    files: Vec<(PathBuf, Digest)>,
}

impl SourceSnapshot {
    fn take(blobs: &FsCasStore, workdir: &WorkDir) -> Result<Self> {
        let src = workdir.src_dir();
        let mut files = Vec::new();
        if src.is_dir() {
            for entry in WalkDir::new(&src).sort_by_file_name() {
                let entry = entry.map_err(|e| RecastError::Io(e.into()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                if let Some(digest) = blobs.snapshot(entry.path())? {
                    files.push((entry.path().to_path_buf(), digest));
                }
            }
        }
        Ok(Self {
            manifest: blobs.snapshot(&workdir.manifest())?,
            files,
        })
    }

    /// Put `src/` and the manifest back exactly; files added since are gone.
    fn restore(&self, blobs: &FsCasStore, workdir: &WorkDir) -> Result<()> {
        let src = workdir.src_dir();
        if src.exists() {
            std::fs::remove_dir_all(&src)?;
        }
        std::fs::create_dir_all(&src)?;
        for (path, digest) in &self.files {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            blobs.restore(digest, path)?;
        }
        restore_or_remove(blobs, self.manifest.as_ref(), &workdir.manifest())
    }
}

fn restore_or_remove(blobs: &FsCasStore, digest: Option<&Digest>, path: &Path) -> Result<()> {
    match digest {
        Some(digest) => blobs.restore(digest, path)?,
        None if path.exists() => std::fs::remove_file(path)?,
        None => {}
    }
    Ok(())
}

pub struct RepairDriver<'a> {
    generator: &'a dyn CodeGenerator,
    policy: &'a RepairPolicy,
    blobs: &'a FsCasStore,
    language: &'a str,
}

impl<'a> RepairDriver<'a> {
    pub fn new(
        generator: &'a dyn CodeGenerator,
        policy: &'a RepairPolicy,
        blobs: &'a FsCasStore,
        language: &'a str,
    ) -> Self {
        Self {
            generator,
            policy,
            blobs,
            language,
        }
    }

    /// Run the loop until the target passes or the budget is spent.
    pub async fn run(
        &self,
        target: &Target,
        workdir: &WorkDir,
        initial: Diagnostics,
        cycle: &mut dyn RepairCycle,
    ) -> Result<RepairLog> {
        let mut log = RepairLog::load(workdir)?.unwrap_or_else(|| RepairLog::new(&target.name, self.policy));
        log.policy = self.policy.clone();

        if self.policy.max_attempts == 0 {
            log.outcome = RepairOutcome::Skipped;
            log.save(workdir)?;
            return Ok(log);
        }
        if initial.is_empty() {
            log.outcome = RepairOutcome::NothingToRepair;
            log.save(workdir)?;
            return Ok(log);
        }

        let mut diagnostics = initial;
        while log.attempts_used() < self.policy.max_attempts {
            let attempt = log.attempts_used() + 1;
            let (accepted, rejection) = self.attempt(target, workdir, &diagnostics, attempt).await?;
            obs::emit_repair_attempt(&target.name, attempt, self.policy.max_attempts, accepted);

            let mut record = RepairAttempt {
                attempt,
                diagnostics_digest: Digest::compute(diagnostics.render().as_bytes()),
                accepted,
                rejection,
                passed: false,
                at: Utc::now(),
            };

            if accepted {
                match cycle.verify().await? {
                    None => {
                        record.passed = true;
                        log.attempts.push(record);
                        log.outcome = RepairOutcome::Repaired { attempts: attempt };
                        log.evaluated_at = Utc::now();
                        log.save(workdir)?;
                        info!(target = %target.name, attempts = attempt, "repair succeeded");
                        return Ok(log);
                    }
                    Some(next) => diagnostics = next,
                }
            }
            log.attempts.push(record);
            log.evaluated_at = Utc::now();
            log.save(workdir)?;
        }

        log.outcome = RepairOutcome::Exhausted {
            attempts: log.attempts_used(),
        };
        log.evaluated_at = Utc::now();
        log.save(workdir)?;
        warn!(target = %target.name, attempts = log.attempts_used(), "repair budget exhausted");
        Ok(log)
    }

    /// One request/accept/revert step. Returns whether the response was
    /// accepted and, if not, why.
    async fn attempt(
        &self,
        target: &Target,
        workdir: &WorkDir,
        diagnostics: &Diagnostics,
        attempt: u32,
    ) -> Result<(bool, Option<String>)> {
        let prior = std::fs::read_to_string(workdir.primary_source()).unwrap_or_default();
        let snapshot = SourceSnapshot::take(self.blobs, workdir)?;

        let request = GenerationRequest::translate(
            target,
            self.language,
            translate::load_sources(target, workdir)?,
        )
        .repair(prior.clone(), diagnostics.render(), attempt);

        let response = match self.generator.generate(&request).await {
            Ok(response) => response,
            Err(e @ RecastError::Translation { .. }) | Err(e @ RecastError::Process(_)) => {
                return Ok((false, Some(e.to_string())));
            }
            Err(e) => return Err(e),
        };
        translate::log_response(workdir, &request, &response)?;

        let sources = match CrateSources::from_response(&response, target) {
            Ok(sources) => sources,
            Err(e) => return Ok((false, Some(e.to_string()))),
        };
        assemble::install(workdir, target, &sources)?;

        match check_acceptance(target, &prior, &sources.primary) {
            Ok(()) => Ok((true, None)),
            Err(reason) => {
                snapshot.restore(self.blobs, workdir)?;
                warn!(target = %target.name, attempt, reason = %reason, "repair rejected, reverted");
                Ok((false, Some(reason)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compdb::CompileUnit;
    use crate::diagnostic::{Diagnostic, DiagnosticSource};
    use crate::target::TargetKind;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Scripted {
        responses: Vec<&'static str>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl CodeGenerator for Scripted {
        async fn generate(&self, _request: &GenerationRequest) -> Result<String> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            Ok(self.responses[i.min(self.responses.len() - 1)].to_string())
        }
    }

    struct FailsUntil {
        remaining: u32,
        verified: u32,
    }

    #[async_trait]
    impl RepairCycle for FailsUntil {
        async fn verify(&mut self) -> Result<Option<Diagnostics>> {
            self.verified += 1;
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            Ok(Some(failing()))
        }
    }

    fn failing() -> Diagnostics {
        Diagnostics(vec![Diagnostic::error(DiagnosticSource::Build, "error[E0308]: mismatched types")])
    }

    fn fixture(kind: TargetKind, symbols: &[&str], initial: &str) -> (tempfile::TempDir, Target, WorkDir, FsCasStore) {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("m.c");
        std::fs::write(&src, "int add(int a, int b) { return a + b; }\n").unwrap();
        let unit = CompileUnit {
            path: src,
            directory: dir.path().to_path_buf(),
            arguments: vec!["cc".into()],
            output: None,
            target: "m".into(),
        };
        let target = Target::new("m", kind, vec![unit])
            .unwrap()
            .with_symbols(symbols.iter().map(|s| s.to_string()).collect());
        let wd = WorkDir::for_target(&dir.path().join("work"), &target);
        assemble::install(&wd, &target, &CrateSources::single(initial)).unwrap();
        let blobs = FsCasStore::new(dir.path().join("blobs")).unwrap();
        (dir, target, wd, blobs)
    }

    #[tokio::test]
    async fn stops_at_first_passing_attempt() {
        let (_d, target, wd, blobs) = fixture(TargetKind::Executable, &[], "fn main() { broken }");
        let gen = Scripted { responses: vec!["fn main() {}"], calls: AtomicU32::new(0) };
        let policy = RepairPolicy::default();
        let mut cycle = FailsUntil { remaining: 1, verified: 0 };

        let log = RepairDriver::new(&gen, &policy, &blobs, "rust")
            .run(&target, &wd, failing(), &mut cycle)
            .await
            .unwrap();

        assert_eq!(log.outcome, RepairOutcome::Repaired { attempts: 2 });
        assert_eq!(gen.calls.load(Ordering::SeqCst), 2);
        assert_eq!(std::fs::read_to_string(wd.primary_source()).unwrap(), "fn main() {}");
    }

    #[tokio::test]
    async fn budget_bounds_attempts_across_runs() {
        let (_d, target, wd, blobs) = fixture(TargetKind::Executable, &[], "fn main() { broken }");
        let gen = Scripted { responses: vec!["fn main() { still_broken }"], calls: AtomicU32::new(0) };
        let policy = RepairPolicy { max_attempts: 2 };
        let mut cycle = FailsUntil { remaining: u32::MAX, verified: 0 };
        let driver = RepairDriver::new(&gen, &policy, &blobs, "rust");

        let log = driver.run(&target, &wd, failing(), &mut cycle).await.unwrap();
        assert_eq!(log.outcome, RepairOutcome::Exhausted { attempts: 2 });
        assert_eq!(gen.calls.load(Ordering::SeqCst), 2);

        // A later run does not get a fresh budget.
        let again = driver.run(&target, &wd, failing(), &mut cycle).await.unwrap();
        assert!(again.is_exhausted());
        assert_eq!(gen.calls.load(Ordering::SeqCst), 2);
        assert_eq!(RepairLog::load(&wd).unwrap().unwrap().attempts.len(), 2);
    }

    #[tokio::test]
    async fn rejected_response_is_reverted_and_counted() {
        let original = "pub fn add(a: i32, b: i32) -> i32 { a - b }\n";
        let (_d, target, wd, blobs) = fixture(TargetKind::Library, &["add"], original);
        let installed = std::fs::read_to_string(wd.primary_source()).unwrap();
        let gen = Scripted { responses: vec!["pub fn other() {}"], calls: AtomicU32::new(0) };
        let policy = RepairPolicy { max_attempts: 1 };
        let mut cycle = FailsUntil { remaining: 0, verified: 0 };

        let log = RepairDriver::new(&gen, &policy, &blobs, "rust")
            .run(&target, &wd, failing(), &mut cycle)
            .await
            .unwrap();

        assert_eq!(log.outcome, RepairOutcome::Exhausted { attempts: 1 });
        assert!(!log.attempts[0].accepted);
        assert!(log.attempts[0].rejection.as_deref().unwrap().contains("add"));
        assert_eq!(cycle.verified, 0);
        assert_eq!(std::fs::read_to_string(wd.primary_source()).unwrap(), installed);
    }

    #[tokio::test]
    async fn rejected_multi_file_response_leaves_no_new_files() {
        let original = "pub fn add(a: i32, b: i32) -> i32 { a - b }\n";
        let (_d, target, wd, blobs) = fixture(TargetKind::Library, &["add"], original);
        let installed = std::fs::read_to_string(wd.primary_source()).unwrap();
        let manifest = std::fs::read_to_string(wd.manifest()).unwrap();
        let response = r#"{"files": {
            "src/lib.rs": "pub fn other() {}",
            "src/extra.rs": "pub fn helper() {}",
            "src/util/deep.rs": "pub fn g() {}"
        }}"#;
        let gen = Scripted { responses: vec![response], calls: AtomicU32::new(0) };
        let policy = RepairPolicy { max_attempts: 1 };
        let mut cycle = FailsUntil { remaining: 0, verified: 0 };

        let log = RepairDriver::new(&gen, &policy, &blobs, "rust")
            .run(&target, &wd, failing(), &mut cycle)
            .await
            .unwrap();

        assert!(!log.attempts[0].accepted);
        assert!(!wd.src_dir().join("extra.rs").exists());
        assert!(!wd.src_dir().join("util").exists());
        assert!(wd.wrapper_source().exists());
        assert_eq!(std::fs::read_to_string(wd.primary_source()).unwrap(), installed);
        assert_eq!(std::fs::read_to_string(wd.manifest()).unwrap(), manifest);
    }

    #[tokio::test]
    async fn nothing_to_repair_without_diagnostics() {
        let (_d, target, wd, blobs) = fixture(TargetKind::Executable, &[], "fn main() {}");
        let gen = Scripted { responses: vec![""], calls: AtomicU32::new(0) };
        let policy = RepairPolicy::default();
        let mut cycle = FailsUntil { remaining: 0, verified: 0 };
        let log = RepairDriver::new(&gen, &policy, &blobs, "rust")
            .run(&target, &wd, Diagnostics::new(), &mut cycle)
            .await
            .unwrap();
        assert_eq!(log.outcome, RepairOutcome::NothingToRepair);
        assert_eq!(gen.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn acceptance_rules() {
        let unit = CompileUnit {
            path: PathBuf::from("/p/m.c"),
            directory: PathBuf::from("/p"),
            arguments: vec![],
            output: None,
            target: "m".into(),
        };
        let lib = Target::new("m", TargetKind::Library, vec![unit])
            .unwrap()
            .with_symbols(vec!["add".into(), "sub".into()]);
        let prior = "pub fn add() {}";
        assert!(check_acceptance(&lib, prior, "  ").is_err());
        assert!(check_acceptance(&lib, prior, "pub fn add() {}\npub fn sub() {}\n").is_ok());
        // `sub` was never translated, so losing it is not a regression.
        assert!(check_acceptance(&lib, prior, "pub fn add() { 1; }").is_ok());
        assert!(check_acceptance(&lib, prior, "fn add() {}").is_err());
    }
}
