//! Incremental scheduler over named artifacts.
//!
//! Each artifact declares the artifacts it consumes, the external files it
//! reads, the files it produces and a [`Rule`] that produces them. After a
//! rule runs, a stamp recording a digest of everything it consumed is
//! written to `<stamps_dir>/<artifact>.json`; the next `ensure` compares
//! against that stamp instead of re-running.
//!
//! Cycles are detected when an artifact is registered, and the
//! registration is rolled back.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use recast_core::cas::{Digest, DigestBuilder};
use recast_core::{obs, FreshnessMode, RecastError};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{SchedulerError, SchedulerResult};

/// Why a rule did not produce its outputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleError {
    /// The stage ran and failed; recorded, downstream continues.
    Failed(String),
    /// The stage could not run at all; aborts the target's chain.
    Prerequisite(String),
}

impl From<RecastError> for RuleError {
    fn from(err: RecastError) -> Self {
        if err.is_config() {
            Self::Prerequisite(err.to_string())
        } else {
            Self::Failed(err.to_string())
        }
    }
}

/// Production rule of one artifact. Rules get the scheduler so a rule can
/// re-ensure other artifacts (repair rebuilds and retests this way).
#[async_trait]
pub trait Rule: Send + Sync {
    async fn produce(&self, scheduler: &Scheduler) -> Result<(), RuleError>;
}

pub struct ArtifactSpec {
    pub name: String,
    /// Artifacts that must be fresh before this one runs.
    pub inputs: Vec<String>,
    /// Files or directories from outside the graph.
    pub sources: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
    /// Settings that change what the rule would produce, e.g. a command line.
    pub params: Vec<String>,
    pub rule: Arc<dyn Rule>,
}

impl ArtifactSpec {
    pub fn new(name: impl Into<String>, rule: Arc<dyn Rule>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            sources: Vec::new(),
            outputs: Vec::new(),
            params: Vec::new(),
            rule,
        }
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.inputs.push(input.into());
        self
    }

    pub fn with_sources<I: IntoIterator<Item = PathBuf>>(mut self, sources: I) -> Self {
        self.sources.extend(sources);
        self
    }

    pub fn with_outputs<I: IntoIterator<Item = PathBuf>>(mut self, outputs: I) -> Self {
        self.outputs.extend(outputs);
        self
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.params.push(param.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnsureOutcome {
    Built,
    Cached,
}

/// Persisted record of the last production of an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamp {
    pub artifact: String,
    pub input_digest: Digest,
    pub produced_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Set when the rule failed; the outputs exist but document a failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

pub struct Scheduler {
    nodes: HashMap<String, ArtifactSpec>,
    order: Vec<String>,
    stamps_dir: PathBuf,
    freshness: FreshnessMode,
    retry_failed: bool,
    /// Outcomes of artifacts already ensured in this session.
    session: Mutex<HashMap<String, EnsureOutcome>>,
}

impl Scheduler {
    pub fn new(stamps_dir: impl Into<PathBuf>, freshness: FreshnessMode) -> Self {
        Self {
            nodes: HashMap::new(),
            order: Vec::new(),
            stamps_dir: stamps_dir.into(),
            freshness,
            retry_failed: false,
            session: Mutex::new(HashMap::new()),
        }
    }

    /// Treat artifacts whose last run failed as stale.
    pub fn with_retry_failed(mut self, retry: bool) -> Self {
        self.retry_failed = retry;
        self
    }

    /// Register `spec`. Inputs may name artifacts registered later, but an
    /// edge that closes a cycle is rejected and the registration undone.
    pub fn add_artifact(&mut self, spec: ArtifactSpec) -> SchedulerResult<()> {
        let name = spec.name.clone();
        let previous = self.nodes.insert(name.clone(), spec);

        if let Some(cycle) = self.find_cycle_through(&name) {
            match previous {
                Some(old) => {
                    self.nodes.insert(name, old);
                }
                None => {
                    self.nodes.remove(&name);
                }
            }
            return Err(SchedulerError::DependencyCycle { artifacts: cycle });
        }
        if previous.is_none() {
            self.order.push(name);
        }
        Ok(())
    }

    /// Registered artifact names, in registration order.
    pub fn artifacts(&self) -> &[String] {
        &self.order
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    fn find_cycle_through(&self, start: &str) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        let mut stack = vec![vec![start.to_string()]];
        while let Some(path) = stack.pop() {
            let Some(spec) = path.last().and_then(|n| self.nodes.get(n)) else {
                continue;
            };
            for input in &spec.inputs {
                if input == start {
                    return Some(path.clone());
                }
                if visited.insert(input.clone()) {
                    let mut next = path.clone();
                    next.push(input.clone());
                    stack.push(next);
                }
            }
        }
        None
    }

    fn spec(&self, name: &str) -> SchedulerResult<&ArtifactSpec> {
        self.nodes
            .get(name)
            .ok_or_else(|| SchedulerError::UnknownArtifact(name.to_string()))
    }

    /// `name` and everything it depends on, dependencies first.
    pub fn plan(&self, name: &str) -> SchedulerResult<Vec<String>> {
        fn visit(
            scheduler: &Scheduler,
            name: &str,
            seen: &mut HashSet<String>,
            out: &mut Vec<String>,
        ) -> SchedulerResult<()> {
            if !seen.insert(name.to_string()) {
                return Ok(());
            }
            let spec = scheduler.spec(name)?;
            for input in &spec.inputs {
                if !scheduler.contains(input) {
                    return Err(SchedulerError::UnknownInput {
                        artifact: name.to_string(),
                        input: input.clone(),
                    });
                }
                visit(scheduler, input, seen, out)?;
            }
            out.push(name.to_string());
            Ok(())
        }

        let mut out = Vec::new();
        visit(self, name, &mut HashSet::new(), &mut out)?;
        Ok(out)
    }

    /// Forget what this session has ensured, so the next `ensure` looks at
    /// the stamps again.
    pub async fn reset_session(&self) {
        self.session.lock().await.clear();
    }

    /// Make `name` fresh, producing its inputs first.
    pub fn ensure<'a>(&'a self, name: &'a str) -> BoxFuture<'a, SchedulerResult<EnsureOutcome>> {
        async move {
            let spec = self.spec(name)?;
            if let Some(done) = self.session.lock().await.get(name).copied() {
                return Ok(done);
            }

            for input in &spec.inputs {
                if !self.contains(input) {
                    return Err(SchedulerError::UnknownInput {
                        artifact: name.to_string(),
                        input: input.clone(),
                    });
                }
                self.ensure(input).await?;
            }

            let stamp = self.stamp(name)?;
            if self.is_fresh(spec, stamp.as_ref())? {
                obs::emit_artifact_cached(name);
                self.session.lock().await.insert(name.to_string(), EnsureOutcome::Cached);
                return Ok(EnsureOutcome::Cached);
            }

            debug!(artifact = %name, "producing");
            let started = Instant::now();
            let failure = match spec.rule.produce(self).await {
                Ok(()) => None,
                Err(RuleError::Failed(reason)) => {
                    touch_outputs(&spec.outputs)?;
                    Some(reason)
                }
                Err(RuleError::Prerequisite(message)) => {
                    return Err(SchedulerError::Prerequisite {
                        artifact: name.to_string(),
                        message,
                    });
                }
            };

            let stamp = Stamp {
                artifact: name.to_string(),
                input_digest: self.input_digest(spec)?,
                produced_at: Utc::now(),
                duration_ms: started.elapsed().as_millis() as u64,
                failure,
            };
            self.write_stamp(&stamp)?;
            self.session.lock().await.insert(name.to_string(), EnsureOutcome::Built);
            Ok(EnsureOutcome::Built)
        }
        .boxed()
    }

    fn stamp_path(&self, name: &str) -> PathBuf {
        let file: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
            .collect();
        self.stamps_dir.join(format!("{file}.json"))
    }

    pub fn stamp(&self, name: &str) -> SchedulerResult<Option<Stamp>> {
        match std::fs::read_to_string(self.stamp_path(name)) {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_stamp(&self, stamp: &Stamp) -> SchedulerResult<()> {
        let json = serde_json::to_vec_pretty(stamp)?;
        recast_core::cas::fs::write_atomic(&self.stamp_path(&stamp.artifact), &json)?;
        Ok(())
    }

    /// Drop the stamp of `name` so it is produced again on the next run.
    pub fn forget(&self, name: &str) -> SchedulerResult<()> {
        match std::fs::remove_file(self.stamp_path(name)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn is_fresh(&self, spec: &ArtifactSpec, stamp: Option<&Stamp>) -> SchedulerResult<bool> {
        let Some(stamp) = stamp else {
            return Ok(false);
        };
        if self.retry_failed && stamp.failure.is_some() {
            return Ok(false);
        }
        if spec.outputs.iter().any(|o| !o.exists()) {
            return Ok(false);
        }
        match self.freshness {
            FreshnessMode::ContentHash => Ok(stamp.input_digest == self.input_digest(spec)?),
            FreshnessMode::Timestamp => {
                let stamped = std::fs::metadata(self.stamp_path(&spec.name))?.modified()?;
                Ok(self.newest_input(spec)?.map_or(true, |newest| newest <= stamped))
            }
        }
    }

    /// Everything `spec` consumes: its parameters, the outputs and failure
    /// state of its input artifacts, and its external sources.
    fn input_digest(&self, spec: &ArtifactSpec) -> SchedulerResult<Digest> {
        let mut builder = DigestBuilder::new().field("artifact", &spec.name);
        for param in &spec.params {
            builder.push(param.as_bytes());
        }
        for input in &spec.inputs {
            let upstream = self.spec(input)?;
            builder.push(input.as_bytes());
            let failure = self.stamp(input)?.and_then(|s| s.failure).unwrap_or_default();
            builder.push(failure.as_bytes());
            for output in &upstream.outputs {
                digest_path(&mut builder, output)?;
            }
        }
        for source in &spec.sources {
            digest_path(&mut builder, source)?;
        }
        Ok(builder.finish())
    }

    fn newest_input(&self, spec: &ArtifactSpec) -> SchedulerResult<Option<SystemTime>> {
        let mut paths: Vec<&Path> = spec.sources.iter().map(PathBuf::as_path).collect();
        for input in &spec.inputs {
            paths.extend(self.spec(input)?.outputs.iter().map(PathBuf::as_path));
        }
        let mut newest = None;
        for path in paths {
            for entry in WalkDir::new(path).into_iter().filter_map(|e| e.ok()) {
                let modified = entry.metadata().map_err(std::io::Error::from)?.modified()?;
                newest = newest.max(Some(modified));
            }
        }
        Ok(newest)
    }
}

/// Files hash by content; directories by every file beneath them, with
/// relative names, in sorted order.
fn digest_path(builder: &mut DigestBuilder, path: &Path) -> SchedulerResult<()> {
    builder.push(path.to_string_lossy().as_bytes());
    if !path.is_dir() {
        builder.file(path)?;
        return Ok(());
    }
    for entry in WalkDir::new(path).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.file_type().is_file() {
            let rel = entry.path().strip_prefix(path).unwrap_or(entry.path());
            builder.push(rel.to_string_lossy().as_bytes());
            builder.file(entry.path())?;
        }
    }
    Ok(())
}

fn touch_outputs(outputs: &[PathBuf]) -> std::io::Result<()> {
    for output in outputs.iter().filter(|o| !o.exists()) {
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::File::create(output)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Copies `from` (or a constant) to `to` and counts runs.
    struct CopyRule {
        from: Option<PathBuf>,
        to: PathBuf,
        runs: Arc<AtomicU32>,
        outcome: Result<(), RuleError>,
    }

    #[async_trait]
    impl Rule for CopyRule {
        async fn produce(&self, _scheduler: &Scheduler) -> Result<(), RuleError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()?;
            let text = match &self.from {
                Some(from) => std::fs::read_to_string(from).unwrap_or_default(),
                None => "seed".to_string(),
            };
            std::fs::write(&self.to, text.to_uppercase()).unwrap();
            Ok(())
        }
    }

    fn copy(from: Option<&Path>, to: &Path, outcome: Result<(), RuleError>) -> (Arc<dyn Rule>, Arc<AtomicU32>) {
        let runs = Arc::new(AtomicU32::new(0));
        let rule = CopyRule {
            from: from.map(Path::to_path_buf),
            to: to.to_path_buf(),
            runs: runs.clone(),
            outcome,
        };
        (Arc::new(rule), runs)
    }

    struct Chain {
        _dir: tempfile::TempDir,
        source: PathBuf,
        mid: PathBuf,
        end: PathBuf,
        stamps: PathBuf,
    }

    fn chain() -> Chain {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("in.txt");
        std::fs::write(&source, "hello").unwrap();
        Chain {
            source,
            mid: dir.path().join("mid.txt"),
            end: dir.path().join("end.txt"),
            stamps: dir.path().join("stamps"),
            _dir: dir,
        }
    }

    fn scheduler(c: &Chain, mode: FreshnessMode) -> (Scheduler, Arc<AtomicU32>, Arc<AtomicU32>) {
        let mut s = Scheduler::new(&c.stamps, mode);
        let (a, a_runs) = copy(Some(&c.source), &c.mid, Ok(()));
        let (b, b_runs) = copy(Some(&c.mid), &c.end, Ok(()));
        s.add_artifact(
            ArtifactSpec::new("t/mid", a)
                .with_sources([c.source.clone()])
                .with_outputs([c.mid.clone()]),
        )
        .unwrap();
        s.add_artifact(ArtifactSpec::new("t/end", b).with_input("t/mid").with_outputs([c.end.clone()]))
            .unwrap();
        (s, a_runs, b_runs)
    }

    #[tokio::test]
    async fn second_run_is_fully_cached() {
        let c = chain();
        let (s, a, b) = scheduler(&c, FreshnessMode::ContentHash);
        assert_eq!(s.ensure("t/end").await.unwrap(), EnsureOutcome::Built);
        assert_eq!(std::fs::read_to_string(&c.end).unwrap(), "HELLO");

        let (again, a2, b2) = scheduler(&c, FreshnessMode::ContentHash);
        assert_eq!(again.ensure("t/end").await.unwrap(), EnsureOutcome::Cached);
        assert_eq!((a.load(Ordering::SeqCst), b.load(Ordering::SeqCst)), (1, 1));
        assert_eq!((a2.load(Ordering::SeqCst), b2.load(Ordering::SeqCst)), (0, 0));
    }

    #[tokio::test]
    async fn changed_source_rebuilds_downstream() {
        let c = chain();
        let (s, _, _) = scheduler(&c, FreshnessMode::ContentHash);
        s.ensure("t/end").await.unwrap();

        std::fs::write(&c.source, "world").unwrap();
        let (again, a, b) = scheduler(&c, FreshnessMode::ContentHash);
        assert_eq!(again.ensure("t/end").await.unwrap(), EnsureOutcome::Built);
        assert_eq!((a.load(Ordering::SeqCst), b.load(Ordering::SeqCst)), (1, 1));
        assert_eq!(std::fs::read_to_string(&c.end).unwrap(), "WORLD");
    }

    #[tokio::test]
    async fn identical_upstream_output_keeps_downstream_cached() {
        let c = chain();
        let (s, _, _) = scheduler(&c, FreshnessMode::ContentHash);
        s.ensure("t/end").await.unwrap();

        // Only the case changes, and the upper-cased output stays the same.
        std::fs::write(&c.source, "HELLO").unwrap();
        let (again, a, b) = scheduler(&c, FreshnessMode::ContentHash);
        again.ensure("t/end").await.unwrap();
        assert_eq!((a.load(Ordering::SeqCst), b.load(Ordering::SeqCst)), (1, 0));
    }

    #[tokio::test]
    async fn timestamp_mode_follows_mtimes() {
        let c = chain();
        let (s, _, _) = scheduler(&c, FreshnessMode::Timestamp);
        s.ensure("t/end").await.unwrap();

        let (cached, a, _) = scheduler(&c, FreshnessMode::Timestamp);
        assert_eq!(cached.ensure("t/end").await.unwrap(), EnsureOutcome::Cached);
        assert_eq!(a.load(Ordering::SeqCst), 0);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        std::fs::write(&c.source, "hello").unwrap();
        let (touched, a, _) = scheduler(&c, FreshnessMode::Timestamp);
        assert_eq!(touched.ensure("t/end").await.unwrap(), EnsureOutcome::Built);
        assert_eq!(a.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_rule_is_stamped_and_outputs_exist() {
        let c = chain();
        let mut s = Scheduler::new(&c.stamps, FreshnessMode::ContentHash);
        let (rule, runs) = copy(None, &c.mid, Err(RuleError::Failed("translator unavailable".into())));
        s.add_artifact(ArtifactSpec::new("t/mid", rule).with_outputs([c.mid.clone()]))
            .unwrap();

        assert_eq!(s.ensure("t/mid").await.unwrap(), EnsureOutcome::Built);
        assert!(c.mid.exists());
        let stamp = s.stamp("t/mid").unwrap().unwrap();
        assert_eq!(stamp.failure.as_deref(), Some("translator unavailable"));

        s.reset_session().await;
        assert_eq!(s.ensure("t/mid").await.unwrap(), EnsureOutcome::Cached);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let mut retrying = Scheduler::new(&c.stamps, FreshnessMode::ContentHash).with_retry_failed(true);
        let (rule, runs) = copy(None, &c.mid, Ok(()));
        retrying
            .add_artifact(ArtifactSpec::new("t/mid", rule).with_outputs([c.mid.clone()]))
            .unwrap();
        assert_eq!(retrying.ensure("t/mid").await.unwrap(), EnsureOutcome::Built);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(retrying.stamp("t/mid").unwrap().unwrap().failure.is_none());
    }

    #[tokio::test]
    async fn prerequisite_failure_aborts_without_stamp() {
        let c = chain();
        let mut s = Scheduler::new(&c.stamps, FreshnessMode::ContentHash);
        let (a, _) = copy(None, &c.mid, Err(RuleError::Prerequisite("compile_commands.json missing".into())));
        let (b, b_runs) = copy(Some(&c.mid), &c.end, Ok(()));
        s.add_artifact(ArtifactSpec::new("t/mid", a).with_outputs([c.mid.clone()]))
            .unwrap();
        s.add_artifact(ArtifactSpec::new("t/end", b).with_input("t/mid")).unwrap();

        let err = s.ensure("t/end").await.unwrap_err();
        assert!(matches!(err, SchedulerError::Prerequisite { ref artifact, .. } if artifact == "t/mid"));
        assert!(s.stamp("t/mid").unwrap().is_none());
        assert_eq!(b_runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cycle_is_rejected_and_rolled_back() {
        let c = chain();
        let mut s = Scheduler::new(&c.stamps, FreshnessMode::ContentHash);
        let (r, _) = copy(None, &c.mid, Ok(()));
        s.add_artifact(ArtifactSpec::new("a", r.clone()).with_input("c")).unwrap();
        s.add_artifact(ArtifactSpec::new("b", r.clone()).with_input("a")).unwrap();
        let err = s
            .add_artifact(ArtifactSpec::new("c", r.clone()).with_input("b"))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::DependencyCycle { .. }));
        assert!(!s.contains("c"));
        assert_eq!(s.artifacts(), ["a", "b"]);

        s.add_artifact(ArtifactSpec::new("c", r)).unwrap();
        assert_eq!(s.plan("b").unwrap(), vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn unknown_artifacts_are_errors() {
        let c = chain();
        let mut s = Scheduler::new(&c.stamps, FreshnessMode::ContentHash);
        let (r, _) = copy(None, &c.mid, Ok(()));
        s.add_artifact(ArtifactSpec::new("a", r).with_input("missing")).unwrap();
        assert!(matches!(
            s.ensure("nope").await.unwrap_err(),
            SchedulerError::UnknownArtifact(_)
        ));
        assert!(matches!(
            s.ensure("a").await.unwrap_err(),
            SchedulerError::UnknownInput { .. }
        ));
    }
}
