//! Coverage-guided growth of a target's test-vector corpus.
//!
//! The original executable is the oracle: every input the fuzzer finds
//! that reaches a coverage class not seen before is replayed against the
//! original, and whatever it prints becomes the expected output of a new
//! vector. A bug in the original is therefore recorded as expected
//! behaviour; fuzz vectors carry `oracle: "original"` so this stays visible.
//!
//! Fuzzer and coverage failures are logged and skipped. Corpus growth never
//! blocks the translate/build/test cycle.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::cas::{Digest, DigestBuilder};
use crate::config::{CommandSpec, FuzzConfig};
use crate::error::{RecastError, Result};
use crate::exec::{self, Invocation};
use crate::obs;
use crate::testvec::{AddOutcome, ExpectedOutput, TestVector, VectorOrigin, VectorStore};

/// Set of edge ids hit by one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoverageMap(BTreeSet<u32>);

impl CoverageMap {
    pub fn from_edges(edges: impl IntoIterator<Item = u32>) -> Self {
        Self(edges.into_iter().collect())
    }

    /// Parse `afl-showmap` output: one `edge:count` pair per line.
    pub fn parse_showmap(text: &str) -> Self {
        Self(
            text.lines()
                .filter_map(|line| line.split(':').next())
                .filter_map(|id| id.trim().parse().ok())
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Identity of the coverage class.
    pub fn digest(&self) -> Digest {
        let mut builder = DigestBuilder::new();
        for edge in &self.0 {
            builder.push(&edge.to_le_bytes());
        }
        builder.finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredInput {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// A minimized seed and the class it represents.
#[derive(Debug, Clone)]
pub struct Seed {
    pub name: String,
    pub input: Vec<u8>,
    pub coverage: CoverageMap,
}

#[async_trait]
pub trait FuzzBackend: Send + Sync {
    /// Coverage of one run of `exe` with `input` on stdin.
    async fn coverage(&self, exe: &Path, input: &[u8]) -> Result<CoverageMap>;

    /// Run a campaign for at most `budget`; returns every queued input.
    async fn fuzz(&self, exe: &Path, seeds: &Path, out: &Path, budget: Duration) -> Result<Vec<DiscoveredInput>>;
}

/// Grace period on top of the campaign budget before the fuzzer is killed.
const CAMPAIGN_GRACE: Duration = Duration::from_secs(30);

/// `afl-showmap` for coverage and `afl-fuzz` for campaigns.
pub struct AflBackend {
    showmap: CommandSpec,
    fuzzer: CommandSpec,
    exec_timeout: Duration,
}

impl AflBackend {
    pub fn new(config: &FuzzConfig, exec_timeout: Duration) -> Self {
        Self {
            showmap: config.showmap.clone(),
            fuzzer: config.fuzzer.clone(),
            exec_timeout,
        }
    }
}

#[async_trait]
impl FuzzBackend for AflBackend {
    async fn coverage(&self, exe: &Path, input: &[u8]) -> Result<CoverageMap> {
        let scratch = tempfile::tempdir()?;
        let map = scratch.path().join("map");
        let mut vars = HashMap::new();
        vars.insert("map", map.to_string_lossy().into_owned());
        vars.insert("exe", exe.to_string_lossy().into_owned());
        vars.insert("timeout_ms", self.exec_timeout.as_millis().to_string());
        let inv = self
            .showmap
            .render(&vars)
            .stdin(input.to_vec())
            .timeout(self.exec_timeout + self.exec_timeout);

        // showmap exits non-zero when the target crashes; the map is still valid.
        let out = exec::run(&inv).await?;
        match std::fs::read_to_string(&map) {
            Ok(text) => Ok(CoverageMap::parse_showmap(&text)),
            Err(_) => Err(RecastError::tooling(
                &self.showmap.program,
                format!("no coverage map produced: {}", out.stderr_lossy().trim()),
            )),
        }
    }

    async fn fuzz(&self, exe: &Path, seeds: &Path, out: &Path, budget: Duration) -> Result<Vec<DiscoveredInput>> {
        std::fs::create_dir_all(out)?;
        let mut vars = HashMap::new();
        vars.insert("seeds", seeds.to_string_lossy().into_owned());
        vars.insert("out", out.to_string_lossy().into_owned());
        vars.insert("exe", exe.to_string_lossy().into_owned());
        vars.insert("budget_secs", budget.as_secs().max(1).to_string());
        let inv = self
            .fuzzer
            .render(&vars)
            .env("AFL_NO_UI", "1")
            .env("AFL_SKIP_CPUFREQ", "1")
            .env("AFL_I_DONT_CARE_ABOUT_MISSING_CRASHES", "1")
            .timeout(budget + CAMPAIGN_GRACE);

        let result = exec::run(&inv).await?;
        if result.timed_out {
            warn!(fuzzer = %self.fuzzer.program, "campaign overran its budget and was stopped");
        } else if !result.success() {
            return Err(RecastError::tooling(
                &self.fuzzer.program,
                format!("exited with {:?}: {}", result.exit_code, result.stderr_lossy().trim()),
            ));
        }
        collect_queue(out)
    }
}

/// Every `id:*` file under a `queue/` directory of `out`. Crashes and hangs
/// are ignored.
pub fn collect_queue(out: &Path) -> Result<Vec<DiscoveredInput>> {
    let mut found = Vec::new();
    for entry in WalkDir::new(out).sort_by_file_name() {
        let entry = entry.map_err(|e| RecastError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let in_queue = entry
            .path()
            .parent()
            .and_then(Path::file_name)
            .is_some_and(|d| d == "queue");
        let name = entry.file_name().to_string_lossy().into_owned();
        if in_queue && name.starts_with("id:") {
            found.push(DiscoveredInput {
                name,
                bytes: std::fs::read(entry.path())?,
            });
        }
    }
    Ok(found)
}

/// Summary of one expansion, persisted as `corpus.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExpansionReport {
    pub target: String,
    pub seeds: usize,
    pub discovered: usize,
    pub added: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl ExpansionReport {
    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Drives minimization, fuzzing and extraction for one target.
pub struct CorpusManager<'a> {
    backend: &'a dyn FuzzBackend,
    original: PathBuf,
    timeout: Duration,
}

impl<'a> CorpusManager<'a> {
    pub fn new(backend: &'a dyn FuzzBackend, original: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            backend,
            original: original.into(),
            timeout,
        }
    }

    /// Keep one vector per coverage class, taking the first by name.
    pub async fn minimize_seeds(&self, vectors: &[TestVector]) -> Vec<Seed> {
        let mut ordered: Vec<&TestVector> = vectors.iter().filter(|v| v.is_runnable()).collect();
        ordered.sort_by(|a, b| a.name.cmp(&b.name));

        let mut seen = HashSet::new();
        let mut seeds = Vec::new();
        for vector in ordered {
            match self.backend.coverage(&self.original, &vector.stdin).await {
                Ok(coverage) => {
                    if seen.insert(coverage.digest()) {
                        seeds.push(Seed {
                            name: vector.name.clone(),
                            input: vector.stdin.clone(),
                            coverage,
                        });
                    }
                }
                Err(e) => obs::emit_tooling_error("coverage", &e),
            }
        }
        seeds
    }

    /// Write `seeds` into `<dir>/seeds` and run one campaign into
    /// `<dir>/out`.
    pub async fn fuzz(&self, seeds: &[Seed], dir: &Path, budget: Duration) -> Result<Vec<DiscoveredInput>> {
        let seed_dir = dir.join("seeds");
        std::fs::create_dir_all(&seed_dir)?;
        for seed in seeds {
            std::fs::write(seed_dir.join(&seed.name), &seed.input)?;
        }
        if seeds.is_empty() {
            // The fuzzer refuses an empty seed directory.
            std::fs::write(seed_dir.join("empty"), b"\n")?;
        }
        self.backend
            .fuzz(&self.original, &seed_dir, &dir.join("out"), budget)
            .await
    }

    /// Turn inputs with unseen coverage into stored vectors; `known` holds
    /// the classes already represented and grows as vectors are added.
    /// Returns the names of the vectors added.
    pub async fn extract(
        &self,
        target: &str,
        store: &VectorStore,
        known: &mut HashSet<Digest>,
        inputs: &[DiscoveredInput],
    ) -> Result<Vec<String>> {
        let mut added = Vec::new();
        for input in inputs {
            let class = match self.backend.coverage(&self.original, &input.bytes).await {
                Ok(coverage) => coverage.digest(),
                Err(e) => {
                    obs::emit_tooling_error("coverage", &e);
                    continue;
                }
            };
            if known.contains(&class) {
                continue;
            }

            let Some(vector) = self.observe(input).await else {
                continue;
            };
            match store.add(&vector).await {
                Ok(AddOutcome::Added) => {
                    obs::emit_vector_added(target, &vector.name, vector.origin.as_str());
                    added.push(vector.name.clone());
                }
                Ok(AddOutcome::AlreadyPresent) => {}
                Err(RecastError::VectorConflict(name)) => {
                    warn!(target = %target, vector = %name, "fuzz vector name collides with a different vector");
                    continue;
                }
                Err(e) => return Err(e),
            }
            known.insert(class);
        }
        Ok(added)
    }

    /// Replay `input` on the original and record what it did.
    async fn observe(&self, input: &DiscoveredInput) -> Option<TestVector> {
        let inv = Invocation::new(self.original.to_string_lossy())
            .stdin(input.bytes.clone())
            .timeout(self.timeout);
        let out = match exec::run(&inv).await {
            Ok(out) => out,
            Err(e) => {
                obs::emit_tooling_error("original", &e);
                return None;
            }
        };
        if out.timed_out {
            debug!(input = %input.name, "original timed out, input skipped");
            return None;
        }
        let mut vector = TestVector::new(
            format!("fuzz-{}", Digest::compute(&input.bytes).short()),
            ExpectedOutput::Exact(out.stdout_lossy()),
        )
        .with_stdin(input.bytes.clone())
        .with_origin(VectorOrigin::Fuzz);
        if let Some(code) = out.exit_code {
            vector = vector.with_ret(code);
        }
        Some(vector)
    }

    /// Minimize, fuzz for `budget` under `fuzz_dir`, and extract. Tooling
    /// failures end up in the report, not as errors.
    pub async fn expand(
        &self,
        target: &str,
        store: &VectorStore,
        fuzz_dir: &Path,
        budget: Duration,
    ) -> Result<ExpansionReport> {
        let vectors = store.load_all()?;
        let seeds = self.minimize_seeds(&vectors).await;
        let mut known: HashSet<Digest> = seeds.iter().map(|s| s.coverage.digest()).collect();

        let mut report = ExpansionReport {
            target: target.to_string(),
            seeds: seeds.len(),
            discovered: 0,
            added: Vec::new(),
            error: None,
            finished_at: Utc::now(),
        };

        match self.fuzz(&seeds, fuzz_dir, budget).await {
            Ok(discovered) => {
                report.discovered = discovered.len();
                report.added = self.extract(target, store, &mut known, &discovered).await?;
            }
            Err(e) => {
                obs::emit_tooling_error("fuzzer", &e);
                report.error = Some(e.to_string());
            }
        }
        report.finished_at = Utc::now();
        Ok(report)
    }
}
