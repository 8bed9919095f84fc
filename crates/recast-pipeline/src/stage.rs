//! The fixed stage taxonomy and the rule behind each stage.
//!
//! Stages of one target run strictly in order:
//! extract → translate → wrap (libraries) → build → test → expand-corpus →
//! repair. Each is an artifact named `<target>/<stage>` in that target's
//! scheduler.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use recast_core::build::{self, BuildArtifact};
use recast_core::cas::fs::FsCasStore;
use recast_core::diagnostic::{Diagnostic, DiagnosticSource};
use recast_core::fuzz::CorpusManager;
use recast_core::repair::{RepairCycle, RepairDriver, RepairLog, RepairPolicy};
use recast_core::translate::{self, TranslationArtifact, TranslationStatus};
use recast_core::verify::{self, Subject, TestLog};
use recast_core::{
    exec, obs, wrapper, CommandSpec, Diagnostics, PipelineConfig, RecastError, Target, VectorStore, WorkDir,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::orchestrator::Services;
use crate::scheduler::{Rule, RuleError, Scheduler};

const PREPROCESS_TIMEOUT: Duration = Duration::from_secs(120);

/// Builtin pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinStage {
    /// Preprocess every unit and record the unit list.
    Extract,
    Translate,
    /// Synthesize C ABI shims; libraries only.
    Wrap,
    Build,
    Test,
    /// Fuzz the original executable and grow the corpus.
    ExpandCorpus,
    Repair,
}

impl BuiltinStage {
    pub const ALL: [BuiltinStage; 7] = [
        Self::Extract,
        Self::Translate,
        Self::Wrap,
        Self::Build,
        Self::Test,
        Self::ExpandCorpus,
        Self::Repair,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Extract => "extract",
            Self::Translate => "translate",
            Self::Wrap => "wrap",
            Self::Build => "build",
            Self::Test => "test",
            Self::ExpandCorpus => "expand_corpus",
            Self::Repair => "repair",
        }
    }

    /// Artifact name of this stage for `target`.
    pub fn artifact(&self, target: &str) -> String {
        format!("{target}/{}", self.name())
    }
}

impl fmt::Display for BuiltinStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything a stage rule of one target needs; passed explicitly, never
/// held in globals.
pub struct StageContext {
    pub target: Target,
    pub workdir: WorkDir,
    pub config: Arc<PipelineConfig>,
    pub services: Services,
}

impl StageContext {
    pub fn new(target: Target, config: Arc<PipelineConfig>, services: Services) -> Self {
        let workdir = WorkDir::for_target(&config.work_root, &target);
        Self {
            target,
            workdir,
            config,
            services,
        }
    }

    pub fn vectors_dir(&self) -> PathBuf {
        self.config.vectors_for(&self.target.name)
    }

    pub fn harness(&self) -> Option<&CommandSpec> {
        self.config.library_harness.get(&self.target.name)
    }

    /// Whether the test stage has something to run the vectors against.
    pub fn has_test_subject(&self) -> bool {
        !self.target.is_library() || self.harness().is_some()
    }

    /// Whether the corpus of this target can be grown by fuzzing.
    pub fn can_fuzz(&self) -> bool {
        self.config.fuzz.enabled
            && self.services.fuzz.is_some()
            && !self.target.is_library()
            && self.target.original.is_some()
    }

    pub fn repair_policy(&self) -> RepairPolicy {
        RepairPolicy {
            max_attempts: self.config.repair.max_attempts,
        }
    }
}

/// The rule of one builtin stage.
pub struct StageRule {
    stage: BuiltinStage,
    ctx: Arc<StageContext>,
}

impl StageRule {
    pub fn new(stage: BuiltinStage, ctx: Arc<StageContext>) -> Arc<Self> {
        Arc::new(Self { stage, ctx })
    }
}

#[async_trait]
impl Rule for StageRule {
    async fn produce(&self, scheduler: &Scheduler) -> Result<(), RuleError> {
        let target = &self.ctx.target.name;
        obs::emit_stage_started(target, self.stage.name());
        let started = Instant::now();

        self.ctx.workdir.create().map_err(RecastError::from)?;
        let result = match self.stage {
            BuiltinStage::Extract => extract(&self.ctx).await,
            BuiltinStage::Translate => run_translate(&self.ctx).await,
            BuiltinStage::Wrap => wrap(&self.ctx),
            BuiltinStage::Build => run_build(&self.ctx).await,
            BuiltinStage::Test => test(&self.ctx).await,
            BuiltinStage::ExpandCorpus => expand_corpus(&self.ctx).await,
            BuiltinStage::Repair => repair(&self.ctx, scheduler).await,
        };

        obs::emit_stage_finished(
            target,
            self.stage.name(),
            started.elapsed().as_millis() as u64,
            result.is_ok(),
        );
        if let Err(RuleError::Failed(reason)) = &result {
            warn!(target = %target, stage = %self.stage, reason = %reason, "stage failed");
        }
        result
    }
}

async fn extract(ctx: &StageContext) -> Result<(), RuleError> {
    if !ctx.config.compile_commands.exists() {
        return Err(RuleError::Prerequisite(format!(
            "compilation database {} is missing",
            ctx.config.compile_commands.display()
        )));
    }

    for unit in &ctx.target.units {
        if !unit.path.exists() {
            return Err(RuleError::Prerequisite(format!("source {} is missing", unit.path.display())));
        }
        let out = ctx.workdir.preprocessed(unit);
        let inv = unit
            .preprocess(&out, ctx.config.preprocessor.as_deref())
            .timeout(PREPROCESS_TIMEOUT);
        let preprocessed = match exec::run(&inv).await {
            Ok(result) if result.success() && out.exists() => true,
            Ok(result) => {
                let detail = format!("exit {:?}: {}", result.exit_code, result.stderr_lossy().trim());
                obs::emit_tooling_error("preprocessor", &detail);
                false
            }
            Err(e) => {
                obs::emit_tooling_error("preprocessor", &e);
                false
            }
        };
        if !preprocessed {
            // Translate from the raw unit instead.
            std::fs::copy(&unit.path, &out).map_err(RecastError::from)?;
        }
    }

    let units = serde_json::to_string_pretty(&ctx.target.units).map_err(RecastError::from)?;
    std::fs::write(ctx.workdir.units_record(), units).map_err(RecastError::from)?;
    Ok(())
}

async fn run_translate(ctx: &StageContext) -> Result<(), RuleError> {
    let Some(generator) = ctx.services.translator.as_deref() else {
        return Err(RuleError::Prerequisite("no translator configured".into()));
    };
    let artifact = translate::translate(
        generator,
        &ctx.target,
        &ctx.workdir,
        &ctx.config.target_language,
    )
    .await?;

    // A new translation gets a fresh repair budget.
    RepairLog::new(&ctx.target.name, &ctx.repair_policy()).save(&ctx.workdir)?;

    match artifact.status {
        TranslationStatus::Failed => Err(RuleError::Failed(
            artifact.error.unwrap_or_else(|| "translation failed".into()),
        )),
        _ => Ok(()),
    }
}

fn wrap(ctx: &StageContext) -> Result<(), RuleError> {
    let translation = TranslationArtifact::load(&ctx.workdir)?;
    if !matches!(translation, Some(ref t) if t.status != TranslationStatus::Failed) {
        return Err(RuleError::Failed("no translation to wrap".into()));
    }

    let rust = std::fs::read_to_string(ctx.workdir.primary_source()).map_err(RecastError::from)?;
    let c_source = translate::load_sources(&ctx.target, &ctx.workdir)?
        .into_iter()
        .map(|u| u.text)
        .collect::<Vec<_>>()
        .join("\n");
    let artifact = wrapper::synthesize(&ctx.target, &rust, &c_source);
    artifact.write(&ctx.workdir)?;

    if artifact.has_errors() {
        let errors: Vec<String> = artifact
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.symbol, e.reason))
            .collect();
        return Err(RuleError::Failed(
            RecastError::Synthesis {
                target: ctx.target.name.clone(),
                errors,
            }
            .to_string(),
        ));
    }
    Ok(())
}

async fn run_build(ctx: &StageContext) -> Result<(), RuleError> {
    let translation = TranslationArtifact::load(&ctx.workdir)?;
    let reason = match &translation {
        None => Some("no translation".to_string()),
        Some(t) if t.status == TranslationStatus::Failed => Some(format!(
            "translation failed: {}",
            t.error.as_deref().unwrap_or("unknown error")
        )),
        Some(_) => None,
    };
    if let Some(reason) = reason {
        BuildArtifact::not_attempted(&ctx.target.name, &ctx.workdir, &reason)?;
        return Ok(());
    }

    let artifact = build::build(
        &ctx.target.name,
        &ctx.workdir,
        &ctx.config.build,
        ctx.config.build_classification,
    )
    .await?;
    debug!(target = %ctx.target.name, status = ?artifact.status, "build finished");
    Ok(())
}

async fn test(ctx: &StageContext) -> Result<(), RuleError> {
    let build = BuildArtifact::load(&ctx.workdir.build_record())?;
    let log_path = ctx.workdir.test_log();
    let target = &ctx.target.name;

    let log = match build {
        Some(build) if !build.failed() => {
            let subject = match ctx.harness() {
                _ if !ctx.target.is_library() => {
                    Subject::Executable(build.binary.unwrap_or_else(|| ctx.workdir.built_binary()))
                }
                Some(harness) => Subject::Library {
                    harness: harness.clone(),
                    library: ctx.workdir.built_binary(),
                },
                None => {
                    debug!(target = %target, "library has no harness, nothing to run");
                    return Ok(());
                }
            };
            let vectors = VectorStore::open(ctx.vectors_dir())?.load_all()?;
            let results = verify::run_vectors(&subject, &vectors, ctx.config.test_timeout()).await;
            TestLog::new(false, results)
        }
        _ => TestLog::new(true, Vec::new()),
    };

    log.write(&log_path)?;
    obs::emit_status_classified(target, log.status().as_str(), log.passed(), log.results.len());
    Ok(())
}

async fn expand_corpus(ctx: &StageContext) -> Result<(), RuleError> {
    let (Some(backend), Some(original)) = (ctx.services.fuzz.as_deref(), ctx.target.original.as_ref()) else {
        return Ok(());
    };
    let store = VectorStore::open(ctx.vectors_dir())?;
    let manager = CorpusManager::new(backend, original, ctx.config.test_timeout());
    let report = manager
        .expand(
            &ctx.target.name,
            &store,
            &ctx.workdir.fuzz_dir(),
            ctx.config.fuzz.time_budget(),
        )
        .await?;
    report.save(&ctx.workdir.corpus_record())?;

    match report.error {
        Some(error) => Err(RuleError::Failed(error)),
        None => Ok(()),
    }
}

/// What is wrong with the target right now; empty when it builds and
/// every vector passes.
pub fn current_diagnostics(workdir: &WorkDir) -> recast_core::Result<Diagnostics> {
    match BuildArtifact::load(&workdir.build_record())? {
        None => Ok(Diagnostics(vec![Diagnostic::error(
            DiagnosticSource::Build,
            "build did not run",
        )])),
        Some(build) if build.failed() => {
            let log = std::fs::read_to_string(&build.log_path).unwrap_or_default();
            Ok(Diagnostics::from_build(&build, &log))
        }
        Some(_) => Ok(TestLog::read(&workdir.test_log())?
            .map(|log| Diagnostics::from_tests(&log.results))
            .unwrap_or_default()),
    }
}

/// Rebuild and retest through the scheduler after each accepted repair.
struct ScheduledCycle<'a> {
    scheduler: &'a Scheduler,
    ctx: &'a StageContext,
}

#[async_trait]
impl RepairCycle for ScheduledCycle<'_> {
    async fn verify(&mut self) -> recast_core::Result<Option<Diagnostics>> {
        let test = BuiltinStage::Test.artifact(&self.ctx.target.name);
        self.scheduler.reset_session().await;
        self.scheduler
            .ensure(&test)
            .await
            .map_err(|e| RecastError::tooling("scheduler", e.to_string()))?;
        let diagnostics = current_diagnostics(&self.ctx.workdir)?;
        Ok((!diagnostics.is_empty()).then_some(diagnostics))
    }
}

async fn repair(ctx: &StageContext, scheduler: &Scheduler) -> Result<(), RuleError> {
    match TranslationArtifact::load(&ctx.workdir)? {
        Some(t) if t.status != TranslationStatus::Failed => {}
        _ => return Ok(()),
    }
    let Some(generator) = ctx
        .services
        .repairer
        .as_deref()
        .or(ctx.services.translator.as_deref())
    else {
        return Err(RuleError::Failed("no repair service configured".into()));
    };

    let policy = ctx.repair_policy();
    let blobs = FsCasStore::new(ctx.config.blobs_dir()).map_err(RecastError::from)?;
    let initial = current_diagnostics(&ctx.workdir)?;
    let mut cycle = ScheduledCycle { scheduler, ctx };
    let log = RepairDriver::new(generator, &policy, &blobs, &ctx.config.target_language)
        .run(&ctx.target, &ctx.workdir, initial, &mut cycle)
        .await?;
    debug!(target = %ctx.target.name, outcome = ?log.outcome, "repair finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_names_and_artifacts() {
        assert_eq!(BuiltinStage::ExpandCorpus.name(), "expand_corpus");
        assert_eq!(BuiltinStage::Build.artifact("libcalc"), "libcalc/build");
        assert_eq!(BuiltinStage::Repair.to_string(), "repair");
    }

    #[test]
    fn stages_are_ordered_by_execution() {
        let mut shuffled = vec![
            BuiltinStage::Repair,
            BuiltinStage::Extract,
            BuiltinStage::Test,
            BuiltinStage::Wrap,
        ];
        shuffled.sort();
        assert_eq!(
            shuffled,
            vec![
                BuiltinStage::Extract,
                BuiltinStage::Wrap,
                BuiltinStage::Test,
                BuiltinStage::Repair
            ]
        );
        assert!(BuiltinStage::ALL.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn missing_build_record_is_a_diagnostic() {
        let dir = tempfile::tempdir().unwrap();
        let unit = recast_core::CompileUnit {
            path: dir.path().join("a.c"),
            directory: dir.path().to_path_buf(),
            arguments: vec!["cc".into()],
            output: None,
            target: "a".into(),
        };
        let target = Target::new("a", recast_core::TargetKind::Executable, vec![unit]).unwrap();
        let workdir = WorkDir::for_target(dir.path(), &target);
        workdir.create().unwrap();
        let diagnostics = current_diagnostics(&workdir).unwrap();
        assert_eq!(diagnostics.len(), 1);
    }
}
