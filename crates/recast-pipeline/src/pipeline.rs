//! One target's stage chain.
//!
//! The chain is registered in a scheduler of its own, so targets never
//! share session state. Stamps from every target live side by side in the
//! configured stamps directory.

use std::sync::Arc;

use recast_core::{PipelineConfig, Target, WorkDir};
use tracing::info;

use crate::error::SchedulerResult;
use crate::orchestrator::Services;
use crate::report::TargetReport;
use crate::scheduler::{ArtifactSpec, EnsureOutcome, Scheduler};
use crate::stage::{BuiltinStage, StageContext, StageRule};

pub struct TargetPipeline {
    ctx: Arc<StageContext>,
    scheduler: Scheduler,
}

impl TargetPipeline {
    pub fn new(target: Target, config: Arc<PipelineConfig>, services: Services) -> SchedulerResult<Self> {
        let scheduler = Scheduler::new(config.stamps_dir(), config.freshness);
        let ctx = Arc::new(StageContext::new(target, config, services));
        let mut pipeline = Self { ctx, scheduler };
        pipeline.register()?;
        Ok(pipeline)
    }

    /// Re-run stages whose last run failed even when their inputs did not
    /// change.
    pub fn with_retry_failed(mut self, retry: bool) -> Self {
        self.scheduler = self.scheduler.with_retry_failed(retry);
        self
    }

    pub fn target(&self) -> &Target {
        &self.ctx.target
    }

    pub fn workdir(&self) -> &WorkDir {
        &self.ctx.workdir
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    fn artifact(&self, stage: BuiltinStage) -> String {
        stage.artifact(&self.ctx.target.name)
    }

    fn register(&mut self) -> SchedulerResult<()> {
        let ctx = self.ctx.clone();
        let wd = &ctx.workdir;
        let config = &ctx.config;
        let target = &ctx.target;
        let rule = |stage| StageRule::new(stage, ctx.clone());
        let name = |stage: BuiltinStage| stage.artifact(&target.name);

        let mut extract = ArtifactSpec::new(name(BuiltinStage::Extract), rule(BuiltinStage::Extract))
            .with_sources([config.compile_commands.clone()])
            .with_sources(target.units.iter().map(|u| u.path.clone()))
            .with_outputs([wd.units_record()])
            .with_outputs(target.units.iter().map(|u| wd.preprocessed(u)))
            .with_param(config.preprocessor.clone().unwrap_or_default());
        for unit in &target.units {
            extract = extract.with_param(unit.arguments.join(" "));
        }
        self.scheduler.add_artifact(extract)?;

        let translator = format!("{:?}", config.translator);
        self.scheduler.add_artifact(
            ArtifactSpec::new(name(BuiltinStage::Translate), rule(BuiltinStage::Translate))
                .with_input(name(BuiltinStage::Extract))
                .with_outputs([wd.translation_record(), wd.manifest(), wd.primary_source()])
                .with_param(translator)
                .with_param(config.target_language.clone())
                .with_param(target.exported_symbols.join(",")),
        )?;

        let mut build = ArtifactSpec::new(name(BuiltinStage::Build), rule(BuiltinStage::Build))
            .with_input(name(BuiltinStage::Translate))
            .with_outputs([wd.build_log(), wd.build_record()])
            .with_param(format!("{:?}", config.build))
            .with_param(format!("{:?}", config.build_classification));
        if target.is_library() {
            self.scheduler.add_artifact(
                ArtifactSpec::new(name(BuiltinStage::Wrap), rule(BuiltinStage::Wrap))
                    .with_input(name(BuiltinStage::Translate))
                    .with_outputs([wd.wrapper_source(), wd.wrapper_record()]),
            )?;
            build = build.with_input(name(BuiltinStage::Wrap));
        }
        self.scheduler.add_artifact(build)?;

        let mut test = ArtifactSpec::new(name(BuiltinStage::Test), rule(BuiltinStage::Test))
            .with_input(name(BuiltinStage::Build))
            .with_sources([ctx.vectors_dir()])
            .with_param(format!("{:?}", ctx.harness()))
            .with_param(config.test_timeout_secs.to_string());
        if ctx.has_test_subject() {
            test = test.with_outputs([wd.test_log()]);
        }
        self.scheduler.add_artifact(test)?;

        if ctx.can_fuzz() {
            self.scheduler.add_artifact(
                ArtifactSpec::new(name(BuiltinStage::ExpandCorpus), rule(BuiltinStage::ExpandCorpus))
                    .with_sources(target.original.clone())
                    .with_sources([ctx.vectors_dir()])
                    .with_outputs([wd.corpus_record()])
                    .with_param(config.fuzz.time_budget_secs.to_string()),
            )?;
        }

        self.scheduler.add_artifact(
            ArtifactSpec::new(name(BuiltinStage::Repair), rule(BuiltinStage::Repair))
                .with_input(name(BuiltinStage::Test))
                .with_outputs([wd.repair_record()])
                .with_param(config.repair.max_attempts.to_string())
                .with_param(format!("{:?}", config.repair_command())),
        )?;
        Ok(())
    }

    /// Stages registered for this target, in execution order.
    pub fn stages(&self) -> Vec<BuiltinStage> {
        BuiltinStage::ALL
            .into_iter()
            .filter(|s| self.scheduler.contains(&self.artifact(*s)))
            .collect()
    }

    /// Ensure a single stage (and whatever it depends on). `None` when the
    /// stage does not apply to this target.
    pub async fn ensure_stage(&self, stage: BuiltinStage) -> SchedulerResult<Option<EnsureOutcome>> {
        let name = self.artifact(stage);
        if !self.scheduler.contains(&name) {
            return Ok(None);
        }
        self.scheduler.ensure(&name).await.map(Some)
    }

    /// Run every stage up to and including `last`, in order. New corpus
    /// vectors send the chain back through the test stage before repair.
    pub async fn run(&self, last: BuiltinStage) -> SchedulerResult<()> {
        for stage in self.stages().into_iter().filter(|s| *s <= last) {
            let outcome = self.ensure_stage(stage).await?;
            if stage == BuiltinStage::ExpandCorpus && outcome == Some(EnsureOutcome::Built) {
                info!(target = %self.ctx.target.name, "corpus changed, re-testing");
                self.scheduler.reset_session().await;
                self.ensure_stage(BuiltinStage::Test).await?;
            }
        }
        Ok(())
    }

    /// Drop every stamp of this target so the next run starts over.
    pub fn forget(&self) -> SchedulerResult<()> {
        for stage in self.stages() {
            self.scheduler.forget(&self.artifact(stage))?;
        }
        Ok(())
    }

    pub fn report(&self) -> TargetReport {
        TargetReport::collect(&self.ctx.target, &self.ctx.workdir, &self.ctx.config)
    }
}
