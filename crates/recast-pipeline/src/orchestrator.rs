//! Bounded parallel execution across targets.
//!
//! Each target gets its own [`TargetPipeline`]; up to `concurrency` of
//! them run at once. One target failing never stops the others, and the
//! report lists targets in the order they were given.

use std::sync::Arc;

use recast_core::compdb::CompilationDatabase;
use recast_core::fuzz::{AflBackend, FuzzBackend};
use recast_core::translate::{CodeGenerator, CommandGenerator};
use recast_core::{target, PipelineConfig, Target, TargetSpan};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, Instrument};

use crate::error::SchedulerResult;
use crate::pipeline::TargetPipeline;
use crate::report::{RunReport, TargetReport};
use crate::stage::BuiltinStage;

/// External services the stages call out to. Injected so tests can
/// substitute fakes.
#[derive(Clone, Default)]
pub struct Services {
    pub translator: Option<Arc<dyn CodeGenerator>>,
    /// Falls back to `translator` when absent.
    pub repairer: Option<Arc<dyn CodeGenerator>>,
    pub fuzz: Option<Arc<dyn FuzzBackend>>,
}

impl Services {
    /// Command-backed services as configured.
    pub fn from_config(config: &PipelineConfig) -> Self {
        let translator = config
            .translator
            .clone()
            .map(|cmd| Arc::new(CommandGenerator::new(cmd)) as Arc<dyn CodeGenerator>);
        let repairer = config
            .repair
            .command
            .clone()
            .map(|cmd| Arc::new(CommandGenerator::new(cmd)) as Arc<dyn CodeGenerator>);
        let fuzz = config.fuzz.enabled.then(|| {
            Arc::new(AflBackend::new(&config.fuzz, config.test_timeout())) as Arc<dyn FuzzBackend>
        });
        Self {
            translator,
            repairer,
            fuzz,
        }
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("translator", &self.translator.is_some())
            .field("repairer", &self.repairer.is_some())
            .field("fuzz", &self.fuzz.is_some())
            .finish()
    }
}

/// Read the compilation database and derive the prioritized target list.
pub async fn load_targets(config: &PipelineConfig) -> recast_core::Result<Vec<Target>> {
    let db = CompilationDatabase::load(&config.compile_commands)?;
    target::build_targets(&db, config).await
}

pub struct Orchestrator {
    config: Arc<PipelineConfig>,
    services: Services,
    retry_failed: bool,
}

impl Orchestrator {
    pub fn new(config: PipelineConfig, services: Services) -> Self {
        Self {
            config: Arc::new(config),
            services,
            retry_failed: false,
        }
    }

    pub fn with_retry_failed(mut self, retry: bool) -> Self {
        self.retry_failed = retry;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn pipeline(&self, target: Target) -> SchedulerResult<TargetPipeline> {
        Ok(TargetPipeline::new(target, self.config.clone(), self.services.clone())?
            .with_retry_failed(self.retry_failed))
    }

    /// Run every target through `last` and report where each ended up.
    pub async fn run(&self, targets: Vec<Target>, last: BuiltinStage) -> RunReport {
        let total = targets.len();
        let limit = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        info!(event = "run.started", targets = total, through = %last, concurrency = self.config.concurrency);

        let mut join_set = JoinSet::new();
        for (idx, target) in targets.iter().cloned().enumerate() {
            let limit = Arc::clone(&limit);
            let config = Arc::clone(&self.config);
            let services = self.services.clone();
            let retry_failed = self.retry_failed;
            let span = TargetSpan::span(&target.name, target.kind.as_str());
            join_set.spawn(
                async move {
                    let _permit = match limit.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(e) => return (idx, TargetReport::aborted(&target, &config, &e.to_string())),
                    };
                    let outcome = match TargetPipeline::new(target.clone(), config.clone(), services) {
                        Ok(pipeline) => {
                            let pipeline = pipeline.with_retry_failed(retry_failed);
                            pipeline.run(last).await.map(|()| pipeline.report())
                        }
                        Err(e) => Err(e),
                    };
                    match outcome {
                        Ok(report) => (idx, report),
                        Err(e) => {
                            error!(target = %target.name, error = %e, "target aborted");
                            (idx, TargetReport::aborted(&target, &config, &e.to_string()))
                        }
                    }
                }
                .instrument(span),
            );
        }

        let mut slots: Vec<Option<TargetReport>> = vec![None; total];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((idx, report)) => slots[idx] = Some(report),
                Err(e) => error!(error = %e, "target task panicked"),
            }
        }
        let reports = slots
            .into_iter()
            .zip(&targets)
            .map(|(slot, target)| {
                slot.unwrap_or_else(|| TargetReport::aborted(target, &self.config, "target task panicked"))
            })
            .collect();

        let report = RunReport::new(reports);
        info!(
            event = "run.finished",
            complete = report.counts.complete,
            partial = report.counts.partial,
            failed = report.counts.failed,
            missing = report.counts.missing,
        );
        report
    }

    /// Report the persisted state of every target without running anything.
    pub fn status(&self, targets: &[Target]) -> RunReport {
        let reports = targets
            .iter()
            .map(|t| {
                let workdir = recast_core::WorkDir::for_target(&self.config.work_root, t);
                TargetReport::collect(t, &workdir, &self.config)
            })
            .collect();
        RunReport::new(reports)
    }

    /// Drop the stamps of `targets` so their next run starts from scratch.
    pub fn forget(&self, targets: &[Target]) -> SchedulerResult<()> {
        for target in targets {
            self.pipeline(target.clone())?.forget()?;
        }
        Ok(())
    }
}
