//! Per-target and per-run reports, recomputed from the artifacts on disk and
//! written as `report.json` and `report.md`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use recast_core::repair::RepairLog;
use recast_core::verify::TestLog;
use recast_core::{
    BuildArtifact, BuildStatus, CompletionStatus, PipelineConfig, Target, TargetKind, TranslationArtifact,
    TranslationStatus, VectorStore, WorkDir, WrapperArtifact,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where one target stands, recomputed from the artifacts on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetReport {
    pub target: String,
    pub kind: TargetKind,
    pub workdir: PathBuf,
    pub status: CompletionStatus,
    pub translation: Option<TranslationStatus>,
    pub build: Option<BuildStatus>,
    pub passed: usize,
    pub total: usize,
    pub repair_attempts: u32,
    pub repair_outcome: Option<String>,
    pub wrapper_errors: usize,
    pub vectors: usize,
    /// Why the target stopped, or why its artifacts could not be read.
    pub error: Option<String>,
}

impl TargetReport {
    pub fn collect(target: &Target, workdir: &WorkDir, config: &PipelineConfig) -> Self {
        let mut report = Self::empty(target, workdir, config);
        if let Err(e) = report.fill(workdir) {
            report.error = Some(e.to_string());
        }
        report
    }

    /// A target whose run stopped before it could be classified. Once a
    /// stage has run, an abort counts as FAILED rather than MISSING.
    pub fn aborted(target: &Target, config: &PipelineConfig, error: &str) -> Self {
        let workdir = WorkDir::for_target(&config.work_root, target);
        let mut report = Self::collect(target, &workdir, config);
        if report.status == CompletionStatus::Missing && workdir.units_record().exists() {
            report.status = CompletionStatus::Failed;
        }
        report.error = Some(error.to_string());
        report
    }

    fn empty(target: &Target, workdir: &WorkDir, config: &PipelineConfig) -> Self {
        let vectors_dir = config.vectors_for(&target.name);
        let vectors = if vectors_dir.is_dir() {
            VectorStore::open(vectors_dir)
                .and_then(|store| store.files())
                .map(|files| files.len())
                .unwrap_or(0)
        } else {
            0
        };
        Self {
            target: target.name.clone(),
            kind: target.kind,
            workdir: workdir.root().to_path_buf(),
            status: CompletionStatus::Missing,
            translation: None,
            build: None,
            passed: 0,
            total: 0,
            repair_attempts: 0,
            repair_outcome: None,
            wrapper_errors: 0,
            vectors,
            error: None,
        }
    }

    fn fill(&mut self, workdir: &WorkDir) -> recast_core::Result<()> {
        let build = BuildArtifact::load(&workdir.build_record())?;
        self.build = build.as_ref().map(|b| b.status);
        let translation = TranslationArtifact::load(workdir)?;
        self.translation = translation.as_ref().map(|t| t.effective_status(build.as_ref()));

        if let Some(log) = TestLog::read(&workdir.test_log())? {
            self.passed = log.passed();
            self.total = log.results.len();
            self.status = log.status();
        }
        let failed = self.translation == Some(TranslationStatus::Failed)
            || build.as_ref().is_some_and(|b| b.failed());
        if failed {
            self.status = CompletionStatus::Failed;
        }

        if let Some(repair) = RepairLog::load(workdir)? {
            self.repair_attempts = repair.attempts_used();
            self.repair_outcome = serde_json::to_value(&repair.outcome)?
                .get("type")
                .and_then(|t| t.as_str())
                .map(str::to_string);
        }
        if let Some(wrapper) = WrapperArtifact::load(workdir)? {
            self.wrapper_errors = wrapper.errors.len();
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusCounts {
    pub missing: usize,
    pub complete: usize,
    pub partial: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn tally<'a>(reports: impl IntoIterator<Item = &'a TargetReport>) -> Self {
        let mut counts = Self::default();
        for report in reports {
            match report.status {
                CompletionStatus::Missing => counts.missing += 1,
                CompletionStatus::Complete => counts.complete += 1,
                CompletionStatus::Partial => counts.partial += 1,
                CompletionStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.missing + self.complete + self.partial + self.failed
    }
}

/// Aggregate report of one run, written as `report.json` and `report.md`
/// under the work root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunReport {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub counts: StatusCounts,
    pub targets: Vec<TargetReport>,
}

impl RunReport {
    pub fn new(targets: Vec<TargetReport>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            generated_at: Utc::now(),
            counts: StatusCounts::tally(&targets),
            targets,
        }
    }

    pub fn target(&self, name: &str) -> Option<&TargetReport> {
        self.targets.iter().find(|t| t.target == name)
    }

    pub fn render_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str("# Recast Report\n\n");
        out.push_str(&format!(
            "- complete: {}\n- partial: {}\n- failed: {}\n- missing: {}\n\n",
            self.counts.complete, self.counts.partial, self.counts.failed, self.counts.missing
        ));
        if self.targets.is_empty() {
            return out;
        }

        out.push_str("| target | kind | status | tests | repairs |\n");
        out.push_str("|---|---|---|---|---|\n");
        for t in &self.targets {
            out.push_str(&format!(
                "| `{}` | {} | {} | {}/{} | {} |\n",
                t.target, t.kind, t.status, t.passed, t.total, t.repair_attempts
            ));
        }

        let errors: Vec<&TargetReport> = self.targets.iter().filter(|t| t.error.is_some()).collect();
        if !errors.is_empty() {
            out.push_str("\n## Errors\n");
            for t in errors {
                out.push_str(&format!("- `{}`: {}\n", t.target, t.error.as_deref().unwrap_or_default()));
            }
        }
        out
    }

    pub fn write(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir).with_context(|| format!("create {:?}", dir))?;
        let json_path = dir.join("report.json");
        let content = serde_json::to_string_pretty(self).context("serialize run report")?;
        std::fs::write(&json_path, content).with_context(|| format!("write {:?}", json_path))?;
        let md_path = dir.join("report.md");
        std::fs::write(&md_path, self.render_markdown()).with_context(|| format!("write {:?}", md_path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(name: &str, status: CompletionStatus, passed: usize, total: usize) -> TargetReport {
        TargetReport {
            target: name.to_string(),
            kind: TargetKind::Executable,
            workdir: PathBuf::from(format!("/w/{name}")),
            status,
            translation: Some(TranslationStatus::Succeeded),
            build: Some(BuildStatus::Success),
            passed,
            total,
            repair_attempts: 0,
            repair_outcome: None,
            wrapper_errors: 0,
            vectors: total,
            error: None,
        }
    }

    #[test]
    fn counts_cover_every_status() {
        let reports = vec![
            report("a", CompletionStatus::Complete, 2, 2),
            report("b", CompletionStatus::Partial, 1, 2),
            report("c", CompletionStatus::Complete, 1, 1),
            report("d", CompletionStatus::Missing, 0, 0),
        ];
        let counts = StatusCounts::tally(&reports);
        assert_eq!(
            counts,
            StatusCounts {
                missing: 1,
                complete: 2,
                partial: 1,
                failed: 0
            }
        );
        assert_eq!(counts.total(), 4);
    }

    #[test]
    fn markdown_render_is_stable() {
        let mut failed = report("libcalc", CompletionStatus::Failed, 0, 3);
        failed.kind = TargetKind::Library;
        failed.repair_attempts = 3;
        failed.error = Some("translator failed".to_string());
        let run = RunReport::new(vec![report("calc", CompletionStatus::Complete, 2, 2), failed]);

        let expected = "# Recast Report\n\n- complete: 1\n- partial: 0\n- failed: 1\n- missing: 0\n\n\
| target | kind | status | tests | repairs |\n|---|---|---|---|---|\n\
| `calc` | bin | COMPLETE | 2/2 | 0 |\n\
| `libcalc` | lib | FAILED | 0/3 | 3 |\n\
\n## Errors\n- `libcalc`: translator failed\n";
        assert_eq!(run.render_markdown(), expected);
    }

    #[test]
    fn write_produces_json_and_markdown() {
        let dir = tempfile::tempdir().unwrap();
        let run = RunReport::new(vec![report("calc", CompletionStatus::Complete, 1, 1)]);
        run.write(dir.path()).unwrap();

        let json = std::fs::read_to_string(dir.path().join("report.json")).unwrap();
        let parsed: RunReport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, run);
        assert_eq!(parsed.targets[0].status, CompletionStatus::Complete);
        assert!(json.contains("\"COMPLETE\""));
        assert!(dir.path().join("report.md").exists());
    }

    #[test]
    fn abort_after_a_stage_ran_counts_as_failed() {
        let dir = tempfile::tempdir().unwrap();
        let unit = recast_core::CompileUnit {
            path: dir.path().join("calc.c"),
            directory: dir.path().to_path_buf(),
            arguments: vec!["cc".into()],
            output: None,
            target: "calc".into(),
        };
        let target = Target::new("calc", TargetKind::Executable, vec![unit]).unwrap();
        let config = PipelineConfig {
            work_root: dir.path().join("work"),
            vectors_dir: dir.path().join("vectors"),
            ..Default::default()
        };

        let early = TargetReport::aborted(&target, &config, "pipeline setup failed");
        assert_eq!(early.status, CompletionStatus::Missing);

        let workdir = WorkDir::for_target(&config.work_root, &target);
        workdir.create().unwrap();
        std::fs::write(workdir.units_record(), "[]").unwrap();
        let late = TargetReport::aborted(&target, &config, "no translator configured");
        assert_eq!(late.status, CompletionStatus::Failed);
        assert_eq!(late.error.as_deref(), Some("no translator configured"));
    }
}
