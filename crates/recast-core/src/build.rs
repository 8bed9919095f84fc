//! Building the assembled crate and recording the result.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::CommandSpec;
use crate::error::Result;
use crate::exec;
use crate::workdir::WorkDir;

/// How a finished build is judged.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BuildClassification {
    /// Non-zero exit code means failure.
    #[default]
    ExitCode,
    /// Any build output at all means failure.
    LogSize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogState {
    Empty,
    NonEmpty,
}

impl LogState {
    /// Size only; a log of nothing but a newline is still output.
    pub fn of(log: &[u8]) -> Self {
        if log.is_empty() {
            Self::Empty
        } else {
            Self::NonEmpty
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Success,
    Failure,
}

pub fn classify(mode: BuildClassification, exit_code: Option<i32>, log: &[u8]) -> BuildStatus {
    let ok = match mode {
        BuildClassification::ExitCode => exit_code == Some(0),
        BuildClassification::LogSize => LogState::of(log) == LogState::Empty,
    };
    if ok {
        BuildStatus::Success
    } else {
        BuildStatus::Failure
    }
}

/// Persisted as `build.json`; the log itself is `build.log`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildArtifact {
    pub target: String,
    pub status: BuildStatus,
    pub log_state: LogState,
    pub exit_code: Option<i32>,
    pub binary: Option<PathBuf>,
    pub log_path: PathBuf,
    pub built_at: DateTime<Utc>,
}

impl BuildArtifact {
    pub fn failed(&self) -> bool {
        self.status == BuildStatus::Failure
    }

    /// A build that never ran because there was nothing to build; the
    /// reason is written to the log so downstream stages see one shape.
    pub fn not_attempted(target: &str, workdir: &WorkDir, reason: &str) -> Result<Self> {
        std::fs::write(workdir.build_log(), reason)?;
        let artifact = Self {
            target: target.to_string(),
            status: BuildStatus::Failure,
            log_state: LogState::of(reason.as_bytes()),
            exit_code: None,
            binary: None,
            log_path: workdir.build_log(),
            built_at: Utc::now(),
        };
        artifact.save(&workdir.build_record())?;
        Ok(artifact)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Run the configured build command against the workdir's manifest.
///
/// Only a build command that cannot be spawned is an error; a failing
/// build is an artifact with `status: failure`.
pub async fn build(
    target: &str,
    workdir: &WorkDir,
    command: &CommandSpec,
    mode: BuildClassification,
) -> Result<BuildArtifact> {
    let mut vars = HashMap::new();
    vars.insert("manifest", workdir.manifest().to_string_lossy().into_owned());
    vars.insert("workdir", workdir.root().to_string_lossy().into_owned());
    let inv = command.render(&vars).cwd(workdir.root());

    debug!(target = %target, command = %inv.display(), "building");
    let out = exec::run(&inv).await?;

    let mut log = out.stderr.clone();
    log.extend_from_slice(&out.stdout);
    std::fs::write(workdir.build_log(), &log)?;

    let status = classify(mode, out.exit_code, &log);
    let binary = workdir.built_binary();
    let artifact = BuildArtifact {
        target: target.to_string(),
        status,
        log_state: LogState::of(&log),
        exit_code: out.exit_code,
        binary: (status == BuildStatus::Success && binary.exists()).then_some(binary),
        log_path: workdir.build_log(),
        built_at: Utc::now(),
    };
    artifact.save(&workdir.build_record())?;
    Ok(artifact)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compdb::CompileUnit;
    use crate::target::{Target, TargetKind};

    fn workdir(root: &Path) -> WorkDir {
        let unit = CompileUnit {
            path: PathBuf::from("/p/a.c"),
            directory: PathBuf::from("/p"),
            arguments: vec!["cc".into()],
            output: None,
            target: "a".into(),
        };
        let target = Target::new("a", TargetKind::Executable, vec![unit]).unwrap();
        let wd = WorkDir::for_target(root, &target);
        wd.create().unwrap();
        wd
    }

    #[test]
    fn classification_modes_disagree_on_warnings() {
        let warnings = b"warning: unused variable";
        assert_eq!(classify(BuildClassification::ExitCode, Some(0), warnings), BuildStatus::Success);
        assert_eq!(classify(BuildClassification::LogSize, Some(0), warnings), BuildStatus::Failure);
        assert_eq!(classify(BuildClassification::LogSize, Some(1), b""), BuildStatus::Success);
        assert_eq!(classify(BuildClassification::ExitCode, None, b""), BuildStatus::Failure);
    }

    #[test]
    fn whitespace_only_log_is_not_empty() {
        assert_eq!(LogState::of(b""), LogState::Empty);
        assert_eq!(LogState::of(b"\n"), LogState::NonEmpty);
        assert_eq!(classify(BuildClassification::LogSize, Some(0), b" \n"), BuildStatus::Failure);
    }

    #[tokio::test]
    async fn failing_build_is_recorded_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        let wd = workdir(dir.path());
        let cmd = CommandSpec::new("sh", &["-c", "echo 'error[E0425]: cannot find value' >&2; exit 101"]);

        let artifact = build("a", &wd, &cmd, BuildClassification::ExitCode).await.unwrap();
        assert!(artifact.failed());
        assert_eq!(artifact.exit_code, Some(101));
        assert_eq!(artifact.log_state, LogState::NonEmpty);
        assert!(std::fs::read_to_string(wd.build_log()).unwrap().contains("E0425"));
        assert_eq!(BuildArtifact::load(&wd.build_record()).unwrap(), Some(artifact));
    }

    #[tokio::test]
    async fn manifest_placeholder_is_substituted() {
        let dir = tempfile::tempdir().unwrap();
        let wd = workdir(dir.path());
        let cmd = CommandSpec::new("sh", &["-c", "test \"$0\" = \"$1\"", "{manifest}"]);
        let mut with_expected = cmd.clone();
        with_expected.args.push(wd.manifest().to_string_lossy().into_owned());

        let artifact = build("a", &wd, &with_expected, BuildClassification::ExitCode).await.unwrap();
        assert!(!artifact.failed());
        assert_eq!(artifact.log_state, LogState::Empty);
    }

    #[test]
    fn not_attempted_is_a_failure_with_reason() {
        let dir = tempfile::tempdir().unwrap();
        let wd = workdir(dir.path());
        let artifact = BuildArtifact::not_attempted("a", &wd, "translation failed: timeout").unwrap();
        assert!(artifact.failed());
        assert!(std::fs::read_to_string(wd.build_log()).unwrap().contains("timeout"));
    }
}
