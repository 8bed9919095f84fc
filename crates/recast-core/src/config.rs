//! Pipeline configuration, loaded from `recast.toml`.
//!
//! Every field has a default so an empty file is a valid configuration;
//! only the translator command has to be supplied before `run` can do
//! useful work.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::build::BuildClassification;
use crate::error::{RecastError, Result};
use crate::exec::Invocation;
use crate::target::TargetKind;

/// An external command with `{placeholder}` substitution in its arguments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Substitute `{name}` occurrences in the program and every argument.
    /// Unknown placeholders are left as-is.
    pub fn render(&self, vars: &HashMap<&str, String>) -> Invocation {
        let expand = |s: &str| {
            let mut out = s.to_string();
            for (key, value) in vars {
                out = out.replace(&format!("{{{key}}}"), value);
            }
            out
        };
        Invocation::new(expand(&self.program)).args(self.args.iter().map(|a| expand(a)))
    }
}

/// How the scheduler decides whether an artifact is stale.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FreshnessMode {
    #[default]
    ContentHash,
    Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RepairConfig {
    /// Falls back to the translator command when unset.
    pub command: Option<CommandSpec>,
    pub max_attempts: u32,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            command: None,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FuzzConfig {
    pub enabled: bool,
    pub time_budget_secs: u64,
    pub showmap: CommandSpec,
    pub fuzzer: CommandSpec,
}

impl Default for FuzzConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            time_budget_secs: 60,
            showmap: CommandSpec::new(
                "afl-showmap",
                &["-q", "-e", "-o", "{map}", "-t", "{timeout_ms}", "--", "{exe}"],
            ),
            fuzzer: CommandSpec::new(
                "afl-fuzz",
                &["-i", "{seeds}", "-o", "{out}", "-V", "{budget_secs}", "--", "{exe}"],
            ),
        }
    }
}

impl FuzzConfig {
    pub fn time_budget(&self) -> Duration {
        Duration::from_secs(self.time_budget_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    pub compile_commands: PathBuf,
    /// Directory holding the original build's artifacts; used to find
    /// executables and libraries by target name.
    pub build_dir: Option<PathBuf>,
    pub work_root: PathBuf,
    pub vectors_dir: PathBuf,
    /// Units listed here come first, in this order, when a target's sources
    /// are handed to the translator.
    pub source_priority: Vec<PathBuf>,
    /// Explicit kind per target name, overriding inference.
    pub kinds: BTreeMap<String, TargetKind>,
    /// Explicit original artifact per target name.
    pub artifacts: BTreeMap<String, PathBuf>,
    pub concurrency: usize,
    pub freshness: FreshnessMode,
    pub build_classification: BuildClassification,
    pub test_timeout_secs: u64,
    pub target_language: String,
    pub preprocessor: Option<String>,
    pub nm: CommandSpec,
    pub translator: Option<CommandSpec>,
    pub repair: RepairConfig,
    pub build: CommandSpec,
    /// Harness executable per library target; it is invoked with a vector's
    /// arguments and must exit with the function's return value.
    pub library_harness: BTreeMap<String, CommandSpec>,
    pub fuzz: FuzzConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            compile_commands: PathBuf::from("compile_commands.json"),
            build_dir: None,
            work_root: PathBuf::from(".recast"),
            vectors_dir: PathBuf::from("tests/vectors"),
            source_priority: Vec::new(),
            kinds: BTreeMap::new(),
            artifacts: BTreeMap::new(),
            concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            freshness: FreshnessMode::default(),
            build_classification: BuildClassification::default(),
            test_timeout_secs: 10,
            target_language: "rust".to_string(),
            preprocessor: None,
            nm: CommandSpec::new("nm", &["--extern-only", "{artifact}"]),
            translator: None,
            repair: RepairConfig::default(),
            build: CommandSpec::new(
                "cargo",
                &["build", "--quiet", "--color=never", "--manifest-path", "{manifest}"],
            ),
            library_harness: BTreeMap::new(),
            fuzz: FuzzConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load from a TOML file. Relative paths in the file are resolved
    /// against the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            RecastError::Config(format!("cannot read config {}: {e}", path.display()))
        })?;
        let mut config = Self::from_toml(&text)?;
        if let Some(base) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            config.rebase(base);
        }
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(RecastError::Config("concurrency must be at least 1".into()));
        }
        if self.test_timeout_secs == 0 {
            return Err(RecastError::Config(
                "test_timeout_secs must be at least 1".into(),
            ));
        }
        if self.build.program.is_empty() {
            return Err(RecastError::Config("build command is empty".into()));
        }
        if let Some(translator) = &self.translator {
            if translator.program.is_empty() {
                return Err(RecastError::Config("translator command is empty".into()));
            }
        }
        Ok(())
    }

    fn rebase(&mut self, base: &Path) {
        let join = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        join(&mut self.compile_commands);
        join(&mut self.work_root);
        join(&mut self.vectors_dir);
        if let Some(dir) = self.build_dir.as_mut() {
            join(dir);
        }
        for path in self.source_priority.iter_mut() {
            join(path);
        }
        for path in self.artifacts.values_mut() {
            join(path);
        }
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    pub fn repair_command(&self) -> Option<&CommandSpec> {
        self.repair.command.as_ref().or(self.translator.as_ref())
    }

    /// Shared corpus directory of one target.
    pub fn vectors_for(&self, target: &str) -> PathBuf {
        self.vectors_dir.join(target)
    }

    pub fn stamps_dir(&self) -> PathBuf {
        self.work_root.join("stamps")
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.work_root.join("blobs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = PipelineConfig::from_toml("").unwrap();
        assert_eq!(config.work_root, PathBuf::from(".recast"));
        assert_eq!(config.freshness, FreshnessMode::ContentHash);
        assert_eq!(config.build_classification, BuildClassification::ExitCode);
        assert_eq!(config.repair.max_attempts, 3);
        assert_eq!(config.test_timeout_secs, 10);
        assert!(!config.fuzz.enabled);
    }

    #[test]
    fn parses_full_document() {
        let text = r#"
            compile_commands = "build/compile_commands.json"
            concurrency = 2
            freshness = "timestamp"
            build_classification = "log_size"
            source_priority = ["src/util.c"]

            [kinds]
            calc = "executable"

            [translator]
            program = "llm-translate"
            args = ["--model", "large"]

            [repair]
            max_attempts = 5

            [fuzz]
            enabled = true
            time_budget_secs = 5
        "#;
        let config = PipelineConfig::from_toml(text).unwrap();
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.freshness, FreshnessMode::Timestamp);
        assert_eq!(config.build_classification, BuildClassification::LogSize);
        assert_eq!(config.kinds.get("calc"), Some(&TargetKind::Executable));
        assert_eq!(config.repair.max_attempts, 5);
        assert_eq!(config.repair_command().unwrap().program, "llm-translate");
        assert_eq!(config.fuzz.time_budget(), Duration::from_secs(5));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = PipelineConfig::from_toml("concurrency = 0").unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn relative_paths_follow_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recast.toml");
        std::fs::write(&path, "vectors_dir = \"vec\"\n").unwrap();
        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.vectors_dir, dir.path().join("vec"));
        assert_eq!(config.compile_commands, dir.path().join("compile_commands.json"));
    }

    #[test]
    fn command_spec_substitutes_placeholders() {
        let spec = CommandSpec::new("cargo", &["build", "--manifest-path", "{manifest}"]);
        let mut vars = HashMap::new();
        vars.insert("manifest", "/w/Cargo.toml".to_string());
        let inv = spec.render(&vars);
        assert_eq!(inv.program, "cargo");
        assert_eq!(inv.args, vec!["build", "--manifest-path", "/w/Cargo.toml"]);
    }
}
