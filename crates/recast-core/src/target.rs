//! The unit of work: a named executable or library built from an ordered
//! set of compile units.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cas::{Digest, DigestBuilder};
use crate::compdb::{CompilationDatabase, CompileUnit};
use crate::config::PipelineConfig;
use crate::error::{RecastError, Result};
use crate::symbols;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    #[serde(alias = "lib")]
    Library,
    #[serde(alias = "bin")]
    Executable,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Library => "lib",
            Self::Executable => "bin",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetKind {
    type Err = RecastError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "lib" | "library" => Ok(Self::Library),
            "bin" | "executable" => Ok(Self::Executable),
            other => Err(RecastError::Config(format!("unknown target kind: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Target {
    pub name: String,
    pub kind: TargetKind,
    /// Never empty; priority-listed units first.
    pub units: Vec<CompileUnit>,
    /// Empty for executables.
    pub exported_symbols: Vec<String>,
    /// Artifact produced by the original build, when one was found.
    pub original: Option<PathBuf>,
}

impl Target {
    pub fn new(name: impl Into<String>, kind: TargetKind, units: Vec<CompileUnit>) -> Result<Self> {
        let name = name.into();
        if units.is_empty() {
            return Err(RecastError::EmptyTarget { target: name });
        }
        Ok(Self {
            name,
            kind,
            units,
            exported_symbols: Vec::new(),
            original: None,
        })
    }

    pub fn with_symbols(mut self, symbols: Vec<String>) -> Self {
        self.exported_symbols = symbols;
        self
    }

    pub fn with_original(mut self, original: impl Into<PathBuf>) -> Self {
        self.original = Some(original.into());
        self
    }

    /// Fingerprint over everything that shapes the translation.
    pub fn fingerprint(&self) -> Digest {
        let mut builder = DigestBuilder::new()
            .field("name", &self.name)
            .field("kind", self.kind.as_str());
        for unit in &self.units {
            builder.push(unit.path.to_string_lossy().as_bytes());
            for arg in &unit.arguments {
                builder.push(arg.as_bytes());
            }
        }
        for symbol in &self.exported_symbols {
            builder.push(symbol.as_bytes());
        }
        builder.finish()
    }

    /// Stable directory name, reused across runs while the target is unchanged.
    pub fn workdir_name(&self) -> String {
        format!("{}-{}", sanitize(&self.name), self.fingerprint().short())
    }

    /// Valid Rust crate name derived from the target name.
    pub fn crate_name(&self) -> String {
        let name = sanitize(&self.name).replace('-', "_").to_lowercase();
        match name.chars().next() {
            Some(c) if c.is_ascii_alphabetic() => name,
            _ => format!("c_{name}"),
        }
    }

    pub fn is_library(&self) -> bool {
        self.kind == TargetKind::Library
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn main_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^[^;#/\n]*\bmain\s*\([^;]*\)\s*(\{|$)").expect("static regex")
    })
}

/// Whether the source file at `path` defines `main`.
fn defines_main(path: &Path) -> bool {
    std::fs::read_to_string(path)
        .map(|text| main_regex().is_match(&text))
        .unwrap_or(false)
}

/// Locate the original build artifact for `name` under `build_dir`.
fn find_original(name: &str, build_dir: &Path) -> Option<(PathBuf, TargetKind)> {
    let base = name.strip_prefix("lib").unwrap_or(name);
    for ext in ["so", "dylib", "a"] {
        let candidate = build_dir.join(format!("lib{base}.{ext}"));
        if candidate.is_file() {
            return Some((candidate, TargetKind::Library));
        }
    }
    let exe = build_dir.join(name);
    if exe.is_file() {
        return Some((exe, TargetKind::Executable));
    }
    None
}

fn kind_of_path(path: &Path) -> TargetKind {
    match path.extension().and_then(|e| e.to_str()) {
        Some("so" | "dylib" | "a") => TargetKind::Library,
        _ => TargetKind::Executable,
    }
}

/// Whether the source at `path` defines one of `symbols`.
fn defines_any(path: &Path, symbols: &[String]) -> bool {
    if symbols.is_empty() {
        return false;
    }
    let Ok(text) = std::fs::read_to_string(path) else {
        return false;
    };
    symbols.iter().any(|s| {
        Regex::new(&format!(r"\b{}\s*\([^;]*\)\s*\{{", regex::escape(s)))
            .map(|re| re.is_match(&text))
            .unwrap_or(false)
    })
}

/// Order units for the translator: configured priority paths first, in list
/// order; then the units carrying the entry point (`main` for executables,
/// the eponymous unit or an exported definition for libraries); then the
/// rest in database order.
pub fn prioritize(
    units: Vec<CompileUnit>,
    priority: &[PathBuf],
    name: &str,
    kind: TargetKind,
    symbols: &[String],
) -> Vec<CompileUnit> {
    let base = name.strip_prefix("lib").unwrap_or(name);
    let mut ranked: Vec<(usize, CompileUnit)> = units
        .into_iter()
        .map(|u| {
            let rank = match priority.iter().position(|p| u.path == *p || u.path.ends_with(p)) {
                Some(i) => i,
                None => {
                    let entry = match kind {
                        TargetKind::Executable => defines_main(&u.path),
                        TargetKind::Library => {
                            u.stem() == base || u.stem() == name || defines_any(&u.path, symbols)
                        }
                    };
                    priority.len() + usize::from(!entry)
                }
            };
            (rank, u)
        })
        .collect();
    ranked.sort_by_key(|(rank, _)| *rank);
    ranked.into_iter().map(|(_, u)| u).collect()
}

/// Build the target model for every target in the database.
///
/// Fails fast on configuration errors; a library whose symbols cannot be
/// listed keeps an empty symbol list and a logged warning.
pub async fn build_targets(db: &CompilationDatabase, config: &PipelineConfig) -> Result<Vec<Target>> {
    let mut targets = Vec::new();
    for name in db.target_names() {
        let units = db.units_for(&name);

        let original = match config.artifacts.get(&name) {
            Some(path) => Some((path.clone(), kind_of_path(path))),
            None => config
                .build_dir
                .as_deref()
                .and_then(|dir| find_original(&name, dir)),
        };
        let kind = match (config.kinds.get(&name), &original) {
            (Some(kind), _) => *kind,
            (None, Some((_, kind))) => *kind,
            (None, None) if units.iter().any(|u| defines_main(&u.path)) => TargetKind::Executable,
            (None, None) => TargetKind::Library,
        };

        let mut exported = Vec::new();
        if let (Some((path, _)), TargetKind::Library) = (&original, kind) {
            match symbols::discover(path, &config.nm).await {
                Ok(found) => exported = found,
                Err(e) => crate::obs::emit_tooling_error(&config.nm.program, &e),
            }
        }

        let units = prioritize(units, &config.source_priority, &name, kind, &exported);
        let mut target = Target::new(name, kind, units)?.with_symbols(exported);
        if let Some((path, _)) = original {
            target.original = Some(path);
        }
        debug!(target = %target.name, kind = %target.kind, units = target.units.len(), "target modelled");
        targets.push(target);
    }
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommandSpec;

    fn unit(path: &str, target: &str) -> CompileUnit {
        CompileUnit {
            path: PathBuf::from(path),
            directory: PathBuf::from("/p"),
            arguments: vec!["cc".into(), "-c".into(), path.into()],
            output: None,
            target: target.into(),
        }
    }

    #[test]
    fn empty_target_is_rejected() {
        let err = Target::new("t", TargetKind::Executable, vec![]).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn workdir_name_is_stable_and_content_sensitive() {
        let a = Target::new("calc", TargetKind::Executable, vec![unit("/p/a.c", "calc")]).unwrap();
        let b = a.clone();
        assert_eq!(a.workdir_name(), b.workdir_name());
        assert!(a.workdir_name().starts_with("calc-"));

        let c = Target::new("calc", TargetKind::Library, vec![unit("/p/a.c", "calc")]).unwrap();
        assert_ne!(a.workdir_name(), c.workdir_name());
    }

    #[test]
    fn crate_name_is_a_valid_identifier() {
        let t = Target::new("2d-Plot.v2", TargetKind::Executable, vec![unit("/p/a.c", "x")]).unwrap();
        assert_eq!(t.crate_name(), "c_2d_plot_v2");
    }

    #[test]
    fn priority_units_come_first() {
        let units = vec![unit("/p/a.c", "t"), unit("/p/b.c", "t"), unit("/p/c.c", "t")];
        let priority = [PathBuf::from("c.c"), PathBuf::from("/p/b.c")];
        let ordered = prioritize(units, &priority, "t", TargetKind::Executable, &[]);
        let names: Vec<_> = ordered.iter().map(|u| u.stem()).collect();
        assert_eq!(names, vec!["c", "b", "a"]);
    }

    #[test]
    fn library_units_defining_exports_lead() {
        let dir = tempfile::tempdir().unwrap();
        let util = dir.path().join("util.c");
        let api = dir.path().join("api.c");
        std::fs::write(&util, "static int helper(void) { return 1; }\n").unwrap();
        std::fs::write(&api, "int add(int a, int b)\n{\n  return a + b;\n}\n").unwrap();
        let units = vec![
            unit(util.to_str().unwrap(), "m"),
            unit(api.to_str().unwrap(), "m"),
        ];
        let ordered = prioritize(units, &[], "m", TargetKind::Library, &["add".to_string()]);
        assert_eq!(ordered[0].stem(), "api");
    }

    #[test]
    fn kind_parses_both_spellings() {
        assert_eq!("lib".parse::<TargetKind>().unwrap(), TargetKind::Library);
        assert_eq!("executable".parse::<TargetKind>().unwrap(), TargetKind::Executable);
        assert!("shared".parse::<TargetKind>().is_err());
    }

    #[tokio::test]
    async fn infers_kind_from_main_definition() {
        let dir = tempfile::tempdir().unwrap();
        let main_c = dir.path().join("main.c");
        let lib_c = dir.path().join("lib.c");
        std::fs::write(&main_c, "#include <stdio.h>\nint main(int argc, char **argv) {\n  return 0;\n}\n").unwrap();
        std::fs::write(&lib_c, "int add(int a, int b) { return a + b; }\n").unwrap();

        let db_text = serde_json::json!([
            {"directory": dir.path(), "file": main_c, "arguments": ["cc", "-c", main_c], "target": "app"},
            {"directory": dir.path(), "file": lib_c, "arguments": ["cc", "-c", lib_c], "target": "calc"},
        ])
        .to_string();
        let db = CompilationDatabase::parse(&db_text, Path::new("db.json")).unwrap();
        let targets = build_targets(&db, &PipelineConfig::default()).await.unwrap();

        assert_eq!(targets[0].kind, TargetKind::Executable);
        assert_eq!(targets[1].kind, TargetKind::Library);
        assert!(targets[1].exported_symbols.is_empty());
    }

    #[tokio::test]
    async fn library_artifact_supplies_symbols() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("calc.c");
        std::fs::write(&src, "int add(int a, int b) { return a + b; }\n").unwrap();
        let so = dir.path().join("libcalc.so");
        std::fs::write(&so, b"").unwrap();

        let db_text = serde_json::json!([
            {"directory": dir.path(), "file": src, "arguments": ["cc", "-c", src], "target": "calc"},
        ])
        .to_string();
        let db = CompilationDatabase::parse(&db_text, Path::new("db.json")).unwrap();
        let config = PipelineConfig {
            build_dir: Some(dir.path().to_path_buf()),
            nm: CommandSpec::new("printf", &["0000 T add\n0000 U puts\n"]),
            ..Default::default()
        };
        let targets = build_targets(&db, &config).await.unwrap();

        assert_eq!(targets[0].kind, TargetKind::Library);
        assert_eq!(targets[0].exported_symbols, vec!["add"]);
        assert!(symbols::symbols_path(&so).exists());
        assert_eq!(targets[0].original.as_deref(), Some(so.as_path()));
    }
}
