//! Turning translator output into a buildable crate.
//!
//! A response is either plain Rust source for the crate root, or a JSON
//! object `{"files": {"src/lib.rs": "...", "src/util/mod.rs": "..."}}`.
//! Modules that the response places in subdirectories get `mod.rs` files
//! declaring their children, and top-level modules get declared in the
//! crate root.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::{RecastError, Result};
use crate::target::{Target, TargetKind};
use crate::workdir::WorkDir;

/// Name of the generated module holding exported C ABI shims.
pub const WRAPPER_MODULE: &str = "wrapper";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrateSources {
    pub primary: String,
    /// Additional files keyed by path relative to `src/`.
    pub modules: BTreeMap<PathBuf, String>,
}

#[derive(Deserialize)]
struct MultiFile {
    files: BTreeMap<PathBuf, String>,
}

impl CrateSources {
    pub fn single(primary: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            modules: BTreeMap::new(),
        }
    }

    /// Interpret a translator response for `target`.
    pub fn from_response(response: &str, target: &Target) -> Result<Self> {
        let trimmed = response.trim_start();
        if !trimmed.starts_with('{') {
            return Ok(Self::single(response));
        }
        let Ok(multi) = serde_json::from_str::<MultiFile>(trimmed) else {
            return Ok(Self::single(response));
        };

        let root = match target.kind {
            TargetKind::Library => "lib.rs",
            TargetKind::Executable => "main.rs",
        };
        let mut sources = Self::default();
        let mut found_root = false;
        for (path, text) in multi.files {
            let rel = path.strip_prefix("src").unwrap_or(&path).to_path_buf();
            if rel.as_os_str().is_empty()
                || rel.components().any(|c| !matches!(c, Component::Normal(_)))
            {
                return Err(RecastError::Translation {
                    target: target.name.clone(),
                    reason: format!("response file {} escapes src/", path.display()),
                });
            }
            if rel == Path::new(root) {
                sources.primary = text;
                found_root = true;
            } else {
                sources.modules.insert(rel, text);
            }
        }
        if !found_root {
            return Err(RecastError::Translation {
                target: target.name.clone(),
                reason: format!("multi-file response has no src/{root}"),
            });
        }
        Ok(sources)
    }
}

#[derive(Serialize)]
struct Manifest {
    package: Package,
    #[serde(skip_serializing_if = "Option::is_none")]
    lib: Option<LibSection>,
    #[serde(rename = "bin", skip_serializing_if = "Vec::is_empty")]
    bins: Vec<BinSection>,
    dependencies: BTreeMap<&'static str, &'static str>,
    #[serde(rename = "dev-dependencies")]
    dev_dependencies: BTreeMap<&'static str, &'static str>,
    workspace: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct Package {
    name: String,
    version: &'static str,
    edition: &'static str,
    publish: bool,
}

#[derive(Serialize)]
struct LibSection {
    path: &'static str,
    #[serde(rename = "crate-type")]
    crate_type: Vec<&'static str>,
}

#[derive(Serialize)]
struct BinSection {
    name: String,
    path: &'static str,
}

pub fn render_manifest(target: &Target) -> Result<String> {
    let (lib, bins) = match target.kind {
        TargetKind::Library => (
            Some(LibSection {
                path: "src/lib.rs",
                crate_type: vec!["lib", "cdylib"],
            }),
            Vec::new(),
        ),
        TargetKind::Executable => (
            None,
            vec![BinSection {
                name: target.crate_name(),
                path: "src/main.rs",
            }],
        ),
    };
    let manifest = Manifest {
        package: Package {
            name: target.crate_name(),
            version: "0.1.0",
            edition: "2021",
            publish: false,
        },
        lib,
        bins,
        dependencies: BTreeMap::from([("libc", "0.2")]),
        dev_dependencies: BTreeMap::from([("assert_cmd", "2"), ("predicates", "3")]),
        // An empty table keeps cargo from adopting an enclosing workspace.
        workspace: BTreeMap::new(),
    };
    toml::to_string(&manifest)
        .map_err(|e| RecastError::Config(format!("cannot render manifest: {e}")))
}

fn declares_module(source: &str, module: &str) -> bool {
    Regex::new(&format!(
        r"(?m)^\s*(pub(\([^)]*\))?\s+)?mod\s+{}\s*[;{{]",
        regex::escape(module)
    ))
    .map(|re| re.is_match(source))
    .unwrap_or(false)
}

/// Append `pub mod <module>;` to `source` unless it already declares it.
pub fn ensure_module_declared<'a>(source: &'a str, module: &str) -> Cow<'a, str> {
    if declares_module(source, module) {
        return Cow::Borrowed(source);
    }
    let mut out = source.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&format!("\npub mod {module};\n"));
    Cow::Owned(out)
}

/// Root source as it is written to disk: libraries always declare the
/// wrapper module.
pub fn prepare_root(source: &str, kind: TargetKind) -> String {
    match kind {
        TargetKind::Library => ensure_module_declared(source, WRAPPER_MODULE).into_owned(),
        TargetKind::Executable => source.to_string(),
    }
}

/// Write the manifest and every source file; returns the files written.
pub fn install(workdir: &WorkDir, target: &Target, sources: &CrateSources) -> Result<Vec<PathBuf>> {
    workdir.create()?;
    std::fs::write(workdir.manifest(), render_manifest(target)?)?;

    let src = workdir.src_dir();
    let mut written = vec![workdir.manifest()];
    for (rel, text) in &sources.modules {
        let path = src.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, text)?;
        written.push(path);
    }
    written.extend(generate_mod_files(&src)?);

    let mut root = prepare_root(&sources.primary, target.kind);
    for module in top_level_modules(&src)? {
        root = ensure_module_declared(&root, &module).into_owned();
    }
    let primary = workdir.primary_source();
    std::fs::write(&primary, root)?;
    written.push(primary);
    if target.kind == TargetKind::Library && !workdir.wrapper_source().exists() {
        std::fs::write(workdir.wrapper_source(), "")?;
        written.push(workdir.wrapper_source());
    }
    Ok(written)
}

fn module_name(path: &Path) -> Option<String> {
    if path.is_dir() {
        return path.file_name().map(|n| n.to_string_lossy().into_owned());
    }
    match (path.file_stem(), path.extension()) {
        (Some(stem), Some(ext)) if ext == "rs" && stem != "mod" => {
            Some(stem.to_string_lossy().into_owned())
        }
        _ => None,
    }
}

fn child_modules(dir: &Path) -> Result<Vec<String>> {
    let mut modules = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        if let Some(name) = module_name(&entry?.path()) {
            modules.push(name);
        }
    }
    modules.sort();
    Ok(modules)
}

fn top_level_modules(src: &Path) -> Result<Vec<String>> {
    Ok(child_modules(src)?
        .into_iter()
        .filter(|m| !matches!(m.as_str(), "main" | "lib" | WRAPPER_MODULE))
        .collect())
}

/// Give every subdirectory of `src` without a `mod.rs` one that declares
/// its children in sorted order.
pub fn generate_mod_files(src: &Path) -> Result<Vec<PathBuf>> {
    let mut created = Vec::new();
    for entry in WalkDir::new(src).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| RecastError::Io(e.into()))?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let mod_rs = entry.path().join("mod.rs");
        if mod_rs.exists() {
            continue;
        }
        let body: String = child_modules(entry.path())?
            .iter()
            .map(|m| format!("pub mod {m};\n"))
            .collect();
        std::fs::write(&mod_rs, body)?;
        created.push(mod_rs);
    }
    Ok(created)
}
