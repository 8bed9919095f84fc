//! Exported-symbol discovery for original library artifacts.
//!
//! Symbols come from `nm --extern-only`: defined text symbols (`T`) only,
//! minus reserved `_`-prefixed names. The result is cached next to the
//! artifact as `<artifact>.symbols`, one name per line, with the digest of
//! the artifact it was read from in `<artifact>.symbols.digest`. A rebuilt
//! artifact invalidates the cache.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::cas::Digest;
use crate::config::CommandSpec;
use crate::error::{RecastError, Result};
use crate::exec;

/// Parse `nm` output into exported function names, in order, deduplicated.
pub fn parse_nm_output(output: &str) -> Vec<String> {
    let mut symbols: Vec<String> = Vec::new();
    for line in output.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 2 || parts[parts.len() - 2] != "T" {
            continue;
        }
        let name = base_name(parts[parts.len() - 1]);
        if name.starts_with('_') || symbols.iter().any(|s| s == name) {
            continue;
        }
        symbols.push(name.to_string());
    }
    symbols
}

/// Strip a symbol version suffix: `foo@@VERS_1.0` -> `foo`.
pub fn base_name(symbol: &str) -> &str {
    symbol.split('@').next().unwrap_or(symbol)
}

pub fn symbols_path(artifact: &Path) -> PathBuf {
    let mut name = artifact.as_os_str().to_os_string();
    name.push(".symbols");
    PathBuf::from(name)
}

fn digest_path(artifact: &Path) -> PathBuf {
    let mut name = symbols_path(artifact).into_os_string();
    name.push(".digest");
    PathBuf::from(name)
}

/// The cached list, if it was taken from the artifact as it is now.
fn read_cache(artifact: &Path, current: &Digest) -> Result<Option<Vec<String>>> {
    let cache = symbols_path(artifact);
    let recorded = match std::fs::read_to_string(digest_path(artifact)) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if recorded.trim() != current.to_hex() || !cache.exists() {
        return Ok(None);
    }
    read_symbols(&cache).map(Some)
}

pub fn write_symbols(path: &Path, symbols: &[String]) -> Result<()> {
    let mut text = String::new();
    for symbol in symbols {
        text.push_str(symbol);
        text.push('\n');
    }
    std::fs::write(path, text)?;
    Ok(())
}

pub fn read_symbols(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path)?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

/// Return the exported symbols of `artifact`, reading the `.symbols` cache
/// when it matches the artifact and running `nm` otherwise.
pub async fn discover(artifact: &Path, nm: &CommandSpec) -> Result<Vec<String>> {
    let current = Digest::of_file(artifact)?;
    if let Some(symbols) = read_cache(artifact, &current)? {
        return Ok(symbols);
    }

    let mut vars = HashMap::new();
    vars.insert("artifact", artifact.to_string_lossy().into_owned());
    let inv = nm.render(&vars);
    let out = exec::run(&inv).await?;
    if !out.success() {
        return Err(RecastError::tooling(
            &nm.program,
            format!("{}: {}", artifact.display(), out.stderr_lossy().trim()),
        ));
    }

    let symbols = parse_nm_output(&out.stdout_lossy());
    write_symbols(&symbols_path(artifact), &symbols)?;
    std::fs::write(digest_path(artifact), format!("{}\n", current.to_hex()))?;
    Ok(symbols)
}
