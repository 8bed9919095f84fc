//! Test vectors: one observed behaviour of the original program.
//!
//! Vectors live as individual JSON files under `<vectors_dir>/<target>/`,
//! named after the vector. The store is append-only: a vector is never
//! rewritten once it exists, and every write for a target goes through one
//! lock.
//!
//! Two on-disk shapes are accepted:
//!
//! ```json
//! { "args": ["3", "4"], "in": ["line 1", "line 2"], "out": "7", "ret": 0 }
//! { "argv": ["-x"], "stdin": "data", "rc": 1,
//!   "stdout": { "pattern": "^ok", "is_regex": true }, "has_ub": "overflow" }
//! ```
//!
//! `out` may be a string, a list of lines (joined with `\n`) or a boolean,
//! which means the output is not checked.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::NamedTempFile;
use tokio::sync::Mutex;

use crate::error::{RecastError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpectedOutput {
    /// Compared after trimming trailing whitespace on both sides.
    Exact(String),
    /// Regular expression searched for in the output.
    Pattern(String),
    DontCare,
}

impl ExpectedOutput {
    pub fn matches(&self, actual: &str) -> Result<bool> {
        Ok(match self {
            Self::Exact(expected) => actual.trim_end() == expected.trim_end(),
            Self::Pattern(pattern) => regex::Regex::new(pattern)?.is_match(actual),
            Self::DontCare => true,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VectorOrigin {
    #[default]
    Seed,
    Fuzz,
}

impl VectorOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Seed => "seed",
            Self::Fuzz => "fuzz",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestVector {
    pub name: String,
    pub args: Vec<String>,
    pub stdin: Vec<u8>,
    pub expected: ExpectedOutput,
    /// Expected exit status, or for libraries the expected return value.
    pub ret: Option<i32>,
    pub origin: VectorOrigin,
    /// Set when the original exhibits undefined behaviour on this input;
    /// such vectors are never run.
    pub undefined_behavior: Option<String>,
}

impl TestVector {
    pub fn new(name: impl Into<String>, expected: ExpectedOutput) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            stdin: Vec::new(),
            expected,
            ret: None,
            origin: VectorOrigin::Seed,
            undefined_behavior: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = stdin.into();
        self
    }

    pub fn with_ret(mut self, ret: i32) -> Self {
        self.ret = Some(ret);
        self
    }

    pub fn with_origin(mut self, origin: VectorOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn is_runnable(&self) -> bool {
        self.undefined_behavior.is_none()
    }

    /// Parse one vector document; `name` comes from the file name.
    pub fn from_json(name: &str, text: &str) -> Result<Self> {
        let record: VectorRecord = serde_json::from_str(text).map_err(|e| invalid(name, e))?;
        record.into_vector(name)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&VectorRecord::from_vector(self))?)
    }
}

fn invalid(name: &str, reason: impl std::fmt::Display) -> RecastError {
    RecastError::InvalidVector {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StreamPattern {
    pattern: String,
    #[serde(default)]
    is_regex: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct VectorRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    args: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    argv: Option<Vec<Value>>,
    #[serde(default, rename = "in", skip_serializing_if = "Option::is_none")]
    input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    in_hex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stdin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    out: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stdout: Option<StreamPattern>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ret: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rc: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    has_ub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    origin: Option<VectorOrigin>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    oracle: Option<String>,
}

/// Scalars render without JSON quoting; lists become one entry per element.
fn lines(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().map(scalar).collect(),
        Value::Null => Vec::new(),
        other => vec![scalar(other)],
    }
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl VectorRecord {
    fn into_vector(self, name: &str) -> Result<TestVector> {
        let args = self
            .args
            .or(self.argv)
            .unwrap_or_default()
            .iter()
            .map(scalar)
            .collect();

        let stdin = match (self.in_hex, self.input, self.stdin) {
            (Some(h), _, _) => hex::decode(h.trim()).map_err(|e| invalid(name, e))?,
            (None, Some(v), _) => lines(&v).join("\n").into_bytes(),
            (None, None, Some(s)) => s.into_bytes(),
            (None, None, None) => Vec::new(),
        };

        let expected = match (self.out, self.stdout) {
            (Some(Value::Bool(_)), _) => ExpectedOutput::DontCare,
            (Some(v), _) => ExpectedOutput::Exact(lines(&v).join("\n")),
            (None, Some(s)) if s.is_regex => {
                regex::Regex::new(&s.pattern).map_err(|e| invalid(name, e))?;
                ExpectedOutput::Pattern(s.pattern)
            }
            (None, Some(s)) => ExpectedOutput::Exact(s.pattern),
            (None, None) => return Err(invalid(name, "no expected output (`out` or `stdout`)")),
        };

        Ok(TestVector {
            name: name.to_string(),
            args,
            stdin,
            expected,
            ret: self.ret.or(self.rc),
            origin: self.origin.unwrap_or_default(),
            undefined_behavior: self.has_ub,
        })
    }

    fn from_vector(v: &TestVector) -> Self {
        let (input, in_hex) = match std::str::from_utf8(&v.stdin) {
            _ if v.stdin.is_empty() => (None, None),
            Ok(s) => (Some(Value::String(s.to_string())), None),
            Err(_) => (None, Some(hex::encode(&v.stdin))),
        };
        let (out, stdout) = match &v.expected {
            ExpectedOutput::Exact(s) => (Some(Value::String(s.clone())), None),
            ExpectedOutput::Pattern(p) => (
                None,
                Some(StreamPattern {
                    pattern: p.clone(),
                    is_regex: true,
                }),
            ),
            ExpectedOutput::DontCare => (Some(Value::Bool(false)), None),
        };
        Self {
            args: Some(v.args.iter().cloned().map(Value::String).collect()),
            input,
            in_hex,
            out,
            stdout,
            ret: v.ret,
            has_ub: v.undefined_behavior.clone(),
            origin: (v.origin != VectorOrigin::Seed).then_some(v.origin),
            oracle: (v.origin == VectorOrigin::Fuzz).then(|| "original".to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    /// An identical vector was already stored under this name.
    AlreadyPresent,
}

/// Append-only corpus of one target.
pub struct VectorStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl VectorStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.path_of(name).exists()
    }

    /// Every vector file, sorted by name.
    pub fn files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "json") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    pub fn load_all(&self) -> Result<Vec<TestVector>> {
        self.files()?
            .iter()
            .map(|path| {
                let name = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let text = std::fs::read_to_string(path)?;
                TestVector::from_json(&name, &text)
            })
            .collect()
    }

    /// Add `vector` unless one with the same name exists. An existing vector
    /// with different content is a conflict; nothing is ever overwritten.
    pub async fn add(&self, vector: &TestVector) -> Result<AddOutcome> {
        if vector.name.is_empty() || vector.name.contains(['/', '\\']) {
            return Err(invalid(&vector.name, "vector names must be plain file names"));
        }
        let json = vector.to_json()?;

        let _guard = self.write_lock.lock().await;
        let path = self.path_of(&vector.name);
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        std::io::Write::write_all(&mut tmp, json.as_bytes())?;
        match tmp.persist_noclobber(&path) {
            Ok(_) => Ok(AddOutcome::Added),
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                let existing = TestVector::from_json(&vector.name, &std::fs::read_to_string(&path)?)?;
                if existing == *vector {
                    Ok(AddOutcome::AlreadyPresent)
                } else {
                    Err(RecastError::VectorConflict(vector.name.clone()))
                }
            }
            Err(e) => Err(e.error.into()),
        }
    }
}

fn ident(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    if out.starts_with(|c: char| c.is_ascii_digit()) || out.is_empty() {
        out.insert_str(0, "v_");
    }
    out
}

fn byte_literal(bytes: &[u8]) -> String {
    let escaped: String = bytes
        .iter()
        .flat_map(|b| std::ascii::escape_default(*b))
        .map(char::from)
        .collect();
    format!("b\"{escaped}\"")
}

/// Render the corpus as an `assert_cmd` integration test file for the
/// translated binary `bin`.
pub fn render_rust_tests(bin: &str, vectors: &[TestVector]) -> String {
    let mut out = String::new();
    out.push_str("// Generated by recast from the shared test-vector corpus.\n");
    out.push_str("use assert_cmd::Command;\n");
    for v in vectors {
        out.push('\n');
        if let Some(ub) = &v.undefined_behavior {
            let _ = writeln!(out, "#[ignore = {:?}]", format!("undefined behavior: {ub}"));
        }
        let _ = writeln!(out, "#[test]\nfn {}() {{", ident(&v.name));
        let _ = writeln!(out, "    let mut cmd = Command::cargo_bin({bin:?}).unwrap();");
        if !v.args.is_empty() {
            let _ = writeln!(out, "    cmd.args({:?});", v.args);
        }
        if !v.stdin.is_empty() {
            let _ = writeln!(out, "    cmd.write_stdin({}.as_slice());", byte_literal(&v.stdin));
        }
        out.push_str("    let assert = cmd.assert();\n");
        if let Some(code) = v.ret {
            let _ = writeln!(out, "    let assert = assert.code({code});");
        }
        match &v.expected {
            ExpectedOutput::Exact(s) => {
                let _ = writeln!(
                    out,
                    "    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).into_owned();\n    assert_eq!(stdout.trim_end(), {:?});",
                    s.trim_end()
                );
            }
            ExpectedOutput::Pattern(p) => {
                let _ = writeln!(
                    out,
                    "    assert.stdout(predicates::str::is_match({p:?}).unwrap());"
                );
            }
            ExpectedOutput::DontCare => out.push_str("    let _ = assert;\n"),
        }
        out.push_str("}\n");
    }
    out
}
