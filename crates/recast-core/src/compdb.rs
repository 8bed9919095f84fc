//! Reader for clang-style `compile_commands.json`.
//!
//! Each entry becomes a [`CompileUnit`] tagged with the build target it
//! belongs to. Entries may carry either a `command` string or an
//! `arguments` array; both normalise to an argument vector.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cas::{Digest, DigestBuilder};
use crate::error::{RecastError, Result};
use crate::exec::Invocation;

#[derive(Debug, Deserialize)]
struct RawEntry {
    directory: PathBuf,
    file: PathBuf,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    arguments: Option<Vec<String>>,
    #[serde(default)]
    output: Option<PathBuf>,
    #[serde(default)]
    target: Option<String>,
}

/// One C source file plus the flags it was compiled with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompileUnit {
    /// Absolute path of the source file.
    pub path: PathBuf,
    pub directory: PathBuf,
    /// Full compiler command line, program first.
    pub arguments: Vec<String>,
    pub output: Option<PathBuf>,
    pub target: String,
}

impl CompileUnit {
    /// File name without its extension, e.g. `calc` for `src/calc.c`.
    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn compiler(&self) -> &str {
        self.arguments.first().map(String::as_str).unwrap_or("cc")
    }

    /// Flags other than the compiler, the source file, `-c` and `-o <out>`.
    pub fn flags(&self) -> Vec<String> {
        let mut flags = Vec::new();
        let mut iter = self.arguments.iter().skip(1);
        while let Some(arg) = iter.next() {
            if arg == "-o" {
                iter.next();
                continue;
            }
            if arg == "-c" || arg.starts_with("-o") && arg.len() > 2 && !arg.starts_with("-obj") {
                continue;
            }
            if self.is_source_arg(arg) {
                continue;
            }
            flags.push(arg.clone());
        }
        flags
    }

    fn is_source_arg(&self, arg: &str) -> bool {
        let candidate = Path::new(arg);
        let resolved = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.directory.join(candidate)
        };
        normalize(&resolved) == self.path
    }

    /// The unit's own compile command rewritten to stop after preprocessing,
    /// without line markers, writing to `out`.
    pub fn preprocess(&self, out: &Path, compiler: Option<&str>) -> Invocation {
        Invocation::new(compiler.unwrap_or_else(|| self.compiler()))
            .args(self.flags())
            .args(["-E", "-P"])
            .arg(self.path.to_string_lossy())
            .arg("-o")
            .arg(out.to_string_lossy())
            .cwd(&self.directory)
    }
}

#[derive(Debug, Clone)]
pub struct CompilationDatabase {
    path: PathBuf,
    units: Vec<CompileUnit>,
}

impl CompilationDatabase {
    /// A missing, unreadable or empty database is a configuration error.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            RecastError::Config(format!(
                "compilation database {} not readable: {e}",
                path.display()
            ))
        })?;
        Self::parse(&text, path)
    }

    pub fn parse(text: &str, origin: &Path) -> Result<Self> {
        let raw: Vec<RawEntry> = serde_json::from_str(text).map_err(|e| {
            RecastError::CompileDb(format!("{}: {e}", origin.display()))
        })?;
        if raw.is_empty() {
            return Err(RecastError::Config(format!(
                "compilation database {} is empty",
                origin.display()
            )));
        }

        let mut units = Vec::with_capacity(raw.len());
        for entry in raw {
            units.push(Self::unit_from(entry)?);
        }
        Ok(Self {
            path: origin.to_path_buf(),
            units,
        })
    }

    fn unit_from(entry: RawEntry) -> Result<CompileUnit> {
        let arguments = match (entry.arguments, entry.command) {
            (Some(args), _) if !args.is_empty() => args,
            (_, Some(cmd)) => split_command(&cmd),
            _ => {
                return Err(RecastError::CompileDb(format!(
                    "entry for {} has neither `command` nor `arguments`",
                    entry.file.display()
                )))
            }
        };
        let path = normalize(&if entry.file.is_absolute() {
            entry.file.clone()
        } else {
            entry.directory.join(&entry.file)
        });
        let output = entry.output.or_else(|| output_from_args(&arguments));
        let target = entry
            .target
            .or_else(|| output.as_deref().and_then(target_from_output))
            .unwrap_or_else(|| {
                path.file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default()
            });
        Ok(CompileUnit {
            path,
            directory: entry.directory,
            arguments,
            output,
            target,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn units(&self) -> &[CompileUnit] {
        &self.units
    }

    /// Target names in order of first appearance.
    pub fn target_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for unit in &self.units {
            if !names.contains(&unit.target) {
                names.push(unit.target.clone());
            }
        }
        names
    }

    pub fn units_for(&self, target: &str) -> Vec<CompileUnit> {
        self.units
            .iter()
            .filter(|u| u.target == target)
            .cloned()
            .collect()
    }

    pub fn digest(&self) -> Digest {
        let mut builder = DigestBuilder::new();
        for unit in &self.units {
            builder.push(unit.path.to_string_lossy().as_bytes());
            for arg in &unit.arguments {
                builder.push(arg.as_bytes());
            }
        }
        builder.finish()
    }
}

fn output_from_args(args: &[String]) -> Option<PathBuf> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "-o" {
            return iter.next().map(PathBuf::from);
        }
    }
    None
}

/// CMake places objects under `CMakeFiles/<target>.dir/`.
fn target_from_output(output: &Path) -> Option<String> {
    let components: Vec<_> = output.components().collect();
    components.windows(2).find_map(|pair| match pair {
        [Component::Normal(parent), Component::Normal(dir)] if *parent == "CMakeFiles" => dir
            .to_str()
            .and_then(|d| d.strip_suffix(".dir"))
            .map(str::to_string),
        _ => None,
    })
}

/// Lexically resolve `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Split a compile command the way a POSIX shell would for the subset that
/// appears in compilation databases: whitespace separation, single and
/// double quotes, and backslash escapes.
pub fn split_command(command: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                for q in chars.by_ref() {
                    if q == '\'' {
                        break;
                    }
                    current.push(q);
                }
            }
            '"' => {
                in_word = true;
                while let Some(q) = chars.next() {
                    match q {
                        '"' => break,
                        '\\' => match chars.next() {
                            Some(e @ ('"' | '\\' | '$' | '`')) => current.push(e),
                            Some(e) => {
                                current.push('\\');
                                current.push(e);
                            }
                            None => current.push('\\'),
                        },
                        _ => current.push(q),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(e) = chars.next() {
                    current.push(e);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            _ => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;

    const DB: &str = r#"[
      {"directory": "/proj/build", "file": "../src/calc.c",
       "command": "cc -DMODE=\"fast\" -I../include -c ../src/calc.c -o CMakeFiles/calc.dir/src/calc.c.o"},
      {"directory": "/proj/build", "file": "/proj/src/util.c",
       "arguments": ["cc", "-O2", "-c", "/proj/src/util.c", "-o", "CMakeFiles/calc.dir/src/util.c.o"]},
      {"directory": "/proj/build", "file": "/proj/src/vec.c",
       "arguments": ["cc", "-fPIC", "-c", "/proj/src/vec.c"], "target": "libvec"}
    ]"#;

    fn db() -> CompilationDatabase {
        CompilationDatabase::parse(DB, Path::new("compile_commands.json")).unwrap()
    }

    #[test]
    fn groups_units_by_target() {
        let db = db();
        assert_eq!(db.target_names(), vec!["calc", "libvec"]);
        let calc = db.units_for("calc");
        assert_eq!(calc.len(), 2);
        assert_eq!(calc[0].path, PathBuf::from("/proj/src/calc.c"));
    }

    #[test]
    fn explicit_target_field_wins() {
        let db = db();
        assert_eq!(db.units_for("libvec")[0].stem(), "vec");
    }

    #[test]
    fn flags_drop_compile_and_output() {
        let unit = &db().units_for("calc")[0];
        assert_eq!(unit.flags(), vec!["-DMODE=fast", "-I../include"]);
    }

    #[test]
    fn preprocess_command_adds_e_and_p() {
        let unit = &db().units_for("calc")[1];
        let inv = unit.preprocess(Path::new("/w/src/util.c.i"), None);
        assert_eq!(inv.program, "cc");
        assert_eq!(
            inv.args,
            vec!["-O2", "-E", "-P", "/proj/src/util.c", "-o", "/w/src/util.c.i"]
        );
        assert_eq!(inv.cwd, Some(PathBuf::from("/proj/build")));
    }

    #[test]
    fn empty_database_is_config_error() {
        let err = CompilationDatabase::parse("[]", Path::new("db.json")).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn missing_database_is_config_error() {
        let err = CompilationDatabase::load(Path::new("/no/such/compile_commands.json"))
            .unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn target_falls_back_to_file_stem() {
        let db = CompilationDatabase::parse(
            r#"[{"directory": "/p", "file": "hello.c", "command": "cc -c hello.c"}]"#,
            Path::new("db.json"),
        )
        .unwrap();
        assert_eq!(db.target_names(), vec!["hello"]);
    }

    #[test]
    fn split_handles_quotes_and_escapes() {
        assert_eq!(
            split_command(r#"cc -D'NAME="x y"' "-I/a b" foo\ bar.c"#),
            vec!["cc", r#"-DNAME="x y""#, "-I/a b", "foo bar.c"]
        );
        assert_eq!(split_command("  cc   -c  "), vec!["cc", "-c"]);
        assert_eq!(split_command(r#"cc -D"" x"#), vec!["cc", "-D", "x"]);
    }

    #[test]
    fn digest_changes_with_flags() {
        let a = db();
        let b = CompilationDatabase::parse(&DB.replace("-O2", "-O3"), Path::new("x")).unwrap();
        assert_ne!(a.digest(), b.digest());
    }
}
