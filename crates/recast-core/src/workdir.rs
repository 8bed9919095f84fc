//! Per-target working directory layout.
//!
//! ```text
//! <work_root>/<name>-<digest12>/
//!   Cargo.toml
//!   src/{main.rs|lib.rs}     translation
//!   src/wrapper.rs           exported C ABI shims (libraries)
//!   c/<file>-<digest8>.i     preprocessed units, keyed by full path
//!   units.json               extraction record
//!   translation.json         translation artifact
//!   translation.jsonl        one record per translation or repair response
//!   wrapper.json             synthesis report
//!   build.log  build.json    build artifact
//!   test.log                 one JSON test result per line
//!   repair.json              repair history
//!   corpus.json              last corpus expansion
//!   fuzz/                    seeds and fuzzer output
//! ```

use std::path::{Path, PathBuf};

use crate::cas::Digest;
use crate::compdb::CompileUnit;
use crate::target::{Target, TargetKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkDir {
    root: PathBuf,
    kind: TargetKind,
    crate_name: String,
}

impl WorkDir {
    pub fn for_target(work_root: &Path, target: &Target) -> Self {
        Self {
            root: work_root.join(target.workdir_name()),
            kind: target.kind,
            crate_name: target.crate_name(),
        }
    }

    pub fn create(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.src_dir())?;
        std::fs::create_dir_all(self.preprocessed_dir())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn crate_name(&self) -> &str {
        &self.crate_name
    }

    pub fn manifest(&self) -> PathBuf {
        self.root.join("Cargo.toml")
    }

    pub fn src_dir(&self) -> PathBuf {
        self.root.join("src")
    }

    /// `src/lib.rs` for libraries, `src/main.rs` for executables.
    pub fn primary_source(&self) -> PathBuf {
        match self.kind {
            TargetKind::Library => self.src_dir().join("lib.rs"),
            TargetKind::Executable => self.src_dir().join("main.rs"),
        }
    }

    pub fn wrapper_source(&self) -> PathBuf {
        self.src_dir().join("wrapper.rs")
    }

    pub fn preprocessed_dir(&self) -> PathBuf {
        self.root.join("c")
    }

    /// Units with the same file name in different directories get
    /// distinct outputs.
    pub fn preprocessed(&self, unit: &CompileUnit) -> PathBuf {
        let name = unit
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| unit.stem());
        let digest = Digest::compute(unit.path.to_string_lossy().as_bytes()).to_hex();
        self.preprocessed_dir().join(format!("{name}-{}.i", &digest[..8]))
    }

    pub fn units_record(&self) -> PathBuf {
        self.root.join("units.json")
    }

    pub fn translation_record(&self) -> PathBuf {
        self.root.join("translation.json")
    }

    pub fn translation_log(&self) -> PathBuf {
        self.root.join("translation.jsonl")
    }

    pub fn wrapper_record(&self) -> PathBuf {
        self.root.join("wrapper.json")
    }

    pub fn build_log(&self) -> PathBuf {
        self.root.join("build.log")
    }

    pub fn build_record(&self) -> PathBuf {
        self.root.join("build.json")
    }

    pub fn test_log(&self) -> PathBuf {
        self.root.join("test.log")
    }

    pub fn repair_record(&self) -> PathBuf {
        self.root.join("repair.json")
    }

    pub fn corpus_record(&self) -> PathBuf {
        self.root.join("corpus.json")
    }

    pub fn fuzz_dir(&self) -> PathBuf {
        self.root.join("fuzz")
    }

    /// Where cargo leaves the built binary or shared library.
    pub fn built_binary(&self) -> PathBuf {
        let debug = self.root.join("target").join("debug");
        match self.kind {
            TargetKind::Executable => {
                debug.join(format!("{}{}", self.crate_name, std::env::consts::EXE_SUFFIX))
            }
            TargetKind::Library => debug.join(format!(
                "{}{}{}",
                std::env::consts::DLL_PREFIX,
                self.crate_name,
                std::env::consts::DLL_SUFFIX
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(kind: TargetKind) -> Target {
        let unit = CompileUnit {
            path: PathBuf::from("/p/src/calc.c"),
            directory: PathBuf::from("/p"),
            arguments: vec!["cc".into()],
            output: None,
            target: "calc".into(),
        };
        Target::new("calc", kind, vec![unit]).unwrap()
    }

    #[test]
    fn primary_source_follows_kind() {
        let lib = WorkDir::for_target(Path::new("/w"), &target(TargetKind::Library));
        let bin = WorkDir::for_target(Path::new("/w"), &target(TargetKind::Executable));
        assert!(lib.primary_source().ends_with("src/lib.rs"));
        assert!(bin.primary_source().ends_with("src/main.rs"));
        assert_ne!(lib.root(), bin.root());
    }

    #[test]
    fn preprocessed_output_keeps_source_name() {
        let t = target(TargetKind::Executable);
        let wd = WorkDir::for_target(Path::new("/w"), &t);
        let out = wd.preprocessed(&t.units[0]);
        assert_eq!(out.parent(), Some(wd.preprocessed_dir().as_path()));
        let name = out.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("calc.c-") && name.ends_with(".i"), "{name}");
    }

    #[test]
    fn same_named_units_do_not_collide() {
        let unit = |path: &str| CompileUnit {
            path: PathBuf::from(path),
            directory: PathBuf::from("/p"),
            arguments: vec!["cc".into()],
            output: None,
            target: "m".into(),
        };
        let t = Target::new("m", TargetKind::Executable, vec![unit("/p/src/a/util.c"), unit("/p/src/b/util.c")]).unwrap();
        let wd = WorkDir::for_target(Path::new("/w"), &t);
        let a = wd.preprocessed(&t.units[0]);
        let b = wd.preprocessed(&t.units[1]);
        assert_ne!(a, b);
        assert_eq!(a, wd.preprocessed(&t.units[0]));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn built_library_is_shared_object() {
        let wd = WorkDir::for_target(Path::new("/w"), &target(TargetKind::Library));
        assert!(wd.built_binary().ends_with("target/debug/libcalc.so"));
    }
}
