//! A library target from compilation database entry to classified test log,
//! with `nm`, the translator, the build and the harness all faked.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use recast_core::build::{self, BuildClassification};
use recast_core::compdb::CompilationDatabase;
use recast_core::symbols::symbols_path;
use recast_core::translate::{self, CodeGenerator, GenerationRequest, TranslationStatus};
use recast_core::verify::{self, Subject, TestLog};
use recast_core::wrapper::{self, ShimKind};
use recast_core::{
    target, CommandSpec, CompletionStatus, ExpectedOutput, PipelineConfig, TargetKind, TestVector, WorkDir,
};

const C_SOURCE: &str = "int add(int a, int b) { return a + b; }\nint sub(int a, int b) { return a - b; }\n";
const TRANSLATION: &str = "pub fn add(a: i32, b: i32) -> i32 {\n    a + b\n}\n";

struct Fixed;

#[async_trait]
impl CodeGenerator for Fixed {
    async fn generate(&self, _request: &GenerationRequest) -> recast_core::Result<String> {
        Ok(format!("```rust\n{TRANSLATION}```\n"))
    }
}

fn project(root: &Path) -> PipelineConfig {
    let src = root.join("src");
    let build = root.join("build");
    std::fs::create_dir_all(&src).unwrap();
    std::fs::create_dir_all(&build).unwrap();
    std::fs::write(src.join("calc.c"), C_SOURCE).unwrap();
    std::fs::write(build.join("libcalc.so"), b"\x7fELF").unwrap();

    let db = serde_json::json!([{
        "directory": src,
        "file": "calc.c",
        "command": "cc -fPIC -c calc.c -o CMakeFiles/calc.dir/calc.c.o",
    }]);
    std::fs::write(root.join("compile_commands.json"), db.to_string()).unwrap();

    let mut config = PipelineConfig::default();
    config.compile_commands = root.join("compile_commands.json");
    config.build_dir = Some(build);
    config.work_root = root.join("work");
    config.nm = CommandSpec::new(
        "sh",
        &[
            "-c",
            "printf '0000 T add\\n0000 T sub@@CALC_1.0\\n0000 T _init\\n0000 U printf\\n0000 T add\\n'",
            "{artifact}",
        ],
    );
    config
}

#[tokio::test]
async fn library_is_modelled_translated_wrapped_and_tested() {
    let dir = tempfile::tempdir().unwrap();
    let config = project(dir.path());

    let db = CompilationDatabase::load(&config.compile_commands).unwrap();
    let targets = target::build_targets(&db, &config).await.unwrap();
    assert_eq!(targets.len(), 1);
    let lib = &targets[0];
    assert_eq!(lib.name, "calc");
    assert_eq!(lib.kind, TargetKind::Library);
    assert_eq!(lib.exported_symbols, vec!["add", "sub"]);
    let original = lib.original.clone().unwrap();
    assert_eq!(
        std::fs::read_to_string(symbols_path(&original)).unwrap(),
        "add\nsub\n"
    );

    // The cached symbol list survives a broken nm.
    let mut offline = config.clone();
    offline.nm = CommandSpec::new("false", &[]);
    let again = target::build_targets(&db, &offline).await.unwrap();
    assert_eq!(again[0].exported_symbols, lib.exported_symbols);

    let workdir = WorkDir::for_target(&config.work_root, lib);
    let artifact = translate::translate(&Fixed, lib, &workdir, "rust").await.unwrap();
    assert_eq!(artifact.status, TranslationStatus::Pending);
    let root_source = std::fs::read_to_string(workdir.primary_source()).unwrap();
    assert!(root_source.starts_with(TRANSLATION));
    assert!(root_source.contains("pub mod wrapper;"));
    let log = std::fs::read_to_string(workdir.translation_log()).unwrap();
    assert_eq!(log.lines().count(), 1);

    let wrapper = wrapper::synthesize(lib, &root_source, C_SOURCE);
    assert!(!wrapper.has_errors(), "{:?}", wrapper.errors);
    let kinds: Vec<ShimKind> = wrapper.shims.iter().map(|s| s.kind).collect();
    assert_eq!(kinds, vec![ShimKind::Forward, ShimKind::Unimplemented]);
    wrapper.write(&workdir).unwrap();

    let build_cmd = CommandSpec::new("sh", &["-c", "test -f src/wrapper.rs && test -f Cargo.toml"]);
    let built = build::build(&lib.name, &workdir, &build_cmd, BuildClassification::ExitCode)
        .await
        .unwrap();
    assert!(!built.failed());
    assert_eq!(
        artifact.effective_status(Some(&built)),
        TranslationStatus::Succeeded
    );

    // The harness exits with the sum of its two arguments after the library path.
    let harness = CommandSpec::new("sh", &["-c", "exit $(( $2 + $3 ))", "harness", "{lib}"]);
    let subject = Subject::Library {
        harness,
        library: workdir.built_binary(),
    };
    let vectors = vec![
        TestVector::new("add", ExpectedOutput::DontCare).with_args(["3", "4"]).with_ret(7),
        TestVector::new("add_wrong", ExpectedOutput::DontCare).with_args(["1", "1"]).with_ret(3),
    ];
    let results = verify::run_vectors(&subject, &vectors, Duration::from_secs(10)).await;
    let log = TestLog::new(false, results);
    log.write(&workdir.test_log()).unwrap();

    assert_eq!(log.passed(), 1);
    assert_eq!(
        verify::status_from_log(&workdir.test_log()).unwrap(),
        CompletionStatus::Partial
    );
}
