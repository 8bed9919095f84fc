//! Running test vectors against a built translation and classifying the
//! outcome.
//!
//! The test log (`test.log`) is the single source of truth for a target's
//! [`CompletionStatus`]: one JSON object per line, a build record first and
//! then one record per vector.

use std::collections::HashMap;
use std::fmt;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::CommandSpec;
use crate::error::Result;
use crate::exec::{self, Invocation, ProcessOutput};
use crate::testvec::TestVector;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum TestOutcome {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestResult {
    pub vector: String,
    pub outcome: TestOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub duration_ms: u64,
}

impl TestResult {
    pub fn pass(vector: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            vector: vector.into(),
            outcome: TestOutcome::Pass,
            detail: None,
            duration_ms,
        }
    }

    pub fn fail(vector: impl Into<String>, detail: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            vector: vector.into(),
            outcome: TestOutcome::Fail,
            detail: Some(detail.into()),
            duration_ms,
        }
    }

    pub fn passed(&self) -> bool {
        self.outcome == TestOutcome::Pass
    }
}

/// Final per-target classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum CompletionStatus {
    /// Never attempted, or nothing to judge.
    Missing,
    Complete,
    Partial,
    /// Attempted and did not work: build failure or every vector failed.
    Failed,
}

impl CompletionStatus {
    pub fn classify(build_failed: bool, results: &[TestResult]) -> Self {
        if build_failed {
            return Self::Failed;
        }
        let passed = results.iter().filter(|r| r.passed()).count();
        match (passed, results.len()) {
            (_, 0) => Self::Missing,
            (p, n) if p == n => Self::Complete,
            (0, _) => Self::Failed,
            _ => Self::Partial,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Missing => "MISSING",
            Self::Complete => "COMPLETE",
            Self::Partial => "PARTIAL",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a vector is run against.
#[derive(Debug, Clone)]
pub enum Subject {
    Executable(PathBuf),
    /// A harness program loads `library`; its exit status is the return
    /// value of the function under test.
    Library { harness: CommandSpec, library: PathBuf },
}

impl Subject {
    fn invocation(&self, vector: &TestVector) -> Invocation {
        let base = match self {
            Self::Executable(path) => Invocation::new(path.to_string_lossy()),
            Self::Library { harness, library } => {
                let mut vars = HashMap::new();
                vars.insert("lib", library.to_string_lossy().into_owned());
                harness.render(&vars)
            }
        };
        base.args(vector.args.iter().cloned())
            .stdin(vector.stdin.clone())
    }

    fn is_library(&self) -> bool {
        matches!(self, Self::Library { .. })
    }
}

/// Judge one finished run. Spawn failures are judged by the caller.
pub fn judge(subject: &Subject, vector: &TestVector, output: &ProcessOutput, timeout: Duration) -> TestResult {
    let elapsed = output.duration_ms;
    if output.timed_out {
        return TestResult::fail(
            &vector.name,
            format!("timed out after {}s", timeout.as_secs_f32()),
            elapsed,
        );
    }

    if subject.is_library() && vector.ret.is_none() {
        return TestResult::fail(&vector.name, "library vector has no expected return value", elapsed);
    }
    if let Some(want) = vector.ret {
        if output.exit_code != Some(want) {
            let what = if subject.is_library() { "return" } else { "exit code" };
            return TestResult::fail(
                &vector.name,
                format!("expected {what} {want}, got {:?}", output.exit_code),
                elapsed,
            );
        }
    }

    let stdout = output.stdout_lossy();
    match vector.expected.matches(&stdout) {
        Ok(true) => TestResult::pass(&vector.name, elapsed),
        Ok(false) => TestResult::fail(
            &vector.name,
            format!("expected {:?}, got {:?}", vector.expected, stdout.trim_end()),
            elapsed,
        ),
        Err(e) => TestResult::fail(&vector.name, e.to_string(), elapsed),
    }
}

pub async fn run_vector(subject: &Subject, vector: &TestVector, timeout: Duration) -> TestResult {
    let inv = subject.invocation(vector).timeout(timeout);
    match exec::run(&inv).await {
        Ok(output) => judge(subject, vector, &output, timeout),
        Err(e) => TestResult::fail(&vector.name, e.to_string(), 0),
    }
}

/// Run every runnable vector, in order.
pub async fn run_vectors(subject: &Subject, vectors: &[TestVector], timeout: Duration) -> Vec<TestResult> {
    let mut results = Vec::with_capacity(vectors.len());
    for vector in vectors.iter().filter(|v| v.is_runnable()) {
        results.push(run_vector(subject, vector, timeout).await);
    }
    results
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum LogLine {
    Build { failed: bool },
    Result(TestResult),
}

/// Parsed `test.log`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestLog {
    pub build_failed: bool,
    pub results: Vec<TestResult>,
}

impl TestLog {
    pub fn new(build_failed: bool, results: Vec<TestResult>) -> Self {
        Self {
            build_failed,
            results,
        }
    }

    pub fn status(&self) -> CompletionStatus {
        CompletionStatus::classify(self.build_failed, &self.results)
    }

    pub fn passed(&self) -> usize {
        self.results.iter().filter(|r| r.passed()).count()
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
        writeln!(file, "{}", serde_json::to_string(&LogLine::Build { failed: self.build_failed })?)?;
        for result in &self.results {
            writeln!(file, "{}", serde_json::to_string(&LogLine::Result(result.clone()))?)?;
        }
        file.flush()?;
        Ok(())
    }

    /// `None` when no log has been written yet.
    pub fn read(path: &Path) -> Result<Option<Self>> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut log = Self::default();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str(line)? {
                LogLine::Build { failed } => log.build_failed = failed,
                LogLine::Result(r) => log.results.push(r),
            }
        }
        Ok(Some(log))
    }
}

/// Status recomputed from the persisted log alone.
pub fn status_from_log(path: &Path) -> Result<CompletionStatus> {
    Ok(TestLog::read(path)?
        .map(|log| log.status())
        .unwrap_or(CompletionStatus::Missing))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testvec::ExpectedOutput;

    fn results(pattern: &[bool]) -> Vec<TestResult> {
        pattern
            .iter()
            .enumerate()
            .map(|(i, ok)| {
                if *ok {
                    TestResult::pass(format!("t{i}"), 1)
                } else {
                    TestResult::fail(format!("t{i}"), "mismatch", 1)
                }
            })
            .collect()
    }

    #[test]
    fn classification_table() {
        use CompletionStatus::*;
        assert_eq!(CompletionStatus::classify(false, &[]), Missing);
        assert_eq!(CompletionStatus::classify(false, &results(&[true, true])), Complete);
        assert_eq!(CompletionStatus::classify(false, &results(&[true, false])), Partial);
        assert_eq!(CompletionStatus::classify(false, &results(&[false, false])), Failed);
        assert_eq!(CompletionStatus::classify(true, &[]), Failed);
        assert_eq!(CompletionStatus::classify(true, &results(&[true])), Failed);
    }

    #[test]
    fn log_roundtrip_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.log");
        assert_eq!(status_from_log(&path).unwrap(), CompletionStatus::Missing);

        TestLog::new(false, results(&[true, false])).write(&path).unwrap();
        let log = TestLog::read(&path).unwrap().unwrap();
        assert_eq!(log.results.len(), 2);
        assert_eq!(status_from_log(&path).unwrap(), CompletionStatus::Partial);
    }

    #[tokio::test]
    async fn executable_vectors_compare_stdout() {
        let subject = Subject::Executable(PathBuf::from("cat"));
        let vectors = vec![
            TestVector::new("echo", ExpectedOutput::Exact("a\nb".into())).with_stdin("a\nb\n"),
            TestVector::new("wrong", ExpectedOutput::Exact("z".into())).with_stdin("a"),
        ];
        let results = run_vectors(&subject, &vectors, Duration::from_secs(5)).await;
        assert!(results[0].passed());
        assert!(!results[1].passed());
        assert_eq!(CompletionStatus::classify(false, &results), CompletionStatus::Partial);
    }

    #[tokio::test]
    async fn exceeding_timeout_fails_vector() {
        let subject = Subject::Executable(PathBuf::from("sleep"));
        let v = TestVector::new("slow", ExpectedOutput::DontCare).with_args(["5"]);
        let r = run_vector(&subject, &v, Duration::from_millis(100)).await;
        assert_eq!(r.outcome, TestOutcome::Fail);
        assert!(r.detail.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn library_vectors_compare_return_value() {
        let subject = Subject::Library {
            harness: CommandSpec::new("sh", &["-c", "exit $(($0 + $1))"]),
            library: PathBuf::from("/unused/libcalc.so"),
        };
        let good = TestVector::new("add", ExpectedOutput::DontCare).with_args(["3", "4"]).with_ret(7);
        let bad = TestVector::new("add2", ExpectedOutput::DontCare).with_args(["3", "4"]).with_ret(8);
        let results = run_vectors(&subject, &[good, bad], Duration::from_secs(5)).await;
        assert!(results[0].passed());
        assert!(!results[1].passed());
    }

    #[tokio::test]
    async fn library_vectors_also_compare_stdout() {
        let subject = Subject::Library {
            harness: CommandSpec::new("sh", &["-c", "echo 8; exit 7"]),
            library: PathBuf::from("/unused/libcalc.so"),
        };
        let wrong_out = TestVector::new("out", ExpectedOutput::Exact("7".into())).with_ret(7);
        let right_out = TestVector::new("ok", ExpectedOutput::Exact("8".into())).with_ret(7);
        let wrong_ret = TestVector::new("ret", ExpectedOutput::Exact("8".into())).with_ret(8);
        let results = run_vectors(&subject, &[wrong_out, right_out, wrong_ret], Duration::from_secs(5)).await;
        assert!(!results[0].passed());
        assert!(results[0].detail.as_deref().unwrap().contains("expected"));
        assert!(results[1].passed());
        assert!(!results[2].passed());
        assert!(results[2].detail.as_deref().unwrap().contains("return"));
    }

    #[tokio::test]
    async fn undefined_behaviour_vectors_are_skipped() {
        let subject = Subject::Executable(PathBuf::from("true"));
        let mut v = TestVector::new("ub", ExpectedOutput::DontCare);
        v.undefined_behavior = Some("overflow".into());
        assert!(run_vectors(&subject, &[v], Duration::from_secs(1)).await.is_empty());
    }

    #[tokio::test]
    async fn missing_binary_fails_instead_of_erroring() {
        let subject = Subject::Executable(PathBuf::from("/no/such/translated-bin"));
        let v = TestVector::new("t", ExpectedOutput::DontCare);
        let r = run_vector(&subject, &v, Duration::from_secs(1)).await;
        assert_eq!(r.outcome, TestOutcome::Fail);
    }
}
