//! Child process execution with captured output and a hard timeout.
//!
//! Every external tool recast drives (preprocessor, `nm`, translator, cargo,
//! the programs under test, the fuzzer) goes through [`run`]. A child that
//! outlives its timeout is killed, and the timeout is reported as data on
//! [`ProcessOutput`] rather than as an error.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{RecastError, Result};

/// A fully resolved command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            cwd: None,
            env: Vec::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Shell-like rendering for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// `None` when the child was killed by a signal or by the timeout.
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration_ms: u64,
    pub timed_out: bool,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Run `inv` to completion.
///
/// Spawn failures (missing binary, permissions) are errors; everything the
/// child does after it starts is reported through [`ProcessOutput`].
pub async fn run(inv: &Invocation) -> Result<ProcessOutput> {
    let start = Instant::now();

    let mut cmd = Command::new(&inv.program);
    cmd.args(&inv.args)
        .stdin(if inv.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &inv.cwd {
        cmd.current_dir(dir);
    }
    for (key, value) in &inv.env {
        cmd.env(key, value);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| RecastError::Process(format!("failed to spawn `{}`: {e}", inv.program)))?;

    if let (Some(input), Some(mut pipe)) = (inv.stdin.clone(), child.stdin.take()) {
        // A child that exits without draining stdin yields a broken pipe; that
        // is the child's business, not an execution error.
        tokio::spawn(async move {
            let _ = pipe.write_all(&input).await;
            let _ = pipe.shutdown().await;
        });
    }

    let waited = match inv.timeout {
        Some(limit) => tokio::time::timeout(limit, child.wait_with_output()).await,
        None => Ok(child.wait_with_output().await),
    };
    let duration_ms = start.elapsed().as_millis() as u64;

    match waited {
        Ok(output) => {
            let output = output?;
            Ok(ProcessOutput {
                exit_code: output.status.code(),
                stdout: output.stdout,
                stderr: output.stderr,
                duration_ms,
                timed_out: false,
            })
        }
        // The child future was dropped, and with it the child: kill_on_drop
        // delivers SIGKILL.
        Err(_) => Ok(ProcessOutput {
            exit_code: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
            duration_ms,
            timed_out: true,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let out = run(&Invocation::new("sh").args(["-c", "echo hello; exit 3"]))
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stdout_lossy(), "hello\n");
        assert!(!out.success());
    }

    #[tokio::test]
    async fn feeds_stdin() {
        let out = run(&Invocation::new("cat").stdin("a\nb")).await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, b"a\nb");
    }

    #[tokio::test]
    async fn timeout_kills_child() {
        let out = run(&Invocation::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(100)))
        .await
        .unwrap();
        assert!(out.timed_out);
        assert_eq!(out.exit_code, None);
        assert!(out.duration_ms < 5000);
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let err = run(&Invocation::new("/definitely/not/a/program"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to spawn"));
    }

    #[tokio::test]
    async fn runs_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let out = run(&Invocation::new("pwd").cwd(dir.path())).await.unwrap();
        let printed = std::path::PathBuf::from(out.stdout_lossy().trim());
        assert_eq!(
            printed.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }
}
