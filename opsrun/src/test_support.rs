//! Test-only helpers for retry and pipeline tests.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::core::classifier::ErrorKind;
use crate::core::types::StepSpec;
use crate::retry::Sleeper;

/// Sleeper that records requested delays instead of sleeping.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn recorded(&self) -> Vec<Duration> {
        self.delays.lock().expect("sleeper lock").clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.delays.lock().expect("sleeper lock").push(duration);
    }
}

/// Operation that fails with `kind` for its first `failures` calls, then returns `value`.
#[derive(Debug)]
pub struct FlakyOp<T> {
    failures: u32,
    kind: ErrorKind,
    value: T,
    calls: u32,
}

impl<T: Clone> FlakyOp<T> {
    pub fn new(failures: u32, kind: ErrorKind, value: T) -> Self {
        Self {
            failures,
            kind,
            value,
            calls: 0,
        }
    }

    pub fn call(&mut self) -> Result<T, ErrorKind> {
        self.calls += 1;
        if self.calls <= self.failures {
            Err(self.kind)
        } else {
            Ok(self.value.clone())
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls
    }
}

/// A step that runs `script` through `sh -c`.
pub fn sh_step(label: &str, script: &str) -> StepSpec {
    StepSpec::new(label, ["sh", "-c", script])
}

/// A scratch git repository with a bare `origin` next to it.
pub struct TestRepo {
    _temp: tempfile::TempDir,
    work: PathBuf,
    origin: PathBuf,
}

impl TestRepo {
    /// Create `work/` (one commit on `main`) and `origin.git/`, with `main` pushed.
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("tempdir")?;
        let work = temp.path().join("work");
        let origin = temp.path().join("origin.git");
        std::fs::create_dir_all(&work).context("create work dir")?;

        git(temp.path(), &["init", "--bare", "-b", "main", "origin.git"])?;
        git(&work, &["init", "-b", "main"])?;
        std::fs::write(work.join("README.md"), "test\n").context("write readme")?;
        git(&work, &["add", "-A"])?;
        git(&work, &["commit", "-m", "initial"])?;
        let origin_str = origin.to_string_lossy().to_string();
        git(&work, &["remote", "add", "origin", &origin_str])?;
        git(&work, &["push", "origin", "main"])?;

        Ok(Self {
            _temp: temp,
            work,
            origin,
        })
    }

    pub fn path(&self) -> &Path {
        &self.work
    }

    pub fn origin(&self) -> &Path {
        &self.origin
    }

    /// Write a file and commit it on the current branch.
    pub fn commit_file(&self, name: &str, contents: &str, message: &str) -> Result<()> {
        std::fs::write(self.work.join(name), contents)
            .with_context(|| format!("write {name}"))?;
        git(&self.work, &["add", "-A"])?;
        git(&self.work, &["commit", "-m", message])
    }

    /// Short sha of `refs/heads/main` in the bare origin.
    pub fn origin_main_sha(&self) -> Result<String> {
        git_output(&self.origin, &["rev-parse", "--short=12", "main"])
    }

    pub fn head_sha(&self) -> Result<String> {
        git_output(&self.work, &["rev-parse", "--short=12", "HEAD"])
    }
}

fn git_command(dir: &Path, args: &[&str]) -> Command {
    let mut cmd = Command::new("git");
    cmd.args(args)
        .current_dir(dir)
        .env("GIT_AUTHOR_NAME", "opsrun-test")
        .env("GIT_AUTHOR_EMAIL", "opsrun-test@example.com")
        .env("GIT_COMMITTER_NAME", "opsrun-test")
        .env("GIT_COMMITTER_EMAIL", "opsrun-test@example.com")
        .env("GIT_CONFIG_NOSYSTEM", "1");
    cmd
}

fn git(dir: &Path, args: &[&str]) -> Result<()> {
    git_output(dir, args).map(|_| ())
}

fn git_output(dir: &Path, args: &[&str]) -> Result<String> {
    let output = git_command(dir, args)
        .output()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
