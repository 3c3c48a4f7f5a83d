//! Classified invocation of external CLI tools (`git`, `gh`).
//!
//! Failures are turned into a [`CommandError`] that knows its [`ErrorKind`],
//! so callers can hand network operations straight to the retry executor.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::core::classifier::{Classify, ErrorKind, classify_command_failure};
use crate::io::process::{ProcessEnv, run_command_with_timeout};

pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

/// A failed tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("{command} failed ({kind}): {stderr}")]
    Failed {
        command: String,
        kind: ErrorKind,
        stderr: String,
    },
    #[error("{command} timed out after {timeout_secs}s")]
    TimedOut { command: String, timeout_secs: u64 },
    #[error("could not run {command}: {message}")]
    Spawn { command: String, message: String },
}

impl Classify for CommandError {
    fn kind(&self) -> ErrorKind {
        match self {
            CommandError::Failed { kind, .. } => *kind,
            CommandError::TimedOut { .. } => ErrorKind::Timeout,
            CommandError::Spawn { .. } => ErrorKind::Fatal,
        }
    }
}

/// A program bound to a working directory, environment and timeout.
#[derive(Debug, Clone)]
pub struct Tool {
    program: String,
    /// Arguments placed before every invocation's own arguments.
    leading_args: Vec<String>,
    workdir: PathBuf,
    env: ProcessEnv,
    timeout: Duration,
}

impl Tool {
    /// Runs non-interactively, with [`DEFAULT_TOOL_TIMEOUT`].
    pub fn new(program: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
            workdir: workdir.into(),
            env: ProcessEnv::non_interactive(),
            timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    /// Run through a wrapper, e.g. `sh ./fake-gh` or `op run -- gh`.
    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Extra variables layered over the non-interactive defaults.
    pub fn with_env(mut self, env: &ProcessEnv) -> Self {
        self.env = self.env.merged(env);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn env(&self) -> &ProcessEnv {
        &self.env
    }

    /// Run `args` and return trimmed stdout, or a classified error on non-zero exit.
    pub fn run_checked(&self, args: &[&str]) -> Result<String, CommandError> {
        let rendered = self.render(args);
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.leading_args)
            .args(args)
            .current_dir(&self.workdir);

        debug!(command = %rendered, "running tool");
        let output = run_command_with_timeout(cmd, &self.env, self.timeout).map_err(|err| {
            CommandError::Spawn {
                command: rendered.clone(),
                message: format!("{err:#}"),
            }
        })?;

        if output.timed_out {
            return Err(CommandError::TimedOut {
                command: rendered,
                timeout_secs: self.timeout.as_secs(),
            });
        }
        if !output.success() {
            let stderr = output.stderr_text();
            return Err(CommandError::Failed {
                command: rendered,
                kind: classify_command_failure(&stderr),
                stderr,
            });
        }
        Ok(output.stdout_text())
    }

    /// Like [`Tool::run_checked`], but a non-zero exit is `Ok(false)`.
    pub fn run_status(&self, args: &[&str]) -> Result<bool, CommandError> {
        match self.run_checked(args) {
            Ok(_) => Ok(true),
            Err(CommandError::Failed { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn render(&self, args: &[&str]) -> String {
        let mut parts = vec![self.program.as_str()];
        parts.extend(self.leading_args.iter().map(String::as_str));
        parts.extend(args);
        parts.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_is_classified_from_stderr() {
        let tool = Tool::new("sh", ".");
        let err = tool
            .run_checked(&["-c", "echo 'Could not resolve host: example.invalid' 1>&2; exit 128"])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransientIo);
        assert!(err.to_string().starts_with("sh -c"));
    }

    #[test]
    fn timeout_is_classified_as_timeout() {
        let tool = Tool::new("sleep", ".").with_timeout(Duration::from_millis(100));
        let err = tool.run_checked(&["5"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn missing_program_is_fatal() {
        let tool = Tool::new("opsrun-definitely-missing-binary", ".");
        let err = tool.run_checked(&[]).unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
        assert_eq!(err.kind(), ErrorKind::Fatal);
    }

    #[test]
    fn tool_env_is_non_interactive_and_extendable() {
        let tool = Tool::new("sh", ".").with_env(&ProcessEnv::new().with("EXTRA", "x"));
        let out = tool
            .run_checked(&["-c", "echo $GIT_TERMINAL_PROMPT$GH_PROMPT_DISABLED$EXTRA"])
            .expect("run");
        assert_eq!(out, "01x");
    }

    #[test]
    fn run_status_maps_exit_code_to_bool() {
        let tool = Tool::new("sh", ".");
        assert!(tool.run_status(&["-c", "exit 0"]).expect("status"));
        assert!(!tool.run_status(&["-c", "exit 1"]).expect("status"));
    }
}
