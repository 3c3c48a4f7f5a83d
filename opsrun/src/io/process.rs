//! Helpers for running child processes with timeouts, streamed output, and
//! cooperative cancellation.

use std::collections::BTreeMap;
use std::io::{self, BufRead, BufReader, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::cancel::CancellationSignal;
use crate::exit_codes;

/// Environment overrides applied to every spawned process.
///
/// Passed explicitly to each launch instead of mutating this process's own
/// environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessEnv {
    vars: BTreeMap<String, String>,
}

impl ProcessEnv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Disables credential and confirmation prompts from `git` and `gh`.
    pub fn non_interactive() -> Self {
        Self::new()
            .with("GIT_TERMINAL_PROMPT", "0")
            .with("GCM_INTERACTIVE", "never")
            .with("GH_PROMPT_DISABLED", "1")
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// `other` wins on conflicting keys.
    pub fn merged(&self, other: &ProcessEnv) -> ProcessEnv {
        let mut vars = self.vars.clone();
        vars.extend(other.vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        ProcessEnv { vars }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn apply(&self, cmd: &mut Command) {
        cmd.envs(&self.vars);
    }
}

/// Timing knobs for [`stream_command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOptions {
    /// Bound on waiting for exit once output has closed.
    pub wait_timeout: Duration,
    /// How often the cancellation flag is polled while no output arrives.
    pub poll_interval: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// How a streamed process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOutcome {
    /// `None` when the process timed out, died by signal or could not be reaped.
    pub status: Option<ExitStatus>,
    pub cancelled: bool,
    pub timed_out: bool,
}

impl StreamOutcome {
    pub fn exit_code(&self) -> i32 {
        self.status
            .and_then(|status| status.code())
            .unwrap_or(exit_codes::WAIT_FAILED)
    }
}

/// Spawn `cmd` with stdin closed and forward its combined stdout/stderr to
/// `on_line`, one non-empty line at a time, in arrival order.
///
/// `cancel` is checked before each line is handed over and on every poll
/// tick. Once it is set the process is killed and reaped and no further
/// output is forwarded.
///
/// Errors only when the process cannot be started. Every other outcome,
/// including timeouts and failed waits, is reported through [`StreamOutcome`]
/// after the child has been killed and reaped.
#[instrument(skip_all, fields(wait_timeout_secs = options.wait_timeout.as_secs()))]
pub fn stream_command(
    mut cmd: Command,
    env: &ProcessEnv,
    options: &StreamOptions,
    cancel: &CancellationSignal,
    on_line: &mut dyn FnMut(&str),
) -> Result<StreamOutcome> {
    env.apply(&mut cmd);
    // One pipe for both streams keeps stdout and stderr lines in write order.
    let (reader, writer) = io::pipe().context("create output pipe")?;
    let stderr_writer = writer.try_clone().context("clone output pipe")?;
    cmd.stdin(Stdio::null())
        .stdout(writer)
        .stderr(stderr_writer);

    debug!("spawning child process");
    let spawned = cmd.spawn();
    // `cmd` holds the parent's copies of the write end; EOF needs them closed.
    drop(cmd);
    let mut child = match spawned {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let (tx, rx) = mpsc::channel::<String>();
    let output_reader = spawn_line_reader(reader, tx);

    let mut cancelled = false;
    loop {
        if cancel.is_cancelled() {
            cancelled = true;
            break;
        }
        match rx.recv_timeout(options.poll_interval) {
            Ok(line) => {
                if cancel.is_cancelled() {
                    cancelled = true;
                    break;
                }
                let line = line.trim_end_matches(['\n', '\r']);
                if !line.trim().is_empty() {
                    on_line(line);
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if cancelled {
        warn!("cancellation requested, terminating child process");
        let status = terminate(&mut child);
        // Not joined: the reader ends once the last writer of the pipe closes.
        return Ok(StreamOutcome {
            status,
            cancelled: true,
            timed_out: false,
        });
    }

    if output_reader.join().is_err() {
        warn!("output reader thread panicked");
    }

    let outcome = match child.wait_timeout(options.wait_timeout) {
        Ok(Some(status)) => StreamOutcome {
            status: Some(status),
            cancelled: false,
            timed_out: false,
        },
        Ok(None) => {
            warn!(
                timeout_secs = options.wait_timeout.as_secs(),
                "command timed out, killing"
            );
            terminate(&mut child);
            StreamOutcome {
                status: None,
                cancelled: false,
                timed_out: true,
            }
        }
        Err(e) => {
            error!(err = %e, "waiting for command failed, killing");
            terminate(&mut child);
            StreamOutcome {
                status: None,
                cancelled: false,
                timed_out: false,
            }
        }
    };

    debug!(
        exit_code = outcome.exit_code(),
        timed_out = outcome.timed_out,
        "command finished"
    );
    Ok(outcome)
}

/// Forward each line of `reader` into `tx` until EOF, a read error, or the receiver hangs up.
fn spawn_line_reader<R: Read + Send + 'static>(
    reader: R,
    tx: Sender<String>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        loop {
            let mut line = Vec::new();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) => {
                    if tx.send(String::from_utf8_lossy(&line).into_owned()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(err = %e, "read child output");
                    break;
                }
            }
        }
    })
}

/// Best-effort kill followed by a reap. Returns the exit status if the reap succeeded.
fn terminate(child: &mut Child) -> Option<ExitStatus> {
    if let Err(e) = child.kill() {
        // Already exited is the common case here; the wait below still reaps it.
        debug!(err = %e, "kill child process");
    }
    match child.wait() {
        Ok(status) => Some(status),
        Err(e) => {
            error!(err = %e, "reap child process");
            None
        }
    }
}

/// Captured output of a non-streamed command.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: Option<ExitStatus>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.is_some_and(|status| status.success())
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. Stdin is closed.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs()))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    env: &ProcessEnv,
    timeout: Duration,
) -> Result<CommandOutput> {
    env.apply(&mut cmd);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
        (Some(stdout), Some(stderr)) => (stdout, stderr),
        _ => {
            terminate(&mut child);
            return Err(anyhow!("stdout/stderr were not piped"));
        }
    };

    let stdout_handle = thread::spawn(move || read_all(stdout));
    let stderr_handle = thread::spawn(move || read_all(stderr));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout) {
        Ok(Some(status)) => Some(status),
        Ok(None) => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            terminate(&mut child);
            None
        }
        Err(e) => {
            error!(err = %e, "waiting for command failed, killing");
            terminate(&mut child);
            None
        }
    };

    let stdout = join_output(stdout_handle).context("join stdout")?;
    let stderr = join_output(stderr_handle).context("join stderr")?;

    debug!(exit_code = ?status.and_then(|s| s.code()), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        timed_out,
    })
}

fn read_all<R: Read>(mut reader: R) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).context("read output")?;
    Ok(buf)
}

fn join_output(handle: thread::JoinHandle<Result<Vec<u8>>>) -> Result<Vec<u8>> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    fn collect(
        cmd: Command,
        env: &ProcessEnv,
        options: &StreamOptions,
        cancel: &CancellationSignal,
    ) -> (StreamOutcome, Vec<String>) {
        let mut lines = Vec::new();
        let outcome = stream_command(cmd, env, options, cancel, &mut |line: &str| {
            lines.push(line.to_string());
        })
        .expect("stream");
        (outcome, lines)
    }

    #[test]
    fn streams_non_empty_lines_and_exit_code() {
        let (outcome, lines) = collect(
            sh("echo one; echo; echo two; exit 3"),
            &ProcessEnv::new(),
            &StreamOptions::default(),
            &CancellationSignal::new(),
        );
        assert_eq!(lines, vec!["one", "two"]);
        assert_eq!(outcome.exit_code(), 3);
        assert!(!outcome.cancelled);
    }

    #[test]
    fn interleaved_stdout_and_stderr_keep_write_order() {
        let (outcome, lines) = collect(
            sh(concat!(
                "i=0; while [ $i -lt 200 ]; do ",
                "echo l$i; i=$((i+1)); echo l$i 1>&2; i=$((i+1)); ",
                "done"
            )),
            &ProcessEnv::new(),
            &StreamOptions::default(),
            &CancellationSignal::new(),
        );
        let expected: Vec<String> = (0..200).map(|i| format!("l{i}")).collect();
        assert_eq!(lines, expected);
        assert_eq!(outcome.exit_code(), 0);
    }

    #[test]
    fn stdin_is_closed() {
        let (outcome, lines) = collect(
            sh("cat; echo done"),
            &ProcessEnv::new(),
            &StreamOptions::default(),
            &CancellationSignal::new(),
        );
        assert_eq!(lines, vec!["done"]);
        assert_eq!(outcome.exit_code(), 0);
    }

    #[test]
    fn env_is_applied_per_command() {
        let env = ProcessEnv::non_interactive().with("OPSRUN_TEST_VAR", "hello");
        let (_, lines) = collect(
            sh("echo $OPSRUN_TEST_VAR $GIT_TERMINAL_PROMPT"),
            &env,
            &StreamOptions::default(),
            &CancellationSignal::new(),
        );
        assert_eq!(lines, vec!["hello 0"]);
        assert!(std::env::var("OPSRUN_TEST_VAR").is_err());
    }

    #[test]
    fn preset_cancellation_kills_before_any_line() {
        let cancel = CancellationSignal::new();
        cancel.cancel();
        let (outcome, lines) = collect(
            sh("echo never; sleep 5"),
            &ProcessEnv::new(),
            &StreamOptions::default(),
            &cancel,
        );
        assert!(outcome.cancelled);
        assert!(lines.is_empty());
    }

    #[test]
    fn cancellation_of_silent_process_is_observed_on_poll() {
        let cancel = CancellationSignal::new();
        let _watchdog = cancel.cancel_after(Duration::from_millis(100));
        let started = std::time::Instant::now();
        let (outcome, _) = collect(
            sh("sleep 30"),
            &ProcessEnv::new(),
            &StreamOptions {
                wait_timeout: Duration::from_secs(60),
                poll_interval: Duration::from_millis(20),
            },
            &cancel,
        );
        assert!(outcome.cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn spawn_failure_is_an_error() {
        let err = stream_command(
            Command::new("opsrun-definitely-missing-binary"),
            &ProcessEnv::new(),
            &StreamOptions::default(),
            &CancellationSignal::new(),
            &mut |_: &str| {},
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("spawn command"));
    }

    #[test]
    fn captured_command_reports_timeout() {
        let output = run_command_with_timeout(
            sh("sleep 5"),
            &ProcessEnv::new(),
            Duration::from_millis(100),
        )
        .expect("run");
        assert!(output.timed_out);
        assert!(!output.success());
    }

    #[test]
    fn captured_command_splits_streams() {
        let output = run_command_with_timeout(
            sh("echo out; echo err 1>&2"),
            &ProcessEnv::new(),
            Duration::from_secs(5),
        )
        .expect("run");
        assert!(output.success());
        assert_eq!(output.stdout_text(), "out");
        assert_eq!(output.stderr_text(), "err");
    }

    #[test]
    fn merged_env_prefers_override() {
        let base = ProcessEnv::new().with("A", "1").with("B", "1");
        let merged = base.merged(&ProcessEnv::new().with("B", "2"));
        assert_eq!(merged.get("A"), Some("1"));
        assert_eq!(merged.get("B"), Some("2"));
    }
}
