//! Cancellable step runner.
//!
//! Runs an ordered list of [`StepSpec`]s, streaming each step's merged output
//! to a caller-supplied sink. The run stops at the first failing step or as
//! soon as the [`CancellationSignal`] is observed.

use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancellationSignal;
use crate::core::types::{ExecutionResult, StepSpec};
use crate::exit_codes;
use crate::io::process::{ProcessEnv, StreamOptions, stream_command};

pub const NO_OUTPUT_LINE: &str = "Completed with no output";

/// Receives transcript lines as they are produced, synchronously and in order.
///
/// Implemented for any `FnMut(&str)`. A sink that marshals lines to another
/// thread (a UI, a channel) is responsible for its own synchronization.
pub trait LineSink {
    fn line(&mut self, line: &str);
}

impl<F: FnMut(&str)> LineSink for F {
    fn line(&mut self, line: &str) {
        self(line);
    }
}

/// Process-level settings shared by every step of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineOptions {
    pub stream: StreamOptions,
    pub env: ProcessEnv,
}

impl PipelineOptions {
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.stream.wait_timeout = timeout;
        self
    }

    pub fn with_env(mut self, env: ProcessEnv) -> Self {
        self.env = env;
        self
    }
}

/// Transcript under construction: every line goes to the sink and the transcript together.
struct Recorder<'a, S: LineSink + ?Sized> {
    sink: &'a mut S,
    transcript: Vec<String>,
    steps_run: Vec<String>,
}

impl<'a, S: LineSink + ?Sized> Recorder<'a, S> {
    fn new(sink: &'a mut S) -> Self {
        Self {
            sink,
            transcript: Vec::new(),
            steps_run: Vec::new(),
        }
    }

    fn emit(&mut self, line: impl Into<String>) {
        let line = line.into();
        self.sink.line(&line);
        self.transcript.push(line);
    }

    fn failed(mut self, step: &StepSpec, exit_code: i32) -> ExecutionResult {
        warn!(label = %step.label, exit_code, "step failed, stopping run");
        self.emit(format!(
            "Step '{}' failed with exit code {exit_code}",
            step.label
        ));
        ExecutionResult {
            exit_code,
            transcript: self.transcript,
            failed_step_label: Some(step.label.clone()),
            cancelled: false,
            steps_run: self.steps_run,
        }
    }

    fn cancelled(mut self, line: String) -> ExecutionResult {
        info!(%line, "run cancelled");
        self.emit(line);
        ExecutionResult {
            exit_code: exit_codes::CANCELLED,
            transcript: self.transcript,
            failed_step_label: None,
            cancelled: true,
            steps_run: self.steps_run,
        }
    }

    fn succeeded(mut self) -> ExecutionResult {
        if self.transcript.is_empty() {
            self.emit(NO_OUTPUT_LINE);
        }
        ExecutionResult {
            exit_code: exit_codes::OK,
            transcript: self.transcript,
            failed_step_label: None,
            cancelled: false,
            steps_run: self.steps_run,
        }
    }
}

/// Run `steps` in order on the calling thread.
///
/// Cancellation is checked before each step starts and before each output
/// line is consumed. Skipped steps are neither launched nor mentioned in the
/// transcript.
#[instrument(skip_all, fields(steps = steps.len()))]
pub fn run_steps<S: LineSink + ?Sized>(
    steps: &[StepSpec],
    sink: &mut S,
    cancel: &CancellationSignal,
    options: &PipelineOptions,
) -> ExecutionResult {
    let mut recorder = Recorder::new(sink);

    for step in steps {
        if cancel.is_cancelled() {
            return recorder.cancelled(format!("Cancelled before step '{}'", step.label));
        }

        info!(label = %step.label, command = %step.display_command(), "starting step");
        recorder.emit(format!("==> Starting step: {}", step.label));
        recorder.steps_run.push(step.label.clone());

        let launched = build_command(step).and_then(|cmd| {
            stream_command(cmd, &options.env, &options.stream, cancel, &mut |line: &str| {
                recorder.emit(line);
            })
        });

        let outcome = match launched {
            Ok(outcome) => outcome,
            Err(err) => {
                recorder.emit(format!("Failed to start '{}': {err:#}", step.label));
                return recorder.failed(step, exit_codes::FAILED);
            }
        };

        if outcome.cancelled {
            return recorder.cancelled(format!("Cancelled during step '{}'", step.label));
        }
        if outcome.timed_out {
            recorder.emit(format!(
                "Step '{}' did not exit within {}s and was killed",
                step.label,
                options.stream.wait_timeout.as_secs()
            ));
        }

        let exit_code = outcome.exit_code();
        if exit_code != exit_codes::OK {
            return recorder.failed(step, exit_code);
        }
        debug!(label = %step.label, "step succeeded");
    }

    recorder.succeeded()
}

fn build_command(step: &StepSpec) -> Result<Command> {
    let (program, args) = step
        .command
        .split_first()
        .ok_or_else(|| anyhow!("empty command"))?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Some(dir) = &step.workdir {
        cmd.current_dir(dir);
    }
    Ok(cmd)
}
