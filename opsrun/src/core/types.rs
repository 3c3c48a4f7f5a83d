//! Shared deterministic types for step execution.
//!
//! These types define the contract between the step runner and its callers.
//! They carry no I/O handles and serialize to stable JSON.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::exit_codes;

/// One external command to run as part of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Human-readable name, reported in the transcript and on failure.
    pub label: String,
    /// Program followed by its arguments.
    pub command: Vec<String>,
    /// Working directory for the process. Inherits the caller's when `None`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<PathBuf>,
}

impl StepSpec {
    pub fn new<I, S>(label: impl Into<String>, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            label: label.into(),
            command: command.into_iter().map(Into::into).collect(),
            workdir: None,
        }
    }

    pub fn in_dir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    /// The command rendered for log lines (`docker image prune -f`).
    pub fn display_command(&self) -> String {
        self.command.join(" ")
    }
}

/// Outcome of a full pipeline run. Built once, immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// `0` on success; the failing step's exit code, `-1` for a timed out or
    /// unreapable step, `130` on cancellation.
    pub exit_code: i32,
    /// Every line emitted during the run, in order.
    pub transcript: Vec<String>,
    /// Label of the step that stopped the run, if a step failed.
    pub failed_step_label: Option<String>,
    pub cancelled: bool,
    /// Labels of steps that were launched, in order.
    pub steps_run: Vec<String>,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == exit_codes::OK && !self.cancelled
    }

    /// The transcript joined with newlines, as shown to users.
    pub fn transcript_text(&self) -> String {
        self.transcript.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_spec_builds_from_str_slices() {
        let step = StepSpec::new("prune", ["docker", "image", "prune", "-f"]).in_dir("/tmp");
        assert_eq!(step.display_command(), "docker image prune -f");
        assert_eq!(step.workdir, Some(PathBuf::from("/tmp")));
    }

    #[test]
    fn step_spec_omits_missing_workdir_in_json() {
        let step = StepSpec::new("a", ["true"]);
        let json = serde_json::to_string(&step).expect("serialize");
        assert_eq!(json, r#"{"label":"a","command":["true"]}"#);
    }

    #[test]
    fn cancelled_result_is_not_success() {
        let result = ExecutionResult {
            exit_code: 0,
            transcript: vec!["x".to_string(), "y".to_string()],
            failed_step_label: None,
            cancelled: true,
            steps_run: Vec::new(),
        };
        assert!(!result.success());
        assert_eq!(result.transcript_text(), "x\ny");
    }
}
