//! opsrun configuration stored in `opsrun.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::backoff::{DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS, RetryPolicy};
use crate::core::classifier::ErrorKind;
use crate::io::process::{ProcessEnv, StreamOptions};
use crate::pipeline::PipelineOptions;

pub const DEFAULT_CONFIG_FILE: &str = "opsrun.toml";

/// opsrun configuration (TOML).
///
/// Meant to be edited by humans. Missing fields default to the values the
/// CLI would use without a config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct OpsConfig {
    pub retry: RetryConfig,
    pub runner: RunnerConfig,
    /// Extra environment for every spawned process, layered over the
    /// non-interactive defaults.
    pub env: ProcessEnv,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_secs: f64,
    pub retryable_kinds: Vec<ErrorKind>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_secs: DEFAULT_BASE_DELAY.as_secs_f64(),
            retryable_kinds: ErrorKind::DEFAULT_TRANSIENT.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Bound on waiting for a step's process to exit after its output closes.
    pub wait_timeout_secs: u64,
    /// Cancellation poll interval while a step is silent.
    pub poll_interval_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        let stream = StreamOptions::default();
        Self {
            wait_timeout_secs: stream.wait_timeout.as_secs(),
            poll_interval_ms: stream.poll_interval.as_millis() as u64,
        }
    }
}

impl OpsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(anyhow!("retry.max_attempts must be >= 1"));
        }
        self.base_delay()?;
        if self.runner.wait_timeout_secs == 0 {
            return Err(anyhow!("runner.wait_timeout_secs must be > 0"));
        }
        if self.runner.poll_interval_ms == 0 {
            return Err(anyhow!("runner.poll_interval_ms must be > 0"));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        RetryPolicy::new(
            self.retry.max_attempts,
            self.base_delay()?,
            self.retry.retryable_kinds.iter().copied(),
        )
    }

    fn base_delay(&self) -> Result<Duration> {
        Duration::try_from_secs_f64(self.retry.base_delay_secs).map_err(|err| {
            anyhow!(
                "retry.base_delay_secs must be a non-negative number of seconds ({}): {err}",
                self.retry.base_delay_secs
            )
        })
    }

    /// Step runner options: configured timings plus the non-interactive
    /// environment overlaid with `[env]`.
    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            stream: StreamOptions {
                wait_timeout: Duration::from_secs(self.runner.wait_timeout_secs),
                poll_interval: Duration::from_millis(self.runner.poll_interval_ms),
            },
            env: ProcessEnv::non_interactive().merged(&self.env),
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `OpsConfig::default()`.
pub fn load_config(path: &Path) -> Result<OpsConfig> {
    if !path.exists() {
        let cfg = OpsConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: OpsConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &OpsConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
