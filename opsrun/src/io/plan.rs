//! Step plans: TOML files listing the steps for `opsrun run`.
//!
//! ```toml
//! [[step]]
//! label = "Build"
//! command = ["cargo", "build", "--release"]
//!
//! [[step]]
//! label = "Package"
//! command = ["tar", "czf", "dist.tgz", "target/release/app"]
//! workdir = "."
//! ```

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::debug;

use crate::core::types::StepSpec;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PlanFile {
    #[serde(default, rename = "step")]
    steps: Vec<StepSpec>,
}

/// Load and validate a plan. Relative step workdirs resolve against the plan's directory.
pub fn load_plan(path: &Path) -> Result<Vec<StepSpec>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))?;
    let mut steps =
        parse_plan(&contents).with_context(|| format!("parse plan {}", path.display()))?;

    let base = path.parent().unwrap_or_else(|| Path::new(""));
    for step in &mut steps {
        if let Some(dir) = &step.workdir
            && dir.is_relative()
        {
            step.workdir = Some(base.join(dir));
        }
    }
    debug!(path = %path.display(), steps = steps.len(), "plan loaded");
    Ok(steps)
}

/// Parse plan TOML and check labels and commands.
pub fn parse_plan(contents: &str) -> Result<Vec<StepSpec>> {
    let plan: PlanFile = toml::from_str(contents).context("parse plan toml")?;
    validate_steps(&plan.steps)?;
    Ok(plan.steps)
}

fn validate_steps(steps: &[StepSpec]) -> Result<()> {
    let mut errors = Vec::new();
    let mut seen = BTreeSet::new();
    for (idx, step) in steps.iter().enumerate() {
        let position = idx + 1;
        if step.label.trim().is_empty() {
            errors.push(format!("step {position}: label must not be empty"));
        } else if !seen.insert(step.label.as_str()) {
            errors.push(format!("step {position}: duplicate label '{}'", step.label));
        }
        if step.command.first().is_none_or(|program| program.trim().is_empty()) {
            errors.push(format!("step {position}: command must be a non-empty array"));
        }
    }
    if !errors.is_empty() {
        bail!("invalid plan:\n- {}", errors.join("\n- "));
    }
    Ok(())
}
