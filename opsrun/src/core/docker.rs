//! Docker cleanup plan.
//!
//! Builds the ordered prune steps; running them is the step runner's job.

use crate::core::types::StepSpec;

/// Which optional prune steps to include.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupOptions {
    /// Remove every unused image, not only dangling ones.
    pub all_images: bool,
    /// Also remove unused volumes. Off by default since volumes hold data.
    pub volumes: bool,
}

/// Ordered steps: containers first so their images become unreferenced,
/// then images, optionally volumes, then build cache.
pub fn cleanup_steps(options: CleanupOptions) -> Vec<StepSpec> {
    let mut steps = vec![StepSpec::new(
        "Remove stopped containers",
        ["docker", "container", "prune", "-f"],
    )];

    let mut image_prune = vec!["docker", "image", "prune", "-f"];
    if options.all_images {
        image_prune.push("-a");
    }
    steps.push(StepSpec::new(
        if options.all_images {
            "Remove unused images"
        } else {
            "Remove dangling images"
        },
        image_prune,
    ));

    if options.volumes {
        steps.push(StepSpec::new(
            "Remove unused volumes",
            ["docker", "volume", "prune", "-f"],
        ));
    }

    steps.push(StepSpec::new(
        "Remove build cache",
        ["docker", "builder", "prune", "-f"],
    ));
    steps
}
