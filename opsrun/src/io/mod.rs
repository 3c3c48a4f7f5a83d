//! Side-effecting helpers: processes, external tools, config and plan files.

pub mod config;
pub mod git;
pub mod github;
pub mod plan;
pub mod process;
pub mod tool;
