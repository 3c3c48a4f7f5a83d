//! Retry and cancellable step execution for operational tasks.
//!
//! Two independent building blocks, plus the adapters that use them:
//!
//! - **[`retry`]**: bounded retries with exponential backoff, driven by a
//!   per-call [`core::backoff::RetryPolicy`] and errors that classify
//!   themselves via [`core::classifier::Classify`].
//! - **[`pipeline`]**: runs an ordered list of external commands, streaming
//!   merged output line by line to a sink and stopping on the first failure or
//!   when a [`cancel::CancellationSignal`] is set.
//!
//! The crate keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (backoff math, failure
//!   classification, step and result types, the docker cleanup plan).
//! - **[`io`]**: Side-effecting operations (process spawning, `git`/`gh`
//!   adapters, config and plan files).

pub mod cancel;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod pipeline;
pub mod retry;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
