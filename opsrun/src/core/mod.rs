//! Deterministic, pure logic shared by the retry executor and step runner.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod backoff;
pub mod classifier;
pub mod docker;
pub mod types;
