//! Harness — the execution layer between agent orchestration and the
//! outside world.
//!
//! This crate owns the seams the orchestration crates are written against:
//! - Plan generation through an opaque [`generation::GenerationBackend`], with
//!   strict decoding and one shared fallback policy for every stage
//! - Action and task execution capabilities that report a closed
//!   [`execution::ErrorKind`] instead of free text
//! - Retry backoff whose waits are cancellable

pub mod execution;
pub mod generation;
pub mod retry;
