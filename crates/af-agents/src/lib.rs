//! Task execution for auto-forge.
//!
//! - [`task_runner`] drives persisted tasks through their state machine with
//!   retries, routing, and self-heal labelling
//! - [`plan_executor`] runs action plans step by step
//! - [`pipeline`] composes plan generation, code generation, and execution
//!   into one request

pub mod pipeline;
pub mod plan_executor;
pub mod preflight;
pub mod routing;
pub mod self_heal;
pub mod state_machine;
pub mod task_runner;
