//! Observability for auto-forge: `tracing` subscriber setup and an
//! in-process metrics collector with Prometheus text export.
//!
//! - **Logging**: human-readable or JSON output via `tracing-subscriber`
//! - **Metrics**: labelled counters, gauges, and histograms; metric names used
//!   by the runner, the plan executor, and the validator live in [`metrics::names`]

pub mod logging;
pub mod metrics;
