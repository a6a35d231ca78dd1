//! Observability for taskhive binaries.
//!
//! - **Logging**: human-readable or JSON output via `tracing-subscriber`
//! - **Metrics**: counters, gauges and histograms with Prometheus and JSON
//!   export

pub mod logging;
pub mod metrics;
