//! Observability
//!
//! Structured audit events for sandbox and worker decisions, plus the load
//! figures and counters the judge reports.

pub mod audit;
pub mod metrics;

pub use metrics::{HostLoad, JudgeMetrics};
