//! Verdict bits and per-case results
//!
//! [`result`] holds the bitmask and the reported figures; [`classify`]
//! derives the bits from a finished process as a pure function.

pub mod classify;
pub mod result;

pub use classify::{CaseLimits, Classification, VerdictClassifier};
pub use result::{ResultFlags, TestResult};
