//! Thin wrappers around kernel primitives.
//!
//! Register-level `unsafe` code lives in `ptrace` with explicit SAFETY comments.

pub mod abi;
#[cfg(target_os = "linux")]
pub mod ptrace;
pub mod signal;
