//! judgebox: a remote code-execution judge with a ptrace syscall sandbox
//!
//! # Architecture
//!
//! ## Sandbox ([`sandbox`], [`kernel`])
//! - [`sandbox::filesystem`]: path rules and their matching
//! - [`sandbox::policy`]: per-syscall decision table
//! - [`sandbox::isolate`]: path-checked handlers for filesystem syscalls
//! - [`kernel::abi`]: syscall tables and register decoding per ABI
//! - [`kernel::ptrace`]: thin wrappers over the trace interface
//! - [`kernel::signal`]: shutdown signalling for the judge main loop
//!
//! ## Execution Control ([`exec`])
//! - [`exec::process`]: traced launch, kill and outcome collection
//! - [`exec::limits`]: rlimits, personality and affinity applied before exec
//! - [`exec::output`]: capped stdout/stderr capture
//!
//! ## Grading ([`problem`], [`executors`], [`graders`], [`verdict`])
//! - [`problem`]: problem discovery, `init.yml` loading, test cases
//! - [`executors`]: language executors and their explicit registry
//! - [`graders`]: graders, checkers and abort handles
//! - [`verdict`]: verdict bits, per-case results and classification
//!
//! ## Orchestration ([`worker`], [`protocol`], [`judge`])
//! - [`worker`]: one process per submission, talking over a socket pair
//! - [`protocol`]: framed, compressed packets to the server
//! - [`judge`]: the judge state machine
//!
//! ## Ambient ([`config`], [`observability`], [`cli`])

// Sandbox
pub mod kernel;
pub mod sandbox;

// Execution Control
pub mod exec;

// Grading
pub mod executors;
pub mod graders;
pub mod problem;
pub mod verdict;

// Orchestration
pub mod judge;
pub mod protocol;
pub mod worker;

// Observability
pub mod observability;

// Configuration
pub mod config;

// CLI entrypoint shared with the worker re-exec path
pub mod cli;

pub use config::types::{JudgeError, Result};
