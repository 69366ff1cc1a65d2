//! Language executors and the registry the judge selects them from.

pub mod base;
pub mod languages;
pub mod registry;

pub use base::{CompileOutcome, Executor, ExecutorBase, RuntimeInfo};
pub use registry::{ExecutorRegistry, ExecutorSpec, ExecutorVersions, BUILTIN_EXECUTORS};
