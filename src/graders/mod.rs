//! Graders turn one test case into a [`TestResult`] by running the executor
//! and checking what it printed.

pub mod checkers;
pub mod standard;

pub use standard::StandardGrader;

use crate::config::types::{GraderManagerConfig, JudgeError, Result};
use crate::executors::Executor;
use crate::exec::ProcessKiller;
use crate::problem::{Problem, TestCase};
use crate::verdict::TestResult;
use log::{info, warn};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// What the worker needs from a grader
pub trait Grader: Send {
    fn grade(&mut self, case: &TestCase) -> Result<TestResult>;

    /// Handle the worker's abort receiver uses from its own thread
    fn abort_handle(&self) -> AbortHandle;

    /// Stop grading and kill the case currently running, if any
    fn abort_grading(&self) {
        self.abort_handle().abort();
    }

    fn is_aborted(&self) -> bool {
        self.abort_handle().is_aborted()
    }
}

/// Cross-thread abort flag plus the killer of the running case
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    aborted: Arc<AtomicBool>,
    current: Arc<Mutex<Option<ProcessKiller>>>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the running process; kills it at once if an abort already came in
    pub fn track(&self, killer: ProcessKiller) {
        let mut current = self.current.lock();
        if self.is_aborted() {
            killer.kill();
        }
        *current = Some(killer);
    }

    pub fn untrack(&self) {
        *self.current.lock() = None;
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        if let Some(killer) = self.current.lock().as_ref() {
            killer.kill();
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

/// Builds a grader that reports its running case to the given abort handle
pub type GraderFactory = fn(Arc<Problem>, Box<dyn Executor>, AbortHandle) -> Result<Box<dyn Grader>>;

pub const BUILTIN_GRADERS: &[(&str, GraderFactory)] = &[("standard", |problem, executor, abort| {
    Ok(Box::new(StandardGrader::new(problem, executor, abort)?))
})];

/// Explicit table of graders, filled at startup
#[derive(Clone, Default)]
pub struct GraderRegistry {
    graders: BTreeMap<&'static str, GraderFactory>,
}

impl std::fmt::Debug for GraderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.graders.keys()).finish()
    }
}

impl GraderRegistry {
    pub fn with_builtins(config: &GraderManagerConfig) -> Self {
        let mut registry = Self::default();
        for (name, location) in &config.external {
            warn!("external grader {} at {} is not loadable here, skipping", name, location);
        }
        if config.include_builtin {
            for (name, factory) in BUILTIN_GRADERS {
                registry.register(*name, *factory);
            }
        }
        info!("loaded graders: {}", registry.names().join(", "));
        registry
    }

    pub fn register(&mut self, name: &'static str, factory: GraderFactory) {
        self.graders.entry(name).or_insert(factory);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.graders.keys().copied().collect()
    }

    pub fn create(
        &self,
        name: &str,
        problem: Arc<Problem>,
        executor: Box<dyn Executor>,
        abort: AbortHandle,
    ) -> Result<Box<dyn Grader>> {
        let factory = self
            .graders
            .get(name)
            .ok_or_else(|| JudgeError::InvalidGraderName(name.to_string()))?;
        factory(problem, executor, abort)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_is_shared_between_clones() {
        let handle = AbortHandle::new();
        let receiver = handle.clone();
        assert!(!handle.is_aborted());
        receiver.abort();
        assert!(handle.is_aborted());
    }

    #[test]
    fn test_registry_builtins() {
        let registry = GraderRegistry::with_builtins(&GraderManagerConfig::default());
        assert_eq!(registry.names(), vec!["standard"]);

        let empty = GraderRegistry::with_builtins(&GraderManagerConfig {
            include_builtin: false,
            ..GraderManagerConfig::default()
        });
        assert!(empty.names().is_empty());
    }
}
