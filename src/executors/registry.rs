use super::base::{Executor, ExecutorBase, RuntimeInfo};
use super::languages::{c::CExecutor, cpp::Cpp17Executor, python::Python3Executor};
use crate::config::types::{ExecutorConfig, ExecutorManagerConfig, JudgeError, Result};
use log::{debug, info, warn};
use std::collections::BTreeMap;

/// How to build one language's executor
#[derive(Clone, Copy)]
pub struct ExecutorSpec {
    pub name: &'static str,
    /// Runtime looked up at registration
    pub command: &'static str,
    pub factory: fn(ExecutorBase) -> Box<dyn Executor>,
}

impl std::fmt::Debug for ExecutorSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorSpec")
            .field("name", &self.name)
            .field("command", &self.command)
            .finish()
    }
}

pub const BUILTIN_EXECUTORS: &[ExecutorSpec] = &[
    ExecutorSpec {
        name: CExecutor::NAME,
        command: CExecutor::COMMAND,
        factory: |base| Box::new(CExecutor::new(base)),
    },
    ExecutorSpec {
        name: Cpp17Executor::NAME,
        command: Cpp17Executor::COMMAND,
        factory: |base| Box::new(Cpp17Executor::new(base)),
    },
    ExecutorSpec {
        name: Python3Executor::NAME,
        command: Python3Executor::COMMAND,
        factory: |base| Box::new(Python3Executor::new(base)),
    },
];

/// Handshake payload: `{lang: [(command, version)]}`
pub type ExecutorVersions = BTreeMap<String, Vec<(String, Vec<u32>)>>;

#[derive(Debug, Clone)]
struct Registered {
    spec: ExecutorSpec,
    runtime: RuntimeInfo,
}

/// Explicit table of usable executors, filled at startup
#[derive(Debug, Clone)]
pub struct ExecutorRegistry {
    config: ExecutorConfig,
    executors: BTreeMap<&'static str, Registered>,
}

impl ExecutorRegistry {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            executors: BTreeMap::new(),
        }
    }

    /// Register the builtin executors the manager config selects and whose
    /// runtimes can be found
    pub fn with_builtins(manager: &ExecutorManagerConfig, config: &ExecutorConfig) -> Result<Self> {
        let mut registry = Self::new(config.clone());

        if manager.builtin_whitelist.is_some() && manager.builtin_blacklist.is_some() {
            return Err(JudgeError::Config(
                "`executors.builtin_whitelist` and `executors.builtin_blacklist` are mutually exclusive".to_string(),
            ));
        }
        for (name, location) in &manager.external {
            warn!("external executor {} at {} is not loadable here, skipping", name, location);
        }
        if !manager.include_builtin {
            return Ok(registry);
        }

        let selected: Vec<&ExecutorSpec> = match &manager.builtin_whitelist {
            Some(whitelist) => whitelist
                .iter()
                .map(|name| {
                    BUILTIN_EXECUTORS
                        .iter()
                        .find(|spec| spec.name == name.as_str())
                        .ok_or_else(|| JudgeError::Config(format!("there is no builtin executor named `{}`", name)))
                })
                .collect::<Result<_>>()?,
            None => {
                let blacklist = manager.builtin_blacklist.as_deref().unwrap_or(&[]);
                BUILTIN_EXECUTORS
                    .iter()
                    .filter(|spec| !blacklist.iter().any(|name| name == spec.name))
                    .collect()
            }
        };

        for spec in selected {
            match RuntimeInfo::locate(spec.command, config) {
                Some(runtime) => {
                    debug!(
                        "loaded {} executor ({} {})",
                        spec.name,
                        runtime.path.display(),
                        runtime.version_string()
                    );
                    registry.register(*spec, runtime);
                }
                None => warn!("{} executor unavailable: {} not found", spec.name, spec.command),
            }
        }
        info!("loaded executors: {}", registry.names().join(", "));
        Ok(registry)
    }

    pub fn register(&mut self, spec: ExecutorSpec, runtime: RuntimeInfo) {
        if self.executors.contains_key(spec.name) {
            warn!("executor {} registered twice, keeping the first", spec.name);
            return;
        }
        self.executors.insert(spec.name, Registered { spec, runtime });
    }

    /// Apply the judge-level `only_executors` / `exclude_executors` filters
    pub fn filter(&mut self, only: Option<&[String]>, exclude: Option<&[String]>) {
        if let Some(only) = only {
            self.executors.retain(|name, _| only.iter().any(|keep| keep == name));
        }
        if let Some(exclude) = exclude {
            self.executors.retain(|name, _| !exclude.iter().any(|drop| drop == name));
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.executors.keys().copied().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.executors.contains_key(name)
    }

    pub fn versions(&self) -> ExecutorVersions {
        self.executors
            .iter()
            .map(|(name, registered)| {
                (
                    name.to_string(),
                    vec![(registered.runtime.command.clone(), registered.runtime.version.clone())],
                )
            })
            .collect()
    }

    /// Build an executor for one submission
    pub fn create(&self, language: &str, problem_id: &str, source: Vec<u8>, unbuffered: bool) -> Result<Box<dyn Executor>> {
        let registered = self
            .executors
            .get(language)
            .ok_or_else(|| JudgeError::InvalidExecutorName(language.to_string()))?;
        let base = ExecutorBase::new(
            self.config.clone(),
            registered.runtime.clone(),
            problem_id,
            source,
            unbuffered,
        )?;
        Ok((registered.spec.factory)(base))
    }
}
