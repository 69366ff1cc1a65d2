use crate::config::types::Result;
use crate::executors::base::{CompileOutcome, Executor, ExecutorBase, RUNTIME_SYSCALLS};
use std::collections::BTreeMap;
use std::path::PathBuf;

const SOURCE: &str = "_main.py";

/// CPython 3, interpreted straight from the working directory
#[derive(Debug)]
pub struct Python3Executor {
    base: ExecutorBase,
}

impl Python3Executor {
    pub const NAME: &'static str = "PY3";
    pub const COMMAND: &'static str = "python3";

    pub fn new(base: ExecutorBase) -> Self {
        Self { base }
    }
}

impl Executor for Python3Executor {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn base(&self) -> &ExecutorBase {
        &self.base
    }

    fn prepare(&mut self) -> Result<CompileOutcome> {
        self.base.write_source(SOURCE)?;
        Ok(CompileOutcome::Ready { message: None })
    }

    fn executable(&self) -> PathBuf {
        self.base.runtime.path.clone()
    }

    fn command_line(&self) -> Vec<String> {
        vec![
            self.base.runtime.command.clone(),
            "-B".to_string(),
            self.base.working_dir().join(SOURCE).display().to_string(),
        ]
    }

    fn allowed_syscalls(&self) -> Vec<&'static str> {
        let mut names = RUNTIME_SYSCALLS.to_vec();
        names.extend(["getdents", "getdents64", "fstatfs", "statfs", "getppid", "sched_getparam"]);
        names
    }

    // The interpreter stats a long list of candidate module paths.
    fn lookup_errno(&self) -> bool {
        true
    }

    fn env(&self) -> BTreeMap<String, String> {
        let mut env = self.base.env();
        env.insert("PYTHONIOENCODING".to_string(), "utf8".to_string());
        if self.base.unbuffered {
            env.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());
        }
        env
    }
}
