use crate::config::types::Result;
use crate::executors::base::{missing_artifact, CompileOutcome, Executor, ExecutorBase};
use std::path::PathBuf;

const SOURCE: &str = "_main.c";
const BINARY: &str = "_main";

/// C11 through gcc
#[derive(Debug)]
pub struct CExecutor {
    base: ExecutorBase,
}

impl CExecutor {
    pub const NAME: &'static str = "C";
    pub const COMMAND: &'static str = "gcc";

    pub fn new(base: ExecutorBase) -> Self {
        Self { base }
    }

    pub(crate) fn compile_args(&self, std: &str, source: &str) -> Vec<String> {
        vec![
            self.base.runtime.command.clone(),
            format!("-std={}", std),
            "-O2".to_string(),
            "-Wall".to_string(),
            "-DONLINE_JUDGE".to_string(),
            "-o".to_string(),
            BINARY.to_string(),
            source.to_string(),
            "-lm".to_string(),
        ]
    }
}

/// Shared by the gcc-family executors
pub(crate) fn compile_native(base: &ExecutorBase, source: &str, argv: Vec<String>) -> Result<CompileOutcome> {
    base.write_source(source)?;
    let outcome = base.compile(argv)?;
    if matches!(outcome, CompileOutcome::Ready { .. }) {
        let binary = base.working_dir().join(BINARY);
        if !binary.is_file() {
            return Err(missing_artifact(&binary));
        }
    }
    Ok(outcome)
}

pub(crate) fn binary_path(base: &ExecutorBase) -> PathBuf {
    base.working_dir().join(BINARY)
}

impl Executor for CExecutor {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn base(&self) -> &ExecutorBase {
        &self.base
    }

    fn prepare(&mut self) -> Result<CompileOutcome> {
        compile_native(&self.base, SOURCE, self.compile_args("c11", SOURCE))
    }

    fn executable(&self) -> PathBuf {
        binary_path(&self.base)
    }

    fn command_line(&self) -> Vec<String> {
        vec![self.executable().display().to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::base::test_support::base;

    #[test]
    fn test_command_line_runs_binary_in_workdir() {
        let executor = CExecutor::new(base("int main(){}"));
        let binary = executor.working_dir().join("_main");
        assert_eq!(executor.executable(), binary);
        assert_eq!(executor.command_line(), vec![binary.display().to_string()]);
    }

    #[test]
    fn test_compile_args_target_c11() {
        let executor = CExecutor::new(base(""));
        let args = executor.compile_args("c11", SOURCE);
        assert!(args.contains(&"-std=c11".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("-lm"));
    }
}
