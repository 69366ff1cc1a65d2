use super::c::{binary_path, compile_native, CExecutor};
use crate::config::types::Result;
use crate::executors::base::{CompileOutcome, Executor, ExecutorBase};
use std::path::PathBuf;

const SOURCE: &str = "_main.cpp";

/// C++17 through g++
#[derive(Debug)]
pub struct Cpp17Executor {
    inner: CExecutor,
}

impl Cpp17Executor {
    pub const NAME: &'static str = "CPP17";
    pub const COMMAND: &'static str = "g++";

    pub fn new(base: ExecutorBase) -> Self {
        Self {
            inner: CExecutor::new(base),
        }
    }
}

impl Executor for Cpp17Executor {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn base(&self) -> &ExecutorBase {
        self.inner.base()
    }

    fn prepare(&mut self) -> Result<CompileOutcome> {
        let argv = self.inner.compile_args("c++17", SOURCE);
        compile_native(self.base(), SOURCE, argv)
    }

    fn executable(&self) -> PathBuf {
        binary_path(self.base())
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
    fn test_cpp17_reports_its_own_name() {
        let executor = Cpp17Executor::new(base("int main(){}"));
        assert_eq!(executor.name(), "CPP17");
        assert!(executor.executable().starts_with(executor.working_dir()));
    }
}
