use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised anywhere inside the judge
#[derive(Error, Debug)]
pub enum JudgeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid problem init: {0}")]
    InvalidInit(String),

    #[error("There is no loaded grader named `{0}`")]
    InvalidGraderName(String),

    #[error("There is no loaded executor named `{0}`")]
    InvalidExecutorName(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("Worker did not send a message in {seconds} seconds")]
    WorkerTimeout { seconds: u64 },

    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("exceeded {limit}-byte limit on {stream} stream")]
    OutputLimitExceeded { stream: OutputStream, limit: usize },

    #[error("Compile error: {0}")]
    Compile(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<nix::errno::Errno> for JudgeError {
    fn from(err: nix::errno::Errno) -> Self {
        JudgeError::Sandbox(err.to_string())
    }
}

impl From<serde_json::Error> for JudgeError {
    fn from(err: serde_json::Error) -> Self {
        JudgeError::Protocol(err.to_string())
    }
}

impl From<serde_yaml::Error> for JudgeError {
    fn from(err: serde_yaml::Error) -> Self {
        JudgeError::InvalidInit(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, JudgeError>;

/// Captured output stream of a traced process
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputStream::Stdout => write!(f, "stdout"),
            OutputStream::Stderr => write!(f, "stderr"),
        }
    }
}

/// Per-judge executor settings shared by every language
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Seconds a compiler may run
    pub compiler_time_limit: f64,
    /// Largest file a compiler may write, in KB
    pub compiler_size_limit: u64,
    /// Bytes of compiler output kept for the compile log
    pub compiler_output_character_limit: usize,
    /// Runtime path overrides, keyed by command name (`g++`, `python3`, ...)
    pub runtime: BTreeMap<String, PathBuf>,
    pub temp_directory: PathBuf,
    pub submission_cpu_affinity: Option<Vec<usize>>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            compiler_time_limit: 10.0,
            compiler_size_limit: 131072,
            compiler_output_character_limit: 65536,
            runtime: BTreeMap::new(),
            temp_directory: PathBuf::from("/tmp/"),
            submission_cpu_affinity: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GraderManagerConfig {
    pub include_builtin: bool,
    /// Externally provided graders, name to location. Loading them is left
    /// to the embedding application.
    pub external: BTreeMap<String, String>,
}

impl Default for GraderManagerConfig {
    fn default() -> Self {
        Self {
            include_builtin: true,
            external: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutorManagerConfig {
    pub include_builtin: bool,
    pub builtin_whitelist: Option<Vec<String>>,
    pub builtin_blacklist: Option<Vec<String>>,
    pub external: BTreeMap<String, String>,
}

impl Default for ExecutorManagerConfig {
    fn default() -> Self {
        Self {
            include_builtin: true,
            builtin_whitelist: None,
            builtin_blacklist: None,
            external: BTreeMap::new(),
        }
    }
}

/// Top-level judge configuration, usually read from `~/.judgebox.yml`
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JudgeConfig {
    pub server_host: String,
    pub server_port: u16,
    pub judge_name: String,
    pub judge_key: String,

    pub log_file: Option<PathBuf>,
    pub log_level: String,
    /// JSON-lines copy of the `judgebox::audit` events
    pub audit_log: Option<PathBuf>,

    pub only_executors: Option<Vec<String>>,
    pub exclude_executors: Option<Vec<String>>,

    pub problem_storage_globs: Vec<String>,

    pub ansi: bool,
    pub watchdog: bool,

    /// Seconds allowed for the TCP connect
    pub connect_timeout: u64,
    /// Seconds of socket silence tolerated before the connection is dropped
    pub read_timeout: u64,
    pub reconnect: bool,
    pub reconnect_delay: u64,

    pub graders: GraderManagerConfig,
    pub executors: ExecutorManagerConfig,
    pub executor: ExecutorConfig,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            server_host: "localhost".to_string(),
            server_port: 9999,
            judge_name: String::new(),
            judge_key: String::new(),
            log_file: None,
            log_level: "info".to_string(),
            audit_log: None,
            only_executors: None,
            exclude_executors: None,
            problem_storage_globs: Vec::new(),
            ansi: true,
            watchdog: true,
            connect_timeout: 5,
            read_timeout: 300,
            reconnect: true,
            reconnect_delay: 5,
            graders: GraderManagerConfig::default(),
            executors: ExecutorManagerConfig::default(),
            executor: ExecutorConfig::default(),
        }
    }
}

impl JudgeConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        if self.read_timeout == 0 {
            None
        } else {
            Some(Duration::from_secs(self.read_timeout))
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay)
    }

    /// Default location of the judge configuration file
    pub fn default_path() -> PathBuf {
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/etc"))
            .join(".judgebox.yml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn judge_config_defaults_match_documented_values() {
        let config = JudgeConfig::default();
        assert_eq!(config.server_port, 9999);
        assert_eq!(config.read_timeout(), Some(Duration::from_secs(300)));
        assert_eq!(config.executor.compiler_output_character_limit, 65536);
        assert_eq!(config.executor.temp_directory, PathBuf::from("/tmp/"));
        assert!(config.executors.include_builtin);
    }

    #[test]
    fn partial_yaml_fills_in_defaults() {
        let yaml = "server_host: judge.example\njudge_name: j1\njudge_key: k\nexecutor:\n  compiler_time_limit: 20\n";
        let config: JudgeConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server_host, "judge.example");
        assert_eq!(config.server_port, 9999);
        assert_eq!(config.executor.compiler_time_limit, 20.0);
        assert_eq!(config.executor.compiler_size_limit, 131072);
    }

    #[test]
    fn output_limit_error_names_stream_and_limit() {
        let err = JudgeError::OutputLimitExceeded {
            stream: OutputStream::Stdout,
            limit: 1024,
        };
        assert_eq!(err.to_string(), "exceeded 1024-byte limit on stdout stream");
    }
}
