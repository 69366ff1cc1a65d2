use crate::config::types::{JudgeConfig, JudgeError, Result};
use log::{debug, info};
use std::path::Path;

/// Command-line values that take precedence over the config file
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub server_host: Option<String>,
    pub server_port: Option<u16>,
    pub judge_name: Option<String>,
    pub judge_key: Option<String>,
    pub log_level: Option<String>,
    pub log_file: Option<std::path::PathBuf>,
    pub only_executors: Option<Vec<String>>,
    pub exclude_executors: Option<Vec<String>>,
    pub problem_storage_globs: Option<Vec<String>>,
    pub no_ansi: bool,
    pub no_watchdog: bool,
}

/// Load the judge config from a YAML file. A missing file yields defaults so
/// the judge can be fully configured from the command line.
pub fn load_config(path: &Path) -> Result<JudgeConfig> {
    if !path.exists() {
        info!("config file {} not found, using defaults", path.display());
        return Ok(JudgeConfig::default());
    }

    let raw = std::fs::read_to_string(path)?;
    if raw.trim().is_empty() {
        return Ok(JudgeConfig::default());
    }

    let config: JudgeConfig = serde_yaml::from_str(&raw).map_err(|e| {
        JudgeError::Config(format!("failed to parse {}: {}", path.display(), e))
    })?;
    debug!("loaded config from {}", path.display());
    Ok(config)
}

impl ConfigOverrides {
    pub fn apply(self, config: &mut JudgeConfig) {
        if let Some(host) = self.server_host {
            config.server_host = host;
        }
        if let Some(port) = self.server_port {
            config.server_port = port;
        }
        if let Some(name) = self.judge_name {
            config.judge_name = name;
        }
        if let Some(key) = self.judge_key {
            config.judge_key = key;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(file) = self.log_file {
            config.log_file = Some(file);
        }
        // The two executor filters are mutually exclusive, so a command-line
        // choice of one replaces the file's choice of either.
        if let Some(only) = self.only_executors {
            config.only_executors = Some(only);
            config.exclude_executors = None;
        }
        if let Some(exclude) = self.exclude_executors {
            config.exclude_executors = Some(exclude);
            config.only_executors = None;
        }
        if let Some(globs) = self.problem_storage_globs {
            config.problem_storage_globs = globs;
        }
        if self.no_ansi {
            config.ansi = false;
        }
        if self.no_watchdog {
            config.watchdog = false;
        }
    }
}
