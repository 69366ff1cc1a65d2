// Startup validation of the judge configuration.
// Every error is fatal; warnings are logged and the judge keeps going.

use crate::config::types::{JudgeConfig, JudgeError, Result};
use log::warn;

/// Validation result with detailed errors
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Validate config at startup, failing fast on any error
pub fn validate_config(config: &JudgeConfig) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    validate_identity(config, &mut result);
    validate_executor_selection(config, &mut result);
    validate_executor_settings(config, &mut result);
    validate_problem_storage(config, &mut result);

    for warning in &result.warnings {
        warn!("config: {}", warning);
    }

    if !result.is_valid() {
        return Err(JudgeError::Config(format!(
            "config validation failed:\n{}",
            result.errors.join("\n")
        )));
    }

    Ok(result)
}

fn validate_identity(config: &JudgeConfig, result: &mut ValidationResult) {
    if config.server_host.trim().is_empty() {
        result.add_error("server_host is required".to_string());
    }
    if config.server_port == 0 {
        result.add_error("server_port cannot be zero".to_string());
    }
    if config.judge_name.trim().is_empty() {
        result.add_error("judge_name is required".to_string());
    }
    if config.judge_key.is_empty() {
        result.add_error("judge_key is required".to_string());
    }
    if config.connect_timeout == 0 {
        result.add_error("connect_timeout cannot be zero".to_string());
    }
}

fn validate_executor_selection(config: &JudgeConfig, result: &mut ValidationResult) {
    if config.only_executors.is_some() && config.exclude_executors.is_some() {
        result.add_error(
            "only_executors and exclude_executors are mutually exclusive".to_string(),
        );
    }

    let managers = &config.executors;
    if managers.builtin_whitelist.is_some() && managers.builtin_blacklist.is_some() {
        result.add_error(
            "executors.builtin_whitelist and executors.builtin_blacklist are mutually exclusive"
                .to_string(),
        );
    }

    if !managers.include_builtin && managers.external.is_empty() {
        result.add_warning("no builtin or external executors are enabled".to_string());
    }
}

fn validate_executor_settings(config: &JudgeConfig, result: &mut ValidationResult) {
    let executor = &config.executor;

    if !executor.temp_directory.is_absolute() {
        result.add_error(format!(
            "executor.temp_directory must be absolute path: {:?}",
            executor.temp_directory
        ));
    } else if !executor.temp_directory.is_dir() {
        result.add_warning(format!(
            "executor.temp_directory does not exist: {:?}",
            executor.temp_directory
        ));
    }

    if executor.compiler_time_limit <= 0.0 {
        result.add_error("executor.compiler_time_limit must be positive".to_string());
    }

    if let Some(cores) = &executor.submission_cpu_affinity {
        if cores.is_empty() {
            result.add_error("executor.submission_cpu_affinity cannot be empty".to_string());
        }
        let cpus = num_cpus::get();
        for core in cores {
            if *core >= cpus {
                result.add_error(format!(
                    "executor.submission_cpu_affinity core {} exceeds the {} available cpus",
                    core, cpus
                ));
            }
        }
    }
}

fn validate_problem_storage(config: &JudgeConfig, result: &mut ValidationResult) {
    if config.problem_storage_globs.is_empty() {
        result.add_error("problem_storage_globs must name at least one location".to_string());
    }
    for pattern in &config.problem_storage_globs {
        if let Err(e) = globset::Glob::new(pattern) {
            result.add_error(format!("invalid problem storage glob {:?}: {}", pattern, e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> JudgeConfig {
        JudgeConfig {
            judge_name: "judge-1".to_string(),
            judge_key: "secret".to_string(),
            problem_storage_globs: vec!["/srv/problems/*".to_string()],
            ..JudgeConfig::default()
        }
    }

    #[test]
    fn test_valid_config_passes() {
        let result = validate_config(&valid_config()).unwrap();
        assert!(result.is_valid());
    }

    #[test]
    fn test_missing_judge_key_is_fatal() {
        let mut config = valid_config();
        config.judge_key.clear();
        assert!(matches!(validate_config(&config), Err(JudgeError::Config(_))));
    }

    #[test]
    fn test_only_and_exclude_executors_conflict() {
        let mut config = valid_config();
        config.only_executors = Some(vec!["PY3".to_string()]);
        config.exclude_executors = Some(vec!["CPP17".to_string()]);
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn test_whitelist_and_blacklist_conflict() {
        let mut config = valid_config();
        config.executors.builtin_whitelist = Some(vec!["C".to_string()]);
        config.executors.builtin_blacklist = Some(vec!["PY3".to_string()]);
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_relative_temp_directory_rejected() {
        let mut config = valid_config();
        config.executor.temp_directory = "scratch".into();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_affinity_beyond_cpu_count_rejected() {
        let mut config = valid_config();
        config.executor.submission_cpu_affinity = Some(vec![num_cpus::get() + 4]);
        assert!(validate_config(&config).is_err());
    }
}
