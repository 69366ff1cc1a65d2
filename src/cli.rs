use crate::config::loader::{load_config, ConfigOverrides};
use crate::config::types::JudgeConfig;
use crate::config::validator::validate_config;
use crate::executors::ExecutorRegistry;
use crate::judge::Judge;
use crate::kernel::signal::{self, SignalHandler};
use crate::observability::audit;
use crate::problem::ProblemStore;
use crate::protocol::PacketManager;
use crate::worker::{run_worker_role, ProcessSpawner};
use anyhow::{anyhow, Result};
use clap::Parser;
use env_logger::WriteStyle;
use log::{error, info, warn};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "judgebox", author, version, about = "Connects a judge to a submission server", long_about = None)]
struct Cli {
    /// Configuration file (default: ~/.judgebox.yml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Host of the submission server
    #[arg(long)]
    server_host: Option<String>,
    #[arg(short = 'p', long)]
    server_port: Option<u16>,
    /// Judge name (overrides configuration)
    #[arg(long)]
    judge_name: Option<String>,
    /// Judge key (overrides configuration)
    #[arg(long)]
    judge_key: Option<String>,
    #[arg(long)]
    log_level: Option<String>,
    /// Append logs to this file instead of stderr
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,
    /// Only load these executors
    #[arg(long, value_delimiter = ',', conflicts_with = "exclude_executors")]
    only_executors: Option<Vec<String>>,
    /// Do not load these executors
    #[arg(long, value_delimiter = ',')]
    exclude_executors: Option<Vec<String>>,
    /// Globs of problem directories
    #[arg(long, num_args = 1..)]
    problem_storage_globs: Option<Vec<String>>,
    /// Disable ANSI output
    #[arg(long)]
    no_ansi: bool,
    /// Scan problem directories once at startup only
    #[arg(long)]
    no_watchdog: bool,
    /// Internal role selector (hidden; used by the worker re-exec path)
    #[arg(long, hide = true)]
    internal_role: Option<String>,
    /// Channel fd for the internal worker role
    #[arg(long, hide = true)]
    ipc_fd: Option<i32>,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            server_host: self.server_host.clone(),
            server_port: self.server_port,
            judge_name: self.judge_name.clone(),
            judge_key: self.judge_key.clone(),
            log_level: self.log_level.clone(),
            log_file: self.log_file.clone(),
            only_executors: self.only_executors.clone(),
            exclude_executors: self.exclude_executors.clone(),
            problem_storage_globs: self.problem_storage_globs.clone(),
            no_ansi: self.no_ansi,
            no_watchdog: self.no_watchdog,
        }
    }
}

fn init_logging(level: &str, log_file: Option<&Path>, ansi: bool) -> Result<()> {
    let mut builder = env_logger::Builder::new();
    builder.parse_filters(level);
    // RUST_LOG refines the configured level
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    builder.write_style(if ansi { WriteStyle::Auto } else { WriteStyle::Never });
    if let Some(path) = log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| anyhow!("cannot open log file {}: {}", path.display(), e))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
        builder.write_style(WriteStyle::Never);
    }
    builder.try_init()?;
    Ok(())
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    if let Some(role) = cli.internal_role.as_deref() {
        return run_internal_role(role, &cli);
    }

    let path = cli.config.clone().unwrap_or_else(JudgeConfig::default_path);
    let mut config = load_config(&path)?;
    cli.overrides().apply(&mut config);
    init_logging(&config.log_level, config.log_file.as_deref(), config.ansi)?;
    validate_config(&config)?;
    if let Some(path) = &config.audit_log {
        audit::init_audit_file(path)?;
    }

    let signals = SignalHandler::init()?;
    let spawner = Arc::new(ProcessSpawner::current_exe(config.log_level.clone())?);

    let mut executors = ExecutorRegistry::with_builtins(&config.executors, &config.executor)?;
    executors.filter(config.only_executors.as_deref(), config.exclude_executors.as_deref());
    if executors.names().is_empty() {
        warn!("no executors are available, every submission will fail");
    }
    info!("Executors: {}", executors.names().join(", "));

    let mut problems = ProblemStore::discover(&config.problem_storage_globs)?;
    info!("Found {} problems", problems.problems().len());

    let mut judge = Judge::new(config.clone(), spawner);
    loop {
        let outcome = serve_connection(&mut judge, &config, &problems, &executors);
        match outcome {
            Ok(()) => {
                info!("Server closed the session");
                return Ok(());
            }
            Err(e) if !signal::should_continue() => {
                info!("Shutting down on signal {} ({})", signals.describe(), e);
                return Ok(());
            }
            Err(e) if !config.reconnect => return Err(e.into()),
            Err(e) => error!("Connection lost: {}", e),
        }

        info!("Reconnecting in {} seconds", config.reconnect_delay);
        if signals.wait_for_signal(config.reconnect_delay()) {
            info!("Shutting down on signal {}", signals.describe());
            return Ok(());
        }
        if config.watchdog {
            match ProblemStore::discover(&config.problem_storage_globs) {
                Ok(rescanned) => problems = rescanned,
                Err(e) => warn!("problem rescan failed, keeping the old list: {}", e),
            }
        }
    }
}

/// One connect, handshake and session; a shutdown signal cuts the socket
/// so a blocked read returns
fn serve_connection(
    judge: &mut Judge,
    config: &JudgeConfig,
    problems: &ProblemStore,
    executors: &ExecutorRegistry,
) -> crate::Result<()> {
    let packets = PacketManager::connect(config, problems.problems(), executors.versions())?;
    let interrupter = packets.interrupter()?;
    let finished = Arc::new(AtomicBool::new(false));
    let watcher = {
        let finished = finished.clone();
        thread::Builder::new().name("signal-watch".to_string()).spawn(move || {
            while !finished.load(Ordering::SeqCst) {
                if !signal::should_continue() {
                    interrupter.interrupt();
                    return;
                }
                thread::sleep(Duration::from_millis(200));
            }
        })?
    };

    let outcome = judge.run(packets);
    finished.store(true, Ordering::SeqCst);
    let _ = watcher.join();
    outcome
}

fn run_internal_role(role: &str, cli: &Cli) -> Result<()> {
    match role {
        "worker" => {
            let ipc_fd = cli
                .ipc_fd
                .ok_or_else(|| anyhow!("--ipc-fd is required for --internal-role=worker"))?;
            init_logging(cli.log_level.as_deref().unwrap_or("info"), None, false)?;
            run_worker_role(ipc_fd)?;
            Ok(())
        }
        other => Err(anyhow!("unsupported internal role: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_filters_conflict() {
        let parsed = Cli::try_parse_from([
            "judgebox",
            "--only-executors",
            "C",
            "--exclude-executors",
            "PY3",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_overrides_from_flags() {
        let cli = Cli::try_parse_from([
            "judgebox",
            "--server-host",
            "judge.example",
            "-p",
            "9998",
            "--only-executors",
            "C,CPP17",
            "--no-ansi",
        ])
        .unwrap();
        let mut config = JudgeConfig::default();
        cli.overrides().apply(&mut config);
        assert_eq!(config.server_host, "judge.example");
        assert_eq!(config.server_port, 9998);
        assert_eq!(config.only_executors, Some(vec!["C".to_string(), "CPP17".to_string()]));
        assert!(!config.ansi);
        assert!(config.watchdog);
    }

    #[test]
    fn test_worker_role_flags_are_accepted() {
        let cli = Cli::try_parse_from([
            "judgebox",
            "--internal-role",
            "worker",
            "--ipc-fd",
            "3",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(cli.internal_role.as_deref(), Some("worker"));
        assert_eq!(cli.ipc_fd, Some(3));
    }
}
