use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use tracing::{debug, info};

use ragflow_client::cli::{Cli, Command};
use ragflow_client::config::Config;
use ragflow_client::daemon::{DaemonManager, VERSION};
use ragflow_client::lifecycle::LifecycleManager;
use ragflow_client::logging::{LogTarget, resolve_level, setup_logging};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    let level = resolve_level(cli.log_level.as_deref(), Some(&config.logging.level));

    match cli.command {
        Some(Command::Start { foreground: true }) | Some(Command::Run) => {
            setup_logging(level, LogTarget::Stderr, config.logging.json).context("Failed to setup logging")?;
            cmd_run(&config).await
        }
        Some(Command::Start { foreground: false }) => cmd_start(&config, &cli),
        Some(Command::Stop) => cmd_stop(&config),
        Some(Command::Status) | None => cmd_status(&config),
        Some(Command::Config) => cmd_config(&config),
        Some(Command::RunDaemon) => {
            setup_logging(level, LogTarget::File(&config.log_dir()), config.logging.json)
                .context("Failed to setup logging")?;
            cmd_run_daemon(&config).await
        }
    }
}

fn daemon_manager(config: &Config) -> DaemonManager {
    DaemonManager::with_pid_file(config.pid_file())
}

/// Run the client in this process
async fn cmd_run(config: &Config) -> Result<()> {
    debug!("cmd_run: called");
    config.validate()?;
    let daemon = daemon_manager(config);
    if let Some(pid) = daemon.running_pid() {
        eyre::bail!("RAGFlow client is already running in the background (PID: {})", pid);
    }

    info!(version = VERSION, "Starting RAGFlow client in foreground mode");
    LifecycleManager::new(config.clone())?.run().await
}

/// Spawn the background client
fn cmd_start(config: &Config, cli: &Cli) -> Result<()> {
    debug!("cmd_start: called");
    config.validate()?;
    let daemon = daemon_manager(config);

    if let Some(pid) = daemon.running_pid() {
        println!("RAGFlow client is already running (PID: {})", pid);
        return Ok(());
    }

    let pid = daemon.start(cli.config.as_deref(), cli.log_level.as_deref())?;
    println!("{} (PID: {})", "RAGFlow client started".green(), pid);
    println!("Logs: {}", config.log_file().display());
    Ok(())
}

fn cmd_stop(config: &Config) -> Result<()> {
    debug!("cmd_stop: called");
    let daemon = daemon_manager(config);

    let Some(pid) = daemon.running_pid() else {
        println!("RAGFlow client is not running");
        return Ok(());
    };

    daemon.stop()?;
    println!("{} (was PID: {})", "RAGFlow client stopped".yellow(), pid);
    Ok(())
}

fn cmd_status(config: &Config) -> Result<()> {
    debug!("cmd_status: called");
    let status = daemon_manager(config).status();

    println!("RAGFlow Client Status");
    println!("---------------------");
    if status.running {
        println!("Status: {}", "running".green());
        if let Some(pid) = status.pid {
            println!("PID: {}", pid);
        }
    } else {
        println!("Status: {}", "stopped".red());
    }
    println!("PID file: {}", status.pid_file.display());
    println!("Server: {}", config.server.url);
    println!("Version: {}", VERSION);
    Ok(())
}

fn cmd_config(config: &Config) -> Result<()> {
    print!("{}", config.to_masked_yaml()?);
    Ok(())
}

/// Body of the detached process spawned by `start`
async fn cmd_run_daemon(config: &Config) -> Result<()> {
    debug!("cmd_run_daemon: called");
    config.validate()?;
    let daemon = daemon_manager(config);
    daemon.register_self()?;

    let outcome = match LifecycleManager::new(config.clone()) {
        Ok(manager) => manager.run().await,
        Err(e) => Err(e),
    };

    daemon.unregister_self()?;
    outcome
}
