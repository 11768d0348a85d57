//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// RAGFlow client - document conversion agent for a RAGFlow server
#[derive(Debug, Parser)]
#[command(
    name = "rc",
    about = "Background agent that converts documents on behalf of a RAGFlow server",
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the client in the background
    Start {
        /// Run in this process instead of detaching
        #[arg(short, long)]
        foreground: bool,
    },

    /// Stop the background client
    Stop,

    /// Show whether the background client is running
    Status,

    /// Run the client in the foreground
    Run,

    /// Print the effective configuration (API key masked)
    Config,

    /// Internal: Run as daemon process (used by `start`)
    #[command(hide = true)]
    RunDaemon,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start_foreground() {
        let cli = Cli::try_parse_from(["rc", "start", "--foreground"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Start { foreground: true })));
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["rc", "status", "-c", "/etc/rc.yml", "--log-level", "debug"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Status)));
        assert_eq!(cli.config, Some(PathBuf::from("/etc/rc.yml")));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_no_subcommand() {
        let cli = Cli::try_parse_from(["rc"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_hidden_run_daemon_parses() {
        let cli = Cli::try_parse_from(["rc", "run-daemon"]).unwrap();
        assert!(matches!(cli.command, Some(Command::RunDaemon)));
    }

    #[test]
    fn test_unknown_subcommand_fails() {
        assert!(Cli::try_parse_from(["rc", "explode"]).is_err());
    }
}
