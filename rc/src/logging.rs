//! Tracing subscriber setup

use std::fs;
use std::path::Path;

use eyre::{Context, Result};
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Where log lines go
#[derive(Debug, Clone, Copy)]
pub enum LogTarget<'a> {
    /// stderr with ANSI colours
    Stderr,
    /// Append to `<dir>/client.log` without ANSI
    File(&'a Path),
}

/// Map a level name to a tracing level
///
/// Returns `None` for unknown names.
pub fn parse_level(name: &str) -> Option<Level> {
    match name.trim().to_uppercase().as_str() {
        "TRACE" => Some(Level::TRACE),
        "DEBUG" => Some(Level::DEBUG),
        "INFO" => Some(Level::INFO),
        "WARN" | "WARNING" => Some(Level::WARN),
        "ERROR" => Some(Level::ERROR),
        _ => None,
    }
}

/// Resolve the level with priority: CLI `--log-level` > config file > INFO
pub fn resolve_level(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Level {
    match cli_log_level.or(config_log_level) {
        Some(s) => parse_level(s).unwrap_or_else(|| {
            eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
            Level::INFO
        }),
        None => Level::INFO,
    }
}

/// Install the global subscriber
pub fn setup_logging(level: Level, target: LogTarget<'_>, json: bool) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let installed = match target {
        LogTarget::Stderr => {
            let builder = tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_ansi(true)
                .with_env_filter(filter);
            if json {
                builder.json().try_init()
            } else {
                builder.try_init()
            }
        }
        LogTarget::File(log_dir) => {
            fs::create_dir_all(log_dir).context("Failed to create log directory")?;
            let log_file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_dir.join("client.log"))
                .context("Failed to open log file")?;
            let builder = tracing_subscriber::fmt()
                .with_writer(log_file)
                .with_ansi(false)
                .with_env_filter(filter);
            if json {
                builder.json().try_init()
            } else {
                builder.try_init()
            }
        }
    };
    installed.map_err(|e| eyre::eyre!("Failed to initialize logging: {}", e))?;

    tracing::debug!(%level, json, "setup_logging: initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("trace"), Some(Level::TRACE));
        assert_eq!(parse_level("Debug"), Some(Level::DEBUG));
        assert_eq!(parse_level("WARNING"), Some(Level::WARN));
        assert_eq!(parse_level(" error "), Some(Level::ERROR));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_resolve_level_priority() {
        assert_eq!(resolve_level(Some("debug"), Some("error")), Level::DEBUG);
        assert_eq!(resolve_level(None, Some("error")), Level::ERROR);
        assert_eq!(resolve_level(None, None), Level::INFO);
        assert_eq!(resolve_level(Some("nonsense"), Some("error")), Level::INFO);
    }
}
