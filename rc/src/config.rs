//! Client configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::events::DEFAULT_HISTORY_SIZE;

/// Environment variables that override loaded values
pub const ENV_URL: &str = "WEBSOCKET_URL";
pub const ENV_API_KEY: &str = "WEBSOCKET_API_KEY";
pub const ENV_USER_EMAIL: &str = "USER_EMAIL";
pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";

/// Main client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base directory for the pid file, logs and output
    pub home: PathBuf,

    /// Remote server connection
    pub server: ServerConfig,

    /// Event bus settings
    pub bus: BusSettings,

    /// Conversion worker settings
    pub worker: WorkerConfig,

    /// Log output
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            home: PathBuf::from("~/.ragflow"),
            server: ServerConfig::default(),
            bus: BusSettings::default(),
            worker: WorkerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with fallback chain, then apply environment overrides
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let mut config = Self::load_file_chain(config_path)?;
        config.apply_env();
        Ok(config)
    }

    fn load_file_chain(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .ragflow.yml
        let local_config = PathBuf::from(".ragflow.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/ragflow/ragflow.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("ragflow").join("ragflow.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any lookup; empty values are ignored
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get(ENV_URL) {
            self.server.url = url;
        }
        if let Some(api_key) = get(ENV_API_KEY) {
            self.server.api_key = api_key;
        }
        if let Some(email) = get(ENV_USER_EMAIL) {
            self.server.user_email = email;
        }
        if let Some(level) = get(ENV_LOG_LEVEL) {
            self.logging.level = level;
        }
    }

    /// Validate configuration before use
    ///
    /// Call this early in startup to fail fast with clear error messages.
    pub fn validate(&self) -> Result<()> {
        let server = &self.server;

        let scheme = server
            .url
            .split_once("://")
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
            .unwrap_or_default();
        if !matches!(scheme.as_str(), "ws" | "wss" | "http" | "https") {
            return Err(eyre::eyre!(
                "server.url must start with ws://, wss://, http:// or https://, got '{}'",
                server.url
            ));
        }

        check_range("server.reconnect-max-delay-secs", server.reconnect_max_delay_secs, 1, 300)?;
        check_range("server.ping-interval-secs", server.ping_interval_secs, 5, 60)?;
        check_range("server.ping-timeout-secs", server.ping_timeout_secs, 10, 120)?;
        check_range("server.connect-timeout-secs", server.connect_timeout_secs, 1, 300)?;
        check_range("worker.conversion-timeout-secs", self.worker.conversion_timeout_secs, 1, 86_400)?;
        check_range("worker.download-timeout-secs", self.worker.download_timeout_secs, 1, 86_400)?;
        if self.bus.history_size == 0 {
            return Err(eyre::eyre!("bus.history-size must be at least 1"));
        }
        Ok(())
    }

    /// Home directory with `~/` expanded
    pub fn home_dir(&self) -> PathBuf {
        expand_home(&self.home)
    }

    pub fn pid_file(&self) -> PathBuf {
        self.home_dir().join("client.pid")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.home_dir().join("logs")
    }

    pub fn log_file(&self) -> PathBuf {
        self.log_dir().join("client.log")
    }

    /// Conversion output directory, `<home>/output` unless configured
    pub fn output_dir(&self) -> PathBuf {
        match &self.worker.output_dir {
            Some(dir) => expand_home(dir),
            None => self.home_dir().join("output"),
        }
    }

    /// YAML dump with the API key masked
    pub fn to_masked_yaml(&self) -> Result<String> {
        let mut shown = self.clone();
        if !shown.server.api_key.is_empty() {
            shown.server.api_key = mask(&shown.server.api_key);
        }
        serde_yaml::to_string(&shown).context("Failed to serialize config")
    }
}

fn check_range(name: &str, value: u64, min: u64, max: u64) -> Result<()> {
    if !(min..=max).contains(&value) {
        return Err(eyre::eyre!("{} must be between {} and {}, got {}", name, min, max, value));
    }
    Ok(())
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir().map(|home| home.join(rest)).unwrap_or_else(|| rest.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

/// Keep the last four characters of long keys
fn mask(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "********".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("********{}", tail)
}

/// Remote server connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server base URL
    pub url: String,

    #[serde(rename = "api-key")]
    pub api_key: String,

    /// Optional identity sent with the API key
    #[serde(rename = "user-email")]
    pub user_email: String,

    /// Bound on one connect attempt
    #[serde(rename = "connect-timeout-secs")]
    pub connect_timeout_secs: u64,

    /// Backoff ceiling
    #[serde(rename = "reconnect-max-delay-secs")]
    pub reconnect_max_delay_secs: u64,

    #[serde(rename = "ping-interval-secs")]
    pub ping_interval_secs: u64,

    #[serde(rename = "ping-timeout-secs")]
    pub ping_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:3000".to_string(),
            api_key: String::new(),
            user_email: String::new(),
            connect_timeout_secs: 10,
            reconnect_max_delay_secs: 60,
            ping_interval_secs: 25,
            ping_timeout_secs: 60,
        }
    }
}

impl ServerConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }
}

/// Event bus settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    /// Events kept in the history ring
    #[serde(rename = "history-size")]
    pub history_size: usize,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            history_size: DEFAULT_HISTORY_SIZE,
        }
    }
}

/// Conversion worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Output directory; `<home>/output` when unset
    #[serde(rename = "output-dir")]
    pub output_dir: Option<PathBuf>,

    /// LibreOffice executable
    #[serde(rename = "soffice-path")]
    pub soffice_path: PathBuf,

    #[serde(rename = "conversion-timeout-secs")]
    pub conversion_timeout_secs: u64,

    #[serde(rename = "download-timeout-secs")]
    pub download_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            output_dir: None,
            soffice_path: PathBuf::from("soffice"),
            conversion_timeout_secs: 300,
            download_timeout_secs: 120,
        }
    }
}

/// Log output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// TRACE, DEBUG, INFO, WARN or ERROR
    pub level: String,

    /// Emit JSON lines instead of text
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            json: false,
        }
    }
}
