/*!
 * Configuration management for testrig.
 *
 * This module provides functionality to load, validate, and access configuration
 * settings for the switchboard, detection and device manager.
 */
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Core configuration for testrig
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Switchboard configuration
    #[serde(default)]
    pub switchboard: SwitchboardConfig,

    /// Detection configuration
    #[serde(default)]
    pub detection: DetectionConfig,

    /// Health check configuration
    #[serde(default)]
    pub health: HealthConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Data directory
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Directory that receives per-device log files
    #[serde(default = "default_log_directory")]
    pub log_directory: String,

    /// Device records file (persistent identifiers)
    #[serde(default = "default_device_file")]
    pub device_file: String,

    /// Device options file (option overrides)
    #[serde(default = "default_options_file")]
    pub options_file: String,

    /// Directory holding downloaded credential keys
    #[serde(default = "default_key_directory")]
    pub key_directory: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to write the manager-wide log file
    #[serde(default)]
    pub file_logging: bool,

    /// Manager-wide log file path (if file_logging is true)
    #[serde(default = "default_log_file")]
    pub log_file: String,

    /// Whether to log to stdout
    #[serde(default = "default_log_stdout")]
    pub stdout: bool,

    /// Whether to use JSON format for logs
    #[serde(default)]
    pub json_format: bool,
}

/// Switchboard configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchboardConfig {
    /// Line delimiter used to split the raw byte stream
    #[serde(default = "default_line_delimiter")]
    pub line_delimiter: String,

    /// How long a partial line may sit in the buffer before being emitted
    #[serde(default = "default_partial_line_timeout_ms")]
    pub partial_line_timeout_ms: u64,

    /// Grace period for joining the reader loop on close
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,

    /// Maximum device log size in bytes before rotation (0 disables rotation)
    #[serde(default)]
    pub max_log_size: u64,

    /// Timeout used by callers that do not pass one explicitly
    #[serde(default = "default_expect_timeout_ms")]
    pub default_expect_timeout_ms: u64,
}

/// Detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Number of candidate addresses probed concurrently
    #[serde(default = "default_max_concurrent_queries")]
    pub max_concurrent_queries: usize,

    /// Timeout for a single detection query
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    /// Static IP addresses probed by network communication types
    #[serde(default)]
    pub static_ips: Vec<String>,
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// A bootup counts as expected only if a reboot was requested this recently
    #[serde(default = "default_reboot_window_ms")]
    pub reboot_window_ms: u64,

    /// Number of retries for caller-level flows such as reboot-and-verify
    #[serde(default = "default_retries")]
    pub retries: usize,

    /// Fixed delay between retries
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_directory: default_log_directory(),
            device_file: default_device_file(),
            options_file: default_options_file(),
            key_directory: default_key_directory(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_logging: false,
            log_file: default_log_file(),
            stdout: default_log_stdout(),
            json_format: false,
        }
    }
}

impl Default for SwitchboardConfig {
    fn default() -> Self {
        Self {
            line_delimiter: default_line_delimiter(),
            partial_line_timeout_ms: default_partial_line_timeout_ms(),
            close_grace_ms: default_close_grace_ms(),
            max_log_size: 0,
            default_expect_timeout_ms: default_expect_timeout_ms(),
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_queries: default_max_concurrent_queries(),
            query_timeout_ms: default_query_timeout_ms(),
            static_ips: Vec::new(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            reboot_window_ms: default_reboot_window_ms(),
            retries: default_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl GeneralConfig {
    /// Full path of the device records file
    pub fn device_file_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join(&self.device_file)
    }

    /// Full path of the device options file
    pub fn options_file_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join(&self.options_file)
    }
}

impl SwitchboardConfig {
    /// The delimiter as a single byte
    ///
    /// `"\r\n"` frames on `\n`; the carriage return is stripped from each line.
    pub fn delimiter_byte(&self) -> Result<u8> {
        match self.line_delimiter.as_bytes() {
            [byte] => Ok(*byte),
            b"\r\n" => Ok(b'\n'),
            [] => Err(Error::config("switchboard.line_delimiter must not be empty")),
            _ => Err(Error::config(format!(
                "switchboard.line_delimiter must be a single byte or \"\\r\\n\", got {:?}",
                self.line_delimiter
            ))),
        }
    }

    /// Partial-line flush timeout
    pub fn partial_line_timeout(&self) -> Duration {
        Duration::from_millis(self.partial_line_timeout_ms)
    }

    /// Grace period for joining the reader loop
    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    /// Default expect timeout
    pub fn default_expect_timeout(&self) -> Duration {
        Duration::from_millis(self.default_expect_timeout_ms)
    }
}

impl DetectionConfig {
    /// Per-query detection timeout
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

impl HealthConfig {
    /// Window in which a requested reboot explains a bootup
    pub fn reboot_window(&self) -> Duration {
        Duration::from_millis(self.reboot_window_ms)
    }

    /// Delay between health-check retries
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Config {
    /// Validate values that serde cannot check on its own
    pub fn validate(&self) -> Result<()> {
        self.switchboard.delimiter_byte()?;
        if self.detection.max_concurrent_queries == 0 {
            return Err(Error::config("detection.max_concurrent_queries must be at least 1"));
        }
        Ok(())
    }

    /// Write the configuration as TOML
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let text = toml::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_log_directory() -> String {
    "./logs".to_string()
}

fn default_device_file() -> String {
    "devices.json".to_string()
}

fn default_options_file() -> String {
    "device_options.json".to_string()
}

fn default_key_directory() -> String {
    "./keys".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "./logs/testrig.log".to_string()
}

fn default_log_stdout() -> bool {
    true
}

fn default_line_delimiter() -> String {
    "\n".to_string()
}

fn default_partial_line_timeout_ms() -> u64 {
    100
}

fn default_close_grace_ms() -> u64 {
    1_000
}

fn default_expect_timeout_ms() -> u64 {
    30_000
}

fn default_max_concurrent_queries() -> usize {
    4
}

fn default_query_timeout_ms() -> u64 {
    10_000
}

fn default_reboot_window_ms() -> u64 {
    60_000
}

fn default_retries() -> usize {
    2
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
    override_with: Option<Config>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Override with an existing config
    pub fn override_with(mut self, config: Config) -> Self {
        self.override_with = Some(config);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<Config> {
        if let Some(config) = self.override_with {
            config.validate()?;
            return Ok(config);
        }

        let mut config_builder = ConfigLib::builder();

        let default_config = Config::default();
        config_builder = config_builder.add_source(
            ConfigLib::try_from(&default_config)
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::with_name(&config_file));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config_lib = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?;

        let config: Config = config_lib
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;
        config.validate()?;

        info!("Configuration loaded successfully");
        Ok(config)
    }
}

/// A thread-safe reference to a configuration
#[derive(Debug, Clone)]
pub struct SharedConfig(Arc<Config>);

impl SharedConfig {
    /// Create a new SharedConfig
    pub fn new(config: Config) -> Self {
        Self(Arc::new(config))
    }

    /// Get a reference to the config
    pub fn get(&self) -> &Config {
        &self.0
    }
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl From<Config> for SharedConfig {
    fn from(config: Config) -> Self {
        Self::new(config)
    }
}

impl AsRef<Config> for SharedConfig {
    fn as_ref(&self) -> &Config {
        self.get()
    }
}
