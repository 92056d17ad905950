//! Configuration System using Figment
//!
//! Strongly-typed configuration for the sequencer. Configuration is loaded from:
//! 1. `config/sequencer.toml` (base configuration)
//! 2. Environment variables prefixed with `DAQ_SEQ_`, nested keys separated by
//!    a double underscore (`DAQ_SEQ_SERIAL__BAUD_RATE=19200`)
//!
//! Every field has a default, so a missing file yields a usable configuration.
//!
//! # Example
//! ```no_run
//! use daq_sequencer::config::SequencerConfig;
//!
//! let config = SequencerConfig::load()?;
//! config.validate()?;
//! println!("Serial port: {}", config.serial.port);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file location, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/sequencer.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SequencerConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Serial link settings
    #[serde(default)]
    pub serial: SerialSettings,
    /// Debounce window for coalescing enqueue bursts
    #[serde(default)]
    pub scheduling: DebounceSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Serial link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Port path (e.g. "/dev/ttyUSB0", "COM3")
    #[serde(default = "default_port")]
    pub port: String,
    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Appended to every line written
    #[serde(default = "default_line_terminator")]
    pub line_terminator: String,
    /// Byte that ends a response line
    #[serde(default = "default_response_delimiter")]
    pub response_delimiter: char,
    /// Default read timeout in milliseconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
}

/// Debounce window configuration.
///
/// `coalesce_ms` is the quiet period after the latest enqueue before a run
/// fires; `max_latency_ms` bounds the delay after the first enqueue of a burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebounceSettings {
    /// Quiet period in milliseconds
    #[serde(default = "default_coalesce")]
    pub coalesce_ms: u64,
    /// Upper latency bound in milliseconds
    #[serde(default = "default_max_latency")]
    pub max_latency_ms: u64,
}

// Default value functions
fn default_app_name() -> String {
    "daq-sequencer".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_line_terminator() -> String {
    "\r\n".to_string()
}

fn default_response_delimiter() -> char {
    '\n'
}

fn default_read_timeout() -> u64 {
    1000
}

fn default_coalesce() -> u64 {
    100
}

fn default_max_latency() -> u64 {
    1000
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud_rate: default_baud_rate(),
            line_terminator: default_line_terminator(),
            response_delimiter: default_response_delimiter(),
            read_timeout_ms: default_read_timeout(),
        }
    }
}

impl SerialSettings {
    /// Default read timeout as a `Duration`.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl Default for DebounceSettings {
    fn default() -> Self {
        Self {
            coalesce_ms: default_coalesce(),
            max_latency_ms: default_max_latency(),
        }
    }
}

impl DebounceSettings {
    /// Build settings from durations (truncated to whole milliseconds).
    pub fn new(coalesce: Duration, max_latency: Duration) -> Self {
        Self {
            coalesce_ms: coalesce.as_millis() as u64,
            max_latency_ms: max_latency.as_millis() as u64,
        }
    }

    /// Quiet period after the latest enqueue.
    pub fn coalesce(&self) -> Duration {
        Duration::from_millis(self.coalesce_ms)
    }

    /// Upper bound on the delay after the first enqueue.
    pub fn max_latency(&self) -> Duration {
        Duration::from_millis(self.max_latency_ms)
    }
}

impl SequencerConfig {
    /// Load configuration from `config/sequencer.toml` and environment variables
    ///
    /// Environment variables override the file with prefix `DAQ_SEQ_`.
    /// Example: `DAQ_SEQ_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("DAQ_SEQ_").split("__"))
            .extract()
    }

    /// Parse configuration from a TOML string (no environment overrides)
    pub fn from_toml_str(toml: &str) -> Result<Self, figment::Error> {
        Figment::new().merge(Toml::string(toml)).extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.serial.port.trim().is_empty() {
            return Err("Serial port must not be empty".to_string());
        }

        if self.serial.baud_rate == 0 {
            return Err("Serial baud_rate must be greater than zero".to_string());
        }

        if self.serial.line_terminator.is_empty() {
            return Err("Serial line_terminator must not be empty".to_string());
        }

        if !self.serial.response_delimiter.is_ascii() {
            return Err(format!(
                "Serial response_delimiter {:?} must be a single ASCII character",
                self.serial.response_delimiter
            ));
        }

        if self.serial.read_timeout_ms == 0 {
            return Err("Serial read_timeout_ms must be greater than zero".to_string());
        }

        if self.scheduling.coalesce_ms > self.scheduling.max_latency_ms {
            return Err(format!(
                "scheduling.coalesce_ms ({}) must not exceed scheduling.max_latency_ms ({})",
                self.scheduling.coalesce_ms, self.scheduling.max_latency_ms
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = SequencerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.serial.read_timeout(), Duration::from_secs(1));
        assert_eq!(config.scheduling.coalesce(), Duration::from_millis(100));
        assert_eq!(config.scheduling.max_latency(), Duration::from_secs(1));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = SequencerConfig::from_toml_str(
            r#"
            [serial]
            port = "/dev/ttyS0"
            baud_rate = 19200
            "#,
        )
        .unwrap();

        assert_eq!(config.serial.port, "/dev/ttyS0");
        assert_eq!(config.serial.baud_rate, 19200);
        assert_eq!(config.serial.line_terminator, "\r\n");
        assert_eq!(config.serial.response_delimiter, '\n');
        assert_eq!(config.application.log_level, "info");
        assert_eq!(config.scheduling, DebounceSettings::default());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [application]
            name = "ifr-bench"
            log_level = "debug"

            [scheduling]
            coalesce_ms = 50
            max_latency_ms = 500
            "#
        )
        .unwrap();

        let config = SequencerConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.name, "ifr-bench");
        assert_eq!(config.scheduling.coalesce(), Duration::from_millis(50));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_log_level() {
        let mut config = SequencerConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn coalesce_longer_than_latency_bound_is_rejected() {
        let mut config = SequencerConfig::default();
        config.scheduling = DebounceSettings::new(Duration::from_secs(2), Duration::from_secs(1));
        let err = config.validate().unwrap_err();
        assert!(err.contains("coalesce_ms"));
    }

    #[test]
    fn zero_baud_rate_is_rejected() {
        let mut config = SequencerConfig::default();
        config.serial.baud_rate = 0;
        assert!(config.validate().is_err());
    }
}
