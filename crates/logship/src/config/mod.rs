// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Configuration Module
//!
//! Two layers of configuration exist:
//!
//! 1. **Agent configuration** ([`Config`]): process-wide settings such as where the
//!    default session config lives, where bookmarks are written, and poll intervals.
//!    Loaded through [`ConfigBuilder`] from defaults then `LOGSHIP_*` environment
//!    variables (later sources override earlier ones).
//! 2. **Session configuration** ([`session::SessionConfig`]): one JSON file per
//!    session listing its sources, sinks, pipes, credentials and plugins.
//!
//! ## Edge Cases and Behaviors
//!
//! - **Durations**: accepted as integers, floats or numeric strings, in seconds.
//!   Zero falls back to the default.
//! - **Whitespace**: string values are trimmed; empty strings are ignored.
//! - **Invalid log level**: falls back to `info` with an error log.

pub mod env;
pub mod log_level;
pub mod session;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::{debug, error};

use crate::config::log_level::LogLevel;

/// Default interval between session-manager reconciliation passes.
pub const DEFAULT_CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Default interval between bookmark flushes.
pub const DEFAULT_BOOKMARK_FLUSH_PERIOD: Duration = Duration::from_secs(20);
/// Default bound on graceful stop of a session.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
/// File name of the default session config.
pub const DEFAULT_CONFIG_FILE_NAME: &str = "appsettings.json";

/// Helper macro to merge Option<T> fields to T fields when Option<T> is Some
#[macro_export]
macro_rules! merge_option_to_value {
    ($config:expr, $config_field:ident, $source:expr, $source_field:ident) => {
        if let Some(value) = &$source.$source_field {
            $config.$config_field = value.clone();
        }
    };
    ($config:expr, $source:expr, $field:ident) => {
        if let Some(value) = &$source.$field {
            $config.$field = value.clone();
        }
    };
}

/// Helper macro to merge Option<T> fields where T implements Clone
#[macro_export]
macro_rules! merge_option {
    ($config:expr, $source:expr, $field:ident) => {
        if $source.$field.is_some() {
            $config.$field.clone_from(&$source.$field);
        }
    };
}

#[derive(Debug, PartialEq)]
#[allow(clippy::module_name_repetitions)]
pub enum ConfigLoadError {
    ParseError(String),
}

#[allow(clippy::module_name_repetitions)]
pub trait ConfigSource {
    fn load(&self, config: &mut Config) -> Result<(), ConfigLoadError>;
}

/// Process-wide agent configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Path of the default session config. Its session is launched first and its
    /// failure is fatal.
    pub config_file: PathBuf,
    /// Directory scanned for additional `*.json` session configs.
    pub extra_config_dir: Option<PathBuf>,
    /// Root for bookmarks and the parameter store.
    pub data_dir: PathBuf,
    pub log_level: LogLevel,
    pub config_poll_interval: Duration,
    pub bookmark_flush_period: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_file: PathBuf::from(DEFAULT_CONFIG_FILE_NAME),
            extra_config_dir: None,
            data_dir: PathBuf::from("data"),
            log_level: LogLevel::default(),
            config_poll_interval: DEFAULT_CONFIG_POLL_INTERVAL,
            bookmark_flush_period: DEFAULT_BOOKMARK_FLUSH_PERIOD,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl Config {
    /// Validates the configuration for consistency.
    pub fn validate(&self) -> Result<(), String> {
        if self.config_file.as_os_str().is_empty() {
            return Err("Invalid configuration: config_file cannot be empty".to_string());
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err("Invalid configuration: data_dir cannot be empty".to_string());
        }
        if let Some(extra) = &self.extra_config_dir {
            if self.config_file.parent() == Some(extra.as_path()) {
                debug!(
                    "Default config {} lives in the extras directory and will be skipped there",
                    self.config_file.display()
                );
            }
        }
        Ok(())
    }

    /// File backing the agent's parameter store.
    #[must_use]
    pub fn parameter_store_path(&self) -> PathBuf {
        self.data_dir.join("parameters.json")
    }
}

#[derive(Default)]
#[allow(clippy::module_name_repetitions)]
pub struct ConfigBuilder {
    sources: Vec<Box<dyn ConfigSource>>,
    config: Config,
}

#[allow(clippy::module_name_repetitions)]
impl ConfigBuilder {
    #[must_use]
    pub fn add_source(mut self, source: Box<dyn ConfigSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn build(&mut self) -> Config {
        let mut failed_sources = 0;
        for source in &self.sources {
            match source.load(&mut self.config) {
                Ok(()) => (),
                Err(e) => {
                    error!("Failed to load config: {:?}", e);
                    failed_sources += 1;
                }
            }
        }

        if !self.sources.is_empty() && failed_sources == self.sources.len() {
            debug!("All sources failed to load config, using default config.");
        }

        if self.config.config_poll_interval.is_zero() {
            self.config.config_poll_interval = DEFAULT_CONFIG_POLL_INTERVAL;
        }
        if self.config.bookmark_flush_period.is_zero() {
            self.config.bookmark_flush_period = DEFAULT_BOOKMARK_FLUSH_PERIOD;
        }
        if self.config.shutdown_timeout.is_zero() {
            self.config.shutdown_timeout = DEFAULT_SHUTDOWN_TIMEOUT;
        }

        self.config.clone()
    }
}

/// Loads the agent configuration from defaults and `LOGSHIP_*` environment variables.
#[must_use]
pub fn get_config() -> Config {
    ConfigBuilder::default()
        .add_source(Box::new(env::EnvConfigSource))
        .build()
}

pub fn deserialize_optional_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                Ok(None)
            } else {
                Ok(Some(trimmed.to_string()))
            }
        }
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::Bool(b) => Ok(Some(b.to_string())),
        Value::Null => Ok(None),
        other => {
            error!("Expected a string, got {:?}. Ignoring value.", other);
            Ok(None)
        }
    }
}

/// Parses a duration expressed in seconds. Accepts integers, floats and numeric strings.
pub fn deserialize_optional_duration_from_seconds<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error> {
    Ok(duration_from_value(&Value::deserialize(deserializer)?))
}

/// Converts a JSON value holding seconds into a duration.
#[must_use]
pub fn duration_from_value(value: &Value) -> Option<Duration> {
    let seconds = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match seconds {
        Some(secs) if secs.is_finite() && secs >= 0.0 => Some(Duration::from_secs_f64(secs)),
        Some(secs) => {
            error!("Invalid duration {secs}, ignoring");
            None
        }
        None => {
            if !value.is_null() {
                error!("Expected seconds, got {:?}. Ignoring value.", value);
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bookmark_flush_period, Duration::from_secs(20));
    }

    #[test]
    fn test_validate_empty_data_dir() {
        let config = Config {
            data_dir: PathBuf::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duration_from_value() {
        assert_eq!(
            duration_from_value(&json!(5)),
            Some(Duration::from_secs(5))
        );
        assert_eq!(
            duration_from_value(&json!("2.5")),
            Some(Duration::from_millis(2500))
        );
        assert_eq!(duration_from_value(&json!(-1)), None);
        assert_eq!(duration_from_value(&json!({"a": 1})), None);
    }

    #[test]
    fn test_builder_restores_zero_durations() {
        struct ZeroSource;
        impl ConfigSource for ZeroSource {
            fn load(&self, config: &mut Config) -> Result<(), ConfigLoadError> {
                config.config_poll_interval = Duration::ZERO;
                Ok(())
            }
        }

        let config = ConfigBuilder::default()
            .add_source(Box::new(ZeroSource))
            .build();
        assert_eq!(config.config_poll_interval, DEFAULT_CONFIG_POLL_INTERVAL);
    }
}
