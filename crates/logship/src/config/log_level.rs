// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log level configuration for the agent.
//!
//! Set through `LOGSHIP_LOG_LEVEL`. Parsing is case-insensitive and lenient: an
//! invalid value logs an error and falls back to **INFO** so the agent can still
//! start.

use std::str::FromStr;

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::error;

/// Agent log level controlling verbosity of logging output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl AsRef<str> for LogLevel {
    fn as_ref(&self) -> &str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl LogLevel {
    /// Directive string for a `tracing_subscriber` env filter.
    ///
    /// Noisy dependency targets are silenced regardless of level.
    #[must_use]
    pub fn as_filter_directive(self) -> String {
        format!("notify=off,{}", self.as_ref())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(format!(
                "Invalid log level: '{s}'. Valid levels are: error, warn, info, debug, trace",
            )),
        }
    }
}

impl<'de> Deserialize<'de> for LogLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;

        if let Value::String(s) = value {
            match LogLevel::from_str(&s) {
                Ok(level) => Ok(level),
                Err(e) => {
                    error!("{}", e);
                    Ok(LogLevel::Info)
                }
            }
        } else {
            error!("Expected a string for log level, got {:?}", value);
            Ok(LogLevel::Info)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_str_is_case_insensitive() {
        assert_eq!(LogLevel::from_str("DeBuG").unwrap(), LogLevel::Debug);
        assert_eq!(LogLevel::from_str("warning").unwrap(), LogLevel::Warn);
        assert!(LogLevel::from_str("verbose").is_err());
    }

    #[test]
    fn test_deserialize_falls_back_to_info() {
        let level: LogLevel = serde_json::from_value(json!("nope")).unwrap();
        assert_eq!(level, LogLevel::Info);
        let level: LogLevel = serde_json::from_value(json!(3)).unwrap();
        assert_eq!(level, LogLevel::Info);
        let level: LogLevel = serde_json::from_value(json!("error")).unwrap();
        assert_eq!(level, LogLevel::Error);
    }

    #[test]
    fn test_filter_directive() {
        assert_eq!(LogLevel::Debug.as_filter_directive(), "notify=off,debug");
    }
}
