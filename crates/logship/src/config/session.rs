// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Session configuration files.
//!
//! A session config is a JSON object whose top-level keys are matched without
//! regard to case:
//!
//! ```json
//! {
//!   "Name": "web",
//!   "Sources": [{ "Id": "apache", "SourceType": "DirectorySource", "Directory": "/var/log/apache" }],
//!   "Sinks": [{ "Id": "out", "SinkType": "File", "FilePath": "/tmp/out.log" }],
//!   "Pipes": [{ "Id": "p1", "SourceRef": "apache", "SinkRef": "out" }]
//! }
//! ```
//!
//! Each plugin entry is kept as a [`PluginSection`]; the plugin reads its own
//! options from it so that a bad option fails that plugin only.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{Map, Value};

use crate::config::duration_from_value;
use crate::error::ConfigError;

/// One plugin entry (`Sources[i]`, `Sinks[i]`, ...), with case-insensitive key lookup.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PluginSection {
    values: Map<String, Value>,
    label: String,
}

impl PluginSection {
    #[must_use]
    pub fn new(label: impl Into<String>, values: Map<String, Value>) -> Self {
        Self {
            values,
            label: label.into(),
        }
    }

    /// Builds a section from a JSON object literal, mostly useful in tests.
    pub fn from_value(label: impl Into<String>, value: Value) -> Result<Self, ConfigError> {
        let label = label.into();
        match value {
            Value::Object(values) => Ok(Self { values, label }),
            other => Err(ConfigError::Parse(format!(
                "{label} must be a JSON object, got {other}"
            ))),
        }
    }

    /// Human readable location used in error messages, e.g. `Sources[0]`.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
            .filter(|v| !v.is_null())
    }

    /// String value; numbers and booleans are rendered, blank strings are absent.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(s) => {
                let trimmed = s.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn require_str(&self, key: &str) -> Result<String, ConfigError> {
        self.get_str(key).ok_or_else(|| ConfigError::MissingField {
            section: self.label.clone(),
            field: key.to_string(),
        })
    }

    pub fn get_i64(&self, key: &str) -> Result<Option<i64>, ConfigError> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        let parsed = match value {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        };
        parsed.map(Some).ok_or_else(|| ConfigError::InvalidValue {
            field: key.to_string(),
            reason: format!("expected an integer, got {value}"),
        })
    }

    pub fn get_u64(&self, key: &str) -> Result<Option<u64>, ConfigError> {
        match self.get_i64(key)? {
            Some(v) if v < 0 => Err(ConfigError::InvalidValue {
                field: key.to_string(),
                reason: format!("expected a non-negative integer, got {v}"),
            }),
            Some(v) => Ok(Some(v.unsigned_abs())),
            None => Ok(None),
        }
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        match value {
            Value::Bool(b) => Ok(Some(*b)),
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(Some(true)),
                "false" | "0" | "no" => Ok(Some(false)),
                _ => Err(ConfigError::InvalidValue {
                    field: key.to_string(),
                    reason: format!("expected a boolean, got '{s}'"),
                }),
            },
            Value::Number(n) => Ok(Some(n.as_i64() != Some(0))),
            other => Err(ConfigError::InvalidValue {
                field: key.to_string(),
                reason: format!("expected a boolean, got {other}"),
            }),
        }
    }

    /// Seconds-valued option.
    pub fn get_duration(&self, key: &str) -> Result<Option<Duration>, ConfigError> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        duration_from_value(value)
            .map(Some)
            .ok_or_else(|| ConfigError::InvalidValue {
                field: key.to_string(),
                reason: format!("expected a number of seconds, got {value}"),
            })
    }

    /// The plugin's `Id`, falling back to the section label.
    #[must_use]
    pub fn id(&self) -> String {
        self.get_str("Id").unwrap_or_else(|| self.label.clone())
    }
}

/// Parsed contents of one session config file.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionConfig {
    /// Explicit `Name`; sessions otherwise take the file stem.
    pub name: Option<String>,
    pub sources: Vec<PluginSection>,
    pub sinks: Vec<PluginSection>,
    pub pipes: Vec<PluginSection>,
    pub credentials: Vec<PluginSection>,
    pub plugins: Vec<PluginSection>,
}

impl SessionConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let Value::Object(root) = value else {
            return Err(ConfigError::Parse(
                "session config must be a JSON object".to_string(),
            ));
        };
        let root = PluginSection::new("session", root);

        Ok(Self {
            name: root.get_str("Name"),
            sources: sections(&root, "Sources")?,
            sinks: sections(&root, "Sinks")?,
            pipes: sections(&root, "Pipes")?,
            credentials: sections(&root, "Credentials")?,
            plugins: sections(&root, "Plugins")?,
        })
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_json(&text)
    }

    /// Session name: the explicit `Name`, else the config file stem.
    #[must_use]
    pub fn session_name(&self, path: &Path) -> String {
        self.name.clone().unwrap_or_else(|| file_stem(path))
    }
}

fn sections(root: &PluginSection, key: &str) -> Result<Vec<PluginSection>, ConfigError> {
    match root.get(key) {
        None => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, item)| PluginSection::from_value(format!("{key}[{i}]"), item.clone()))
            .collect(),
        Some(other) => Err(ConfigError::Parse(format!(
            "'{key}' must be an array, got {other}"
        ))),
    }
}

#[must_use]
pub fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| PathBuf::from(path).display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_session_config_case_insensitive() {
        let config = SessionConfig::from_json(
            r#"{
                "name": "web",
                "SOURCES": [{"Id": "apache", "SourceType": "DirectorySource", "directory": "/var/log"}],
                "Sinks": [{"Id": "out", "SinkType": "Console"}]
            }"#,
        )
        .unwrap();

        assert_eq!(config.name.as_deref(), Some("web"));
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.sources[0].get_str("Directory").unwrap(), "/var/log");
        assert_eq!(config.sources[0].label(), "Sources[0]");
        assert!(config.pipes.is_empty());
    }

    #[test]
    fn test_session_name_falls_back_to_file_stem() {
        let config = SessionConfig::from_json("{}").unwrap();
        assert_eq!(config.session_name(Path::new("/etc/conf.d/iis.json")), "iis");
    }

    #[test]
    fn test_rejects_non_array_sections() {
        assert!(SessionConfig::from_json(r#"{"Sources": {"Id": "x"}}"#).is_err());
        assert!(SessionConfig::from_json("[1, 2]").is_err());
        assert!(SessionConfig::from_json("not json").is_err());
    }

    #[test]
    fn test_lenient_scalar_accessors() {
        let section = PluginSection::from_value(
            "Sources[0]",
            json!({"Interval": "5", "SkipLines": 2, "BookmarkOnBufferFlush": "true", "Blank": "  "}),
        )
        .unwrap();

        assert_eq!(
            section.get_duration("interval").unwrap(),
            Some(Duration::from_secs(5))
        );
        assert_eq!(section.get_u64("skiplines").unwrap(), Some(2));
        assert_eq!(section.get_bool("BookmarkOnBufferFlush").unwrap(), Some(true));
        assert_eq!(section.get_str("Blank"), None);
        assert!(section.require_str("Directory").is_err());
        assert_eq!(section.id(), "Sources[0]");
    }

    #[test]
    fn test_invalid_scalar_is_reported() {
        let section =
            PluginSection::from_value("Sources[0]", json!({"SkipLines": "many"})).unwrap();
        let err = section.get_u64("SkipLines").unwrap_err();
        assert!(err.to_string().contains("SkipLines"));
    }
}
