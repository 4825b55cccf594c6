// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

/// Errors raised while reading plugin or agent configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required field '{field}' in {section}")]
    MissingField { section: String, field: String },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Unknown {category} type '{type_name}'")]
    UnknownType { category: String, type_name: String },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors exchanged between the bookmark store and its sources.
#[derive(Debug, thiserror::Error)]
pub enum BookmarkError {
    /// The source has not produced a position yet; the store keeps the old file.
    #[error("Source '{0}' has not initialized its bookmark state")]
    NotInitialized(String),

    #[error("Corrupt bookmark data: {0}")]
    Corrupt(String),

    #[error("Bookmark I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bookmark store is stopped")]
    Stopped,
}

/// Errors raised by plugin construction and lifecycle calls.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to start '{id}': {reason}")]
    Start { id: String, reason: String },

    #[error("Failed to stop '{id}': {reason}")]
    Stop { id: String, reason: String },

    #[error(transparent)]
    Bookmark(#[from] BookmarkError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Session-level failures. These prevent a single session from launching but
/// never affect other sessions.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("A session named '{0}' is already running")]
    DuplicateName(String),

    #[error("Session '{0}' is already started")]
    AlreadyStarted(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session manager is stopped")]
    ManagerStopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ConfigError::MissingField {
            section: "source 'web'".to_string(),
            field: "Directory".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Missing required field 'Directory' in source 'web'"
        );

        let error = SessionError::DuplicateName("default".to_string());
        assert_eq!(
            error.to_string(),
            "A session named 'default' is already running"
        );
    }

    #[test]
    fn test_plugin_error_wraps_config_error() {
        let error: PluginError = ConfigError::Parse("bad json".to_string()).into();
        assert_eq!(error.to_string(), "Failed to parse config: bad json");
    }
}
