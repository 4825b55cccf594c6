// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Environment-variable configuration source (`LOGSHIP_*`).

use std::path::PathBuf;
use std::time::Duration;

use figment::{providers::Env, Figment};
use serde::Deserialize;

use crate::config::{
    deserialize_optional_duration_from_seconds, deserialize_optional_string,
    log_level::LogLevel, Config, ConfigLoadError, ConfigSource,
};
use crate::{merge_option, merge_option_to_value};

/// Prefix shared by every agent environment variable.
pub const ENV_PREFIX: &str = "LOGSHIP_";

#[derive(Debug, PartialEq, Deserialize, Clone, Default)]
#[serde(default)]
#[allow(clippy::module_name_repetitions)]
pub struct EnvConfig {
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub config_file: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub extra_config_dir: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub data_dir: Option<String>,
    pub log_level: Option<LogLevel>,
    #[serde(deserialize_with = "deserialize_optional_duration_from_seconds")]
    pub config_poll_interval: Option<Duration>,
    #[serde(deserialize_with = "deserialize_optional_duration_from_seconds")]
    pub bookmark_flush_period: Option<Duration>,
    #[serde(deserialize_with = "deserialize_optional_duration_from_seconds")]
    pub shutdown_timeout: Option<Duration>,
}

struct PathOverrides {
    config_file: Option<PathBuf>,
    extra_config_dir: Option<PathBuf>,
    data_dir: Option<PathBuf>,
}

fn merge_config(config: &mut Config, env_config: &EnvConfig) {
    let paths = PathOverrides {
        config_file: env_config.config_file.as_ref().map(PathBuf::from),
        extra_config_dir: env_config.extra_config_dir.as_ref().map(PathBuf::from),
        data_dir: env_config.data_dir.as_ref().map(PathBuf::from),
    };
    merge_option_to_value!(config, paths, config_file);
    merge_option_to_value!(config, paths, data_dir);
    merge_option!(config, paths, extra_config_dir);

    merge_option_to_value!(config, env_config, log_level);
    merge_option_to_value!(config, env_config, config_poll_interval);
    merge_option_to_value!(config, env_config, bookmark_flush_period);
    merge_option_to_value!(config, env_config, shutdown_timeout);
}

#[derive(Debug, Clone, Copy)]
#[allow(clippy::module_name_repetitions)]
pub struct EnvConfigSource;

impl ConfigSource for EnvConfigSource {
    fn load(&self, config: &mut Config) -> Result<(), ConfigLoadError> {
        let figment = Figment::new().merge(Env::prefixed(ENV_PREFIX));

        match figment.extract::<EnvConfig>() {
            Ok(env_config) => merge_config(config, &env_config),
            Err(e) => {
                return Err(ConfigLoadError::ParseError(format!(
                    "Failed to parse config from environment variables: {e}, using default config."
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::get_config;

    #[test]
    fn test_env_overrides_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.set_env("LOGSHIP_CONFIG_FILE", "/etc/logship/appsettings.json");
            jail.set_env("LOGSHIP_EXTRA_CONFIG_DIR", "/etc/logship/conf.d");
            jail.set_env("LOGSHIP_DATA_DIR", "/var/lib/logship");
            jail.set_env("LOGSHIP_LOG_LEVEL", "debug");
            jail.set_env("LOGSHIP_BOOKMARK_FLUSH_PERIOD", "3");

            let config = get_config();
            assert_eq!(
                config.config_file,
                PathBuf::from("/etc/logship/appsettings.json")
            );
            assert_eq!(
                config.extra_config_dir,
                Some(PathBuf::from("/etc/logship/conf.d"))
            );
            assert_eq!(config.data_dir, PathBuf::from("/var/lib/logship"));
            assert_eq!(config.log_level, LogLevel::Debug);
            assert_eq!(config.bookmark_flush_period, Duration::from_secs(3));
            Ok(())
        });
    }

    #[test]
    fn test_defaults_without_env() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            let config = get_config();
            assert_eq!(config, Config::default());
            Ok(())
        });
    }

    #[test]
    fn test_zero_poll_interval_uses_default() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.set_env("LOGSHIP_CONFIG_POLL_INTERVAL", "0");
            let config = get_config();
            assert_eq!(
                config.config_poll_interval,
                crate::config::DEFAULT_CONFIG_POLL_INTERVAL
            );
            Ok(())
        });
    }
}
