// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Credential providers configured under a session's `Credentials` section.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::config::session::PluginSection;
use crate::error::ConfigError;
use crate::plugin::{PluginContext, PluginRegistry};

/// Key material handed to sinks.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
    pub session_token: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

pub trait CredentialProvider: Send + Sync {
    fn id(&self) -> &str;

    fn credentials(&self) -> Result<Credentials, ConfigError>;
}

/// Fixed keys from the config file.
#[derive(Debug)]
pub struct StaticCredentialProvider {
    id: String,
    credentials: Credentials,
}

impl StaticCredentialProvider {
    pub fn from_section(section: &PluginSection) -> Result<Self, ConfigError> {
        Ok(Self {
            id: section.id(),
            credentials: Credentials {
                access_key: section.require_str("AccessKey")?,
                secret_key: section.require_str("SecretKey")?,
                session_token: section.get_str("SessionToken"),
            },
        })
    }
}

impl CredentialProvider for StaticCredentialProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn credentials(&self) -> Result<Credentials, ConfigError> {
        Ok(self.credentials.clone())
    }
}

/// Reads keys from environment variables each time they are requested.
#[derive(Debug)]
pub struct EnvironmentCredentialProvider {
    id: String,
    access_key_var: String,
    secret_key_var: String,
    session_token_var: String,
}

impl EnvironmentCredentialProvider {
    pub const DEFAULT_ACCESS_KEY_VAR: &'static str = "LOGSHIP_ACCESS_KEY";
    pub const DEFAULT_SECRET_KEY_VAR: &'static str = "LOGSHIP_SECRET_KEY";
    pub const DEFAULT_SESSION_TOKEN_VAR: &'static str = "LOGSHIP_SESSION_TOKEN";

    #[must_use]
    pub fn from_section(section: &PluginSection) -> Self {
        Self {
            id: section.id(),
            access_key_var: section
                .get_str("AccessKeyVariable")
                .unwrap_or_else(|| Self::DEFAULT_ACCESS_KEY_VAR.to_string()),
            secret_key_var: section
                .get_str("SecretKeyVariable")
                .unwrap_or_else(|| Self::DEFAULT_SECRET_KEY_VAR.to_string()),
            session_token_var: section
                .get_str("SessionTokenVariable")
                .unwrap_or_else(|| Self::DEFAULT_SESSION_TOKEN_VAR.to_string()),
        }
    }

    fn read(&self, var: &str) -> Result<String, ConfigError> {
        std::env::var(var)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingField {
                section: format!("credential '{}'", self.id),
                field: var.to_string(),
            })
    }
}

impl CredentialProvider for EnvironmentCredentialProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn credentials(&self) -> Result<Credentials, ConfigError> {
        Ok(Credentials {
            access_key: self.read(&self.access_key_var)?,
            secret_key: self.read(&self.secret_key_var)?,
            session_token: self.read(&self.session_token_var).ok(),
        })
    }
}

/// Providers loaded by one session, falling back to another session's set
/// (the default session's) for ids it does not define.
#[derive(Default)]
pub struct CredentialProviders {
    providers: RwLock<HashMap<String, Arc<dyn CredentialProvider>>>,
    fallback: Option<Arc<CredentialProviders>>,
}

impl fmt::Debug for CredentialProviders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialProviders")
            .field("ids", &self.ids())
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}

impl CredentialProviders {
    #[must_use]
    pub fn with_fallback(fallback: Option<Arc<CredentialProviders>>) -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            fallback,
        }
    }

    pub fn insert(&self, provider: Arc<dyn CredentialProvider>) {
        let id = provider.id().to_string();
        match self.providers.write() {
            Ok(mut providers) => providers.insert(id, provider),
            Err(poisoned) => poisoned.into_inner().insert(id, provider),
        };
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<dyn CredentialProvider>> {
        let own = match self.providers.read() {
            Ok(providers) => providers.get(id).cloned(),
            Err(poisoned) => poisoned.into_inner().get(id).cloned(),
        };
        own.or_else(|| self.fallback.as_ref().and_then(|f| f.get(id)))
    }

    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = match self.providers.read() {
            Ok(providers) => providers.keys().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().keys().cloned().collect(),
        };
        ids.sort();
        ids
    }
}

pub fn register(registry: &mut PluginRegistry) {
    registry.register_credential("Static", |section: &PluginSection, _: &PluginContext| {
        Ok(Arc::new(StaticCredentialProvider::from_section(section)?) as Arc<dyn CredentialProvider>)
    });
    registry.register_credential("Environment", |section: &PluginSection, _: &PluginContext| {
        Ok(Arc::new(EnvironmentCredentialProvider::from_section(section)) as Arc<dyn CredentialProvider>)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn section(value: serde_json::Value) -> PluginSection {
        PluginSection::from_value("Credentials[0]", value).unwrap()
    }

    #[test]
    fn test_static_provider_requires_keys() {
        let provider = StaticCredentialProvider::from_section(&section(
            json!({"Id": "cred", "AccessKey": "AK", "SecretKey": "SK"}),
        ))
        .unwrap();
        let credentials = provider.credentials().unwrap();
        assert_eq!(credentials.access_key, "AK");
        assert_eq!(credentials.session_token, None);
        assert!(!format!("{credentials:?}").contains("SK"));

        assert!(StaticCredentialProvider::from_section(&section(json!({"AccessKey": "AK"}))).is_err());
    }

    #[test]
    fn test_environment_provider_reads_configured_variables() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("MY_AK", "from-env");
            jail.set_env("MY_SK", "secret");
            let provider = EnvironmentCredentialProvider::from_section(&section(json!({
                "Id": "env",
                "AccessKeyVariable": "MY_AK",
                "SecretKeyVariable": "MY_SK",
                "SessionTokenVariable": "MY_TOKEN_UNSET"
            })));
            let credentials = provider.credentials().unwrap();
            assert_eq!(credentials.access_key, "from-env");
            assert_eq!(credentials.session_token, None);
            Ok(())
        });
    }

    #[test]
    fn test_lookup_falls_back_to_default_session() {
        let defaults = Arc::new(CredentialProviders::default());
        defaults.insert(Arc::new(
            StaticCredentialProvider::from_section(&section(
                json!({"Id": "shared", "AccessKey": "A", "SecretKey": "S"}),
            ))
            .unwrap(),
        ));

        let session = CredentialProviders::with_fallback(Some(Arc::clone(&defaults)));
        assert!(session.get("shared").is_some());
        assert!(session.get("missing").is_none());
        assert!(session.ids().is_empty());
    }
}
