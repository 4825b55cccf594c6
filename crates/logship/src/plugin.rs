// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Plugin capability trait, the context plugins are built with, and the
//! factory table mapping config type names to constructors.
//!
//! Each built-in module contributes its constructors through a `register`
//! function; [`PluginRegistry::with_builtins`] calls all of them. Embedders add
//! their own types with the `register_*` methods before starting sessions.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::bookmark::FileBookmarkStore;
use crate::config::session::PluginSection;
use crate::config::DEFAULT_BOOKMARK_FLUSH_PERIOD;
use crate::credentials::{CredentialProvider, CredentialProviders};
use crate::error::{ConfigError, PluginError};
use crate::parameter_store::{MemoryParameterStore, ParameterStore};
use crate::pipeline::{EventSink, EventSource, Pipe};
use crate::telemetry::{PluginCategory, SessionCounters};

/// Lifecycle shared by sources, sinks, pipes and generic plugins.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn id(&self) -> &str;

    async fn start(&self) -> Result<(), PluginError>;

    /// Stops the plugin, flushing or draining whatever it buffers. Callers
    /// bound this with their own timeout.
    async fn stop(&self) -> Result<(), PluginError>;
}

/// Everything a plugin may need from its session.
#[derive(Clone)]
pub struct PluginContext {
    session_name: String,
    session_id: u64,
    bookmark_store: Arc<FileBookmarkStore>,
    counters: Arc<SessionCounters>,
    parameter_store: Arc<dyn ParameterStore>,
    credentials: Arc<CredentialProviders>,
}

impl fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginContext")
            .field("session_name", &self.session_name)
            .field("session_id", &self.session_id)
            .field("bookmark_dir", &self.bookmark_store.directory())
            .finish_non_exhaustive()
    }
}

impl PluginContext {
    #[must_use]
    pub fn new(
        session_name: impl Into<String>,
        session_id: u64,
        bookmark_store: Arc<FileBookmarkStore>,
        parameter_store: Arc<dyn ParameterStore>,
        credentials: Arc<CredentialProviders>,
    ) -> Self {
        Self {
            session_name: session_name.into(),
            session_id,
            bookmark_store,
            counters: Arc::new(SessionCounters::default()),
            parameter_store,
            credentials,
        }
    }

    /// Context with its own bookmark store under `bookmark_dir`, an in-memory
    /// parameter store and no credentials.
    #[must_use]
    pub fn standalone(session_name: impl Into<String>, bookmark_dir: &Path) -> Self {
        Self::new(
            session_name,
            0,
            Arc::new(FileBookmarkStore::new(
                bookmark_dir,
                DEFAULT_BOOKMARK_FLUSH_PERIOD,
            )),
            Arc::new(MemoryParameterStore::default()),
            Arc::new(CredentialProviders::default()),
        )
    }

    #[must_use]
    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    #[must_use]
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    #[must_use]
    pub fn bookmark_store(&self) -> Arc<FileBookmarkStore> {
        Arc::clone(&self.bookmark_store)
    }

    #[must_use]
    pub fn bookmark_dir(&self) -> PathBuf {
        self.bookmark_store.directory().to_path_buf()
    }

    #[must_use]
    pub fn counters(&self) -> Arc<SessionCounters> {
        Arc::clone(&self.counters)
    }

    #[must_use]
    pub fn parameter_store(&self) -> Arc<dyn ParameterStore> {
        Arc::clone(&self.parameter_store)
    }

    #[must_use]
    pub fn credentials(&self) -> Arc<CredentialProviders> {
        Arc::clone(&self.credentials)
    }

    /// Looks up a credential provider by id, in this session or the default one.
    #[must_use]
    pub fn credential_provider(&self, id: &str) -> Option<Arc<dyn CredentialProvider>> {
        self.credentials.get(id)
    }
}

pub type SourceFactory = Arc<
    dyn Fn(&PluginSection, &PluginContext) -> Result<Arc<dyn EventSource>, ConfigError>
        + Send
        + Sync,
>;
pub type SinkFactory = Arc<
    dyn Fn(&PluginSection, &PluginContext) -> Result<Arc<dyn EventSink>, ConfigError>
        + Send
        + Sync,
>;
pub type PipeFactory = Arc<
    dyn Fn(&PluginSection, &PluginContext) -> Result<Arc<dyn Pipe>, ConfigError> + Send + Sync,
>;
pub type CredentialFactory = Arc<
    dyn Fn(&PluginSection, &PluginContext) -> Result<Arc<dyn CredentialProvider>, ConfigError>
        + Send
        + Sync,
>;
pub type GenericFactory = Arc<
    dyn Fn(&PluginSection, &PluginContext) -> Result<Arc<dyn Plugin>, ConfigError> + Send + Sync,
>;

/// Config type name → constructor, per plugin category. Names match without
/// regard to case.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    sources: HashMap<String, SourceFactory>,
    sinks: HashMap<String, SinkFactory>,
    pipes: HashMap<String, PipeFactory>,
    credentials: HashMap<String, CredentialFactory>,
    plugins: HashMap<String, GenericFactory>,
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("sources", &sorted_keys(&self.sources))
            .field("sinks", &sorted_keys(&self.sinks))
            .field("pipes", &sorted_keys(&self.pipes))
            .field("credentials", &sorted_keys(&self.credentials))
            .field("plugins", &sorted_keys(&self.plugins))
            .finish()
    }
}

fn sorted_keys<V>(map: &HashMap<String, V>) -> Vec<&str> {
    let mut keys: Vec<&str> = map.keys().map(String::as_str).collect();
    keys.sort_unstable();
    keys
}

fn normalize(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

fn lookup<'a, V>(
    map: &'a HashMap<String, V>,
    category: PluginCategory,
    type_name: &str,
) -> Result<&'a V, ConfigError> {
    map.get(&normalize(type_name))
        .ok_or_else(|| ConfigError::UnknownType {
            category: category.to_string(),
            type_name: type_name.to_string(),
        })
}

impl PluginRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in source, sink, pipe, credential provider and
    /// plugin type.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::sources::register(&mut registry);
        crate::sinks::register(&mut registry);
        crate::pipes::register(&mut registry);
        crate::credentials::register(&mut registry);
        crate::telemetry::register(&mut registry);
        registry
    }

    pub fn register_source<F>(&mut self, type_name: &str, factory: F)
    where
        F: Fn(&PluginSection, &PluginContext) -> Result<Arc<dyn EventSource>, ConfigError>
            + Send
            + Sync
            + 'static,
    {
        self.sources.insert(normalize(type_name), Arc::new(factory));
    }

    pub fn register_sink<F>(&mut self, type_name: &str, factory: F)
    where
        F: Fn(&PluginSection, &PluginContext) -> Result<Arc<dyn EventSink>, ConfigError>
            + Send
            + Sync
            + 'static,
    {
        self.sinks.insert(normalize(type_name), Arc::new(factory));
    }

    pub fn register_pipe<F>(&mut self, type_name: &str, factory: F)
    where
        F: Fn(&PluginSection, &PluginContext) -> Result<Arc<dyn Pipe>, ConfigError>
            + Send
            + Sync
            + 'static,
    {
        self.pipes.insert(normalize(type_name), Arc::new(factory));
    }

    pub fn register_credential<F>(&mut self, type_name: &str, factory: F)
    where
        F: Fn(&PluginSection, &PluginContext) -> Result<Arc<dyn CredentialProvider>, ConfigError>
            + Send
            + Sync
            + 'static,
    {
        self.credentials
            .insert(normalize(type_name), Arc::new(factory));
    }

    pub fn register_plugin<F>(&mut self, type_name: &str, factory: F)
    where
        F: Fn(&PluginSection, &PluginContext) -> Result<Arc<dyn Plugin>, ConfigError>
            + Send
            + Sync
            + 'static,
    {
        self.plugins.insert(normalize(type_name), Arc::new(factory));
    }

    pub fn create_source(
        &self,
        type_name: &str,
        section: &PluginSection,
        context: &PluginContext,
    ) -> Result<Arc<dyn EventSource>, ConfigError> {
        let factory = lookup(&self.sources, PluginCategory::Source, type_name)?;
        factory(section, context)
    }

    pub fn create_sink(
        &self,
        type_name: &str,
        section: &PluginSection,
        context: &PluginContext,
    ) -> Result<Arc<dyn EventSink>, ConfigError> {
        let factory = lookup(&self.sinks, PluginCategory::Sink, type_name)?;
        factory(section, context)
    }

    pub fn create_pipe(
        &self,
        type_name: &str,
        section: &PluginSection,
        context: &PluginContext,
    ) -> Result<Arc<dyn Pipe>, ConfigError> {
        let factory = lookup(&self.pipes, PluginCategory::Pipe, type_name)?;
        factory(section, context)
    }

    pub fn create_credential(
        &self,
        type_name: &str,
        section: &PluginSection,
        context: &PluginContext,
    ) -> Result<Arc<dyn CredentialProvider>, ConfigError> {
        let factory = lookup(&self.credentials, PluginCategory::Credential, type_name)?;
        factory(section, context)
    }

    pub fn create_plugin(
        &self,
        type_name: &str,
        section: &PluginSection,
        context: &PluginContext,
    ) -> Result<Arc<dyn Plugin>, ConfigError> {
        let factory = lookup(&self.plugins, PluginCategory::Plugin, type_name)?;
        factory(section, context)
    }

    #[must_use]
    pub fn has_type(&self, category: PluginCategory, type_name: &str) -> bool {
        let key = normalize(type_name);
        match category {
            PluginCategory::Source => self.sources.contains_key(&key),
            PluginCategory::Sink => self.sinks.contains_key(&key),
            PluginCategory::Pipe => self.pipes.contains_key(&key),
            PluginCategory::Credential => self.credentials.contains_key(&key),
            PluginCategory::Plugin => self.plugins.contains_key(&key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtins_are_registered() {
        let registry = PluginRegistry::with_builtins();
        assert!(registry.has_type(PluginCategory::Source, "DirectorySource"));
        assert!(registry.has_type(PluginCategory::Sink, "file"));
        assert!(registry.has_type(PluginCategory::Sink, "Console"));
        assert!(registry.has_type(PluginCategory::Sink, "Memory"));
        assert!(registry.has_type(PluginCategory::Pipe, "RegexFilterPipe"));
        assert!(registry.has_type(PluginCategory::Credential, "static"));
        assert!(registry.has_type(PluginCategory::Plugin, "CounterReporter"));
    }

    #[test]
    fn test_unknown_type_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let context = PluginContext::standalone("web", dir.path());
        let section = PluginSection::from_value("Sinks[0]", json!({"Id": "x"})).unwrap();

        let err = PluginRegistry::with_builtins()
            .create_sink("Kinesis", &section, &context)
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::UnknownType { .. }));
        assert_eq!(err.to_string(), "Unknown sink type 'Kinesis'");
    }

    #[test]
    fn test_context_exposes_session_identity() {
        let dir = tempfile::tempdir().unwrap();
        let context = PluginContext::standalone("web", dir.path());
        assert_eq!(context.session_name(), "web");
        assert_eq!(context.session_id(), 0);
        assert_eq!(context.bookmark_dir(), dir.path());
        assert!(context.credential_provider("none").is_none());
    }
}
