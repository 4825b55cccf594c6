// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One configured source → pipe → sink graph.
//!
//! Start order:
//!
//! ```text
//! bookmark store → credentials → plugins (+ built-in CounterReporter)
//!                → sinks → sources (created) → pipes / subscriptions
//!                → sources (started)
//! ```
//!
//! Stop runs the reverse dependency order: sources, pipes, sinks, plugins and
//! finally the bookmark store, whose stop writes every bookmark one last time.
//! Within a category plugins start and stop concurrently. A plugin that fails
//! to load or start is logged, counted and left out; the rest of the session
//! runs without it.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::bookmark::FileBookmarkStore;
use crate::config::session::{PluginSection, SessionConfig};
use crate::config::{Config, DEFAULT_BOOKMARK_FLUSH_PERIOD, DEFAULT_SHUTDOWN_TIMEOUT};
use crate::credentials::CredentialProviders;
use crate::error::{ConfigError, SessionError};
use crate::parameter_store::ParameterStore;
use crate::pipeline::{EventSink, EventSource, Pipe, Subscription};
use crate::plugin::{Plugin, PluginContext, PluginRegistry};
use crate::telemetry::{
    CounterReporter, PluginCategory, SessionCounters, COUNTER_REPORTER_TYPE,
    DEFAULT_REPORT_INTERVAL,
};

pub const SOURCE_TYPE_KEY: &str = "SourceType";
pub const SINK_TYPE_KEY: &str = "SinkType";
pub const CREDENTIAL_TYPE_KEY: &str = "CredentialType";
pub const PLUGIN_TYPE_KEY: &str = "Type";
pub const BUILTIN_COUNTER_REPORTER_ID: &str = "counters";

/// Process-wide settings every session shares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub data_dir: PathBuf,
    pub bookmark_flush_period: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            bookmark_flush_period: DEFAULT_BOOKMARK_FLUSH_PERIOD,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            bookmark_flush_period: config.bookmark_flush_period,
            shutdown_timeout: config.shutdown_timeout,
        }
    }
}

impl SessionSettings {
    /// `<data_dir>/sessions/<id>/bookmarks`
    #[must_use]
    pub fn bookmark_dir(&self, session_id: u64) -> PathBuf {
        self.data_dir
            .join("sessions")
            .join(session_id.to_string())
            .join("bookmarks")
    }
}

/// Collaborators a session is built with.
#[derive(Clone)]
pub struct SessionDeps {
    pub registry: Arc<PluginRegistry>,
    pub parameter_store: Arc<dyn ParameterStore>,
    /// Providers consulted for credential ids the session does not define.
    pub fallback_credentials: Option<Arc<CredentialProviders>>,
    pub settings: SessionSettings,
}

impl std::fmt::Debug for SessionDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionDeps")
            .field("settings", &self.settings)
            .field("has_fallback_credentials", &self.fallback_credentials.is_some())
            .finish_non_exhaustive()
    }
}

type Started<T> = Vec<(String, Arc<T>)>;

#[derive(Default)]
struct Graph {
    plugins: Started<dyn Plugin>,
    sinks: Started<dyn EventSink>,
    sources: Started<dyn EventSource>,
    pipes: Started<dyn Pipe>,
    subscriptions: Vec<Subscription>,
}

pub struct Session {
    name: String,
    id: u64,
    config_path: PathBuf,
    config: SessionConfig,
    start_time: SystemTime,
    registry: Arc<PluginRegistry>,
    settings: SessionSettings,
    context: PluginContext,
    credentials: Arc<CredentialProviders>,
    graph: Mutex<Option<Graph>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("config_path", &self.config_path)
            .finish_non_exhaustive()
    }
}

impl Session {
    #[must_use]
    pub fn new(config_path: impl Into<PathBuf>, config: SessionConfig, id: u64, deps: SessionDeps) -> Self {
        Self::with_start_time(config_path.into(), config, id, deps, SystemTime::now())
    }

    /// Reads the session config at `config_path`. The session's start time is
    /// taken before the read, so any later write to the file is newer.
    pub async fn load(config_path: &Path, id: u64, deps: SessionDeps) -> Result<Self, SessionError> {
        let start_time = SystemTime::now();
        let config = SessionConfig::load(config_path).await?;
        Ok(Self::with_start_time(
            config_path.to_path_buf(),
            config,
            id,
            deps,
            start_time,
        ))
    }

    fn with_start_time(
        config_path: PathBuf,
        config: SessionConfig,
        id: u64,
        deps: SessionDeps,
        start_time: SystemTime,
    ) -> Self {
        let name = config.session_name(&config_path);
        let credentials = Arc::new(CredentialProviders::with_fallback(deps.fallback_credentials));
        let store = Arc::new(FileBookmarkStore::new(
            deps.settings.bookmark_dir(id),
            deps.settings.bookmark_flush_period,
        ));
        let context = PluginContext::new(
            name.clone(),
            id,
            store,
            deps.parameter_store,
            Arc::clone(&credentials),
        );
        Self {
            name,
            id,
            config_path,
            config,
            start_time,
            registry: deps.registry,
            settings: deps.settings,
            context,
            credentials,
            graph: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    #[must_use]
    pub fn start_time(&self) -> SystemTime {
        self.start_time
    }

    #[must_use]
    pub fn counters(&self) -> Arc<SessionCounters> {
        self.context.counters()
    }

    #[must_use]
    pub fn context(&self) -> &PluginContext {
        &self.context
    }

    #[must_use]
    pub fn credentials(&self) -> Arc<CredentialProviders> {
        Arc::clone(&self.credentials)
    }

    pub async fn is_started(&self) -> bool {
        self.graph.lock().await.is_some()
    }

    pub async fn source_ids(&self) -> Vec<String> {
        self.ids(|graph| graph.sources.iter().map(|(id, _)| id.clone()).collect())
            .await
    }

    pub async fn sink_ids(&self) -> Vec<String> {
        self.ids(|graph| graph.sinks.iter().map(|(id, _)| id.clone()).collect())
            .await
    }

    pub async fn pipe_ids(&self) -> Vec<String> {
        self.ids(|graph| graph.pipes.iter().map(|(id, _)| id.clone()).collect())
            .await
    }

    pub async fn plugin_ids(&self) -> Vec<String> {
        self.ids(|graph| graph.plugins.iter().map(|(id, _)| id.clone()).collect())
            .await
    }

    async fn ids(&self, select: impl Fn(&Graph) -> Vec<String>) -> Vec<String> {
        self.graph.lock().await.as_ref().map(select).unwrap_or_default()
    }

    pub async fn start(&self) -> Result<(), SessionError> {
        let mut slot = self.graph.lock().await;
        if slot.is_some() {
            return Err(SessionError::AlreadyStarted(self.name.clone()));
        }
        info!(session = %self.name, id = self.id, config = %self.config_path.display(), "Starting session");

        let store = self.context.bookmark_store();
        store.start().await;

        for (_, provider) in self.create(
            PluginCategory::Credential,
            &self.config.credentials,
            CREDENTIAL_TYPE_KEY,
            |type_name, section| self.registry.create_credential(type_name, section, &self.context),
        ) {
            self.credentials.insert(provider);
        }

        let mut plugins = self.create(
            PluginCategory::Plugin,
            &self.config.plugins,
            PLUGIN_TYPE_KEY,
            |type_name, section| self.registry.create_plugin(type_name, section, &self.context),
        );
        if !self.has_configured_counter_reporter() {
            self.counters().record_loaded(PluginCategory::Plugin);
            plugins.push((
                BUILTIN_COUNTER_REPORTER_ID.to_string(),
                Arc::new(CounterReporter::new(
                    BUILTIN_COUNTER_REPORTER_ID,
                    &self.context,
                    DEFAULT_REPORT_INTERVAL,
                )) as Arc<dyn Plugin>,
            ));
        }
        let plugins = self.start_all(PluginCategory::Plugin, plugins).await;

        let sinks = self.create(
            PluginCategory::Sink,
            &self.config.sinks,
            SINK_TYPE_KEY,
            |type_name, section| self.registry.create_sink(type_name, section, &self.context),
        );
        let sinks = self.start_all(PluginCategory::Sink, sinks).await;

        let sources = self.create(
            PluginCategory::Source,
            &self.config.sources,
            SOURCE_TYPE_KEY,
            |type_name, section| self.registry.create_source(type_name, section, &self.context),
        );
        let (pipes, subscriptions) = self.connect(&sources, &sinks).await;
        let sources = self.start_all(PluginCategory::Source, sources).await;

        info!(
            session = %self.name,
            sources = sources.len(),
            sinks = sinks.len(),
            pipes = pipes.len(),
            plugins = plugins.len(),
            "Session started"
        );
        *slot = Some(Graph {
            plugins,
            sinks,
            sources,
            pipes,
            subscriptions,
        });
        Ok(())
    }

    /// Stops every plugin in dependency order, each bounded by the shutdown
    /// timeout. Failures are logged and never returned.
    pub async fn stop(&self) {
        let Some(graph) = self.graph.lock().await.take() else {
            return;
        };
        info!(session = %self.name, "Stopping session");

        self.stop_all(PluginCategory::Source, &graph.sources).await;
        for subscription in graph.subscriptions {
            subscription.unsubscribe();
        }
        self.stop_all(PluginCategory::Pipe, &graph.pipes).await;
        self.stop_all(PluginCategory::Sink, &graph.sinks).await;
        self.stop_all(PluginCategory::Plugin, &graph.plugins).await;
        self.context
            .bookmark_store()
            .stop(self.settings.shutdown_timeout)
            .await;

        info!(session = %self.name, "Session stopped");
    }

    fn has_configured_counter_reporter(&self) -> bool {
        self.config.plugins.iter().any(|section| {
            section
                .get_str(PLUGIN_TYPE_KEY)
                .is_some_and(|t| t.eq_ignore_ascii_case(COUNTER_REPORTER_TYPE))
        })
    }

    /// Builds one instance per section. Failures, and ids already taken within
    /// the category, are logged and counted.
    fn create<T: ?Sized>(
        &self,
        category: PluginCategory,
        sections: &[PluginSection],
        type_key: &str,
        factory: impl Fn(&str, &PluginSection) -> Result<Arc<T>, ConfigError>,
    ) -> Started<T> {
        let counters = self.counters();
        let mut seen = HashSet::new();
        let mut created = Vec::with_capacity(sections.len());
        for section in sections {
            let id = section.id();
            let result = if seen.insert(id.clone()) {
                section
                    .require_str(type_key)
                    .and_then(|type_name| factory(&type_name, section))
            } else {
                Err(ConfigError::InvalidValue {
                    field: "Id".to_string(),
                    reason: format!("duplicate {category} id '{id}'"),
                })
            };
            match result {
                Ok(instance) => {
                    counters.record_loaded(category);
                    debug!(session = %self.name, %category, id = %id, "Loaded");
                    created.push((id, instance));
                }
                Err(e) => {
                    counters.record_load_failure(category);
                    error!(session = %self.name, %category, id = %id, "Failed to load {category}: {e}");
                }
            }
        }
        created
    }

    async fn start_all<T: ?Sized + Plugin>(&self, category: PluginCategory, items: Started<T>) -> Started<T> {
        let counters = self.counters();
        let results = join_all(items.iter().map(|(_, item)| item.start())).await;
        items
            .into_iter()
            .zip(results)
            .filter_map(|((id, item), result)| match result {
                Ok(()) => {
                    counters.record_started(category);
                    Some((id, item))
                }
                Err(e) => {
                    counters.record_start_failure(category);
                    error!(session = %self.name, %category, id = %id, "Failed to start {category}: {e}");
                    None
                }
            })
            .collect()
    }

    async fn stop_all<T: ?Sized + Plugin>(&self, category: PluginCategory, items: &Started<T>) {
        let timeout = self.settings.shutdown_timeout;
        let results = join_all(
            items
                .iter()
                .map(|(_, item)| tokio::time::timeout(timeout, item.stop())),
        )
        .await;
        for ((id, _), result) in items.iter().zip(results) {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(session = %self.name, %category, id = %id, "Failed to stop {category}: {e}");
                }
                Err(_) => {
                    warn!(session = %self.name, %category, id = %id, "{category} did not stop within {timeout:?}");
                }
            }
        }
    }

    /// Wires every `Pipes` entry: `SourceRef` feeds `SinkRef` directly, or
    /// through a pipe when `Type` is set. Pipes start concurrently before any
    /// subscription is made.
    async fn connect(
        &self,
        sources: &Started<dyn EventSource>,
        sinks: &Started<dyn EventSink>,
    ) -> (Started<dyn Pipe>, Vec<Subscription>) {
        let counters = self.counters();
        let mut seen = HashSet::new();
        let mut created: Started<dyn Pipe> = Vec::new();
        let mut endpoints = HashMap::new();
        let mut subscriptions = Vec::new();

        for section in &self.config.pipes {
            let id = section.id();
            let resolved = if seen.insert(id.clone()) {
                resolve(section, "SourceRef", sources)
                    .and_then(|source| Ok((source, resolve(section, "SinkRef", sinks)?)))
            } else {
                Err(ConfigError::InvalidValue {
                    field: "Id".to_string(),
                    reason: format!("duplicate pipe id '{id}'"),
                })
            };
            let (source, sink) = match resolved {
                Ok(resolved) => resolved,
                Err(e) => {
                    counters.record_load_failure(PluginCategory::Pipe);
                    error!(session = %self.name, id = %id, "Failed to connect pipe: {e}");
                    continue;
                }
            };

            let Some(type_name) = section.get_str(PLUGIN_TYPE_KEY) else {
                counters.record_loaded(PluginCategory::Pipe);
                subscriptions.push(source.subscribe(sink.input()));
                continue;
            };

            match self.registry.create_pipe(&type_name, section, &self.context) {
                Ok(pipe) => {
                    counters.record_loaded(PluginCategory::Pipe);
                    endpoints.insert(id.clone(), (Arc::clone(source), Arc::clone(sink)));
                    created.push((id, pipe));
                }
                Err(e) => {
                    counters.record_load_failure(PluginCategory::Pipe);
                    error!(session = %self.name, id = %id, "Failed to load pipe: {e}");
                }
            }
        }

        let pipes = self.start_all(PluginCategory::Pipe, created).await;
        for (id, pipe) in &pipes {
            if let Some((source, sink)) = endpoints.remove(id) {
                subscriptions.push(pipe.subscribe(sink.input()));
                subscriptions.push(source.subscribe(pipe.input()));
            }
        }
        (pipes, subscriptions)
    }
}

fn resolve<'a, T: ?Sized>(
    section: &PluginSection,
    key: &str,
    candidates: &'a Started<T>,
) -> Result<&'a Arc<T>, ConfigError> {
    let wanted = section.require_str(key)?;
    candidates
        .iter()
        .find(|(id, _)| *id == wanted)
        .map(|(_, item)| item)
        .ok_or_else(|| ConfigError::InvalidValue {
            field: key.to_string(),
            reason: format!("'{wanted}' is not loaded"),
        })
}
