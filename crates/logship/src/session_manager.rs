// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Maps session config files to running sessions.
//!
//! The default config's session is launched synchronously by
//! [`SessionManager::start`]; failing to launch it is fatal. Afterwards a
//! background task owns every session and reconciles on a fixed poll interval:
//!
//! ```text
//!   notify events ──> dirty flag ──(poll tick)──> reconcile
//!                                                  ├─ default config newer than its session → relaunch
//!                                                  ├─ extras/*.json gone                    → terminate
//!                                                  ├─ extras/*.json new                     → launch
//!                                                  └─ extras/*.json newer than its session  → relaunch
//! ```
//!
//! Bursts of filesystem events collapse into one pass. Other components reach
//! the task only through a [`SessionManagerHandle`].

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::future::join_all;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::session::SessionConfig;
use crate::config::{Config, DEFAULT_CONFIG_FILE_NAME};
use crate::credentials::CredentialProviders;
use crate::error::SessionError;
use crate::parameter_store::ParameterStore;
use crate::plugin::PluginRegistry;
use crate::session::{Session, SessionDeps, SessionSettings};

/// Session id of the default config.
pub const DEFAULT_SESSION_ID: u64 = 0;
const SESSION_ID_PREFIX: &str = "session_id:";
const NEXT_SESSION_ID_KEY: &str = "next_session_id";

/// Public view of a running session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub name: String,
    pub id: u64,
    pub config_path: PathBuf,
    pub start_time: SystemTime,
}

impl From<&Session> for SessionSummary {
    fn from(session: &Session) -> Self {
        Self {
            name: session.name().to_string(),
            id: session.id(),
            config_path: session.config_path().to_path_buf(),
            start_time: session.start_time(),
        }
    }
}

#[derive(Debug)]
pub enum ManagerCommand {
    LaunchValidated {
        config_path: PathBuf,
        config: SessionConfig,
        respond: oneshot::Sender<Result<SessionSummary, SessionError>>,
    },
    Terminate {
        config_path: PathBuf,
        respond: oneshot::Sender<bool>,
    },
    List(oneshot::Sender<Vec<SessionSummary>>),
    /// Runs a reconciliation pass now, regardless of the dirty flag.
    Reconcile(oneshot::Sender<()>),
}

/// Cloneable access to a running [`SessionManager`].
#[derive(Clone, Debug)]
pub struct SessionManagerHandle {
    tx: mpsc::UnboundedSender<ManagerCommand>,
}

impl SessionManagerHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand,
    ) -> Result<T, SessionError> {
        let (respond, response) = oneshot::channel();
        self.tx
            .send(command(respond))
            .map_err(|_| SessionError::ManagerStopped)?;
        response.await.map_err(|_| SessionError::ManagerStopped)
    }

    /// Launches a session from an already validated config and tracks it like
    /// a discovered one. `config_path` is its identity.
    pub async fn launch_validated_session(
        &self,
        config_path: impl Into<PathBuf>,
        config: SessionConfig,
    ) -> Result<SessionSummary, SessionError> {
        let config_path = config_path.into();
        self.request(|respond| ManagerCommand::LaunchValidated {
            config_path,
            config,
            respond,
        })
        .await?
    }

    /// Stops the session tracked under `config_path`. Returns whether one was.
    pub async fn terminate_session(&self, config_path: impl Into<PathBuf>) -> Result<bool, SessionError> {
        let config_path = config_path.into();
        self.request(|respond| ManagerCommand::Terminate {
            config_path,
            respond,
        })
        .await
    }

    pub async fn sessions(&self) -> Result<Vec<SessionSummary>, SessionError> {
        self.request(ManagerCommand::List).await
    }

    pub async fn reconcile(&self) -> Result<(), SessionError> {
        self.request(ManagerCommand::Reconcile).await
    }
}

pub struct SessionManager {
    handle: SessionManagerHandle,
    cancel: CancellationToken,
    task: JoinHandle<ManagerState>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Launches the default session, then starts watching and polling.
    pub async fn start(
        config: &Config,
        registry: PluginRegistry,
        parameter_store: Arc<dyn ParameterStore>,
    ) -> Result<Self, SessionError> {
        let mut state = ManagerState {
            default_config: config.config_file.clone(),
            extra_dir: config.extra_config_dir.clone(),
            poll_interval: config.config_poll_interval,
            registry: Arc::new(registry),
            parameter_store,
            settings: SessionSettings::from(config),
            default_credentials: None,
            sessions: BTreeMap::new(),
            dirty: Arc::new(AtomicBool::new(true)),
            watcher: None,
        };

        let default_config = state.default_config.clone();
        let summary = state.launch(&default_config, None).await?;
        info!(session = %summary.name, "Default session launched");

        state.watcher = state.watch();
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(state.run(rx, cancel.clone()));

        Ok(Self {
            handle: SessionManagerHandle { tx },
            cancel,
            task,
        })
    }

    #[must_use]
    pub fn handle(&self) -> SessionManagerHandle {
        self.handle.clone()
    }

    /// Disables the watchers, stops the poll loop and waits for it, then
    /// terminates every tracked session.
    pub async fn stop(self) {
        self.cancel.cancel();
        match self.task.await {
            Ok(mut state) => state.terminate_all().await,
            Err(e) => error!("Session manager task failed: {e}"),
        }
        info!("Session manager stopped");
    }
}

struct ManagerState {
    default_config: PathBuf,
    extra_dir: Option<PathBuf>,
    poll_interval: Duration,
    registry: Arc<PluginRegistry>,
    parameter_store: Arc<dyn ParameterStore>,
    settings: SessionSettings,
    default_credentials: Option<Arc<CredentialProviders>>,
    sessions: BTreeMap<PathBuf, Arc<Session>>,
    dirty: Arc<AtomicBool>,
    watcher: Option<RecommendedWatcher>,
}

impl ManagerState {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ManagerCommand>, cancel: CancellationToken) -> Self {
        let mut ticker = tokio::time::interval(self.poll_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                command = rx.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = ticker.tick() => self.reconcile(false).await,
            }
        }

        self.watcher = None;
        debug!("Session manager poll loop stopped");
        self
    }

    async fn handle(&mut self, command: ManagerCommand) {
        match command {
            ManagerCommand::LaunchValidated {
                config_path,
                config,
                respond,
            } => {
                self.terminate(&config_path).await;
                let result = self.launch(&config_path, Some(config)).await;
                if let Err(e) = &result {
                    error!(config = %config_path.display(), "Failed to launch validated session: {e}");
                }
                let _ = respond.send(result);
            }
            ManagerCommand::Terminate {
                config_path,
                respond,
            } => {
                let _ = respond.send(self.terminate(&config_path).await);
            }
            ManagerCommand::List(respond) => {
                let _ = respond.send(
                    self.sessions
                        .values()
                        .map(|s| SessionSummary::from(s.as_ref()))
                        .collect(),
                );
            }
            ManagerCommand::Reconcile(respond) => {
                self.reconcile(true).await;
                let _ = respond.send(());
            }
        }
    }

    /// Watches the default config's directory and the extras directory. Any
    /// event only sets the dirty flag.
    fn watch(&self) -> Option<RecommendedWatcher> {
        let dirty = Arc::clone(&self.dirty);
        let mut watcher = match notify::recommended_watcher(move |res: notify::Result<Event>| {
            if res.is_ok() {
                dirty.store(true, Ordering::Release);
            }
        }) {
            Ok(watcher) => watcher,
            Err(e) => {
                warn!("Config watcher unavailable, reconciling on every poll: {e}");
                return None;
            }
        };

        let default_dir = self
            .default_config
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let mut watched = 0;
        for dir in std::iter::once(default_dir).chain(self.extra_dir.clone()) {
            match watcher.watch(&dir, RecursiveMode::NonRecursive) {
                Ok(()) => watched += 1,
                Err(e) => warn!(directory = %dir.display(), "Failed to watch config directory: {e}"),
            }
        }
        let expected = 1 + usize::from(self.extra_dir.is_some());
        (watched == expected).then_some(watcher)
    }

    /// One pass over the default config and the extras directory. Without a
    /// working watcher every pass runs.
    async fn reconcile(&mut self, force: bool) {
        let dirty = self.dirty.swap(false, Ordering::AcqRel);
        if !(force || dirty || self.watcher.is_none()) {
            return;
        }

        let default_config = self.default_config.clone();
        if self.is_stale(&default_config).await {
            info!(config = %default_config.display(), "Default config changed, relaunching");
            self.relaunch(&default_config).await;
        }

        let Some(extra_dir) = self.extra_dir.clone() else {
            return;
        };
        let discovered = self.discover(&extra_dir).await;

        let gone: Vec<PathBuf> = self
            .sessions
            .keys()
            .filter(|path| path.parent() == Some(extra_dir.as_path()) && !discovered.contains(*path))
            .filter(|path| **path != default_config)
            .cloned()
            .collect();
        for path in gone {
            info!(config = %path.display(), "Session config removed");
            self.terminate(&path).await;
        }

        for path in discovered {
            if !self.sessions.contains_key(&path) {
                if let Err(e) = self.launch(&path, None).await {
                    error!(config = %path.display(), "Failed to launch session: {e}");
                }
            } else if self.is_stale(&path).await {
                info!(config = %path.display(), "Session config changed, relaunching");
                self.relaunch(&path).await;
            }
        }
    }

    /// `*.json` files in `dir`, minus reserved and unusable names.
    async fn discover(&self, dir: &Path) -> BTreeSet<PathBuf> {
        let mut found = BTreeSet::new();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!(directory = %dir.display(), "Cannot list extra configs: {e}");
                return found;
            }
        };
        let default_name = self
            .default_config
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(directory = %dir.display(), "Failed to list extra configs: {e}");
                    break;
                }
            };
            let path = entry.path();
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            if !is_session_config_name(&name, default_name.as_deref()) {
                continue;
            }
            if entry.file_type().await.is_ok_and(|t| t.is_file()) {
                found.insert(path);
            }
        }
        found
    }

    async fn is_stale(&self, path: &Path) -> bool {
        let Some(session) = self.sessions.get(path) else {
            return false;
        };
        match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
            Ok(modified) => modified > session.start_time(),
            Err(_) => false,
        }
    }

    async fn relaunch(&mut self, path: &Path) {
        self.terminate(path).await;
        if let Err(e) = self.launch(path, None).await {
            error!(config = %path.display(), "Failed to relaunch session: {e}");
        }
    }

    /// Builds, checks and starts a session for `path`. Reads the file unless
    /// `config` is given.
    async fn launch(&mut self, path: &Path, config: Option<SessionConfig>) -> Result<SessionSummary, SessionError> {
        let is_default = path == self.default_config;
        let id = self.session_id(path)?;
        let deps = SessionDeps {
            registry: Arc::clone(&self.registry),
            parameter_store: Arc::clone(&self.parameter_store),
            fallback_credentials: if is_default {
                None
            } else {
                self.default_credentials.clone()
            },
            settings: self.settings.clone(),
        };
        let session = match config {
            Some(config) => Session::new(path, config, id, deps),
            None => Session::load(path, id, deps).await?,
        };

        if let Some(other) = self
            .sessions
            .values()
            .find(|s| s.name() == session.name() && s.config_path() != path)
        {
            warn!(
                session = %session.name(),
                config = %path.display(),
                existing = %other.config_path().display(),
                "Session name already in use"
            );
            return Err(SessionError::DuplicateName(session.name().to_string()));
        }

        session.start().await?;
        if is_default {
            self.default_credentials = Some(session.credentials());
        }
        let summary = SessionSummary::from(&session);
        info!(session = %summary.name, id = summary.id, config = %path.display(), "Session launched");
        self.sessions.insert(path.to_path_buf(), Arc::new(session));
        Ok(summary)
    }

    async fn terminate(&mut self, path: &Path) -> bool {
        let Some(session) = self.sessions.remove(path) else {
            return false;
        };
        session.stop().await;
        info!(session = %session.name(), config = %path.display(), "Session terminated");
        true
    }

    /// Stops every session concurrently, the default one last.
    async fn terminate_all(&mut self) {
        let default = self.sessions.remove(&self.default_config);
        let sessions = std::mem::take(&mut self.sessions);
        join_all(sessions.values().map(|session| session.stop())).await;
        if let Some(session) = default {
            session.stop().await;
        }
    }

    /// Stable id for `path`, allocated once and kept in the parameter store.
    fn session_id(&self, path: &Path) -> Result<u64, SessionError> {
        if path == self.default_config {
            return Ok(DEFAULT_SESSION_ID);
        }
        let key = format!("{SESSION_ID_PREFIX}{}", path.display());
        if let Some(id) = self.parameter_store.get(&key).and_then(|v| v.parse().ok()) {
            return Ok(id);
        }

        let id = self
            .parameter_store
            .get(NEXT_SESSION_ID_KEY)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_SESSION_ID + 1)
            .max(DEFAULT_SESSION_ID + 1);
        self.parameter_store
            .set(NEXT_SESSION_ID_KEY, &(id + 1).to_string())?;
        self.parameter_store.set(&key, &id.to_string())?;
        debug!(config = %path.display(), id, "Allocated session id");
        Ok(id)
    }
}

/// `*.json` made only of `[A-Za-z0-9._-]`, and not a reserved name.
#[must_use]
pub fn is_session_config_name(name: &str, default_name: Option<&str>) -> bool {
    let Some(stem) = name
        .strip_suffix(".json")
        .or_else(|| name.strip_suffix(".JSON"))
    else {
        return false;
    };
    !stem.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        && !name.eq_ignore_ascii_case(DEFAULT_CONFIG_FILE_NAME)
        && default_name.map_or(true, |d| !name.eq_ignore_ascii_case(d))
}
