// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Directory tailing source.
//!
//! ```text
//! Stopped ──start──> WaitingForDependency ──dir exists──> Initializing ──> Running
//!                           ^                                                │
//!                           └────────────── Resetting <──── dir removed ─────┘
//! ```
//!
//! While running, a scan fires every `Interval`. A filesystem watcher marks
//! files dirty between scans; each scan also compares sizes against cursors,
//! so a missed event only delays a file by one tick.
//!
//! Positions are persisted one of two ways. With `BookmarkOnBufferFlush`,
//! envelopes carry a [`RecordBookmark`](crate::pipeline::RecordBookmark) and
//! only sink acknowledgements advance what is saved. Otherwise the read
//! cursors themselves are saved after every scan.

pub mod cursor;
pub mod filter;
pub mod options;
pub mod state;
pub mod watcher;

pub use cursor::FileCursor;
pub use filter::FileNameFilter;
pub use options::{DirectorySourceOptions, InitialPosition};

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use self::state::SourceState;
use crate::bookmark::{BookmarkSource, FileBookmarkStore};
use crate::config::session::PluginSection;
use crate::dependency::{wait_until_available, Dependency, DirectoryDependency};
use crate::error::{ConfigError, PluginError};
use crate::pipeline::{EnvelopeSender, EventSource, Subscription};
use crate::plugin::{Plugin, PluginContext};
use crate::sources::parser::{RecordParser, SingleLineParser};

pub const DIRECTORY_SOURCE_TYPE: &str = "DirectorySource";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStatus {
    Stopped,
    WaitingForDependency,
    Initializing,
    Running,
    Resetting,
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct DirectorySource {
    id: String,
    state: Arc<SourceState>,
    store: Arc<FileBookmarkStore>,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for DirectorySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectorySource")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl DirectorySource {
    #[must_use]
    pub fn new(id: impl Into<String>, options: DirectorySourceOptions, context: &PluginContext) -> Self {
        let parser = Arc::new(SingleLineParser::new(options.timestamp_extractor()));
        Self::with_parser(id, options, context, parser)
    }

    #[must_use]
    pub fn with_parser(
        id: impl Into<String>,
        options: DirectorySourceOptions,
        context: &PluginContext,
        parser: Arc<dyn RecordParser>,
    ) -> Self {
        let id = id.into();
        Self {
            state: Arc::new(SourceState::new(
                id.clone(),
                options,
                parser,
                context.counters(),
            )),
            store: context.bookmark_store(),
            running: Mutex::new(None),
            id,
        }
    }

    pub fn from_section(section: &PluginSection, context: &PluginContext) -> Result<Self, ConfigError> {
        let options = DirectorySourceOptions::from_section(section)?;
        Ok(Self::new(section.id(), options, context))
    }

    #[must_use]
    pub fn status(&self) -> SourceStatus {
        self.state.status()
    }

    #[must_use]
    pub fn options(&self) -> &DirectorySourceOptions {
        &self.state.options
    }

    #[must_use]
    pub fn state(&self) -> Arc<SourceState> {
        Arc::clone(&self.state)
    }
}

#[async_trait]
impl Plugin for DirectorySource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn start(&self) -> Result<(), PluginError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        self.store
            .register_source(Arc::clone(&self.state) as Arc<dyn BookmarkSource>)
            .await?;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(
            Arc::clone(&self.state),
            Arc::clone(&self.store),
            cancel.clone(),
        ));
        *running = Some(Running { cancel, handle });
        info!(
            source = %self.id,
            directory = %self.state.options.directory.display(),
            filter = %self.state.options.filter.as_str(),
            "Directory source started"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<(), PluginError> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };
        running.cancel.cancel();
        if let Err(e) = running.handle.await {
            return Err(PluginError::Stop {
                id: self.id.clone(),
                reason: e.to_string(),
            });
        }
        info!(source = %self.id, "Directory source stopped");
        Ok(())
    }
}

impl EventSource for DirectorySource {
    fn subscribe(&self, consumer: EnvelopeSender) -> Subscription {
        self.state.publisher.subscribe(consumer)
    }
}

async fn run(state: Arc<SourceState>, store: Arc<FileBookmarkStore>, cancel: CancellationToken) {
    let dependency = DirectoryDependency::new(&state.options.directory);
    let interval = state.options.interval;

    'lifecycle: loop {
        if !dependency.is_available() {
            state.set_status(SourceStatus::WaitingForDependency);
            info!(source = %state.key, "Waiting for {}", dependency.name());
        }
        if !wait_until_available(&dependency, interval, &cancel).await {
            break;
        }

        state.set_status(SourceStatus::Initializing);
        let init = Arc::clone(&state);
        match tokio::task::spawn_blocking(move || init.initialize()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(source = %state.key, "Failed to initialize, retrying: {e}");
                tokio::select! {
                    () = tokio::time::sleep(interval) => continue 'lifecycle,
                    () = cancel.cancelled() => break 'lifecycle,
                }
            }
            Err(e) => {
                error!(source = %state.key, "Initialization task failed: {e}");
                break;
            }
        }

        let watcher = match watcher::watch(Arc::clone(&state)) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!(source = %state.key, "File watcher unavailable, relying on scans: {e}");
                None
            }
        };
        state.set_status(SourceStatus::Running);

        loop {
            if !dependency.is_available() {
                state.set_status(SourceStatus::Resetting);
                warn!(source = %state.key, "{} disappeared, resetting", dependency.name());
                drop(watcher);
                state.reset();
                continue 'lifecycle;
            }

            let scan_state = Arc::clone(&state);
            let scan_cancel = cancel.clone();
            match tokio::task::spawn_blocking(move || scan_state.scan_once(&scan_cancel)).await {
                Ok(stats) if stats.records_read > 0 => {
                    debug!(
                        source = %state.key,
                        records = stats.records_read,
                        bytes = stats.bytes_read,
                        files_pending = stats.files_pending,
                        "Scan complete"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(source = %state.key, "Scan task failed: {e}"),
            }
            if !state.options.bookmark_on_buffer_flush {
                store.flush_source(&state.key).await;
            }

            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                () = cancel.cancelled() => break 'lifecycle,
            }
        }
    }

    if !state.options.bookmark_on_buffer_flush {
        store.flush_source(&state.key).await;
    }
    dependency.dispose();
    state.set_status(SourceStatus::Stopped);
}
