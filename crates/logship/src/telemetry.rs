// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-session counters and the built-in reporter that logs them.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::config::session::PluginSection;
use crate::error::{ConfigError, PluginError};
use crate::periodic::PeriodicTask;
use crate::plugin::{Plugin, PluginContext, PluginRegistry};

/// Type name of the built-in reporter.
pub const COUNTER_REPORTER_TYPE: &str = "CounterReporter";

pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginCategory {
    Source,
    Sink,
    Pipe,
    Credential,
    Plugin,
}

impl PluginCategory {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginCategory::Source => "source",
            PluginCategory::Sink => "sink",
            PluginCategory::Pipe => "pipe",
            PluginCategory::Credential => "credential",
            PluginCategory::Plugin => "plugin",
        }
    }
}

impl fmt::Display for PluginCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
struct LifecycleCounters {
    loaded: AtomicU64,
    failed_to_load: AtomicU64,
    started: AtomicU64,
    failed_to_start: AtomicU64,
}

impl LifecycleCounters {
    fn snapshot(&self) -> LifecycleSnapshot {
        LifecycleSnapshot {
            loaded: self.loaded.load(Ordering::Relaxed),
            failed_to_load: self.failed_to_load.load(Ordering::Relaxed),
            started: self.started.load(Ordering::Relaxed),
            failed_to_start: self.failed_to_start.load(Ordering::Relaxed),
        }
    }
}

/// Counters shared by everything in one session (all relaxed atomics).
#[derive(Debug, Default)]
pub struct SessionCounters {
    sources: LifecycleCounters,
    sinks: LifecycleCounters,
    pipes: LifecycleCounters,
    credentials: LifecycleCounters,
    plugins: LifecycleCounters,
    records_read: AtomicU64,
    bytes_read: AtomicU64,
    records_delivered: AtomicU64,
    /// Latest `(files, bytes)` backlog per source id.
    pending: Mutex<HashMap<String, (u64, u64)>>,
}

impl SessionCounters {
    fn lifecycle(&self, category: PluginCategory) -> &LifecycleCounters {
        match category {
            PluginCategory::Source => &self.sources,
            PluginCategory::Sink => &self.sinks,
            PluginCategory::Pipe => &self.pipes,
            PluginCategory::Credential => &self.credentials,
            PluginCategory::Plugin => &self.plugins,
        }
    }

    pub fn record_loaded(&self, category: PluginCategory) {
        self.lifecycle(category).loaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_load_failure(&self, category: PluginCategory) {
        self.lifecycle(category)
            .failed_to_load
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_started(&self, category: PluginCategory) {
        self.lifecycle(category).started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_start_failure(&self, category: PluginCategory) {
        self.lifecycle(category)
            .failed_to_start
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_read(&self, records: u64, bytes: u64) {
        self.records_read.fetch_add(records, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_delivered(&self, records: u64) {
        self.records_delivered.fetch_add(records, Ordering::Relaxed);
    }

    /// Replaces `source_id`'s backlog gauge.
    pub fn set_pending(&self, source_id: &str, files: u64, bytes: u64) {
        let mut pending = match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        pending.insert(source_id.to_string(), (files, bytes));
    }

    /// Captures a point-in-time snapshot of the counters.
    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        let (files_pending, bytes_pending) = match self.pending.lock() {
            Ok(pending) => sum_pending(&pending),
            Err(poisoned) => sum_pending(&poisoned.into_inner()),
        };
        CounterSnapshot {
            sources: self.sources.snapshot(),
            sinks: self.sinks.snapshot(),
            pipes: self.pipes.snapshot(),
            credentials: self.credentials.snapshot(),
            plugins: self.plugins.snapshot(),
            records_read: self.records_read.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            records_delivered: self.records_delivered.load(Ordering::Relaxed),
            files_pending,
            bytes_pending,
        }
    }
}

fn sum_pending(pending: &HashMap<String, (u64, u64)>) -> (u64, u64) {
    pending
        .values()
        .fold((0, 0), |(files, bytes), (f, b)| (files + f, bytes + b))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LifecycleSnapshot {
    pub loaded: u64,
    pub failed_to_load: u64,
    pub started: u64,
    pub failed_to_start: u64,
}

/// Plain data representation of [`SessionCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterSnapshot {
    pub sources: LifecycleSnapshot,
    pub sinks: LifecycleSnapshot,
    pub pipes: LifecycleSnapshot,
    pub credentials: LifecycleSnapshot,
    pub plugins: LifecycleSnapshot,
    pub records_read: u64,
    pub bytes_read: u64,
    pub records_delivered: u64,
    pub files_pending: u64,
    pub bytes_pending: u64,
}

impl CounterSnapshot {
    #[must_use]
    pub fn lifecycle(&self, category: PluginCategory) -> LifecycleSnapshot {
        match category {
            PluginCategory::Source => self.sources,
            PluginCategory::Sink => self.sinks,
            PluginCategory::Pipe => self.pipes,
            PluginCategory::Credential => self.credentials,
            PluginCategory::Plugin => self.plugins,
        }
    }
}

impl fmt::Display for CounterSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, l) in [
            ("sources", self.sources),
            ("sinks", self.sinks),
            ("pipes", self.pipes),
        ] {
            write!(
                f,
                "{name}_loaded={}, {name}_failed_to_load={}, {name}_started={}, {name}_failed_to_start={}, ",
                l.loaded, l.failed_to_load, l.started, l.failed_to_start
            )?;
        }
        write!(
            f,
            "records_read={}, bytes_read={}, records_delivered={}, files_pending={}, bytes_pending={}",
            self.records_read,
            self.bytes_read,
            self.records_delivered,
            self.files_pending,
            self.bytes_pending
        )
    }
}

/// Logs the session's counters on an interval, and once more on stop.
pub struct CounterReporter {
    id: String,
    session_name: String,
    counters: Arc<SessionCounters>,
    task: PeriodicTask,
}

impl CounterReporter {
    #[must_use]
    pub fn new(id: impl Into<String>, context: &PluginContext, interval: Duration) -> Self {
        let id = id.into();
        Self {
            task: PeriodicTask::new(format!("counter_reporter:{id}"), interval).with_final_tick(),
            id,
            session_name: context.session_name().to_string(),
            counters: context.counters(),
        }
    }

    pub fn from_section(
        section: &PluginSection,
        context: &PluginContext,
    ) -> Result<Self, ConfigError> {
        let interval = section
            .get_duration("Interval")?
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_REPORT_INTERVAL);
        Ok(Self::new(section.id(), context, interval))
    }
}

#[async_trait]
impl Plugin for CounterReporter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn start(&self) -> Result<(), PluginError> {
        let counters = Arc::clone(&self.counters);
        let session = self.session_name.clone();
        self.task
            .start(move || {
                report(&session, &counters);
                async {}
            })
            .await;
        Ok(())
    }

    async fn stop(&self) -> Result<(), PluginError> {
        self.task.stop(Duration::from_secs(5)).await;
        Ok(())
    }
}

fn report(session: &str, counters: &SessionCounters) {
    info!(session = %session, "Counters: {}", counters.snapshot());
}

pub fn register(registry: &mut PluginRegistry) {
    registry.register_plugin(
        COUNTER_REPORTER_TYPE,
        |section: &PluginSection, context: &PluginContext| {
            Ok(Arc::new(CounterReporter::from_section(section, context)?) as Arc<dyn Plugin>)
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_updates() {
        let counters = SessionCounters::default();
        counters.record_loaded(PluginCategory::Sink);
        counters.record_loaded(PluginCategory::Sink);
        counters.record_load_failure(PluginCategory::Sink);
        counters.record_start_failure(PluginCategory::Source);
        counters.add_read(3, 120);
        counters.set_pending("a", 2, 50);
        counters.set_pending("b", 1, 10);
        counters.set_pending("a", 1, 5);

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.lifecycle(PluginCategory::Sink).loaded, 2);
        assert_eq!(snapshot.sinks.failed_to_load, 1);
        assert_eq!(snapshot.sources.failed_to_start, 1);
        assert_eq!(snapshot.records_read, 3);
        assert_eq!(snapshot.bytes_read, 120);
        assert_eq!(snapshot.files_pending, 2);
        assert_eq!(snapshot.bytes_pending, 15);
    }

    #[test]
    fn test_snapshot_display() {
        let text = SessionCounters::default().snapshot().to_string();
        assert!(text.starts_with("sources_loaded=0"));
        assert!(text.ends_with("bytes_pending=0"));
    }

    #[test]
    #[tracing_test::traced_test]
    fn test_report_logs_snapshot() {
        let counters = SessionCounters::default();
        counters.add_read(7, 70);
        report("web", &counters);
        assert!(logs_contain("records_read=7"));
    }

    #[tokio::test]
    async fn test_reporter_start_stop() {
        let dir = tempfile::tempdir().unwrap();
        let context = PluginContext::standalone("web", dir.path());
        let reporter = CounterReporter::new("counters", &context, Duration::from_millis(10));
        reporter.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        reporter.stop().await.unwrap();
        assert_eq!(reporter.id(), "counters");
    }
}
