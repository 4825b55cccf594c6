// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Built-in sinks.
//!
//! Every sink here is a [`BufferedSink`]: envelopes are collected from the
//! input channel and handed to a [`BatchWriter`] when the buffer fills or the
//! flush interval elapses. Only after a batch is written are its record
//! bookmarks acknowledged to the session's bookmark store, so a crash can
//! replay records but never skip them.

pub mod console;
pub mod file;
pub mod memory;

pub use console::ConsoleSink;
pub use file::FileSink;
pub use memory::MemorySink;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bookmark::FileBookmarkStore;
use crate::config::session::PluginSection;
use crate::error::{ConfigError, PluginError};
use crate::pipeline::{
    envelope_channel, group_bookmarks, Envelope, EnvelopeReceiver, EnvelopeSender, EventSink,
};
use crate::plugin::{Plugin, PluginContext, PluginRegistry};
use crate::telemetry::SessionCounters;

pub const DEFAULT_BUFFER_SIZE: usize = 500;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Writes a batch durably. A batch is acknowledged only when this returns `Ok`.
pub trait BatchWriter: Send + 'static {
    fn write_batch(&mut self, batch: &[Arc<Envelope>]) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferOptions {
    pub buffer_size: usize,
    pub flush_interval: Duration,
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

impl BufferOptions {
    /// Reads `BufferSize` and `FlushInterval` (seconds).
    pub fn from_section(section: &PluginSection) -> Result<Self, ConfigError> {
        let mut options = Self::default();
        if let Some(size) = section.get_u64("BufferSize")? {
            options.buffer_size = usize::try_from(size).unwrap_or(usize::MAX).max(1);
        }
        if let Some(interval) = section.get_duration("FlushInterval")? {
            if !interval.is_zero() {
                options.flush_interval = interval;
            }
        }
        Ok(options)
    }
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct BufferedSink<W> {
    id: String,
    options: BufferOptions,
    input: EnvelopeSender,
    idle: Mutex<Option<(EnvelopeReceiver, W)>>,
    running: Mutex<Option<Running>>,
    store: Arc<FileBookmarkStore>,
    counters: Arc<SessionCounters>,
}

impl<W> std::fmt::Debug for BufferedSink<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedSink")
            .field("id", &self.id)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<W: BatchWriter> BufferedSink<W> {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        writer: W,
        options: BufferOptions,
        context: &PluginContext,
    ) -> Self {
        let (input, rx) = envelope_channel();
        Self {
            id: id.into(),
            options,
            input,
            idle: Mutex::new(Some((rx, writer))),
            running: Mutex::new(None),
            store: context.bookmark_store(),
            counters: context.counters(),
        }
    }

    #[must_use]
    pub fn options(&self) -> BufferOptions {
        self.options
    }
}

#[async_trait]
impl<W: BatchWriter> Plugin for BufferedSink<W> {
    fn id(&self) -> &str {
        &self.id
    }

    async fn start(&self) -> Result<(), PluginError> {
        let Some((rx, writer)) = self.idle.lock().await.take() else {
            return Ok(());
        };
        let cancel = CancellationToken::new();
        let worker = Worker {
            id: self.id.clone(),
            options: self.options,
            writer,
            batch: Vec::with_capacity(self.options.buffer_size.min(DEFAULT_BUFFER_SIZE)),
            store: Arc::clone(&self.store),
            counters: Arc::clone(&self.counters),
        };
        let handle = tokio::spawn(worker.run(rx, cancel.clone()));
        *self.running.lock().await = Some(Running { cancel, handle });
        info!(sink = %self.id, "Sink started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), PluginError> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };
        running.cancel.cancel();
        running.handle.await.map_err(|e| PluginError::Stop {
            id: self.id.clone(),
            reason: e.to_string(),
        })?;
        info!(sink = %self.id, "Sink stopped");
        Ok(())
    }
}

impl<W: BatchWriter> EventSink for BufferedSink<W> {
    fn input(&self) -> EnvelopeSender {
        self.input.clone()
    }
}

struct Worker<W> {
    id: String,
    options: BufferOptions,
    writer: W,
    batch: Vec<Arc<Envelope>>,
    store: Arc<FileBookmarkStore>,
    counters: Arc<SessionCounters>,
}

impl<W: BatchWriter> Worker<W> {
    async fn run(mut self, mut rx: EnvelopeReceiver, cancel: CancellationToken) {
        let period = self.options.flush_interval.max(Duration::from_millis(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                // Intake pauses while a full batch is unwritten.
                received = rx.recv(), if self.batch.len() < self.options.buffer_size => match received {
                    Some(envelope) => {
                        self.batch.push(envelope);
                        if self.batch.len() >= self.options.buffer_size {
                            self.flush().await;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => self.flush().await,
            }
        }

        rx.close();
        while let Ok(envelope) = rx.try_recv() {
            self.batch.push(envelope);
        }
        self.flush().await;
        if !self.batch.is_empty() {
            warn!(
                sink = %self.id,
                records = self.batch.len(),
                "Dropping undelivered records on shutdown"
            );
        }
    }

    async fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        if let Err(e) = self.writer.write_batch(&self.batch) {
            warn!(
                sink = %self.id,
                records = self.batch.len(),
                "Failed to write batch, will retry: {e}"
            );
            return;
        }

        self.counters
            .add_delivered(u64::try_from(self.batch.len()).unwrap_or(u64::MAX));
        for (source_key, bookmarks) in group_bookmarks(&self.batch) {
            if let Err(e) = self.store.bookmark_callback(&source_key, bookmarks).await {
                debug!(sink = %self.id, source = %source_key, "Acknowledgement dropped: {e}");
            }
        }
        self.batch.clear();
    }
}

pub fn register(registry: &mut PluginRegistry) {
    registry.register_sink(console::CONSOLE_SINK_TYPE, |section, context| {
        Ok(Arc::new(ConsoleSink::from_section(section, context)?) as Arc<dyn EventSink>)
    });
    registry.register_sink(file::FILE_SINK_TYPE, |section, context| {
        Ok(Arc::new(FileSink::from_section(section, context)?) as Arc<dyn EventSink>)
    });
    registry.register_sink(memory::MEMORY_SINK_TYPE, |section, context| {
        Ok(Arc::new(MemorySink::from_section(section, context)?) as Arc<dyn EventSink>)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bookmark::BookmarkSource;
    use crate::error::BookmarkError;
    use crate::pipeline::{RecordBookmark, ENVELOPE_CHANNEL_CAPACITY};
    use chrono::Utc;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Acks {
        positions: StdMutex<Vec<i64>>,
    }

    impl BookmarkSource for Acks {
        fn bookmark_key(&self) -> &str {
            "apache"
        }

        fn on_bookmark_loaded(&self, _bytes: &[u8]) -> Result<(), BookmarkError> {
            Ok(())
        }

        fn serialize_bookmarks(&self) -> Result<Option<Vec<u8>>, BookmarkError> {
            Ok(None)
        }

        fn on_bookmark_callback(&self, batch: &[RecordBookmark]) -> Result<(), BookmarkError> {
            self.positions
                .lock()
                .unwrap()
                .extend(batch.iter().map(|b| b.position));
            Ok(())
        }
    }

    /// Fails the first `failures` writes.
    struct Flaky {
        failures: usize,
        written: Arc<StdMutex<Vec<String>>>,
    }

    impl BatchWriter for Flaky {
        fn write_batch(&mut self, batch: &[Arc<Envelope>]) -> io::Result<()> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(io::Error::other("disk full"));
            }
            let mut written = self.written.lock().unwrap();
            written.extend(batch.iter().map(|e| e.raw_text().to_string()));
            Ok(())
        }
    }

    fn envelope(text: &str, position: i64) -> Arc<Envelope> {
        Arc::new(
            Envelope::new(Utc::now(), text)
                .with_bookmark(RecordBookmark::new("apache", "/var/log/a.log", position)),
        )
    }

    #[tokio::test]
    async fn test_acknowledges_only_after_successful_write() {
        let dir = tempfile::tempdir().unwrap();
        let context = PluginContext::standalone("default", dir.path());
        let store = context.bookmark_store();
        let acks = Arc::new(Acks::default());
        store
            .register_source(Arc::clone(&acks) as Arc<dyn BookmarkSource>)
            .await
            .unwrap();

        let written = Arc::new(StdMutex::new(Vec::new()));
        let sink = BufferedSink::new(
            "out",
            Flaky {
                failures: 1,
                written: Arc::clone(&written),
            },
            BufferOptions {
                buffer_size: 2,
                flush_interval: Duration::from_millis(20),
            },
            &context,
        );
        sink.start().await.unwrap();

        let input = sink.input();
        input.send(envelope("one", 4)).await.unwrap();
        input.send(envelope("two", 8)).await.unwrap();
        input.send(envelope("three", 14)).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while written.lock().unwrap().len() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        sink.stop().await.unwrap();
        store.stop(Duration::from_secs(1)).await;

        assert_eq!(*written.lock().unwrap(), vec!["one", "two", "three"]);
        assert_eq!(*acks.positions.lock().unwrap(), vec![4, 8, 14]);
        assert_eq!(context.counters().snapshot().records_delivered, 3);
    }

    struct AlwaysFails {
        attempts: Arc<StdMutex<Vec<usize>>>,
    }

    impl BatchWriter for AlwaysFails {
        fn write_batch(&mut self, batch: &[Arc<Envelope>]) -> io::Result<()> {
            self.attempts.lock().unwrap().push(batch.len());
            Err(io::Error::other("disk full"))
        }
    }

    #[tokio::test]
    async fn test_failing_writes_push_back_on_input() {
        let dir = tempfile::tempdir().unwrap();
        let context = PluginContext::standalone("default", dir.path());
        let attempts = Arc::new(StdMutex::new(Vec::new()));
        let sink = BufferedSink::new(
            "out",
            AlwaysFails {
                attempts: Arc::clone(&attempts),
            },
            BufferOptions {
                buffer_size: 10,
                flush_interval: Duration::from_millis(10),
            },
            &context,
        );
        sink.start().await.unwrap();

        let input = sink.input();
        let mut accepted = 0;
        for i in 0..5000 {
            let envelope = Arc::new(Envelope::new(Utc::now(), format!("line {i}")));
            match tokio::time::timeout(Duration::from_millis(200), input.send(envelope)).await {
                Ok(sent) => {
                    sent.unwrap();
                    accepted += 1;
                }
                Err(_) => break,
            }
        }
        assert!(
            accepted <= 10 + ENVELOPE_CHANNEL_CAPACITY,
            "accepted {accepted} envelopes without backpressure"
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(attempts.lock().unwrap().iter().all(|len| *len <= 10));
        sink.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_flush_interval_delivers_partial_batches() {
        let dir = tempfile::tempdir().unwrap();
        let context = PluginContext::standalone("default", dir.path());
        let written = Arc::new(StdMutex::new(Vec::new()));
        let sink = BufferedSink::new(
            "out",
            Flaky {
                failures: 0,
                written: Arc::clone(&written),
            },
            BufferOptions {
                buffer_size: 100,
                flush_interval: Duration::from_millis(20),
            },
            &context,
        );
        sink.start().await.unwrap();
        sink.input()
            .send(Arc::new(Envelope::new(Utc::now(), "lonely")))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*written.lock().unwrap(), vec!["lonely"]);
        sink.stop().await.unwrap();
    }

    #[test]
    fn test_buffer_options_from_section() {
        let section = PluginSection::from_value(
            "Sinks[0]",
            serde_json::json!({ "BufferSize": 10, "FlushInterval": 3 }),
        )
        .unwrap();
        let options = BufferOptions::from_section(&section).unwrap();
        assert_eq!(options.buffer_size, 10);
        assert_eq!(options.flush_interval, Duration::from_secs(3));
        assert_eq!(
            BufferOptions::from_section(&PluginSection::from_value("s", serde_json::json!({})).unwrap())
                .unwrap(),
            BufferOptions::default()
        );
    }
}
