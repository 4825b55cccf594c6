// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! File-backed bookmark store.
//!
//! Two background loops run while the store is started:
//!
//! - **flush loop**: every `flush_period`, asks each registered source for its
//!   bytes and writes them (temp file, then rename) when they changed.
//! - **callback loop**: the single consumer of the acknowledgement queue,
//!   applying each batch to its source in enqueue order.
//!
//! `stop` cancels both, lets the callback loop drain what is already queued,
//! then flushes every source one last time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{bookmark_file_name, BookmarkSource, CallbackQueue, CallbackQueueSender};
use crate::error::BookmarkError;
use crate::pipeline::RecordBookmark;

/// One acknowledgement batch waiting in the queue.
#[derive(Debug)]
struct Callback {
    source_key: String,
    batch: Vec<RecordBookmark>,
}

struct Entry {
    key: String,
    path: PathBuf,
    source: RwLock<Arc<dyn BookmarkSource>>,
    /// Bytes last written or loaded. The lock also serialises writes for this
    /// entry.
    last_blob: tokio::sync::Mutex<Option<Vec<u8>>>,
}

impl Entry {
    fn source(&self) -> Arc<dyn BookmarkSource> {
        match self.source.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn set_source(&self, source: Arc<dyn BookmarkSource>) {
        match self.source.write() {
            Ok(mut guard) => *guard = source,
            Err(poisoned) => *poisoned.into_inner() = source,
        }
    }
}

struct Shared {
    directory: PathBuf,
    entries: RwLock<HashMap<String, Arc<Entry>>>,
}

impl Shared {
    fn entry(&self, key: &str) -> Option<Arc<Entry>> {
        match self.entries.read() {
            Ok(entries) => entries.get(key).cloned(),
            Err(poisoned) => poisoned.into_inner().get(key).cloned(),
        }
    }

    fn all_entries(&self) -> Vec<Arc<Entry>> {
        match self.entries.read() {
            Ok(entries) => entries.values().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().values().cloned().collect(),
        }
    }

    async fn flush_all(&self) {
        let entries = self.all_entries();
        join_all(entries.iter().map(|entry| flush_entry(entry))).await;
    }

    fn apply(&self, callback: &Callback) {
        let Some(entry) = self.entry(&callback.source_key) else {
            warn!(
                source_key = %callback.source_key,
                "Dropping bookmark callback for unregistered source"
            );
            return;
        };
        if let Err(e) = entry.source().on_bookmark_callback(&callback.batch) {
            warn!(source_key = %entry.key, "Failed to apply bookmark callback: {e}");
        }
    }
}

async fn flush_entry(entry: &Entry) {
    let mut last_blob = entry.last_blob.lock().await;
    let blob = match entry.source().serialize_bookmarks() {
        Ok(blob) => blob,
        Err(BookmarkError::NotInitialized(_)) => {
            debug!(source_key = %entry.key, "Bookmark not initialized, skipping flush");
            return;
        }
        Err(e) => {
            warn!(source_key = %entry.key, "Failed to serialize bookmarks: {e}");
            return;
        }
    };

    match blob {
        None => {
            if last_blob.is_none() && !entry.path.exists() {
                return;
            }
            match tokio::fs::remove_file(&entry.path).await {
                Ok(()) => *last_blob = None,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => *last_blob = None,
                Err(e) => {
                    warn!(path = %entry.path.display(), "Failed to remove bookmark file: {e}");
                }
            }
        }
        Some(bytes) => {
            if last_blob.as_deref() == Some(bytes.as_slice()) {
                return;
            }
            match write_atomic(&entry.path, &bytes).await {
                Ok(()) => {
                    debug!(source_key = %entry.key, bytes = bytes.len(), "Bookmark written");
                    *last_blob = Some(bytes);
                }
                Err(e) => {
                    error!(path = %entry.path.display(), "Failed to write bookmark file: {e}");
                }
            }
        }
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}

/// Durable map `source_key → opaque position bytes`, one file per key.
pub struct FileBookmarkStore {
    shared: Arc<Shared>,
    flush_period: Duration,
    sender: CallbackQueueSender<Callback>,
    queue: Mutex<Option<CallbackQueue<Callback>>>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for FileBookmarkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBookmarkStore")
            .field("directory", &self.shared.directory)
            .field("flush_period", &self.flush_period)
            .finish_non_exhaustive()
    }
}

impl FileBookmarkStore {
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>, flush_period: Duration) -> Self {
        Self::with_capacity(directory, flush_period, crate::CALLBACK_QUEUE_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(
        directory: impl Into<PathBuf>,
        flush_period: Duration,
        queue_capacity: usize,
    ) -> Self {
        let queue = CallbackQueue::new(queue_capacity);
        Self {
            shared: Arc::new(Shared {
                directory: directory.into(),
                entries: RwLock::new(HashMap::new()),
            }),
            flush_period,
            sender: queue.sender(),
            queue: Mutex::new(Some(queue)),
            tasks: tokio::sync::Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.shared.directory
    }

    /// Path of the bookmark file for `key`.
    #[must_use]
    pub fn bookmark_path(&self, key: &str) -> PathBuf {
        self.shared.directory.join(bookmark_file_name(key))
    }

    #[must_use]
    pub fn registered_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .shared
            .all_entries()
            .iter()
            .map(|e| e.key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Registers `source` and hands it any bookmark already on disk. A second
    /// registration under the same key reuses the existing entry and file.
    ///
    /// A missing, unreadable or corrupt file leaves the source with its
    /// initial state; only a failure to create the bookmark directory is
    /// returned.
    pub async fn register_source(
        &self,
        source: Arc<dyn BookmarkSource>,
    ) -> Result<PathBuf, BookmarkError> {
        tokio::fs::create_dir_all(&self.shared.directory).await?;

        let key = source.bookmark_key().to_string();
        let entry = {
            let mut entries = match self.shared.entries.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(existing) = entries.get(&key) {
                debug!(source_key = %key, "Source already registered, reusing bookmark entry");
                existing.set_source(Arc::clone(&source));
                Arc::clone(existing)
            } else {
                let entry = Arc::new(Entry {
                    key: key.clone(),
                    path: self.bookmark_path(&key),
                    source: RwLock::new(Arc::clone(&source)),
                    last_blob: tokio::sync::Mutex::new(None),
                });
                entries.insert(key.clone(), Arc::clone(&entry));
                entry
            }
        };

        let mut last_blob = entry.last_blob.lock().await;
        match tokio::fs::read(&entry.path).await {
            Ok(bytes) => match source.on_bookmark_loaded(&bytes) {
                Ok(()) => {
                    debug!(source_key = %key, path = %entry.path.display(), "Bookmark loaded");
                    *last_blob = Some(bytes);
                }
                Err(e) => {
                    warn!(
                        source_key = %key,
                        path = %entry.path.display(),
                        "Ignoring unusable bookmark, starting fresh: {e}"
                    );
                    *last_blob = None;
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(
                    source_key = %key,
                    path = %entry.path.display(),
                    "Failed to read bookmark, starting fresh: {e}"
                );
                *last_blob = None;
            }
        }

        Ok(entry.path.clone())
    }

    /// Removes `key` from the store. Its file stays on disk.
    pub fn unregister_source(&self, key: &str) -> bool {
        let mut entries = match self.shared.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.remove(key).is_some()
    }

    /// Starts the flush and callback loops. Calling it twice is a no-op.
    pub async fn start(&self) {
        let queue = match self.queue.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(queue) = queue else {
            debug!("Bookmark store already started");
            return;
        };

        let mut tasks = self.tasks.lock().await;
        tasks.push(self.spawn_flush_loop());
        tasks.push(spawn_callback_loop(
            Arc::clone(&self.shared),
            queue,
            self.cancel.clone(),
        ));
        info!(
            directory = %self.shared.directory.display(),
            "Bookmark store started"
        );
    }

    fn spawn_flush_loop(&self) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let cancel = self.cancel.clone();
        let period = self.flush_period.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => shared.flush_all().await,
                    () = cancel.cancelled() => {
                        debug!("Bookmark flush loop shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Queues an acknowledgement batch for `source_key`, waiting while the
    /// queue is full.
    pub async fn bookmark_callback(
        &self,
        source_key: &str,
        batch: Vec<RecordBookmark>,
    ) -> Result<(), BookmarkError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.sender
            .enqueue(Callback {
                source_key: source_key.to_string(),
                batch,
            })
            .await
    }

    /// Writes `key`'s current bookmark now.
    pub async fn flush_source(&self, key: &str) {
        match self.shared.entry(key) {
            Some(entry) => flush_entry(&entry).await,
            None => debug!(source_key = %key, "Flush requested for unregistered source"),
        }
    }

    pub async fn flush_all(&self) {
        self.shared.flush_all().await;
    }

    /// Stops both loops and writes every source's final state. Waits at most
    /// `graceful_timeout` for the loops; the final flush always runs.
    pub async fn stop(&self, graceful_timeout: Duration) {
        self.cancel.cancel();

        // Never started: apply whatever was queued before flushing.
        let pending = match self.queue.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(mut queue) = pending {
            drain(&self.shared, &mut queue);
        }

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        if !handles.is_empty()
            && tokio::time::timeout(graceful_timeout, join_all(handles))
                .await
                .is_err()
        {
            warn!("Bookmark store loops did not stop within {graceful_timeout:?}");
        }

        self.shared.flush_all().await;
        debug!(
            directory = %self.shared.directory.display(),
            "Bookmark store stopped"
        );
    }
}

fn spawn_callback_loop(
    shared: Arc<Shared>,
    mut queue: CallbackQueue<Callback>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                item = queue.recv() => match item {
                    Some(callback) => shared.apply(&callback),
                    None => break,
                },
                () = cancel.cancelled() => {
                    drain(&shared, &mut queue);
                    debug!("Bookmark callback loop shutting down");
                    break;
                }
            }
        }
    })
}

fn drain(shared: &Shared, queue: &mut CallbackQueue<Callback>) {
    queue.close();
    while let Some(callback) = queue.try_recv() {
        shared.apply(&callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tracks the highest acknowledged position; `-1` resets it.
    struct CounterSource {
        key: String,
        position: Mutex<Option<i64>>,
        applied: Mutex<Vec<i64>>,
        fail_serialize: bool,
    }

    impl CounterSource {
        fn new(key: &str) -> Arc<Self> {
            Arc::new(Self {
                key: key.to_string(),
                position: Mutex::new(None),
                applied: Mutex::new(Vec::new()),
                fail_serialize: false,
            })
        }

        fn position(&self) -> Option<i64> {
            *self.position.lock().unwrap()
        }
    }

    impl BookmarkSource for CounterSource {
        fn bookmark_key(&self) -> &str {
            &self.key
        }

        fn on_bookmark_loaded(&self, bytes: &[u8]) -> Result<(), BookmarkError> {
            let text = std::str::from_utf8(bytes)
                .map_err(|e| BookmarkError::Corrupt(e.to_string()))?;
            let value = text
                .trim()
                .parse::<i64>()
                .map_err(|e| BookmarkError::Corrupt(e.to_string()))?;
            *self.position.lock().unwrap() = Some(value);
            Ok(())
        }

        fn serialize_bookmarks(&self) -> Result<Option<Vec<u8>>, BookmarkError> {
            if self.fail_serialize {
                return Err(BookmarkError::Corrupt("boom".to_string()));
            }
            match self.position() {
                Some(p) => Ok(Some(p.to_string().into_bytes())),
                None => Err(BookmarkError::NotInitialized(self.key.clone())),
            }
        }

        fn on_bookmark_callback(&self, batch: &[RecordBookmark]) -> Result<(), BookmarkError> {
            let mut position = self.position.lock().unwrap();
            for bookmark in batch {
                self.applied.lock().unwrap().push(bookmark.position);
                *position = if bookmark.is_reset() {
                    Some(0)
                } else {
                    Some(position.unwrap_or(0).max(bookmark.position))
                };
            }
            Ok(())
        }
    }

    fn ack(key: &str, position: i64) -> Vec<RecordBookmark> {
        vec![RecordBookmark::new(key, "/var/log/a.log", position)]
    }

    #[tokio::test]
    async fn test_stop_persists_max_acknowledged_position() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBookmarkStore::new(dir.path(), Duration::from_secs(3600));
        let source = CounterSource::new("apache");
        let path = store.register_source(source.clone()).await.unwrap();
        store.start().await;

        for position in [5, 30, 20] {
            store.bookmark_callback("apache", ack("apache", position)).await.unwrap();
        }
        store.stop(Duration::from_secs(5)).await;

        assert_eq!(std::fs::read_to_string(path).unwrap(), "30");
        assert_eq!(source.applied.lock().unwrap().clone(), vec![5, 30, 20]);
    }

    #[tokio::test]
    async fn test_stop_without_start_applies_queued_callbacks() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBookmarkStore::new(dir.path(), Duration::from_secs(3600));
        let source = CounterSource::new("apache");
        let path = store.register_source(source).await.unwrap();

        store.bookmark_callback("apache", ack("apache", 12)).await.unwrap();
        store.stop(Duration::from_secs(1)).await;

        assert_eq!(std::fs::read_to_string(path).unwrap(), "12");
    }

    #[tokio::test]
    async fn test_register_twice_reuses_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBookmarkStore::new(dir.path(), Duration::from_secs(3600));

        let first = store.register_source(CounterSource::new("web")).await.unwrap();
        let second = store.register_source(CounterSource::new("web")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.registered_keys(), vec!["web".to_string()]);
    }

    #[tokio::test]
    async fn test_corrupt_bookmark_is_replaced_on_flush() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBookmarkStore::new(dir.path(), Duration::from_secs(3600));
        let path = store.bookmark_path("apache");
        std::fs::write(&path, [0xde, 0xad, 0xbe, 0xef]).unwrap();

        let source = CounterSource::new("apache");
        store.register_source(source.clone()).await.unwrap();
        assert_eq!(source.position(), None);

        source.on_bookmark_callback(&ack("apache", 7)).unwrap();
        store.flush_source("apache").await;

        assert_eq!(std::fs::read_to_string(path).unwrap(), "7");
    }

    #[tokio::test]
    async fn test_loaded_bookmark_is_handed_to_source() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBookmarkStore::new(dir.path(), Duration::from_secs(3600));
        std::fs::write(store.bookmark_path("apache"), "42").unwrap();

        let source = CounterSource::new("apache");
        store.register_source(source.clone()).await.unwrap();
        assert_eq!(source.position(), Some(42));
    }

    #[tokio::test]
    async fn test_unchanged_blob_is_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBookmarkStore::new(dir.path(), Duration::from_secs(3600));
        let source = CounterSource::new("apache");
        let path = store.register_source(source.clone()).await.unwrap();

        source.on_bookmark_callback(&ack("apache", 3)).unwrap();
        store.flush_source("apache").await;
        std::fs::remove_file(&path).unwrap();

        store.flush_source("apache").await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_uninitialized_source_keeps_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBookmarkStore::new(dir.path(), Duration::from_secs(3600));
        let source = CounterSource::new("apache");
        let path = store.register_source(source).await.unwrap();

        store.flush_all().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_serialize_failure_keeps_other_sources_flushing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBookmarkStore::new(dir.path(), Duration::from_secs(3600));
        let broken = Arc::new(CounterSource {
            key: "broken".to_string(),
            position: Mutex::new(Some(1)),
            applied: Mutex::new(Vec::new()),
            fail_serialize: true,
        });
        let healthy = CounterSource::new("healthy");
        store.register_source(broken).await.unwrap();
        let healthy_path = store.register_source(healthy.clone()).await.unwrap();

        healthy.on_bookmark_callback(&ack("healthy", 9)).unwrap();
        store.flush_all().await;

        assert_eq!(std::fs::read_to_string(healthy_path).unwrap(), "9");
        assert!(!store.bookmark_path("broken").exists());
    }

    #[tokio::test]
    async fn test_flush_loop_writes_periodically() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBookmarkStore::new(dir.path(), Duration::from_millis(20));
        let source = CounterSource::new("apache");
        let path = store.register_source(source.clone()).await.unwrap();
        store.start().await;

        source.on_bookmark_callback(&ack("apache", 11)).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "11");

        store.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_unknown_key_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBookmarkStore::new(dir.path(), Duration::from_secs(3600));
        store.start().await;
        store.bookmark_callback("ghost", ack("ghost", 1)).await.unwrap();
        store.stop(Duration::from_secs(1)).await;
        assert!(store.registered_keys().is_empty());
    }

    #[tokio::test]
    async fn test_callback_after_stop_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBookmarkStore::new(dir.path(), Duration::from_secs(3600));
        store.start().await;
        store.stop(Duration::from_secs(1)).await;

        let result = store.bookmark_callback("apache", ack("apache", 1)).await;
        assert!(matches!(result, Err(BookmarkError::Stopped)));
    }
}
