// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cursor bookkeeping and the scan pass of a directory source.
//!
//! The watcher callback thread and the blocking scan both mutate `cursors`;
//! `dirty` has its own lock and the two are never held together.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::cursor::{DirtySet, FileCursor};
use super::options::{DirectorySourceOptions, InitialPosition};
use super::SourceStatus;
use crate::bookmark::{codec, BookmarkSource};
use crate::error::BookmarkError;
use crate::pipeline::{Envelope, Publisher, RecordBookmark};
use crate::sources::parser::{LogContext, LogRecord, RecordParser};
use crate::telemetry::SessionCounters;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[must_use]
pub fn stream_id(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Totals from one scan pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub records_read: u64,
    pub bytes_read: u64,
    pub files_pending: u64,
    pub bytes_pending: u64,
}

#[derive(Debug)]
struct FileInfo {
    path: PathBuf,
    len: i64,
    modified: Option<SystemTime>,
}

pub struct SourceState {
    pub(super) key: String,
    pub(super) options: DirectorySourceOptions,
    parser: Arc<dyn RecordParser>,
    pub(super) publisher: Publisher,
    counters: Arc<SessionCounters>,
    cursors: Mutex<HashMap<PathBuf, FileCursor>>,
    dirty: Mutex<DirtySet>,
    /// Acknowledged positions per stream; only used with `BookmarkOnBufferFlush`.
    committed: Mutex<HashMap<String, i64>>,
    /// Old stream id to the name it was renamed to, for acks still in flight.
    renamed: Mutex<HashMap<String, String>>,
    /// Positions read back from the bookmark file, consumed by `initialize`.
    loaded: Mutex<Option<HashMap<String, i64>>>,
    initialized: AtomicBool,
    status: Mutex<SourceStatus>,
}

impl std::fmt::Debug for SourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceState")
            .field("key", &self.key)
            .field("directory", &self.options.directory)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl SourceState {
    pub fn new(
        key: impl Into<String>,
        options: DirectorySourceOptions,
        parser: Arc<dyn RecordParser>,
        counters: Arc<SessionCounters>,
    ) -> Self {
        Self {
            key: key.into(),
            options,
            parser,
            publisher: Publisher::new(),
            counters,
            cursors: Mutex::new(HashMap::new()),
            dirty: Mutex::new(DirtySet::default()),
            committed: Mutex::new(HashMap::new()),
            renamed: Mutex::new(HashMap::new()),
            loaded: Mutex::new(None),
            initialized: AtomicBool::new(false),
            status: Mutex::new(SourceStatus::Stopped),
        }
    }

    fn uses_callbacks(&self) -> bool {
        self.options.bookmark_on_buffer_flush
    }

    pub fn status(&self) -> SourceStatus {
        *lock(&self.status)
    }

    pub fn set_status(&self, status: SourceStatus) {
        let mut current = lock(&self.status);
        if *current != status {
            debug!(source = %self.key, from = ?*current, to = ?status, "Source state changed");
            *current = status;
        }
    }

    pub fn cursor(&self, path: &Path) -> Option<FileCursor> {
        lock(&self.cursors).get(path).cloned()
    }

    pub fn cursor_count(&self) -> usize {
        lock(&self.cursors).len()
    }

    pub fn insert_cursor(&self, cursor: FileCursor) {
        lock(&self.cursors).insert(cursor.file_path.clone(), cursor);
    }

    #[cfg(test)]
    pub(super) fn rename_alias_count(&self) -> usize {
        lock(&self.renamed).len()
    }

    pub fn committed_position(&self, path: &Path) -> Option<i64> {
        lock(&self.committed).get(&stream_id(path)).copied()
    }

    pub fn is_dirty(&self, path: &Path) -> bool {
        lock(&self.dirty).contains(path)
    }

    fn wants(&self, path: &Path) -> bool {
        path != self.options.directory
            && path
                .file_name()
                .is_some_and(|name| self.options.filter.matches(&name.to_string_lossy()))
    }

    pub fn mark_dirty(&self, path: &Path) {
        if self.wants(path) {
            lock(&self.dirty).mark(path);
        }
    }

    pub fn handle_remove(&self, path: &Path) {
        if lock(&self.cursors).remove(path).is_some() {
            debug!(source = %self.key, path = %path.display(), "File removed");
        }
        lock(&self.dirty).remove(path);
    }

    /// Carries `from`'s cursor over to `to`. An untracked `from` makes `to` a
    /// new file at offset 0.
    pub fn handle_rename(&self, from: &Path, to: &Path) {
        let keep = self.wants(to);
        {
            let mut cursors = lock(&self.cursors);
            match cursors.remove(from) {
                Some(mut cursor) if keep => {
                    cursor.file_path = to.to_path_buf();
                    debug!(
                        source = %self.key,
                        from = %from.display(),
                        to = %to.display(),
                        position = cursor.byte_position,
                        "File renamed, keeping position"
                    );
                    cursors.insert(to.to_path_buf(), cursor);
                }
                Some(_) => {}
                None if keep => {
                    cursors
                        .entry(to.to_path_buf())
                        .or_insert_with(|| FileCursor::new(to));
                }
                None => {}
            }
        }

        if self.uses_callbacks() {
            let (old, new) = (stream_id(from), stream_id(to));
            let mut committed = lock(&self.committed);
            let mut renamed = lock(&self.renamed);
            renamed.remove(&new);
            if let Some(position) = committed.remove(&old) {
                if keep {
                    committed.insert(new.clone(), position);
                    for target in renamed.values_mut() {
                        if *target == old {
                            target.clone_from(&new);
                        }
                    }
                    renamed.insert(old, new);
                }
            }
        }

        let mut dirty = lock(&self.dirty);
        dirty.remove(from);
        if keep {
            dirty.mark(to);
        }
    }

    fn list_files(&self) -> io::Result<Vec<FileInfo>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.options.directory)? {
            let entry = entry?;
            let path = entry.path();
            if !self.wants(&path) {
                continue;
            }
            let Ok(metadata) = std::fs::metadata(&path) else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            files.push(FileInfo {
                path,
                len: i64::try_from(metadata.len()).unwrap_or(i64::MAX),
                modified: metadata.modified().ok(),
            });
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    /// Builds the starting cursor set from the files present now.
    pub fn initialize(&self) -> io::Result<()> {
        let files = self.list_files()?;
        let loaded = lock(&self.loaded).take();

        let resume = match (self.options.initial_position, loaded) {
            (InitialPosition::Bookmark, Some(positions)) => Some(positions),
            _ => None,
        };
        let min_time: Option<SystemTime> = (self.options.initial_position
            == InitialPosition::Timestamp)
            .then(|| self.options.initial_position_timestamp.map(SystemTime::from))
            .flatten();

        let mut cursors = HashMap::with_capacity(files.len());
        let mut dirty = Vec::new();
        for file in &files {
            let cursor = match (&resume, self.options.initial_position) {
                (Some(positions), _) => match positions.get(&stream_id(&file.path)) {
                    Some(position) => FileCursor::at(&file.path, *position),
                    None => FileCursor::new(&file.path),
                },
                (None, InitialPosition::BeginningOfStream) => FileCursor::new(&file.path),
                (None, InitialPosition::EndOfStream | InitialPosition::Bookmark) => {
                    FileCursor::at(&file.path, file.len)
                }
                (None, InitialPosition::Timestamp) => match (file.modified, min_time) {
                    (Some(modified), Some(min)) if modified < min => {
                        FileCursor::at(&file.path, file.len)
                    }
                    _ => FileCursor::new(&file.path),
                },
            };
            if file.len != cursor.byte_position {
                dirty.push(file.path.clone());
            }
            cursors.insert(file.path.clone(), cursor);
        }

        if self.uses_callbacks() {
            *lock(&self.committed) = cursors
                .values()
                .map(|c| (stream_id(&c.file_path), c.byte_position))
                .collect();
        }
        debug!(
            source = %self.key,
            files = cursors.len(),
            pending = dirty.len(),
            resumed = resume.is_some(),
            "Initialized file cursors"
        );
        *lock(&self.cursors) = cursors;
        {
            let mut set = lock(&self.dirty);
            set.clear();
            for path in &dirty {
                set.mark(path);
            }
        }
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    /// Forgets every cursor after the directory disappeared. The current
    /// positions are kept so that a `Bookmark` source resumes from them.
    pub fn reset(&self) {
        if self.initialized.swap(false, Ordering::AcqRel) {
            *lock(&self.loaded) = Some(self.persisted_positions().into_iter().collect());
        }
        lock(&self.cursors).clear();
        lock(&self.dirty).clear();
    }

    fn persisted_positions(&self) -> BTreeMap<String, i64> {
        if self.uses_callbacks() {
            lock(&self.committed)
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect()
        } else {
            lock(&self.cursors)
                .values()
                .map(|c| (stream_id(&c.file_path), c.byte_position))
                .collect()
        }
    }

    /// One scan pass: reconcile cursors with the directory, read every dirty
    /// file and publish its new records. Runs on a blocking thread.
    pub fn scan_once(&self, cancel: &CancellationToken) -> ScanStats {
        let files = match self.list_files() {
            Ok(files) => files,
            Err(e) => {
                warn!(source = %self.key, "Failed to list {}: {e}", self.options.directory.display());
                return ScanStats::default();
            }
        };

        let mut newly_dirty = Vec::new();
        {
            let mut cursors = lock(&self.cursors);
            cursors.retain(|path, _| files.iter().any(|f| &f.path == path));
            for file in &files {
                match cursors.get(&file.path) {
                    None => {
                        debug!(source = %self.key, path = %file.path.display(), "Tracking new file");
                        cursors.insert(file.path.clone(), FileCursor::new(&file.path));
                        newly_dirty.push(file.path.clone());
                    }
                    Some(cursor) if cursor.byte_position != file.len => {
                        newly_dirty.push(file.path.clone());
                    }
                    Some(_) => {}
                }
            }
        }
        if self.uses_callbacks() {
            let mut committed = lock(&self.committed);
            committed.retain(|stream, _| files.iter().any(|f| stream_id(&f.path) == *stream));
            for file in &files {
                committed.entry(stream_id(&file.path)).or_insert(0);
            }
            lock(&self.renamed).retain(|_, target| committed.contains_key(target));
        }

        let paths = {
            let mut dirty = lock(&self.dirty);
            for path in &newly_dirty {
                dirty.mark(path);
            }
            dirty.drain()
        };

        let mut stats = ScanStats::default();
        for (index, path) in paths.iter().enumerate() {
            if cancel.is_cancelled() {
                let mut dirty = lock(&self.dirty);
                for rest in &paths[index..] {
                    dirty.mark(rest);
                }
                break;
            }
            let (records, bytes) = self.read_file(path);
            stats.records_read += records;
            stats.bytes_read += bytes;
        }

        {
            let cursors = lock(&self.cursors);
            for file in &files {
                if let Some(cursor) = cursors.get(&file.path) {
                    if file.len > cursor.byte_position {
                        stats.files_pending += 1;
                        stats.bytes_pending += (file.len - cursor.byte_position).unsigned_abs();
                    }
                }
            }
        }

        self.counters.add_read(stats.records_read, stats.bytes_read);
        self.counters
            .set_pending(&self.key, stats.files_pending, stats.bytes_pending);
        stats
    }

    /// Reads one file from its cursor. Returns `(records, bytes)` consumed.
    fn read_file(&self, path: &Path) -> (u64, u64) {
        let Some(mut cursor) = self.cursor(path) else {
            return (0, 0);
        };
        let start = cursor.byte_position;

        let result = self.read_from(&mut cursor);
        let mut records = 0;
        match result {
            Ok(count) => {
                records = count;
                cursor.consecutive_io_error_count = 0;
            }
            Err(e) => {
                cursor.consecutive_io_error_count += 1;
                if cursor.consecutive_io_error_count >= self.options.max_io_errors {
                    error!(
                        source = %self.key,
                        path = %path.display(),
                        attempts = cursor.consecutive_io_error_count,
                        "Failed to read file: {e}"
                    );
                } else {
                    debug!(
                        source = %self.key,
                        path = %path.display(),
                        attempts = cursor.consecutive_io_error_count,
                        "Failed to read file, will retry: {e}"
                    );
                }
                lock(&self.dirty).mark(path);
            }
        }

        let bytes = if cursor.byte_position >= start {
            cursor.byte_position - start
        } else {
            cursor.byte_position
        };
        if let Some(slot) = lock(&self.cursors).get_mut(path) {
            *slot = cursor;
        }
        (records, bytes.unsigned_abs())
    }

    fn read_from(&self, cursor: &mut FileCursor) -> io::Result<u64> {
        let file = File::open(&cursor.file_path)?;
        let len = i64::try_from(file.metadata()?.len()).unwrap_or(i64::MAX);
        let stream = stream_id(&cursor.file_path);

        if len < cursor.byte_position {
            warn!(
                source = %self.key,
                path = %cursor.file_path.display(),
                position = cursor.byte_position,
                length = len,
                "File truncated, rereading from start"
            );
            cursor.reset();
            if self.uses_callbacks() {
                lock(&self.committed).insert(stream.clone(), 0);
            }
        }
        if len == cursor.byte_position {
            return Ok(0);
        }

        let mut reader = BufReader::new(file);
        let mut context = LogContext {
            file_path: cursor.file_path.clone(),
            position: cursor.byte_position,
            line_number: cursor.line_number,
        };

        let mut records = 0;
        for record in self.parser.parse_records(&mut reader, &mut context) {
            let record = record?;
            cursor.byte_position = record.position;
            cursor.line_number = record.line_number;
            records += 1;
            if self.should_emit(&record, cursor.lines_from_start) {
                self.publish(&stream, record);
            }
        }
        Ok(records)
    }

    fn should_emit(&self, record: &LogRecord, lines_from_start: bool) -> bool {
        if lines_from_start && record.line_number <= self.options.skip_lines {
            return false;
        }
        if self.options.initial_position == InitialPosition::Timestamp {
            if let (Some(ts), Some(min)) = (record.timestamp, self.options.initial_position_timestamp)
            {
                return ts >= min;
            }
        }
        true
    }

    fn publish(&self, stream: &str, record: LogRecord) {
        let timestamp: DateTime<Utc> = record.timestamp.unwrap_or_else(Utc::now);
        let mut envelope = Envelope::new(timestamp, record.text)
            .with_location(record.line_number, record.position);
        if self.uses_callbacks() {
            envelope = envelope.with_bookmark(RecordBookmark::new(
                self.key.clone(),
                stream,
                record.position,
            ));
        }
        self.publisher.blocking_publish(Arc::new(envelope));
    }
}

impl BookmarkSource for SourceState {
    fn bookmark_key(&self) -> &str {
        &self.key
    }

    fn on_bookmark_loaded(&self, bytes: &[u8]) -> Result<(), BookmarkError> {
        let positions: HashMap<String, i64> = codec::decode(bytes)?.into_iter().collect();
        if self.uses_callbacks() {
            *lock(&self.committed) = positions.clone();
        }
        debug!(source = %self.key, files = positions.len(), "Bookmark positions loaded");
        *lock(&self.loaded) = Some(positions);
        Ok(())
    }

    fn serialize_bookmarks(&self) -> Result<Option<Vec<u8>>, BookmarkError> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(BookmarkError::NotInitialized(self.key.clone()));
        }
        let positions = self.persisted_positions();
        Ok(Some(codec::encode(
            positions.iter().map(|(path, position)| (path.as_str(), *position)),
        )))
    }

    fn on_bookmark_callback(&self, batch: &[RecordBookmark]) -> Result<(), BookmarkError> {
        if !self.uses_callbacks() {
            return Ok(());
        }
        let mut committed = lock(&self.committed);
        let renamed = lock(&self.renamed);
        for bookmark in batch {
            let stream = renamed
                .get(&bookmark.stream_id)
                .unwrap_or(&bookmark.stream_id);
            // Streams no longer tracked were deleted or renamed out of the filter.
            let Some(position) = committed.get_mut(stream) else {
                trace!(source = %self.key, stream = %bookmark.stream_id, "Dropping ack for untracked file");
                continue;
            };
            if bookmark.is_reset() {
                *position = 0;
            } else if bookmark.position > *position {
                *position = bookmark.position;
            }
        }
        Ok(())
    }
}
