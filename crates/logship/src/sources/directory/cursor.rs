// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Read progress for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCursor {
    pub file_path: PathBuf,
    pub byte_position: i64,
    pub line_number: i64,
    pub consecutive_io_error_count: u32,
    /// Whether `line_number` counts from the top of the file. Cursors resumed at
    /// an arbitrary offset do not know their absolute line.
    pub lines_from_start: bool,
}

impl FileCursor {
    /// Cursor at offset 0.
    #[must_use]
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
            byte_position: 0,
            line_number: 0,
            consecutive_io_error_count: 0,
            lines_from_start: true,
        }
    }

    /// Cursor resumed at `byte_position`.
    #[must_use]
    pub fn at(file_path: impl Into<PathBuf>, byte_position: i64) -> Self {
        let byte_position = byte_position.max(0);
        Self {
            file_path: file_path.into(),
            byte_position,
            line_number: 0,
            consecutive_io_error_count: 0,
            lines_from_start: byte_position == 0,
        }
    }

    /// Back to offset 0 after the file shrank.
    pub fn reset(&mut self) {
        self.byte_position = 0;
        self.line_number = 0;
        self.lines_from_start = true;
    }
}

/// Files known or suspected to have new data.
#[derive(Debug, Default)]
pub struct DirtySet {
    paths: HashSet<PathBuf>,
}

impl DirtySet {
    pub fn mark(&mut self, path: &Path) {
        self.paths.insert(path.to_path_buf());
    }

    pub fn remove(&mut self, path: &Path) {
        self.paths.remove(path);
    }

    /// Takes every dirty path, sorted.
    pub fn drain(&mut self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.paths.drain().collect();
        paths.sort();
        paths
    }

    pub fn clear(&mut self) {
        self.paths.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        self.paths.contains(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resumed_cursor_does_not_know_its_line() {
        assert!(FileCursor::new("/a.log").lines_from_start);
        assert!(!FileCursor::at("/a.log", 10).lines_from_start);
        assert!(FileCursor::at("/a.log", -5).lines_from_start);

        let mut cursor = FileCursor::at("/a.log", 10);
        cursor.reset();
        assert_eq!(cursor.byte_position, 0);
        assert!(cursor.lines_from_start);
    }

    #[test]
    fn test_dirty_set_drain_is_sorted_and_clears() {
        let mut dirty = DirtySet::default();
        dirty.mark(Path::new("/b.log"));
        dirty.mark(Path::new("/a.log"));
        dirty.mark(Path::new("/a.log"));
        assert_eq!(dirty.len(), 2);

        let paths = dirty.drain();
        assert_eq!(paths, vec![PathBuf::from("/a.log"), PathBuf::from("/b.log")]);
        assert!(dirty.is_empty());
    }
}
