// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use chrono::{DateTime, Utc};

/// Position of one record within a source's stream, acknowledged back to the
/// source once a sink has durably delivered the record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordBookmark {
    pub source_key: String,
    /// File path for directory sources.
    pub stream_id: String,
    /// End offset of the record, or [`RecordBookmark::RESET_POSITION`].
    pub position: i64,
}

impl RecordBookmark {
    /// Explicit reset: the stream restarted from zero.
    pub const RESET_POSITION: i64 = -1;

    #[must_use]
    pub fn new(source_key: impl Into<String>, stream_id: impl Into<String>, position: i64) -> Self {
        Self {
            source_key: source_key.into(),
            stream_id: stream_id.into(),
            position,
        }
    }

    #[must_use]
    pub fn is_reset(&self) -> bool {
        self.position == Self::RESET_POSITION
    }
}

/// A parsed record with its metadata. Built once, then shared read-only.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    timestamp: DateTime<Utc>,
    raw_text: String,
    bookmark: Option<RecordBookmark>,
    line_number: i64,
    position: i64,
}

impl Envelope {
    #[must_use]
    pub fn new(timestamp: DateTime<Utc>, raw_text: impl Into<String>) -> Self {
        Self {
            timestamp,
            raw_text: raw_text.into(),
            bookmark: None,
            line_number: 0,
            position: 0,
        }
    }

    #[must_use]
    pub fn with_bookmark(mut self, bookmark: RecordBookmark) -> Self {
        self.bookmark = Some(bookmark);
        self
    }

    #[must_use]
    pub fn with_location(mut self, line_number: i64, position: i64) -> Self {
        self.line_number = line_number;
        self.position = position;
        self
    }

    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    #[must_use]
    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }

    #[must_use]
    pub fn bookmark(&self) -> Option<&RecordBookmark> {
        self.bookmark.as_ref()
    }

    #[must_use]
    pub fn line_number(&self) -> i64 {
        self.line_number
    }

    #[must_use]
    pub fn position(&self) -> i64 {
        self.position
    }
}

/// Collects the bookmarks carried by `envelopes`, grouped by source key in
/// first-seen order. Order within each group follows the input.
#[must_use]
pub fn group_bookmarks(envelopes: &[Arc<Envelope>]) -> Vec<(String, Vec<RecordBookmark>)> {
    let mut groups: Vec<(String, Vec<RecordBookmark>)> = Vec::new();
    for bookmark in envelopes.iter().filter_map(|e| e.bookmark()) {
        match groups.iter_mut().find(|(key, _)| *key == bookmark.source_key) {
            Some((_, batch)) => batch.push(bookmark.clone()),
            None => groups.push((bookmark.source_key.clone(), vec![bookmark.clone()])),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(text: &str, bookmark: Option<RecordBookmark>) -> Arc<Envelope> {
        let mut e = Envelope::new(Utc::now(), text);
        if let Some(b) = bookmark {
            e = e.with_bookmark(b);
        }
        Arc::new(e)
    }

    #[test]
    fn test_group_bookmarks_preserves_order() {
        let batch = vec![
            envelope("a1", Some(RecordBookmark::new("a", "/x.log", 10))),
            envelope("b1", Some(RecordBookmark::new("b", "/y.log", 5))),
            envelope("plain", None),
            envelope("a2", Some(RecordBookmark::new("a", "/x.log", 20))),
        ];

        let groups = group_bookmarks(&batch);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "a");
        assert_eq!(
            groups[0].1.iter().map(|b| b.position).collect::<Vec<_>>(),
            vec![10, 20]
        );
        assert_eq!(groups[1].0, "b");
    }

    #[test]
    fn test_reset_sentinel() {
        assert!(RecordBookmark::new("a", "/x.log", -1).is_reset());
        assert!(!RecordBookmark::new("a", "/x.log", 0).is_reset());
    }
}
