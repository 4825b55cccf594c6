// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Durable read positions.
//!
//! A [`FileBookmarkStore`] keeps one file per registered [`BookmarkSource`].
//! The store never interprets a source's bytes; it only decides when to ask for
//! them and where to put them. Sinks acknowledge delivered records through
//! [`FileBookmarkStore::bookmark_callback`], which feeds a bounded FIFO queue
//! applied back to the owning source.

pub mod callback_queue;
pub mod codec;
pub mod store;

pub use callback_queue::{CallbackQueue, CallbackQueueSender};
pub use store::FileBookmarkStore;

use crate::error::BookmarkError;
use crate::pipeline::RecordBookmark;

/// Extension of every bookmark file.
pub const BOOKMARK_EXTENSION: &str = "bm";

/// A source whose progress the store persists.
pub trait BookmarkSource: Send + Sync {
    /// Stable key, unique within a session.
    fn bookmark_key(&self) -> &str;

    /// Rehydrates state from bytes previously returned by `serialize_bookmarks`.
    fn on_bookmark_loaded(&self, bytes: &[u8]) -> Result<(), BookmarkError>;

    /// Current state. `Ok(None)` removes the bookmark file;
    /// `Err(BookmarkError::NotInitialized)` keeps the previous one.
    fn serialize_bookmarks(&self) -> Result<Option<Vec<u8>>, BookmarkError>;

    /// Applies acknowledged positions, in the order sinks delivered them.
    fn on_bookmark_callback(&self, batch: &[RecordBookmark]) -> Result<(), BookmarkError>;
}

/// File name for `key`: anything outside `[A-Za-z0-9._-]` becomes `_`.
#[must_use]
pub fn bookmark_file_name(key: &str) -> String {
    let sanitized: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{sanitized}.{BOOKMARK_EXTENSION}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bookmark_file_name_is_sanitized() {
        assert_eq!(bookmark_file_name("apache"), "apache.bm");
        assert_eq!(bookmark_file_name("web/iis:1"), "web_iis_1.bm");
    }
}
