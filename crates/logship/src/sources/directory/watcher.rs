// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Filesystem notifications for a directory source.
//!
//! The handler never reads files. It only updates cursors for renames and
//! removals and marks paths dirty for the next scan. Events it cannot place
//! are left to the scan tick, which lists the directory every time.

use std::sync::Arc;

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::debug;

use super::state::SourceState;

pub fn watch(state: Arc<SourceState>) -> notify::Result<RecommendedWatcher> {
    let directory = state.options.directory.clone();
    let mut watcher =
        notify::recommended_watcher(move |res: notify::Result<Event>| handle_event(&state, res))?;
    watcher.watch(&directory, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

pub fn handle_event(state: &SourceState, res: notify::Result<Event>) {
    let event = match res {
        Ok(event) => event,
        Err(err) => {
            debug!(source = %state.key, error = %err, "File watcher error");
            return;
        }
    };

    match event.kind {
        EventKind::Access(_) => {}
        EventKind::Create(_)
        | EventKind::Modify(
            ModifyKind::Data(_) | ModifyKind::Metadata(_) | ModifyKind::Any | ModifyKind::Other,
        ) => {
            for path in &event.paths {
                state.mark_dirty(path);
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match event.paths.as_slice() {
            [from, to] => state.handle_rename(from, to),
            paths => {
                for path in paths {
                    state.mark_dirty(path);
                }
            }
        },
        // The paired `Both` event carries the cursor over.
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {}
        EventKind::Modify(ModifyKind::Name(_)) | EventKind::Any | EventKind::Other => {
            for path in &event.paths {
                state.mark_dirty(path);
            }
        }
        EventKind::Remove(_) => {
            for path in &event.paths {
                state.handle_remove(path);
            }
        }
    }
}
