// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Preconditions a source needs before it can run.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A precondition with an availability check. `dispose` releases whatever the
/// check holds on to; it is called once, when the owning source stops.
pub trait Dependency: Send + Sync {
    fn name(&self) -> String;

    fn is_available(&self) -> bool;

    fn dispose(&self) {}
}

/// Satisfied while a directory exists.
#[derive(Debug, Clone)]
pub struct DirectoryDependency {
    path: PathBuf,
}

impl DirectoryDependency {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Dependency for DirectoryDependency {
    fn name(&self) -> String {
        format!("directory {}", self.path.display())
    }

    fn is_available(&self) -> bool {
        self.path.is_dir()
    }
}

/// Polls `dependency` until it is available. Returns `false` if cancelled first.
pub async fn wait_until_available(
    dependency: &dyn Dependency,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> bool {
    let mut logged = false;
    loop {
        if dependency.is_available() {
            return true;
        }
        if !logged {
            debug!("Waiting for {} to become available", dependency.name());
            logged = true;
        }
        tokio::select! {
            () = tokio::time::sleep(poll_interval) => {}
            () = cancel.cancelled() => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_returns_once_directory_appears() {
        let root = tempfile::tempdir().unwrap();
        let target = root.path().join("later");
        let dependency = DirectoryDependency::new(&target);
        assert!(!dependency.is_available());

        let cancel = CancellationToken::new();
        let creator = {
            let target = target.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                std::fs::create_dir(&target).unwrap();
            })
        };

        assert!(wait_until_available(&dependency, Duration::from_millis(10), &cancel).await);
        creator.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_stops_on_cancel() {
        let dependency = DirectoryDependency::new("/definitely/not/here");
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!wait_until_available(&dependency, Duration::from_secs(10), &cancel).await);
    }
}
