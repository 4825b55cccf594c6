// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Periodic execution that plugins embed instead of inheriting a timer base.

use std::future::Future;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Runs an async tick on a fixed interval until stopped.
///
/// The first tick fires one full interval after [`PeriodicTask::start`]. When
/// `final_tick` is set, one more tick runs after cancellation so the owner can
/// leave its state consistent.
#[derive(Debug)]
pub struct PeriodicTask {
    name: String,
    interval: Duration,
    final_tick: bool,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicTask {
    #[must_use]
    pub fn new(name: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            interval: interval.max(Duration::from_millis(1)),
            final_tick: false,
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_final_tick(mut self) -> Self {
        self.final_tick = true;
        self
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Spawns the loop. Has no effect if it is already running.
    pub async fn start<F, Fut>(&self, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            debug!(task = %self.name, "Periodic task already running");
            return;
        }

        let period = self.interval;
        let final_tick = self.final_tick;
        let cancel = self.cancel.clone();
        let name = self.name.clone();
        *handle = Some(tokio::spawn(async move {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => tick().await,
                    () = cancel.cancelled() => {
                        if final_tick {
                            tick().await;
                        }
                        debug!(task = %name, "Periodic task stopped");
                        break;
                    }
                }
            }
        }));
    }

    /// Cancels the loop and waits up to `timeout` for it to finish.
    /// Returns `false` if the loop had to be abandoned.
    pub async fn stop(&self, timeout: Duration) -> bool {
        self.cancel.cancel();
        let Some(handle) = self.handle.lock().await.take() else {
            return true;
        };
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(task = %self.name, "Periodic task failed: {e}");
                true
            }
            Err(_) => {
                warn!(task = %self.name, "Periodic task did not stop within {timeout:?}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_ticks_until_stopped() {
        let count = Arc::new(AtomicUsize::new(0));
        let task = PeriodicTask::new("counter", Duration::from_millis(10));
        let ticks = Arc::clone(&count);
        task.start(move || {
            let ticks = Arc::clone(&ticks);
            async move {
                ticks.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(task.stop(Duration::from_secs(1)).await);

        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected several ticks, got {seen}");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_final_tick_runs_on_stop() {
        let count = Arc::new(AtomicUsize::new(0));
        let task = PeriodicTask::new("final", Duration::from_secs(3600)).with_final_tick();
        let ticks = Arc::clone(&count);
        task.start(move || {
            let ticks = Arc::clone(&ticks);
            async move {
                ticks.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await;

        assert!(task.stop(Duration::from_secs(1)).await);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let task = PeriodicTask::new("idle", Duration::from_secs(1));
        assert!(task.stop(Duration::from_millis(10)).await);
    }
}
