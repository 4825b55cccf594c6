// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use tokio::sync::mpsc;

use crate::error::BookmarkError;

/// Bounded FIFO with many producers and a single consumer.
///
/// Producers wait in [`CallbackQueue::enqueue`] while the queue is full, so
/// acknowledgements are never dropped. The consumer side is owned by whoever
/// holds the `CallbackQueue` itself; producers get cheap [`CallbackQueueSender`]
/// clones.
#[derive(Debug)]
pub struct CallbackQueue<T> {
    tx: CallbackQueueSender<T>,
    rx: mpsc::Receiver<T>,
}

/// Producer half of a [`CallbackQueue`].
#[derive(Debug)]
pub struct CallbackQueueSender<T> {
    tx: mpsc::Sender<T>,
}

impl<T> Clone for CallbackQueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> CallbackQueueSender<T> {
    /// Appends `item`, waiting while the queue is at capacity.
    pub async fn enqueue(&self, item: T) -> Result<(), BookmarkError> {
        self.tx.send(item).await.map_err(|_| BookmarkError::Stopped)
    }
}

impl<T> CallbackQueue<T> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx: CallbackQueueSender { tx },
            rx,
        }
    }

    #[must_use]
    pub fn sender(&self) -> CallbackQueueSender<T> {
        self.tx.clone()
    }

    pub async fn enqueue(&self, item: T) -> Result<(), BookmarkError> {
        self.tx.enqueue(item).await
    }

    /// Next item in enqueue order. `None` once closed and drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Next item if one is ready right now.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Stops accepting new items. Items already queued can still be received.
    pub fn close(&mut self) {
        self.rx.close();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl<T> Default for CallbackQueue<T> {
    fn default() -> Self {
        Self::new(crate::CALLBACK_QUEUE_CAPACITY)
    }
}
