// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use super::{Envelope, EnvelopeSender};

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    senders: Vec<(u64, EnvelopeSender)>,
}

/// Fan-out of envelopes to every subscribed channel.
#[derive(Clone, Default, Debug)]
pub struct Publisher {
    inner: Arc<Mutex<Subscribers>>,
}

impl Publisher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, consumer: EnvelopeSender) -> Subscription {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let id = inner.next_id;
        inner.next_id += 1;
        inner.senders.push((id, consumer));
        Subscription {
            id,
            subscribers: Arc::downgrade(&self.inner),
        }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.snapshot().len()
    }

    fn snapshot(&self) -> Vec<(u64, EnvelopeSender)> {
        match self.inner.lock() {
            Ok(guard) => guard.senders.clone(),
            Err(poisoned) => poisoned.into_inner().senders.clone(),
        }
    }

    fn prune(&self, closed: &[u64]) {
        if closed.is_empty() {
            return;
        }
        debug!("Dropping {} closed subscriber(s)", closed.len());
        remove(&self.inner, closed);
    }

    /// Delivers `envelope` to every live subscriber, waiting on full channels.
    /// Returns how many subscribers received it.
    pub async fn publish(&self, envelope: Arc<Envelope>) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, sender) in self.snapshot() {
            if sender.send(Arc::clone(&envelope)).await.is_ok() {
                delivered += 1;
            } else {
                closed.push(id);
            }
        }
        self.prune(&closed);
        delivered
    }

    /// Blocking variant of [`Publisher::publish`] for code running on a
    /// blocking thread. Must not be called from within an async context.
    pub fn blocking_publish(&self, envelope: Arc<Envelope>) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, sender) in self.snapshot() {
            if sender.blocking_send(Arc::clone(&envelope)).is_ok() {
                delivered += 1;
            } else {
                closed.push(id);
            }
        }
        self.prune(&closed);
        delivered
    }
}

fn remove(subscribers: &Mutex<Subscribers>, ids: &[u64]) {
    let mut inner = match subscribers.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    inner.senders.retain(|(id, _)| !ids.contains(id));
}

/// Handle returned by [`Publisher::subscribe`]. Dropping it keeps the
/// subscription alive; call [`Subscription::unsubscribe`] to end it.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    subscribers: Weak<Mutex<Subscribers>>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            remove(&subscribers, &[self.id]);
        }
    }
}

impl std::fmt::Debug for Subscribers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscribers")
            .field("count", &self.senders.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tokio::sync::mpsc;

    fn envelope(text: &str) -> Arc<Envelope> {
        Arc::new(Envelope::new(Utc::now(), text))
    }

    #[tokio::test]
    async fn test_publish_fans_out_to_all_subscribers() {
        let publisher = Publisher::new();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        let _s1 = publisher.subscribe(tx1);
        let _s2 = publisher.subscribe(tx2);

        assert_eq!(publisher.publish(envelope("hello")).await, 2);
        assert_eq!(rx1.recv().await.unwrap().raw_text(), "hello");
        assert_eq!(rx2.recv().await.unwrap().raw_text(), "hello");
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let publisher = Publisher::new();
        let (tx, mut rx) = mpsc::channel(4);
        let subscription = publisher.subscribe(tx);
        subscription.unsubscribe();

        assert_eq!(publisher.publish(envelope("dropped")).await, 0);
        assert_eq!(publisher.subscriber_count(), 0);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_closed_receivers_are_pruned() {
        let publisher = Publisher::new();
        let (tx, rx) = mpsc::channel(4);
        let _subscription = publisher.subscribe(tx);
        drop(rx);

        assert_eq!(publisher.publish(envelope("nobody")).await, 0);
        assert_eq!(publisher.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_blocking_publish_waits_for_capacity() {
        let publisher = Publisher::new();
        let (tx, mut rx) = mpsc::channel(1);
        let _subscription = publisher.subscribe(tx);

        let producer = {
            let publisher = publisher.clone();
            tokio::task::spawn_blocking(move || {
                publisher.blocking_publish(envelope("one"));
                publisher.blocking_publish(envelope("two"))
            })
        };

        assert_eq!(rx.recv().await.unwrap().raw_text(), "one");
        assert_eq!(rx.recv().await.unwrap().raw_text(), "two");
        assert_eq!(producer.await.unwrap(), 1);
    }
}
