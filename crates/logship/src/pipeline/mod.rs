// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Envelopes and the push-based source → pipe → sink contract.
//!
//! Sources and pipes own a [`Publisher`]. Consumers subscribe by handing over the
//! sending half of a bounded channel and get back a [`Subscription`] they can
//! later cancel. Delivery waits when a consumer's channel is full, so a slow sink
//! slows its source down instead of growing memory.
//!
//! ```text
//!   Source ──publish──> [bounded mpsc] ──> Pipe ──publish──> [bounded mpsc] ──> Sink
//! ```

mod envelope;
mod publisher;

pub use envelope::{group_bookmarks, Envelope, RecordBookmark};
pub use publisher::{Publisher, Subscription};

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::plugin::Plugin;

/// Capacity of every envelope channel between stages.
pub const ENVELOPE_CHANNEL_CAPACITY: usize = 1000;

pub type EnvelopeSender = mpsc::Sender<Arc<Envelope>>;
pub type EnvelopeReceiver = mpsc::Receiver<Arc<Envelope>>;

/// Creates a bounded envelope channel with the default capacity.
#[must_use]
pub fn envelope_channel() -> (EnvelopeSender, EnvelopeReceiver) {
    mpsc::channel(ENVELOPE_CHANNEL_CAPACITY)
}

/// Producer stage.
pub trait EventSource: Plugin {
    fn subscribe(&self, consumer: EnvelopeSender) -> Subscription;
}

/// Consumer stage. `input` is the channel the sink drains once started.
pub trait EventSink: Plugin {
    fn input(&self) -> EnvelopeSender;
}

/// Transform stage: consumes like a sink and republishes like a source.
pub trait Pipe: EventSource + EventSink {}

impl<T: EventSource + EventSink> Pipe for T {}
