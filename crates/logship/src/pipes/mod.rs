// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Built-in pipes.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::session::PluginSection;
use crate::error::{ConfigError, PluginError};
use crate::pipeline::{
    envelope_channel, EnvelopeReceiver, EnvelopeSender, EventSink, EventSource, Pipe, Publisher,
    Subscription,
};
use crate::plugin::{Plugin, PluginContext, PluginRegistry};

pub const REGEX_FILTER_PIPE_TYPE: &str = "RegexFilterPipe";

/// Forwards envelopes whose text matches `FilterPattern`, or the ones that do
/// not when `Negate` is set.
///
/// Dropped envelopes are never acknowledged. With `BookmarkOnBufferFlush`
/// their positions are covered by the next forwarded record of the same file.
pub struct RegexFilterPipe {
    id: String,
    pattern: Regex,
    negate: bool,
    input: EnvelopeSender,
    idle: Mutex<Option<EnvelopeReceiver>>,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    publisher: Publisher,
}

impl std::fmt::Debug for RegexFilterPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegexFilterPipe")
            .field("id", &self.id)
            .field("pattern", &self.pattern.as_str())
            .field("negate", &self.negate)
            .finish_non_exhaustive()
    }
}

impl RegexFilterPipe {
    #[must_use]
    pub fn new(id: impl Into<String>, pattern: Regex, negate: bool) -> Self {
        let (input, rx) = envelope_channel();
        Self {
            id: id.into(),
            pattern,
            negate,
            input,
            idle: Mutex::new(Some(rx)),
            running: Mutex::new(None),
            publisher: Publisher::new(),
        }
    }

    pub fn from_section(section: &PluginSection, _context: &PluginContext) -> Result<Self, ConfigError> {
        let raw = section.require_str("FilterPattern")?;
        let pattern = Regex::new(&raw).map_err(|e| ConfigError::InvalidValue {
            field: "FilterPattern".to_string(),
            reason: e.to_string(),
        })?;
        let negate = section.get_bool("Negate")?.unwrap_or(false);
        Ok(Self::new(section.id(), pattern, negate))
    }

    #[must_use]
    pub fn accepts(&self, text: &str) -> bool {
        self.pattern.is_match(text) != self.negate
    }
}

#[async_trait]
impl Plugin for RegexFilterPipe {
    fn id(&self) -> &str {
        &self.id
    }

    async fn start(&self) -> Result<(), PluginError> {
        let Some(mut rx) = self.idle.lock().await.take() else {
            return Ok(());
        };
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let pattern = self.pattern.clone();
        let negate = self.negate;
        let publisher = self.publisher.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    received = rx.recv() => match received {
                        Some(envelope) => {
                            if pattern.is_match(envelope.raw_text()) != negate {
                                publisher.publish(envelope).await;
                            }
                        }
                        None => break,
                    },
                }
            }
            rx.close();
            while let Ok(envelope) = rx.try_recv() {
                if pattern.is_match(envelope.raw_text()) != negate {
                    publisher.publish(envelope).await;
                }
            }
        });
        *self.running.lock().await = Some((cancel, handle));
        info!(pipe = %self.id, pattern = %self.pattern.as_str(), negate = self.negate, "Pipe started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), PluginError> {
        let Some((cancel, handle)) = self.running.lock().await.take() else {
            return Ok(());
        };
        cancel.cancel();
        handle.await.map_err(|e| PluginError::Stop {
            id: self.id.clone(),
            reason: e.to_string(),
        })
    }
}

impl EventSource for RegexFilterPipe {
    fn subscribe(&self, consumer: EnvelopeSender) -> Subscription {
        self.publisher.subscribe(consumer)
    }
}

impl EventSink for RegexFilterPipe {
    fn input(&self) -> EnvelopeSender {
        self.input.clone()
    }
}

pub fn register(registry: &mut PluginRegistry) {
    registry.register_pipe(REGEX_FILTER_PIPE_TYPE, |section, context| {
        Ok(Arc::new(RegexFilterPipe::from_section(section, context)?) as Arc<dyn Pipe>)
    });
}
