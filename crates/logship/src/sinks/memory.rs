// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{BatchWriter, BufferOptions, BufferedSink};
use crate::config::session::PluginSection;
use crate::error::{ConfigError, PluginError};
use crate::pipeline::{Envelope, EnvelopeSender, EventSink};
use crate::plugin::{Plugin, PluginContext};

pub const MEMORY_SINK_TYPE: &str = "Memory";

type Records = Arc<Mutex<Vec<Arc<Envelope>>>>;

#[derive(Debug, Default)]
pub struct MemoryWriter {
    records: Records,
}

impl BatchWriter for MemoryWriter {
    fn write_batch(&mut self, batch: &[Arc<Envelope>]) -> io::Result<()> {
        let mut records = match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        records.extend(batch.iter().cloned());
        Ok(())
    }
}

/// Keeps every delivered envelope in memory and acknowledges it like a
/// durable sink would.
#[derive(Debug)]
pub struct MemorySink {
    inner: BufferedSink<MemoryWriter>,
    records: Records,
}

impl MemorySink {
    #[must_use]
    pub fn new(id: impl Into<String>, options: BufferOptions, context: &PluginContext) -> Self {
        let records = Records::default();
        let writer = MemoryWriter {
            records: Arc::clone(&records),
        };
        Self {
            inner: BufferedSink::new(id, writer, options, context),
            records,
        }
    }

    pub fn from_section(section: &PluginSection, context: &PluginContext) -> Result<Self, ConfigError> {
        Ok(Self::new(
            section.id(),
            BufferOptions::from_section(section)?,
            context,
        ))
    }

    #[must_use]
    pub fn records(&self) -> Vec<Arc<Envelope>> {
        match self.records.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    #[must_use]
    pub fn texts(&self) -> Vec<String> {
        self.records()
            .iter()
            .map(|e| e.raw_text().to_string())
            .collect()
    }
}

#[async_trait]
impl Plugin for MemorySink {
    fn id(&self) -> &str {
        self.inner.id()
    }

    async fn start(&self) -> Result<(), PluginError> {
        self.inner.start().await
    }

    async fn stop(&self) -> Result<(), PluginError> {
        self.inner.stop().await
    }
}

impl EventSink for MemorySink {
    fn input(&self) -> EnvelopeSender {
        self.inner.input()
    }
}
