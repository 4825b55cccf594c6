// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io::{self, Write};
use std::sync::Arc;

use super::{BatchWriter, BufferOptions, BufferedSink};
use crate::config::session::PluginSection;
use crate::error::ConfigError;
use crate::pipeline::Envelope;
use crate::plugin::PluginContext;

pub const CONSOLE_SINK_TYPE: &str = "Console";

/// Writes each record's raw text to stdout.
#[derive(Debug, Default)]
pub struct ConsoleWriter;

impl BatchWriter for ConsoleWriter {
    fn write_batch(&mut self, batch: &[Arc<Envelope>]) -> io::Result<()> {
        let mut out = io::stdout().lock();
        for envelope in batch {
            writeln!(out, "{}", envelope.raw_text())?;
        }
        out.flush()
    }
}

pub type ConsoleSink = BufferedSink<ConsoleWriter>;

impl ConsoleSink {
    pub fn from_section(section: &PluginSection, context: &PluginContext) -> Result<Self, ConfigError> {
        Ok(Self::new(
            section.id(),
            ConsoleWriter,
            BufferOptions::from_section(section)?,
            context,
        ))
    }
}
