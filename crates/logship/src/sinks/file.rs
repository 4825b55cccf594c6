// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use super::{BatchWriter, BufferOptions, BufferedSink};
use crate::config::session::PluginSection;
use crate::error::ConfigError;
use crate::pipeline::Envelope;
use crate::plugin::PluginContext;

pub const FILE_SINK_TYPE: &str = "File";

/// Appends one line per record to `path`. The file is opened lazily and
/// reopened after a failed write.
#[derive(Debug)]
pub struct FileWriter {
    path: PathBuf,
    file: Option<File>,
}

impl FileWriter {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&mut self) -> io::Result<&mut File> {
        match self.file {
            Some(ref mut file) => Ok(file),
            None => {
                if let Some(parent) = self.path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)?;
                debug!(path = %self.path.display(), "Opened sink file");
                Ok(self.file.insert(file))
            }
        }
    }

    fn append(&mut self, batch: &[Arc<Envelope>]) -> io::Result<()> {
        let file = self.open()?;
        let mut out = BufWriter::new(&*file);
        for envelope in batch {
            out.write_all(envelope.raw_text().as_bytes())?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
        drop(out);
        file.sync_data()
    }
}

impl BatchWriter for FileWriter {
    fn write_batch(&mut self, batch: &[Arc<Envelope>]) -> io::Result<()> {
        let result = self.append(batch);
        if result.is_err() {
            self.file = None;
        }
        result
    }
}

pub type FileSink = BufferedSink<FileWriter>;

impl FileSink {
    pub fn from_section(section: &PluginSection, context: &PluginContext) -> Result<Self, ConfigError> {
        let path = section.require_str("FilePath")?;
        Ok(Self::new(
            section.id(),
            FileWriter::new(path),
            BufferOptions::from_section(section)?,
            context,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::EventSink;
    use crate::plugin::Plugin;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn test_appends_lines_and_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.log");
        let mut writer = FileWriter::new(&path);

        let batch: Vec<Arc<Envelope>> = ["a", "b"]
            .iter()
            .map(|text| Arc::new(Envelope::new(Utc::now(), *text)))
            .collect();
        writer.write_batch(&batch).unwrap();
        writer.write_batch(&batch[..1]).unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a\nb\na\n");
    }

    #[test]
    fn test_write_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = FileWriter::new(dir.path());
        let batch = vec![Arc::new(Envelope::new(Utc::now(), "x"))];
        assert!(writer.write_batch(&batch).is_err());
    }

    #[test]
    fn test_from_section_requires_file_path() {
        let dir = tempfile::tempdir().unwrap();
        let context = PluginContext::standalone("default", dir.path());
        let section = PluginSection::from_value("Sinks[0]", json!({ "Id": "out" })).unwrap();
        assert!(matches!(
            FileSink::from_section(&section, &context),
            Err(ConfigError::MissingField { .. })
        ));
    }

    #[tokio::test]
    async fn test_stop_flushes_buffered_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let context = PluginContext::standalone("default", dir.path());
        let section = PluginSection::from_value(
            "Sinks[0]",
            json!({ "Id": "out", "FilePath": path.to_string_lossy(), "FlushInterval": 60 }),
        )
        .unwrap();
        let sink = FileSink::from_section(&section, &context).unwrap();
        sink.start().await.unwrap();
        sink.input()
            .send(Arc::new(Envelope::new(Utc::now(), "buffered")))
            .await
            .unwrap();
        sink.stop().await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "buffered\n");
    }
}
