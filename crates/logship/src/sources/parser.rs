// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Record parsers used by file sources.
//!
//! A parser receives a reader over the whole file and a [`LogContext`] holding
//! the position to resume from. It seeks on its own, since some formats need to
//! read a header before jumping to the position, and yields records lazily.

use std::io::{self, BufRead, Seek, SeekFrom};
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};

use crate::error::ConfigError;

/// Readers a parser can consume.
pub trait ReadSeek: BufRead + Seek {}

impl<T: BufRead + Seek> ReadSeek for T {}

/// Where a parse resumes. The parser advances `position` and `line_number`
/// past every record it yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogContext {
    pub file_path: PathBuf,
    pub position: i64,
    pub line_number: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub text: String,
    pub timestamp: Option<DateTime<Utc>>,
    /// Line number of this record, counted from the resume point's line number.
    pub line_number: i64,
    /// Byte offset just past this record.
    pub position: i64,
}

pub trait RecordParser: Send + Sync {
    fn parse_records<'a>(
        &'a self,
        reader: &'a mut dyn ReadSeek,
        context: &'a mut LogContext,
    ) -> Box<dyn Iterator<Item = io::Result<LogRecord>> + 'a>;
}

/// How naive timestamps in log lines are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeZoneKind {
    #[default]
    Utc,
    Local,
}

impl TimeZoneKind {
    #[must_use]
    pub fn to_utc(&self, naive: &NaiveDateTime) -> Option<DateTime<Utc>> {
        match self {
            TimeZoneKind::Utc => Some(Utc.from_utc_datetime(naive)),
            TimeZoneKind::Local => Local
                .from_local_datetime(naive)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

impl FromStr for TimeZoneKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "utc" => Ok(TimeZoneKind::Utc),
            "local" => Ok(TimeZoneKind::Local),
            other => Err(ConfigError::InvalidValue {
                field: "TimeZoneKind".to_string(),
                reason: format!("expected 'UTC' or 'Local', got '{other}'"),
            }),
        }
    }
}

/// Leading timestamp in a line, in a chrono `strftime` format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampExtractor {
    format: String,
    time_zone: TimeZoneKind,
}

impl TimestampExtractor {
    #[must_use]
    pub fn new(format: impl Into<String>, time_zone: TimeZoneKind) -> Self {
        Self {
            format: format.into(),
            time_zone,
        }
    }

    /// Parses the timestamp at the start of `line`. Trailing text is allowed.
    #[must_use]
    pub fn extract(&self, line: &str) -> Option<DateTime<Utc>> {
        let (naive, _) = NaiveDateTime::parse_and_remainder(line.trim_start(), &self.format).ok()?;
        self.time_zone.to_utc(&naive)
    }
}

/// One record per `\n`-terminated line. A trailing partial line is left for
/// the next read.
#[derive(Debug, Clone, Default)]
pub struct SingleLineParser {
    timestamp: Option<TimestampExtractor>,
}

impl SingleLineParser {
    #[must_use]
    pub fn new(timestamp: Option<TimestampExtractor>) -> Self {
        Self { timestamp }
    }
}

impl RecordParser for SingleLineParser {
    fn parse_records<'a>(
        &'a self,
        reader: &'a mut dyn ReadSeek,
        context: &'a mut LogContext,
    ) -> Box<dyn Iterator<Item = io::Result<LogRecord>> + 'a> {
        Box::new(Lines {
            parser: self,
            reader,
            context,
            seeked: false,
            done: false,
            buf: Vec::new(),
        })
    }
}

struct Lines<'a> {
    parser: &'a SingleLineParser,
    reader: &'a mut dyn ReadSeek,
    context: &'a mut LogContext,
    seeked: bool,
    done: bool,
    buf: Vec<u8>,
}

impl Lines<'_> {
    fn next_record(&mut self) -> io::Result<Option<LogRecord>> {
        if !self.seeked {
            let start = u64::try_from(self.context.position).unwrap_or(0);
            self.reader.seek(SeekFrom::Start(start))?;
            self.seeked = true;
        }

        self.buf.clear();
        let read = self.reader.read_until(b'\n', &mut self.buf)?;
        if read == 0 || self.buf.last() != Some(&b'\n') {
            return Ok(None);
        }

        let mut end = self.buf.len() - 1;
        if end > 0 && self.buf[end - 1] == b'\r' {
            end -= 1;
        }
        let text = String::from_utf8_lossy(&self.buf[..end]).into_owned();

        self.context.position += i64::try_from(read).unwrap_or(i64::MAX);
        self.context.line_number += 1;

        let timestamp = self
            .parser
            .timestamp
            .as_ref()
            .and_then(|extractor| extractor.extract(&text));
        Ok(Some(LogRecord {
            text,
            timestamp,
            line_number: self.context.line_number,
            position: self.context.position,
        }))
    }
}

impl Iterator for Lines<'_> {
    type Item = io::Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn context(position: i64) -> LogContext {
        LogContext {
            file_path: PathBuf::from("/var/log/a.log"),
            position,
            line_number: 0,
        }
    }

    #[test]
    fn test_reads_complete_lines_from_position() {
        let mut reader = Cursor::new(b"skip\nfirst\r\nsecond\npartial".to_vec());
        let mut ctx = context(5);
        let parser = SingleLineParser::default();

        let records: Vec<LogRecord> = parser
            .parse_records(&mut reader, &mut ctx)
            .collect::<io::Result<_>>()
            .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].text, "first");
        assert_eq!(records[0].position, 12);
        assert_eq!(records[0].line_number, 1);
        assert_eq!(records[1].text, "second");
        assert_eq!(records[1].position, 19);
        assert_eq!(ctx.position, 19);
        assert_eq!(ctx.line_number, 2);
    }

    #[test]
    fn test_extracts_leading_timestamp() {
        let mut reader = Cursor::new(b"2024-03-01 10:15:00 GET /index.html\nno timestamp\n".to_vec());
        let mut ctx = context(0);
        let parser = SingleLineParser::new(Some(TimestampExtractor::new(
            "%Y-%m-%d %H:%M:%S",
            TimeZoneKind::Utc,
        )));

        let records: Vec<LogRecord> = parser
            .parse_records(&mut reader, &mut ctx)
            .collect::<io::Result<_>>()
            .unwrap();

        assert_eq!(
            records[0].timestamp,
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 0).unwrap())
        );
        assert_eq!(records[1].timestamp, None);
    }

    #[test]
    fn test_time_zone_kind_parse() {
        assert_eq!("utc".parse::<TimeZoneKind>().unwrap(), TimeZoneKind::Utc);
        assert_eq!("Local".parse::<TimeZoneKind>().unwrap(), TimeZoneKind::Local);
        assert!("Mars".parse::<TimeZoneKind>().is_err());
    }
}
