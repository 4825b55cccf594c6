// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};

use super::filter::FileNameFilter;
use crate::config::session::PluginSection;
use crate::error::ConfigError;
use crate::sources::parser::{TimeZoneKind, TimestampExtractor};

pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_IO_ERRORS: u32 = 3;

/// Where reading starts for files present when the source starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitialPosition {
    BeginningOfStream,
    #[default]
    EndOfStream,
    /// Resume from the saved bookmark; without one, behaves like `EndOfStream`.
    Bookmark,
    /// Read everything, but only emit records at or after the configured time.
    Timestamp,
}

impl FromStr for InitialPosition {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "bos" | "beginningofstream" => Ok(InitialPosition::BeginningOfStream),
            "eos" | "endofstream" => Ok(InitialPosition::EndOfStream),
            "bookmark" => Ok(InitialPosition::Bookmark),
            "timestamp" => Ok(InitialPosition::Timestamp),
            other => Err(ConfigError::InvalidValue {
                field: "InitialPosition".to_string(),
                reason: format!(
                    "expected one of BOS, EOS, Bookmark, Timestamp, got '{other}'"
                ),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DirectorySourceOptions {
    pub directory: PathBuf,
    pub filter: FileNameFilter,
    pub interval: Duration,
    pub initial_position: InitialPosition,
    pub initial_position_timestamp: Option<DateTime<Utc>>,
    pub skip_lines: i64,
    pub time_zone: TimeZoneKind,
    pub timestamp_format: Option<String>,
    pub bookmark_on_buffer_flush: bool,
    pub max_io_errors: u32,
}

impl DirectorySourceOptions {
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            filter: FileNameFilter::default(),
            interval: DEFAULT_SCAN_INTERVAL,
            initial_position: InitialPosition::default(),
            initial_position_timestamp: None,
            skip_lines: 0,
            time_zone: TimeZoneKind::default(),
            timestamp_format: None,
            bookmark_on_buffer_flush: false,
            max_io_errors: DEFAULT_MAX_IO_ERRORS,
        }
    }

    pub fn from_section(section: &PluginSection) -> Result<Self, ConfigError> {
        let mut options = Self::new(section.require_str("Directory")?);

        if let Some(filter) = section.get_str("FileNameFilter") {
            options.filter = FileNameFilter::parse(&filter)?;
        }
        if let Some(interval) = section.get_duration("Interval")? {
            if !interval.is_zero() {
                options.interval = interval;
            }
        }
        if let Some(position) = section.get_str("InitialPosition") {
            options.initial_position = position.parse()?;
        }
        if let Some(zone) = section.get_str("TimeZoneKind") {
            options.time_zone = zone.parse()?;
        }
        if let Some(skip) = section.get_u64("SkipLines")? {
            options.skip_lines = i64::try_from(skip).unwrap_or(i64::MAX);
        }
        options.timestamp_format = section.get_str("TimestampFormat");
        if let Some(flag) = section.get_bool("BookmarkOnBufferFlush")? {
            options.bookmark_on_buffer_flush = flag;
        }
        if let Some(max) = section.get_u64("MaxIoErrors")? {
            options.max_io_errors = u32::try_from(max).unwrap_or(u32::MAX).max(1);
        }

        if let Some(raw) = section.get_str("InitialPositionTimestamp") {
            options.initial_position_timestamp = Some(parse_timestamp(&raw, options.time_zone)?);
        }
        if options.initial_position == InitialPosition::Timestamp
            && options.initial_position_timestamp.is_none()
        {
            return Err(ConfigError::MissingField {
                section: section.label().to_string(),
                field: "InitialPositionTimestamp".to_string(),
            });
        }

        Ok(options)
    }

    #[must_use]
    pub fn timestamp_extractor(&self) -> Option<TimestampExtractor> {
        self.timestamp_format
            .as_ref()
            .map(|format| TimestampExtractor::new(format.clone(), self.time_zone))
    }
}

/// RFC 3339, or `YYYY-MM-DD HH:MM:SS` (also with a `T`) read in `time_zone`.
fn parse_timestamp(raw: &str, time_zone: TimeZoneKind) -> Result<DateTime<Utc>, ConfigError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .and_then(|naive| time_zone.to_utc(&naive))
        .ok_or_else(|| ConfigError::InvalidValue {
            field: "InitialPositionTimestamp".to_string(),
            reason: format!("unrecognised timestamp '{raw}'"),
        })
}
