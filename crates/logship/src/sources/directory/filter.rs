// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use regex::Regex;

use crate::error::ConfigError;

/// Extensions never tailed when the filter is the catch-all wildcard.
const COMPRESSED_EXTENSIONS: [&str; 3] = ["zip", "gz", "bz2"];

/// `FileNameFilter`: wildcard patterns separated by `|`, e.g. `*.log|*.txt`.
/// Matching is on the file name only and ignores case.
#[derive(Debug, Clone)]
pub struct FileNameFilter {
    source: String,
    patterns: Vec<Regex>,
    catch_all: bool,
}

impl FileNameFilter {
    pub const DEFAULT: &'static str = "*.*";

    pub fn parse(filter: &str) -> Result<Self, ConfigError> {
        let parts: Vec<&str> = filter
            .split('|')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();
        if parts.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "FileNameFilter".to_string(),
                reason: "no file name pattern given".to_string(),
            });
        }

        let catch_all = parts.len() == 1 && matches!(parts[0], "*" | "*.*");
        let patterns = parts
            .iter()
            .map(|p| wildcard_to_regex(p))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            source: filter.to_string(),
            patterns,
            catch_all,
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    #[must_use]
    pub fn matches(&self, file_name: &str) -> bool {
        if self.catch_all {
            let lower = file_name.to_ascii_lowercase();
            return !COMPRESSED_EXTENSIONS
                .iter()
                .any(|ext| lower.rsplit_once('.').is_some_and(|(_, e)| e == *ext));
        }
        self.patterns.iter().any(|re| re.is_match(file_name))
    }
}

impl Default for FileNameFilter {
    fn default() -> Self {
        Self {
            source: Self::DEFAULT.to_string(),
            patterns: Vec::new(),
            catch_all: true,
        }
    }
}

fn wildcard_to_regex(pattern: &str) -> Result<Regex, ConfigError> {
    let mut expr = String::from("(?i)^");
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).map_err(|e| ConfigError::InvalidValue {
        field: "FileNameFilter".to_string(),
        reason: format!("bad pattern '{pattern}': {e}"),
    })
}
