// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `<file_path>,<byte_position>` lines, one per tracked file.
//!
//! Paths may themselves contain commas, so the position is whatever follows the
//! last comma on the line.

use crate::error::BookmarkError;

pub fn encode<'a, I>(positions: I) -> Vec<u8>
where
    I: IntoIterator<Item = (&'a str, i64)>,
{
    let mut out = String::new();
    for (path, position) in positions {
        out.push_str(path);
        out.push(',');
        out.push_str(&position.to_string());
        out.push('\n');
    }
    out.into_bytes()
}

pub fn decode(bytes: &[u8]) -> Result<Vec<(String, i64)>, BookmarkError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| BookmarkError::Corrupt(format!("not valid UTF-8: {e}")))?;

    let mut positions = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let (path, position) = line.rsplit_once(',').ok_or_else(|| {
            BookmarkError::Corrupt(format!("line {}: missing position separator", index + 1))
        })?;
        if path.is_empty() {
            return Err(BookmarkError::Corrupt(format!(
                "line {}: empty file path",
                index + 1
            )));
        }
        let position = position.trim().parse::<i64>().map_err(|e| {
            BookmarkError::Corrupt(format!("line {}: bad position: {e}", index + 1))
        })?;
        positions.push((path.to_string(), position));
    }
    Ok(positions)
}
