// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Durable key/value strings that survive restarts, such as the mapping from
//! session config files to session ids.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

pub trait ParameterStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str) -> io::Result<()>;
}

/// Parameter store backed by a single JSON object file. Every `set` rewrites
/// the file through a temporary file and a rename.
#[derive(Debug)]
pub struct FileParameterStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl FileParameterStore {
    /// Opens the store at `path`. A missing file is an empty store; an
    /// unreadable one is logged and also treated as empty.
    #[must_use]
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<BTreeMap<String, String>>(&bytes) {
                Ok(values) => values,
                Err(e) => {
                    warn!(path = %path.display(), "Ignoring unreadable parameter store: {e}");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                warn!(path = %path.display(), "Failed to read parameter store: {e}");
                BTreeMap::new()
            }
        };
        debug!(path = %path.display(), entries = values.len(), "Parameter store opened");
        Self {
            path,
            values: Mutex::new(values),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, values: &BTreeMap<String, String>) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let bytes = serde_json::to_vec_pretty(values).map_err(io::Error::other)?;
        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)
    }
}

impl ParameterStore for FileParameterStore {
    fn get(&self, key: &str) -> Option<String> {
        match self.values.lock() {
            Ok(values) => values.get(key).cloned(),
            Err(poisoned) => poisoned.into_inner().get(key).cloned(),
        }
    }

    fn set(&self, key: &str, value: &str) -> io::Result<()> {
        let mut values = match self.values.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if values.get(key).map(String::as_str) == Some(value) {
            return Ok(());
        }
        values.insert(key.to_string(), value.to_string());
        self.persist(&values)
    }
}

/// Non-durable store for tests and ad-hoc sessions.
#[derive(Debug, Default)]
pub struct MemoryParameterStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl ParameterStore for MemoryParameterStore {
    fn get(&self, key: &str) -> Option<String> {
        match self.values.lock() {
            Ok(values) => values.get(key).cloned(),
            Err(poisoned) => poisoned.into_inner().get(key).cloned(),
        }
    }

    fn set(&self, key: &str, value: &str) -> io::Result<()> {
        match self.values.lock() {
            Ok(mut values) => values.insert(key.to_string(), value.to_string()),
            Err(poisoned) => poisoned
                .into_inner()
                .insert(key.to_string(), value.to_string()),
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("parameters.json");

        let store = FileParameterStore::open(&path);
        assert_eq!(store.get("session_id:/etc/a.json"), None);
        store.set("session_id:/etc/a.json", "3").unwrap();

        let reopened = FileParameterStore::open(&path);
        assert_eq!(reopened.get("session_id:/etc/a.json").as_deref(), Some("3"));
    }

    #[test]
    fn test_corrupt_file_opens_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parameters.json");
        std::fs::write(&path, "not json").unwrap();

        let store = FileParameterStore::open(&path);
        assert_eq!(store.get("anything"), None);
        store.set("k", "v").unwrap();
        assert_eq!(FileParameterStore::open(&path).get("k").as_deref(), Some("v"));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryParameterStore::default();
        store.set("a", "1").unwrap();
        assert_eq!(store.get("a").as_deref(), Some("1"));
    }
}
