//! JSON-file-backed storage adapter used by the CLI.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

use super::{QuotaEstimate, StorageAdapter};

/// Stores all keys in a single JSON object on disk.
///
/// Values are loaded once at open; every `set` rewrites the file through a
/// temporary sibling so a crash mid-write cannot corrupt the previous state.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl FileStorage {
    /// Open (or create) the backing file at the given path.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let values = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            serde_json::from_str(&raw).unwrap_or_else(|error| {
                tracing::warn!(%error, path = %path.display(), "state file unreadable; starting empty");
                BTreeMap::new()
            })
        } else {
            BTreeMap::new()
        };

        Ok(Self { path, values })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_all(&self) -> Result<()> {
        let raw = serde_json::to_string_pretty(&self.values)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, &self.path)
            .map_err(|error| Error::Storage(format!("failed to replace state file: {error}")))
    }
}

impl StorageAdapter for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.values.insert(key.to_string(), value.to_string());
        self.write_all()
    }

    fn quota(&self) -> Option<QuotaEstimate> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_file_storage_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut storage = FileStorage::open(&path).unwrap();
        storage.set("language", "\"de\"").unwrap();
        drop(storage);

        let reopened = FileStorage::open(&path).unwrap();
        assert_eq!(reopened.get("language").unwrap().as_deref(), Some("\"de\""));
    }

    #[test]
    fn test_file_storage_tolerates_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{not json").unwrap();

        let storage = FileStorage::open(&path).unwrap();
        assert_eq!(storage.get("entries").unwrap(), None);
    }
}
