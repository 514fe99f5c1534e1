//! JSON file backend.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::{Map, Value};

use super::PersistentStore;
use crate::error::StoreError;

/// Store persisted as a single pretty-printed JSON object on disk
pub struct JsonFileStore {
    path: PathBuf,
    data: Map<String, Value>,
}

impl JsonFileStore {
    /// Open the store at the default location in the config directory
    pub fn open_default() -> Result<Self> {
        let config_dir = dirs::config_dir()
            .context("Could not find config directory")?
            .join("chatfolders");

        fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Self::open(config_dir.join("store.json"))
    }

    /// Open (or lazily create) the store at `path`
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let data = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read store file: {}", path.display()))?;
            if content.trim().is_empty() {
                Map::new()
            } else {
                serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse store file: {}", path.display()))?
            }
        } else {
            Map::new()
        };

        Ok(Self { path, data })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create store directory")?;
        }

        let content =
            serde_json::to_string_pretty(&self.data).context("Failed to serialize store")?;

        fs::write(&self.path, content)
            .with_context(|| format!("Failed to write store file: {}", self.path.display()))?;

        Ok(())
    }
}

impl PersistentStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.data.get(key).cloned())
    }

    fn set(&mut self, patch: Map<String, Value>) -> Result<(), StoreError> {
        let previous = self.data.clone();
        for (key, value) in patch {
            self.data.insert(key, value);
        }

        if let Err(e) = self.save() {
            // Roll back so memory matches disk
            self.data = previous;
            return Err(StoreError::classify(format!("{e:#}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_persists_and_reopen_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let mut store = JsonFileStore::open(&path).unwrap();
        let mut patch = Map::new();
        patch.insert("presetSeeded".into(), json!(true));
        store.set(patch).unwrap();

        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(reopened.get("presetSeeded").unwrap(), Some(json!(true)));
        assert_eq!(reopened.get("groups").unwrap(), None);
    }

    #[test]
    fn open_treats_empty_file_as_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        fs::write(&path, "").unwrap();

        let store = JsonFileStore::open(&path).unwrap();
        assert_eq!(store.get("groups").unwrap(), None);
    }

    #[test]
    fn open_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        fs::write(&path, "{not json").unwrap();

        assert!(JsonFileStore::open(&path).is_err());
    }
}
