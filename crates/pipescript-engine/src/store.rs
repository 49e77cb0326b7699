//! Persistence for macro and event records.
//!
//! Records are plain JSON values; each registry handles its own versioning and
//! migration and only asks the store to load, save and back up the raw list.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use pipescript_types::Result;

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Every stored record; empty if nothing was ever saved.
    async fn load(&self) -> Result<Vec<Value>>;

    /// Replace the stored records.
    async fn save(&self, records: &[Value]) -> Result<()>;

    /// Keep a copy of the currently stored data under `suffix`, before it is upgraded.
    async fn backup(&self, suffix: &str) -> Result<()>;
}

/// Records kept as a JSON array in a single file.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `{dir}/{name}.json`
    pub fn in_dir(dir: &Path, name: &str) -> Self {
        Self::new(dir.join(format!("{name}.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RecordStore for JsonFileStore {
    async fn load(&self) -> Result<Vec<Value>> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(Vec::new());
        }
        let json = tokio::fs::read_to_string(&self.path).await?;
        let records: Vec<Value> = serde_json::from_str(&json)?;
        tracing::debug!(path = %self.path.display(), records = records.len(), "Records loaded");
        Ok(records)
    }

    async fn save(&self, records: &[Value]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(records)?;
        tokio::fs::write(&self.path, json).await?;
        tracing::debug!(path = %self.path.display(), records = records.len(), "Records saved");
        Ok(())
    }

    async fn backup(&self, suffix: &str) -> Result<()> {
        let mut backup = self.path.clone().into_os_string();
        backup.push(suffix);
        tokio::fs::copy(&self.path, &backup).await?;
        tracing::info!(backup = ?backup, "Backed up records before upgrading");
        Ok(())
    }
}

/// Keeps records in memory only.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Vec<Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<Value>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn load(&self) -> Result<Vec<Value>> {
        Ok(self.records.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn save(&self, records: &[Value]) -> Result<()> {
        *self.records.lock().unwrap_or_else(|e| e.into_inner()) = records.to_vec();
        Ok(())
    }

    async fn backup(&self, _suffix: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::in_dir(dir.path(), "nothing");
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::in_dir(&dir.path().join("nested"), "things");
        store.save(&[json!({"a": 1}), json!("b")]).await.unwrap();
        assert!(store.path().exists());

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, vec![json!({"a": 1}), json!("b")]);
    }

    #[tokio::test]
    async fn backup_copies_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::in_dir(dir.path(), "things");
        store.save(&[json!(1)]).await.unwrap();
        store.backup(".v4_backup").await.unwrap();
        assert!(dir.path().join("things.json.v4_backup").exists());
    }

    #[tokio::test]
    async fn corrupt_file_is_a_json_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::in_dir(dir.path(), "broken");
        tokio::fs::write(store.path(), "{not json").await.unwrap();
        let err = store.load().await.unwrap_err();
        assert_eq!(err.kind(), "JSONError");
    }

    #[tokio::test]
    async fn memory_store_keeps_the_last_save() {
        let store = MemoryStore::with_records(vec![json!(1)]);
        assert_eq!(store.load().await.unwrap(), vec![json!(1)]);
        store.save(&[json!(2), json!(3)]).await.unwrap();
        assert_eq!(store.load().await.unwrap(), vec![json!(2), json!(3)]);
    }
}
