//! In-memory backends for testing and offline development.
//!
//! All data is stored in memory and lost on drop.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use uuid::Uuid;

use storekeep_common::{AccessToken, Error, Result};

use crate::gdrive::DriveFile;
use crate::local::{merge_rows, StateStore, TableStore};
use crate::snapshot::{DriveFiles, FileQuery, MultipartBody, FOLDER_MIME, JSON_MIME};

/// In-memory [`StateStore`].
#[derive(Default)]
pub struct MemoryStateStore {
    values: RwLock<HashMap<String, String>>,
    fail_writes: AtomicBool,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `set`/`remove` fail with a local I/O error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::LocalIo("Storage is read-only".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.read().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.check_writable()?;
        self.values
            .write()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.check_writable()?;
        self.values.write().unwrap().remove(key);
        Ok(())
    }
}

/// In-memory [`TableStore`].
#[derive(Default)]
pub struct MemoryTableStore {
    tables: RwLock<HashMap<String, Vec<Value>>>,
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TableStore for MemoryTableStore {
    async fn rows(&self, table: &str) -> Result<Vec<Value>> {
        Ok(self
            .tables
            .read()
            .unwrap()
            .get(table)
            .cloned()
            .unwrap_or_default())
    }

    async fn upsert_rows(&self, table: &str, rows: Vec<Value>) -> Result<usize> {
        let mut tables = self.tables.write().unwrap();
        let existing = tables.entry(table.to_string()).or_default();
        Ok(merge_rows(existing, rows))
    }
}

/// Call counters of a [`MemoryDrive`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriveStats {
    pub lists: usize,
    pub folders_created: usize,
    pub creates: usize,
    pub updates: usize,
    pub downloads: usize,
}

#[derive(Debug, Clone)]
struct StoredFile {
    meta: DriveFile,
    content: Vec<u8>,
}

/// In-memory folder/file service implementing [`DriveFiles`].
///
/// Optional latency widens race windows in concurrency tests; the offline
/// switch makes every call fail with a network error.
pub struct MemoryDrive {
    files: RwLock<Vec<StoredFile>>,
    stats: RwLock<DriveStats>,
    latency: Option<Duration>,
    offline: AtomicBool,
}

impl MemoryDrive {
    pub fn new() -> Self {
        Self {
            files: RwLock::new(Vec::new()),
            stats: RwLock::new(DriveStats::default()),
            latency: None,
            offline: AtomicBool::new(false),
        }
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn stats(&self) -> DriveStats {
        *self.stats.read().unwrap()
    }

    /// Number of live folders called `name`.
    pub fn folder_count(&self, name: &str) -> usize {
        let query = FileQuery::folder(name);
        self.files
            .read()
            .unwrap()
            .iter()
            .filter(|f| query.matches(&f.meta))
            .count()
    }

    /// Number of live files called `name` inside `folder_id`.
    pub fn file_count(&self, folder_id: &str, name: &str) -> usize {
        let query = FileQuery::file_in(name, folder_id);
        self.files
            .read()
            .unwrap()
            .iter()
            .filter(|f| query.matches(&f.meta))
            .count()
    }

    /// Parsed content of `name` inside `folder_id`.
    pub fn file_json(&self, folder_id: &str, name: &str) -> Option<Value> {
        let query = FileQuery::file_in(name, folder_id);
        self.files
            .read()
            .unwrap()
            .iter()
            .find(|f| query.matches(&f.meta))
            .and_then(|f| serde_json::from_slice(&f.content).ok())
    }

    /// Seed a folder directly, bypassing upsert logic.
    pub fn insert_folder(&self, name: &str) -> String {
        self.insert(name, FOLDER_MIME, Vec::new(), Vec::new()).id
    }

    /// Seed a file directly, bypassing upsert logic.
    pub fn insert_file(&self, folder_id: &str, name: &str, content: &Value) -> String {
        let data = serde_json::to_vec(content).unwrap_or_default();
        self.insert(name, JSON_MIME, vec![folder_id.to_string()], data).id
    }

    fn insert(&self, name: &str, mime_type: &str, parents: Vec<String>, content: Vec<u8>) -> DriveFile {
        let meta = DriveFile {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            mime_type: mime_type.to_string(),
            modified_time: Some(Utc::now()),
            parents,
            trashed: false,
        };
        self.files.write().unwrap().push(StoredFile {
            meta: meta.clone(),
            content,
        });
        meta
    }

    async fn enter(&self, count: impl FnOnce(&mut DriveStats)) -> Result<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Network("Drive is offline".to_string()));
        }
        count(&mut *self.stats.write().unwrap());
        Ok(())
    }
}

impl Default for MemoryDrive {
    fn default() -> Self {
        Self::new()
    }
}

fn metadata_str<'a>(body: &'a MultipartBody, field: &str) -> Option<&'a str> {
    body.metadata().get(field).and_then(Value::as_str)
}

#[async_trait]
impl DriveFiles for MemoryDrive {
    async fn list(&self, _token: &AccessToken, query: &FileQuery) -> Result<Vec<DriveFile>> {
        self.enter(|s| s.lists += 1).await?;
        Ok(self
            .files
            .read()
            .unwrap()
            .iter()
            .filter(|f| query.matches(&f.meta))
            .map(|f| f.meta.clone())
            .collect())
    }

    async fn create_folder(&self, _token: &AccessToken, name: &str) -> Result<DriveFile> {
        self.enter(|s| s.folders_created += 1).await?;
        Ok(self.insert(name, FOLDER_MIME, Vec::new(), Vec::new()))
    }

    async fn create_file(&self, _token: &AccessToken, body: MultipartBody) -> Result<DriveFile> {
        self.enter(|s| s.creates += 1).await?;
        let name = metadata_str(&body, "name")
            .ok_or_else(|| Error::InvalidInput("Upload metadata has no name".to_string()))?;
        let mime = metadata_str(&body, "mimeType").unwrap_or(JSON_MIME);
        let parents: Vec<String> = body
            .metadata()
            .get("parents")
            .and_then(|p| serde_json::from_value(p.clone()).ok())
            .unwrap_or_default();

        Ok(self.insert(name, mime, parents, body.content().to_vec()))
    }

    async fn update_file(
        &self,
        _token: &AccessToken,
        file_id: &str,
        body: MultipartBody,
    ) -> Result<DriveFile> {
        self.enter(|s| s.updates += 1).await?;
        let mut files = self.files.write().unwrap();
        let stored = files
            .iter_mut()
            .find(|f| f.meta.id == file_id)
            .ok_or_else(|| Error::NotFound(format!("File not found: {}", file_id)))?;

        if let Some(name) = metadata_str(&body, "name") {
            stored.meta.name = name.to_string();
        }
        stored.meta.modified_time = Some(Utc::now());
        stored.content = body.content().to_vec();
        Ok(stored.meta.clone())
    }

    async fn download(&self, _token: &AccessToken, file_id: &str) -> Result<Vec<u8>> {
        self.enter(|s| s.downloads += 1).await?;
        self.files
            .read()
            .unwrap()
            .iter()
            .find(|f| f.meta.id == file_id)
            .map(|f| f.content.clone())
            .ok_or_else(|| Error::NotFound(format!("File not found: {}", file_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_state_store_roundtrip() {
        let store = MemoryStateStore::new();
        store.set("k", "v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        store.remove("k").await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_state_store_write_failure() {
        let store = MemoryStateStore::new();
        store.set_fail_writes(true);
        assert!(matches!(store.set("k", "v").await, Err(Error::LocalIo(_))));
    }

    #[tokio::test]
    async fn test_memory_table_store_upsert() {
        let tables = MemoryTableStore::new();
        tables.upsert_rows("customers", vec![json!({"id": "c1", "name": "Ann"})]).await.unwrap();
        tables.upsert_rows("customers", vec![json!({"id": "c1", "name": "Anne"}), json!({"id": "c2"})]).await.unwrap();

        let rows = tables.rows("customers").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["name"], "Anne");
    }

    #[tokio::test]
    async fn test_offline_drive_fails_with_network_error() {
        let drive = MemoryDrive::new();
        drive.set_offline(true);
        let token = AccessToken::new("t", "s");

        let result = drive.list(&token, &FileQuery::folder("x")).await;
        assert!(matches!(result, Err(Error::Network(_))));
    }

    #[tokio::test]
    async fn test_trashed_files_are_not_listed() {
        let drive = MemoryDrive::new();
        let folder = drive.insert_folder("storekeep-u1");
        drive.insert_file(&folder, "products.json", &json!([]));
        drive.files.write().unwrap()[1].meta.trashed = true;

        assert_eq!(drive.file_count(&folder, "products.json"), 0);
    }
}
