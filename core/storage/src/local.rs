//! Local persistence: the key/value state store and per-table row storage.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

use storekeep_common::{Error, Result};

/// Well-known state store keys.
pub mod keys {
    pub const SETTINGS: &str = "settings";
    pub const SETTINGS_DIRTY: &str = "settings_dirty";
    pub const LAST_SYNCED_TIMESTAMP: &str = "last_synced_timestamp";
    pub const AUTH_TOKEN: &str = "auth_token";
    pub const PENDING_MUTATIONS: &str = "pending_mutations";
}

/// Durable string key/value storage.
///
/// Each key is written atomically on its own; there is no cross-key
/// transaction and the last writer wins.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Row storage for the business tables (products, customers, ...).
#[async_trait]
pub trait TableStore: Send + Sync {
    /// All rows of a table; an unknown table is empty.
    async fn rows(&self, table: &str) -> Result<Vec<Value>>;

    /// Insert or replace rows keyed by their `"id"` field.
    ///
    /// Returns the number of rows written. Rows of the table that are not
    /// mentioned are kept.
    async fn upsert_rows(&self, table: &str, rows: Vec<Value>) -> Result<usize>;
}

/// Stable key of a row, if it has one.
pub(crate) fn row_key(row: &Value) -> Option<String> {
    match row.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Merge `incoming` into `existing` by row key, preserving order.
pub(crate) fn merge_rows(existing: &mut Vec<Value>, incoming: Vec<Value>) -> usize {
    let mut written = 0;
    for row in incoming {
        match row_key(&row) {
            Some(key) => {
                if let Some(slot) = existing
                    .iter_mut()
                    .find(|r| row_key(r).as_deref() == Some(key.as_str()))
                {
                    *slot = row;
                } else {
                    existing.push(row);
                }
            }
            None => existing.push(row),
        }
        written += 1;
    }
    written
}

fn local_err(context: &str, e: impl std::fmt::Display) -> Error {
    Error::LocalIo(format!("{}: {}", context, e))
}

/// Write `data` next to `path` and rename over it.
async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| local_err("Failed to create data directory", e))?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data)
        .await
        .map_err(|e| local_err("Failed to write temp file", e))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|e| local_err("Failed to replace file", e))
}

/// JSON-file backed state store.
///
/// The whole map lives in one file and is cached in memory; every mutation
/// rewrites the file atomically before returning.
pub struct FileStateStore {
    path: PathBuf,
    cache: Mutex<BTreeMap<String, String>>,
}

impl FileStateStore {
    /// Open (or create) the store at `path`.
    ///
    /// # Errors
    /// - The file exists but cannot be read or is not a JSON object of strings
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let cache = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| local_err("Corrupt state file", e))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(local_err("Failed to read state file", e)),
        };

        Ok(Self {
            path,
            cache: Mutex::new(cache),
        })
    }

    async fn flush(&self, map: &BTreeMap<String, String>) -> Result<()> {
        let data = serde_json::to_vec_pretty(map)?;
        write_atomic(&self.path, &data).await
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.cache.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut map = self.cache.lock().await;
        let previous = map.insert(key.to_string(), value.to_string());
        if let Err(e) = self.flush(&map).await {
            // keep memory consistent with disk
            match previous {
                Some(v) => map.insert(key.to_string(), v),
                None => map.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut map = self.cache.lock().await;
        if map.remove(key).is_some() {
            self.flush(&map).await?;
        }
        Ok(())
    }
}

/// Table store keeping one `<table>.json` array per table in a directory.
pub struct FileTableStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl FileTableStore {
    /// Create a table store rooted at `root`. The directory is created lazily.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    fn table_path(&self, table: &str) -> Result<PathBuf> {
        if table.is_empty() || table.contains(['/', '\\', '.']) {
            return Err(Error::InvalidInput(format!("Invalid table name '{}'", table)));
        }
        Ok(self.root.join(format!("{}.json", table)))
    }

    async fn read_table(&self, path: &Path) -> Result<Vec<Value>> {
        match fs::read(path).await {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| local_err("Corrupt table file", e))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(local_err("Failed to read table", e)),
        }
    }
}

#[async_trait]
impl TableStore for FileTableStore {
    async fn rows(&self, table: &str) -> Result<Vec<Value>> {
        let path = self.table_path(table)?;
        let _guard = self.lock.lock().await;
        self.read_table(&path).await
    }

    async fn upsert_rows(&self, table: &str, rows: Vec<Value>) -> Result<usize> {
        let path = self.table_path(table)?;
        let _guard = self.lock.lock().await;
        let mut existing = self.read_table(&path).await?;
        let written = merge_rows(&mut existing, rows);
        let data = serde_json::to_vec_pretty(&existing)?;
        write_atomic(&path, &data).await?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_state_store_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        let store = FileStateStore::open(&path).await.unwrap();
        store.set(keys::SETTINGS_DIRTY, "true").await.unwrap();
        store.set(keys::AUTH_TOKEN, "abc").await.unwrap();
        store.remove(keys::AUTH_TOKEN).await.unwrap();
        drop(store);

        let reopened = FileStateStore::open(&path).await.unwrap();
        assert_eq!(
            reopened.get(keys::SETTINGS_DIRTY).await.unwrap().as_deref(),
            Some("true")
        );
        assert!(reopened.get(keys::AUTH_TOKEN).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_state_file_is_local_failure() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"not json").unwrap();

        let result = FileStateStore::open(&path).await;
        assert!(matches!(result, Err(Error::LocalIo(_))));
    }

    #[tokio::test]
    async fn test_file_table_store_upserts_by_id() {
        let dir = TempDir::new().unwrap();
        let tables = FileTableStore::new(dir.path());

        tables
            .upsert_rows("products", vec![json!({"id": 1, "name": "Pen"}), json!({"id": 2, "name": "Ink"})])
            .await
            .unwrap();
        let written = tables
            .upsert_rows("products", vec![json!({"id": 2, "name": "Blue ink"})])
            .await
            .unwrap();

        assert_eq!(written, 1);
        let rows = tables.rows("products").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["name"], "Blue ink");
        assert!(tables.rows("customers").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_table_name_cannot_escape_root() {
        let dir = TempDir::new().unwrap();
        let tables = FileTableStore::new(dir.path());
        assert!(tables.rows("../etc").await.is_err());
    }
}
