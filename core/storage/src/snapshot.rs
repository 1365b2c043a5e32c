//! Remote snapshot protocol.
//!
//! Turns a folder/file service into an idempotent per-table key-value
//! backup:
//! - one folder per user, named `<app>-<userId>`, created lazily
//! - one `<table>.json` file per table inside it, always overwritten in place
//! - restore fetches many tables with bounded parallelism
//!
//! The transport is abstracted by [`DriveFiles`] so the upsert logic is the
//! same for the real Drive client and the in-memory backend.

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use storekeep_common::{AccessToken, Error, Result, UserId};

use crate::gdrive::DriveFile;

/// MIME type of a folder on the file service.
pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
/// MIME type of snapshot files.
pub const JSON_MIME: &str = "application/json";

/// Default number of snapshot files fetched at once.
pub const DEFAULT_FETCH_CONCURRENCY: usize = 5;

/// File name holding a table's snapshot.
pub fn snapshot_name(table: &str) -> String {
    format!("{}.json", table)
}

/// Exact-name lookup on the file service. Trashed files never match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileQuery {
    pub name: String,
    pub mime_type: Option<String>,
    pub parent: Option<String>,
}

impl FileQuery {
    /// Query for a top-level folder.
    pub fn folder(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mime_type: Some(FOLDER_MIME.to_string()),
            parent: None,
        }
    }

    /// Query for a file inside `parent`.
    pub fn file_in(name: impl Into<String>, parent: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mime_type: None,
            parent: Some(parent.into()),
        }
    }

    /// Render as a Drive `q` expression.
    pub fn to_query_string(&self) -> String {
        let mut clauses = vec![format!("name = '{}'", escape(&self.name))];
        if let Some(mime) = &self.mime_type {
            clauses.push(format!("mimeType = '{}'", escape(mime)));
        }
        if let Some(parent) = &self.parent {
            clauses.push(format!("'{}' in parents", escape(parent)));
        }
        clauses.push("trashed = false".to_string());
        clauses.join(" and ")
    }

    /// Whether `file` satisfies this query.
    pub fn matches(&self, file: &DriveFile) -> bool {
        !file.trashed
            && file.name == self.name
            && self.mime_type.as_ref().map_or(true, |m| &file.mime_type == m)
            && self
                .parent
                .as_ref()
                .map_or(true, |p| file.parents.iter().any(|fp| fp == p))
    }
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// A `multipart/related` upload body: JSON metadata followed by content.
#[derive(Debug, Clone)]
pub struct MultipartBody {
    boundary: String,
    metadata: Value,
    content: Vec<u8>,
}

impl MultipartBody {
    /// Build a body with a boundary that occurs in neither part.
    pub fn new(metadata: Value, content: Vec<u8>) -> Result<Self> {
        let metadata_json = serde_json::to_vec(&metadata)?;
        let boundary = loop {
            let candidate = format!("storekeep-{}", uuid::Uuid::new_v4().simple());
            if !contains(&metadata_json, candidate.as_bytes())
                && !contains(&content, candidate.as_bytes())
            {
                break candidate;
            }
        };

        Ok(Self {
            boundary,
            metadata,
            content,
        })
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn metadata(&self) -> &Value {
        &self.metadata
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// `Content-Type` header value for the request.
    pub fn content_type(&self) -> String {
        format!("multipart/related; boundary={}", self.boundary)
    }

    /// Serialize the two parts joined by the boundary.
    pub fn encode(&self) -> Vec<u8> {
        let metadata_json = self.metadata.to_string();
        let mut body = Vec::with_capacity(metadata_json.len() + self.content.len() + 256);

        // Metadata part
        body.extend_from_slice(format!("--{}\r\n", self.boundary).as_bytes());
        body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
        body.extend_from_slice(metadata_json.as_bytes());
        body.extend_from_slice(b"\r\n");

        // Content part
        body.extend_from_slice(format!("--{}\r\n", self.boundary).as_bytes());
        body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", JSON_MIME).as_bytes());
        body.extend_from_slice(&self.content);
        body.extend_from_slice(b"\r\n");

        body.extend_from_slice(format!("--{}--", self.boundary).as_bytes());
        body
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

/// Low-level folder/file operations of the cloud file service.
#[async_trait]
pub trait DriveFiles: Send + Sync {
    /// List files matching `query`, in the service's order.
    async fn list(&self, token: &AccessToken, query: &FileQuery) -> Result<Vec<DriveFile>>;

    /// Create a top-level folder.
    async fn create_folder(&self, token: &AccessToken, name: &str) -> Result<DriveFile>;

    /// Create a file; parent and name come from the body's metadata.
    async fn create_file(&self, token: &AccessToken, body: MultipartBody) -> Result<DriveFile>;

    /// Overwrite an existing file's metadata and content.
    async fn update_file(
        &self,
        token: &AccessToken,
        file_id: &str,
        body: MultipartBody,
    ) -> Result<DriveFile>;

    /// Raw content of a file.
    async fn download(&self, token: &AccessToken, file_id: &str) -> Result<Vec<u8>>;
}

/// Per-user snapshot backup as consumed by the sync engine.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Resolve the user's namespace folder, creating it if absent.
    async fn upsert_namespace(&self, token: &AccessToken, user: &UserId) -> Result<String>;

    /// Create or overwrite `name` inside the namespace.
    async fn upsert_file(
        &self,
        token: &AccessToken,
        folder_id: &str,
        name: &str,
        content: &Value,
    ) -> Result<()>;

    /// Read `name` from the namespace; `None` when no such file exists.
    async fn fetch_file(
        &self,
        token: &AccessToken,
        folder_id: &str,
        name: &str,
    ) -> Result<Option<Value>>;
}

/// Async locks keyed by string, so operations on one key run one at a time.
#[derive(Default)]
struct KeyLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyLocks {
    fn get(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// [`SnapshotStore`] implemented on top of any [`DriveFiles`] transport.
pub struct SnapshotClient<D: DriveFiles + ?Sized> {
    drive: Arc<D>,
    app_name: String,
    locks: KeyLocks,
}

impl<D: DriveFiles + ?Sized> SnapshotClient<D> {
    /// Create a client; namespaces are named `<app_name>-<userId>`.
    pub fn new(drive: Arc<D>, app_name: impl Into<String>) -> Self {
        Self {
            drive,
            app_name: app_name.into(),
            locks: KeyLocks::default(),
        }
    }

    /// The underlying transport.
    pub fn drive(&self) -> &Arc<D> {
        &self.drive
    }
}

#[async_trait]
impl<D: DriveFiles + ?Sized> SnapshotStore for SnapshotClient<D> {
    async fn upsert_namespace(&self, token: &AccessToken, user: &UserId) -> Result<String> {
        let name = user.namespace(&self.app_name);
        let lock = self.locks.get(&format!("ns:{}", name));
        let _guard = lock.lock().await;

        let found = self.drive.list(token, &FileQuery::folder(&name)).await?;
        if found.len() > 1 {
            warn!(namespace = %name, count = found.len(), "Duplicate namespaces found, using the first");
        }
        if let Some(folder) = found.into_iter().next() {
            debug!(namespace = %name, id = %folder.id, "Reusing namespace");
            return Ok(folder.id);
        }

        let folder = self.drive.create_folder(token, &name).await?;
        info!(namespace = %name, id = %folder.id, "Created namespace");
        Ok(folder.id)
    }

    async fn upsert_file(
        &self,
        token: &AccessToken,
        folder_id: &str,
        name: &str,
        content: &Value,
    ) -> Result<()> {
        let data = serde_json::to_vec(content)?;
        let lock = self.locks.get(&format!("file:{}/{}", folder_id, name));
        let _guard = lock.lock().await;

        let existing = self
            .drive
            .list(token, &FileQuery::file_in(name, folder_id))
            .await?
            .into_iter()
            .next();

        match existing {
            Some(file) => {
                let metadata = serde_json::json!({ "name": name, "mimeType": JSON_MIME });
                self.drive
                    .update_file(token, &file.id, MultipartBody::new(metadata, data)?)
                    .await?;
                debug!(file = name, id = %file.id, "Snapshot updated");
            }
            None => {
                let metadata = serde_json::json!({
                    "name": name,
                    "mimeType": JSON_MIME,
                    "parents": [folder_id],
                });
                let created = self
                    .drive
                    .create_file(token, MultipartBody::new(metadata, data)?)
                    .await?;
                debug!(file = name, id = %created.id, "Snapshot created");
            }
        }
        Ok(())
    }

    async fn fetch_file(
        &self,
        token: &AccessToken,
        folder_id: &str,
        name: &str,
    ) -> Result<Option<Value>> {
        let candidates = self
            .drive
            .list(token, &FileQuery::file_in(name, folder_id))
            .await?;

        let Some(file) = candidates.into_iter().find(|f| f.name == name) else {
            return Ok(None);
        };

        let bytes = self.drive.download(token, &file.id).await?;
        let value = serde_json::from_slice(&bytes).map_err(|e| {
            Error::Serialization(format!("Snapshot {} is not valid JSON: {}", name, e))
        })?;
        Ok(Some(value))
    }
}

/// Fetch several snapshot files, at most `concurrency` at a time.
///
/// Results come back in the order of `names`. The first failure aborts the
/// whole batch; fetches still in flight are dropped.
pub async fn fetch_files<S: SnapshotStore + ?Sized>(
    store: &S,
    token: &AccessToken,
    folder_id: &str,
    names: &[String],
    concurrency: usize,
) -> Result<Vec<(String, Option<Value>)>> {
    let mut indexed: Vec<(usize, String, Option<Value>)> = stream::iter(names.iter().enumerate())
        .map(|(i, name)| async move {
            let value = store.fetch_file(token, folder_id, name).await?;
            Ok::<_, Error>((i, name.clone(), value))
        })
        .buffer_unordered(concurrency.max(1))
        .try_collect()
        .await?;

    indexed.sort_by_key(|(i, _, _)| *i);
    Ok(indexed.into_iter().map(|(_, n, v)| (n, v)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDrive;
    use proptest::prelude::*;
    use serde_json::json;
    use std::time::Duration;

    fn token() -> AccessToken {
        AccessToken::new("test-token", "drive.file")
    }

    fn client(drive: Arc<MemoryDrive>) -> SnapshotClient<MemoryDrive> {
        SnapshotClient::new(drive, "storekeep")
    }

    #[test]
    fn test_query_string() {
        let q = FileQuery::folder("storekeep-u1").to_query_string();
        assert_eq!(
            q,
            "name = 'storekeep-u1' and mimeType = 'application/vnd.google-apps.folder' and trashed = false"
        );

        let q = FileQuery::file_in("it's.json", "folder1").to_query_string();
        assert!(q.contains("name = 'it\\'s.json'"));
        assert!(q.contains("'folder1' in parents"));
    }

    #[test]
    fn test_multipart_layout() {
        let body = MultipartBody::new(json!({"name": "a.json"}), b"[1,2]".to_vec()).unwrap();
        let encoded = String::from_utf8(body.encode()).unwrap();
        let boundary = body.boundary();

        assert!(encoded.starts_with(&format!("--{}\r\n", boundary)));
        assert!(encoded.ends_with(&format!("--{}--", boundary)));
        assert_eq!(encoded.matches(&format!("--{}\r\n", boundary)).count(), 2);
        assert!(encoded.contains("{\"name\":\"a.json\"}"));
        assert!(encoded.contains("[1,2]"));
        assert_eq!(
            body.content_type(),
            format!("multipart/related; boundary={}", boundary)
        );
    }

    proptest! {
        #[test]
        fn prop_boundary_absent_from_parts(content in proptest::collection::vec(any::<u8>(), 0..512), name in ".*") {
            let body = MultipartBody::new(json!({"name": name}), content.clone()).unwrap();
            let metadata = serde_json::to_vec(body.metadata()).unwrap();
            prop_assert!(!contains(&metadata, body.boundary().as_bytes()));
            prop_assert!(!contains(&content, body.boundary().as_bytes()));
        }
    }

    #[tokio::test]
    async fn test_namespace_upsert_is_idempotent() {
        let drive = Arc::new(MemoryDrive::new());
        let client = client(drive.clone());
        let user = UserId::new("u1").unwrap();

        let first = client.upsert_namespace(&token(), &user).await.unwrap();
        let second = client.upsert_namespace(&token(), &user).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(drive.folder_count("storekeep-u1"), 1);
    }

    #[tokio::test]
    async fn test_upsert_file_twice_keeps_one_file() {
        let drive = Arc::new(MemoryDrive::new());
        let client = client(drive.clone());
        let user = UserId::new("u1").unwrap();
        let folder = client.upsert_namespace(&token(), &user).await.unwrap();

        let rows = json!([{"id": 1}]);
        client.upsert_file(&token(), &folder, "products.json", &rows).await.unwrap();
        client.upsert_file(&token(), &folder, "products.json", &rows).await.unwrap();

        assert_eq!(drive.file_count(&folder, "products.json"), 1);
        assert_eq!(drive.stats().creates, 1);
        assert_eq!(drive.stats().updates, 1);
    }

    #[tokio::test]
    async fn test_concurrent_upserts_do_not_duplicate() {
        let drive = Arc::new(MemoryDrive::new().with_latency(Duration::from_millis(10)));
        let client = Arc::new(client(drive.clone()));
        let user = UserId::new("u1").unwrap();
        let folder = client.upsert_namespace(&token(), &user).await.unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let client = client.clone();
                let folder = folder.clone();
                tokio::spawn(async move {
                    client
                        .upsert_file(&token(), &folder, "products.json", &json!([{"id": i}]))
                        .await
                })
            })
            .collect();
        for task in futures::future::join_all(tasks).await {
            task.unwrap().unwrap();
        }

        assert_eq!(drive.file_count(&folder, "products.json"), 1);
    }

    #[tokio::test]
    async fn test_update_overwrites_content() {
        let drive = Arc::new(MemoryDrive::new());
        let client = client(drive.clone());
        let user = UserId::new("u1").unwrap();
        let folder = client.upsert_namespace(&token(), &user).await.unwrap();

        client.upsert_file(&token(), &folder, "products.json", &json!([{"id": 1}])).await.unwrap();
        client.upsert_file(&token(), &folder, "products.json", &json!([{"id": 2}])).await.unwrap();

        let fetched = client.fetch_file(&token(), &folder, "products.json").await.unwrap();
        assert_eq!(fetched, Some(json!([{"id": 2}])));
    }

    #[tokio::test]
    async fn test_fetch_missing_file_is_none() {
        let drive = Arc::new(MemoryDrive::new());
        let client = client(drive);
        let user = UserId::new("u1").unwrap();
        let folder = client.upsert_namespace(&token(), &user).await.unwrap();

        let fetched = client.fetch_file(&token(), &folder, "customers.json").await.unwrap();
        assert!(fetched.is_none());
    }

    #[tokio::test]
    async fn test_fetch_files_preserves_order() {
        let drive = Arc::new(MemoryDrive::new().with_latency(Duration::from_millis(2)));
        let client = client(drive);
        let user = UserId::new("u1").unwrap();
        let folder = client.upsert_namespace(&token(), &user).await.unwrap();
        client.upsert_file(&token(), &folder, "b.json", &json!([2])).await.unwrap();
        client.upsert_file(&token(), &folder, "a.json", &json!([1])).await.unwrap();

        let names = vec!["a.json".to_string(), "missing.json".to_string(), "b.json".to_string()];
        let results = fetch_files(&client, &token(), &folder, &names, 2).await.unwrap();

        assert_eq!(results[0], ("a.json".to_string(), Some(json!([1]))));
        assert_eq!(results[1], ("missing.json".to_string(), None));
        assert_eq!(results[2], ("b.json".to_string(), Some(json!([2]))));
    }

    /// Fails `broken.json` at once and never answers for anything else.
    struct StalledStore;

    #[async_trait]
    impl SnapshotStore for StalledStore {
        async fn upsert_namespace(&self, _token: &AccessToken, _user: &UserId) -> Result<String> {
            Ok("folder".to_string())
        }

        async fn upsert_file(
            &self,
            _token: &AccessToken,
            _folder_id: &str,
            _name: &str,
            _content: &Value,
        ) -> Result<()> {
            Ok(())
        }

        async fn fetch_file(
            &self,
            _token: &AccessToken,
            _folder_id: &str,
            name: &str,
        ) -> Result<Option<Value>> {
            if name == "broken.json" {
                return Err(Error::Network("connection reset".to_string()));
            }
            futures::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_fetch_files_stops_at_first_failure() {
        let names = vec!["slow.json".to_string(), "broken.json".to_string()];
        let result = tokio::time::timeout(
            Duration::from_secs(1),
            fetch_files(&StalledStore, &token(), "folder", &names, 2),
        )
        .await
        .expect("batch should fail without waiting on the stalled fetch");

        assert!(matches!(result, Err(Error::Network(_))));
    }
}
