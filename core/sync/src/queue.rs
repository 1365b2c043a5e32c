//! Pending mutation queue contract and the journaled implementation.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use storekeep_common::{Error, PendingMutation, Result};
use storekeep_storage::{keys, MetadataApi, StateStore, TableStore};

/// Progress callback for long-running queue operations.
pub type ProgressFn<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// Entity-level writes awaiting upload.
#[async_trait]
pub trait MutationQueue: Send + Sync {
    /// Number of queued mutations.
    async fn pending_length(&self) -> Result<usize>;

    /// Re-send every queued mutation in enqueue order.
    ///
    /// Fails only when nothing could be sent.
    async fn retry_all(&self) -> Result<()>;

    /// Pull authoritative changes into local tables.
    async fn pull_remote_changes(&self, on_progress: ProgressFn<'_>) -> Result<()>;

    /// Drop all queued mutations.
    async fn reset_sync_state(&self) -> Result<()>;

    /// Reset only if nothing is queued, checked and cleared as one step so a
    /// concurrent enqueue is never discarded.
    ///
    /// Returns the queue length; nothing is reset when it is non-zero.
    async fn reset_if_empty(&self) -> Result<usize>;
}

/// [`MutationQueue`] journaled in the state store under `pending_mutations`.
pub struct JournalQueue {
    store: Arc<dyn StateStore>,
    tables: Arc<dyn TableStore>,
    metadata: Arc<dyn MetadataApi>,
    journal: Mutex<()>,
}

impl JournalQueue {
    pub fn new(
        store: Arc<dyn StateStore>,
        tables: Arc<dyn TableStore>,
        metadata: Arc<dyn MetadataApi>,
    ) -> Self {
        Self {
            store,
            tables,
            metadata,
            journal: Mutex::new(()),
        }
    }

    /// Append a mutation to the journal.
    pub async fn enqueue(&self, mutation: PendingMutation) -> Result<()> {
        let _guard = self.journal.lock().await;
        let mut pending = self.read().await?;
        debug!(entity = %mutation.entity, "Mutation queued");
        pending.push(mutation);
        self.write(&pending).await
    }

    /// Snapshot of the queued mutations, oldest first.
    pub async fn pending(&self) -> Result<Vec<PendingMutation>> {
        self.read().await
    }

    async fn read(&self) -> Result<Vec<PendingMutation>> {
        match self.store.get(keys::PENDING_MUTATIONS).await? {
            Some(json) => serde_json::from_str(&json).map_err(|e| {
                Error::Serialization(format!("Mutation journal is corrupt: {}", e))
            }),
            None => Ok(Vec::new()),
        }
    }

    async fn write(&self, pending: &[PendingMutation]) -> Result<()> {
        if pending.is_empty() {
            return self.store.remove(keys::PENDING_MUTATIONS).await;
        }
        let json = serde_json::to_string(pending)?;
        self.store.set(keys::PENDING_MUTATIONS, &json).await
    }
}

#[async_trait]
impl MutationQueue for JournalQueue {
    async fn pending_length(&self) -> Result<usize> {
        Ok(self.read().await?.len())
    }

    async fn retry_all(&self) -> Result<()> {
        let _guard = self.journal.lock().await;
        let mut pending = self.read().await?;
        if pending.is_empty() {
            return Ok(());
        }

        let mut sent = 0;
        let mut failure = None;
        for mutation in pending.iter_mut() {
            match self.metadata.push_mutation(mutation).await {
                Ok(()) => sent += 1,
                Err(e) => {
                    // Later entries must not overtake this one.
                    mutation.attempts += 1;
                    warn!(entity = %mutation.entity, attempts = mutation.attempts, "Mutation upload failed: {}", e);
                    failure = Some(e);
                    break;
                }
            }
        }

        pending.drain(..sent);
        self.write(&pending).await?;
        info!(sent, remaining = pending.len(), "Queue retry finished");

        match failure {
            Some(e) if sent == 0 => Err(e),
            _ => Ok(()),
        }
    }

    async fn pull_remote_changes(&self, on_progress: ProgressFn<'_>) -> Result<()> {
        let since = match self.store.get(keys::LAST_SYNCED_TIMESTAMP).await? {
            Some(raw) => chrono::DateTime::parse_from_rfc3339(&raw)
                .ok()
                .map(|t| t.with_timezone(&Utc)),
            None => None,
        };

        on_progress("Downloading changes...");
        let changes = self.metadata.pull_changes(since).await?;

        let mut by_table: BTreeMap<String, Vec<serde_json::Value>> = BTreeMap::new();
        for change in changes {
            by_table.entry(change.table).or_default().push(change.row);
        }

        for (table, rows) in by_table {
            on_progress(&format!("Updating {}...", table));
            let written = self.tables.upsert_rows(&table, rows).await?;
            debug!(table = %table, rows = written, "Applied remote changes");
        }
        Ok(())
    }

    async fn reset_sync_state(&self) -> Result<()> {
        let _guard = self.journal.lock().await;
        self.store.remove(keys::PENDING_MUTATIONS).await?;
        info!("Mutation journal cleared");
        Ok(())
    }

    async fn reset_if_empty(&self) -> Result<usize> {
        let _guard = self.journal.lock().await;
        let pending = self.read().await?.len();
        if pending > 0 {
            return Ok(pending);
        }
        self.store.remove(keys::PENDING_MUTATIONS).await?;
        info!("Mutation journal cleared");
        Ok(0)
    }
}
