//! Sync orchestrator: queue retry, pull, dirty reconciliation, settings
//! write path, backup and restore.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use storekeep_common::{Error, Result, SettingsDocument, SettingsSection, SettingsUpload, UserId};
use storekeep_storage::{fetch_files, snapshot_name, MetadataApi, SnapshotStore, TokenBroker};

use crate::context::SyncContext;
use crate::normalize::Normalizer;
use crate::queue::MutationQueue;
use crate::state::{SyncPhase, SyncState};

/// Snapshot file holding the settings document.
pub const SETTINGS_SNAPSHOT: &str = "settings.json";

pub const STATUS_CHECKING_QUEUE: &str = "Checking pending uploads...";
pub const STATUS_RECONCILING: &str = "Finalizing cloud setup...";
pub const STATUS_ERROR: &str = "Sync Error";
pub const STATUS_UP_TO_DATE: &str = "Up to date";
pub const STATUS_SIGNED_OUT: &str = "Working offline";

/// What a restore pass wrote locally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreReport {
    /// Tables that had a snapshot, in configured order.
    pub tables_restored: Vec<String>,
    pub rows_written: usize,
    pub settings_restored: bool,
}

struct Inner {
    ctx: Arc<SyncContext>,
    queue: Arc<dyn MutationQueue>,
    metadata: Arc<dyn MetadataApi>,
    snapshots: Arc<dyn SnapshotStore>,
    broker: Arc<TokenBroker>,
    normalizer: Normalizer,
    /// A full pass is running.
    busy: AtomicBool,
    /// One settings push at a time.
    push_lock: Mutex<()>,
    /// Orders local settings writes against clearing the dirty flag.
    settings_lock: Mutex<()>,
    tasks: TaskTracker,
}

/// Held while a pass runs; releases the busy flag on drop.
struct BusyGuard(Arc<Inner>);

impl BusyGuard {
    fn try_acquire(inner: &Arc<Inner>) -> Option<Self> {
        inner
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| BusyGuard(inner.clone()))
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.busy.store(false, Ordering::SeqCst);
    }
}

/// Coordinates the device's local copy with the metadata service and the
/// per-user snapshot namespace.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl SyncEngine {
    pub fn new(
        ctx: Arc<SyncContext>,
        queue: Arc<dyn MutationQueue>,
        metadata: Arc<dyn MetadataApi>,
        snapshots: Arc<dyn SnapshotStore>,
        broker: Arc<TokenBroker>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                queue,
                metadata,
                snapshots,
                broker,
                normalizer: Normalizer::new(),
                busy: AtomicBool::new(false),
                push_lock: Mutex::new(()),
                settings_lock: Mutex::new(()),
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.inner.ctx
    }

    pub fn state(&self) -> SyncState {
        self.inner.ctx.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.inner.ctx.subscribe()
    }

    /// Read the queue length and publish it.
    pub async fn pending_length(&self) -> Result<usize> {
        let pending = self.inner.queue.pending_length().await?;
        self.inner.ctx.update_state(|s| s.pending_queue_length = pending);
        Ok(pending)
    }

    /// Startup pass.
    ///
    /// With a stored session the pass is awaited so the caller can hold the
    /// app until it finishes; otherwise it runs in the background. Failures
    /// never block access. Returns whether an awaited pass succeeded.
    pub async fn start(&self) -> bool {
        let signed_in = match self.inner.ctx.has_session().await {
            Ok(signed_in) => signed_in,
            Err(e) => {
                warn!("Could not read session state: {}", e);
                false
            }
        };

        if signed_in {
            info!("Session found, running startup sync");
            let ok = self.run_sync(true).await;
            if !ok {
                warn!("Startup sync did not complete, continuing with local data");
            }
            ok
        } else {
            debug!("No session, startup sync runs in the background");
            self.run_sync(false).await;
            false
        }
    }

    /// Run one orchestrator pass.
    ///
    /// Returns `false` when another pass is already running. A blocking call
    /// returns whether the pass succeeded; a non-blocking one returns once
    /// the pass has been spawned.
    pub async fn run_sync(&self, blocking: bool) -> bool {
        let Some(guard) = BusyGuard::try_acquire(&self.inner) else {
            debug!("Sync pass already running, skipping");
            return false;
        };

        if blocking {
            self.pass(guard).await
        } else {
            let engine = self.clone();
            self.inner.tasks.spawn(async move {
                engine.pass(guard).await;
            });
            true
        }
    }

    async fn pass(&self, _guard: BusyGuard) -> bool {
        let ctx = &self.inner.ctx;
        ctx.update_state(|s| s.uploading = true);

        let result = self.pass_steps().await;
        match &result {
            Ok(()) => ctx.update_state(|s| {
                s.phase = SyncPhase::Idle;
                s.status_message = STATUS_UP_TO_DATE.to_string();
                s.uploading = false;
            }),
            Err(Error::CredentialUnavailable(reason)) => {
                info!("Skipping sync pass: {}", reason);
                ctx.update_state(|s| {
                    s.phase = SyncPhase::Idle;
                    s.status_message = STATUS_SIGNED_OUT.to_string();
                    s.uploading = false;
                });
            }
            Err(e) => {
                error!(retryable = e.is_retryable(), "Sync pass failed: {}", e);
                ctx.update_state(|s| {
                    s.phase = SyncPhase::Error;
                    s.status_message = STATUS_ERROR.to_string();
                    s.uploading = false;
                });
            }
        }
        result.is_ok()
    }

    async fn pass_steps(&self) -> Result<()> {
        let ctx = &self.inner.ctx;

        ctx.update_state(|s| {
            s.phase = SyncPhase::CheckingQueue;
            s.status_message = STATUS_CHECKING_QUEUE.to_string();
        });
        let pending = self.pending_length().await?;

        if pending > 0 {
            ctx.update_state(|s| {
                s.phase = SyncPhase::RetryingQueue;
                s.status_message = format!("Uploading {} pending change(s)...", pending);
            });
            // One attempt per pass; the next pass picks up what is left.
            if let Err(e) = self.inner.queue.retry_all().await {
                warn!(pending, "Queue retry failed: {}", e);
            }
            let left = self.pending_length().await?;
            debug!(before = pending, after = left, "Queue retry done");
        }

        ctx.update_state(|s| s.phase = SyncPhase::PullingRemote);
        let progress_ctx = ctx.clone();
        let on_progress = move |msg: &str| {
            progress_ctx.update_state(|s| s.status_message = msg.to_string());
        };
        self.inner.queue.pull_remote_changes(&on_progress).await?;
        ctx.set_last_synced(Utc::now()).await?;

        if ctx.is_dirty().await? {
            ctx.update_state(|s| {
                s.phase = SyncPhase::ReconcilingDirty;
                s.status_message = STATUS_RECONCILING.to_string();
            });
            self.reconcile_dirty().await;
        }

        info!("Sync pass complete");
        Ok(())
    }

    /// Re-push the onboarding subset after an earlier failed push.
    async fn reconcile_dirty(&self) {
        let _push = self.inner.push_lock.lock().await;
        let outcome: Result<()> = async {
            let stored = self.inner.ctx.load_settings().await?;
            let doc = self.inner.normalizer.normalize(stored.clone()).await;
            self.inner
                .metadata
                .put_settings(&SettingsUpload::onboarding(&doc))
                .await?;
            self.clear_dirty_if_unchanged(&stored).await
        }
        .await;

        match outcome {
            Ok(()) => info!("Dirty settings reconciled"),
            Err(e) => warn!("Settings reconciliation failed, will retry next pass: {}", e),
        }
    }

    /// Clear the dirty flag unless a local write landed after `pushed` was read.
    async fn clear_dirty_if_unchanged(&self, pushed: &SettingsDocument) -> Result<()> {
        let _settings = self.inner.settings_lock.lock().await;
        let current = self.inner.ctx.load_settings().await?;
        if &current != pushed {
            // The newer write keeps the flag set and has its own push queued.
            debug!("Settings changed during push");
            return Ok(());
        }
        self.inner.ctx.set_dirty(false).await
    }

    /// Refuse to reset sync bookkeeping while local writes are unsent,
    /// otherwise reset it and run a blocking pass.
    ///
    /// Returns `Ok(false)` without touching anything when a pass is already
    /// running.
    ///
    /// # Errors
    /// - [`Error::GuardViolation`] with the queue length when it is non-zero
    /// - local storage failures while resetting
    pub async fn force_resync(&self) -> Result<bool> {
        let Some(guard) = BusyGuard::try_acquire(&self.inner) else {
            info!("Resync skipped, a sync pass is running");
            return Ok(false);
        };

        let pending = self.inner.queue.reset_if_empty().await?;
        self.inner.ctx.update_state(|s| s.pending_queue_length = pending);
        if pending > 0 {
            warn!(pending, "Resync refused, pending changes would be lost");
            return Err(Error::GuardViolation { pending });
        }

        info!("Resetting sync bookkeeping");
        self.inner.ctx.clear_last_synced().await?;
        Ok(self.pass(guard).await)
    }

    /// Patch one settings section.
    ///
    /// The local write is done when this returns; the remote push runs in
    /// the background and only ever touches the sync state.
    pub async fn update_settings_section(
        &self,
        section: SettingsSection,
        patch: &Value,
    ) -> Result<SettingsDocument> {
        self.write_settings(|doc| doc.apply_patch(section, patch)).await
    }

    /// Stamp the onboarding timestamp.
    pub async fn complete_onboarding(&self) -> Result<SettingsDocument> {
        self.write_settings(|doc| {
            doc.onboarded_at = Some(Utc::now());
            Ok(())
        })
        .await
    }

    /// Clear the onboarding timestamp, keeping every other setting.
    pub async fn reset_onboarding(&self) -> Result<SettingsDocument> {
        self.write_settings(|doc| {
            doc.onboarded_at = None;
            Ok(())
        })
        .await
    }

    async fn write_settings(
        &self,
        edit: impl FnOnce(&mut SettingsDocument) -> Result<()>,
    ) -> Result<SettingsDocument> {
        let doc = {
            let _settings = self.inner.settings_lock.lock().await;
            let mut doc = self.inner.ctx.load_settings().await?;
            edit(&mut doc)?;
            self.inner.ctx.save_settings(&doc).await?;
            self.inner.ctx.set_dirty(true).await?;
            doc
        };

        let engine = self.clone();
        self.inner.tasks.spawn(async move {
            engine.push_settings().await;
        });
        Ok(doc)
    }

    /// Background continuation of a settings write.
    async fn push_settings(&self) {
        let _push = self.inner.push_lock.lock().await;
        let ctx = &self.inner.ctx;

        let stored = match ctx.load_settings().await {
            Ok(doc) => doc,
            Err(e) => {
                warn!("Settings push aborted, could not read settings: {}", e);
                return;
            }
        };
        let portable = self.inner.normalizer.normalize(stored.clone()).await;

        if let Err(e) = self
            .inner
            .metadata
            .put_settings(&SettingsUpload::full(&portable))
            .await
        {
            warn!("Settings push failed: {}", e);
            if let Err(e) = ctx.set_dirty(true).await {
                warn!("Could not persist dirty flag: {}", e);
            }
            return;
        }

        if let Err(e) = self.clear_dirty_if_unchanged(&stored).await {
            warn!("Could not clear dirty flag: {}", e);
        }

        if let Some(user_id) = portable.user.user_id.as_deref() {
            if let Err(e) = self.upload_settings_snapshot(user_id, &portable).await {
                warn!("Settings snapshot upload failed: {}", e);
            }
        }
    }

    async fn upload_settings_snapshot(&self, user_id: &str, doc: &SettingsDocument) -> Result<()> {
        let user = UserId::new(user_id)?;
        let token = self.inner.broker.acquire_token().await?;
        let folder = self.inner.snapshots.upsert_namespace(&token, &user).await?;
        let content = serde_json::to_value(doc)?;
        self.inner
            .snapshots
            .upsert_file(&token, &folder, SETTINGS_SNAPSHOT, &content)
            .await
    }

    /// Wait for every background continuation spawned so far.
    pub async fn flush_background(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.tasks.reopen();
    }

    /// Upload settings and every non-empty table to the user's namespace.
    ///
    /// Returns `false` when there is no credential or an upload fails.
    pub async fn backup_now(&self, user: &UserId) -> bool {
        match self.backup(user).await {
            Ok(files) => {
                info!(user = %user, files, "Backup complete");
                true
            }
            Err(Error::CredentialUnavailable(reason)) => {
                info!("Backup skipped: {}", reason);
                false
            }
            Err(e) => {
                warn!(user = %user, "Backup failed: {}", e);
                false
            }
        }
    }

    async fn backup(&self, user: &UserId) -> Result<usize> {
        let token = self.inner.broker.acquire_token().await?;
        let snapshots = &self.inner.snapshots;
        let folder = snapshots.upsert_namespace(&token, user).await?;

        let settings = self.inner.ctx.load_settings().await?;
        let settings = self.inner.normalizer.normalize(settings).await;
        snapshots
            .upsert_file(&token, &folder, SETTINGS_SNAPSHOT, &serde_json::to_value(&settings)?)
            .await?;
        let mut files = 1;

        for table in &self.inner.ctx.config().tables {
            let rows = self.inner.ctx.tables().rows(table).await?;
            if rows.is_empty() {
                // No file means no data.
                debug!(table = %table, "Skipping empty table");
                continue;
            }
            let count = rows.len();
            snapshots
                .upsert_file(&token, &folder, &snapshot_name(table), &Value::Array(rows))
                .await?;
            debug!(table = %table, rows = count, "Table uploaded");
            files += 1;
        }
        Ok(files)
    }

    /// Pull settings and table snapshots from the user's namespace into
    /// local storage. Absent files leave local data untouched.
    pub async fn restore(&self, user: &UserId) -> Result<RestoreReport> {
        let ctx = &self.inner.ctx;
        let config = ctx.config();
        let token = self.inner.broker.acquire_token().await?;
        let folder = self.inner.snapshots.upsert_namespace(&token, user).await?;

        let mut names = vec![SETTINGS_SNAPSHOT.to_string()];
        names.extend(config.tables.iter().map(|t| snapshot_name(t)));

        let fetched = fetch_files(
            self.inner.snapshots.as_ref(),
            &token,
            &folder,
            &names,
            config.fetch_concurrency,
        )
        .await?;

        let mut report = RestoreReport::default();
        let mut fetched = fetched.into_iter();

        if let Some((_, Some(settings))) = fetched.next() {
            let doc: SettingsDocument = serde_json::from_value(settings)
                .map_err(|e| Error::Serialization(format!("Settings snapshot is invalid: {}", e)))?;
            let _settings = self.inner.settings_lock.lock().await;
            ctx.save_settings(&doc).await?;
            report.settings_restored = true;
        }

        for (table, (name, content)) in config.tables.iter().zip(fetched) {
            match content {
                None => debug!(file = %name, "No snapshot, leaving table as is"),
                Some(Value::Array(rows)) => {
                    let written = ctx.tables().upsert_rows(table, rows).await?;
                    report.rows_written += written;
                    report.tables_restored.push(table.clone());
                }
                Some(_) => warn!(file = %name, "Snapshot is not an array, skipping"),
            }
        }

        info!(
            user = %user,
            tables = report.tables_restored.len(),
            rows = report.rows_written,
            "Restore complete"
        );
        Ok(report)
    }
}
