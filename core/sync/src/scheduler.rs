//! Periodic and on-demand sync scheduling.

use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use storekeep_common::{Error, Result};

use crate::engine::SyncEngine;

type TriggerRequest = oneshot::Sender<bool>;

/// Runs periodic non-blocking passes and serves on-demand triggers.
pub struct SyncScheduler;

impl SyncScheduler {
    /// Start the scheduler task.
    ///
    /// The first periodic pass fires one `interval` after spawning; the
    /// startup pass is the caller's job. Must be called inside a tokio
    /// runtime.
    pub fn spawn(engine: SyncEngine, interval: Duration) -> SchedulerHandle {
        let cancel = CancellationToken::new();
        let (request_tx, request_rx) = mpsc::channel(16);

        let task = tokio::spawn(run(engine, interval, request_rx, cancel.clone()));

        SchedulerHandle {
            cancel,
            request_tx,
            task: Some(task),
        }
    }
}

async fn run(
    engine: SyncEngine,
    period: Duration,
    mut request_rx: mpsc::Receiver<TriggerRequest>,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(interval_secs = period.as_secs(), "Sync scheduler started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Sync scheduler shutting down");
                break;
            }

            Some(response_tx) = request_rx.recv() => {
                debug!("Processing on-demand sync");
                let ok = engine.run_sync(true).await;
                let _ = response_tx.send(ok);
            }

            _ = ticker.tick() => {
                debug!("Triggering periodic sync");
                if !engine.run_sync(false).await {
                    debug!("Periodic sync skipped, a pass is already running");
                }
            }
        }
    }
}

/// Owned handle to the scheduler task. Dropping it stops the task.
pub struct SchedulerHandle {
    cancel: CancellationToken,
    request_tx: mpsc::Sender<TriggerRequest>,
    task: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Run a blocking pass on the scheduler and return its outcome.
    ///
    /// # Errors
    /// - the scheduler has stopped
    pub async fn trigger(&self) -> Result<bool> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request_tx
            .send(response_tx)
            .await
            .map_err(|_| Error::InvalidInput("Scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::InvalidInput("Scheduler stopped before replying".to_string()))
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Stop the scheduler and wait for its task to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::context::SyncContext;
    use crate::test_support::{CallLog, RecordingMetadata, RecordingQueue, StaticSession};
    use std::sync::Arc;
    use storekeep_storage::{MemoryDrive, MemoryStateStore, MemoryTableStore, SnapshotClient, TokenBroker};

    async fn engine(log: CallLog) -> SyncEngine {
        let ctx = SyncContext::load(
            SyncConfig::default(),
            Arc::new(MemoryStateStore::new()),
            Arc::new(MemoryTableStore::new()),
        )
        .await
        .unwrap();
        SyncEngine::new(
            Arc::new(ctx),
            Arc::new(RecordingQueue::new(log.clone(), 0)),
            Arc::new(RecordingMetadata::with_log(log)),
            Arc::new(SnapshotClient::new(Arc::new(MemoryDrive::new()), "storekeep")),
            Arc::new(TokenBroker::new(Arc::new(StaticSession::signed_in()), "drive")),
        )
    }

    fn pulls(log: &CallLog) -> usize {
        log.calls()
            .iter()
            .filter(|c| *c == "pull_remote_changes")
            .count()
    }

    #[tokio::test]
    async fn test_trigger_runs_a_pass() {
        let log = CallLog::default();
        let handle = SyncScheduler::spawn(engine(log.clone()).await, Duration::from_secs(3600));

        assert!(handle.trigger().await.unwrap());
        assert_eq!(pulls(&log), 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_periodic_passes_run() {
        let log = CallLog::default();
        let engine = engine(log.clone()).await;
        let handle = SyncScheduler::spawn(engine.clone(), Duration::from_millis(20));

        tokio::time::sleep(Duration::from_millis(150)).await;
        handle.shutdown().await;
        engine.flush_background().await;

        assert!(pulls(&log) >= 2);
    }

    #[tokio::test]
    async fn test_no_passes_after_shutdown() {
        let log = CallLog::default();
        let engine = engine(log.clone()).await;
        let handle = SyncScheduler::spawn(engine.clone(), Duration::from_millis(20));

        handle.shutdown().await;
        engine.flush_background().await;
        let after_shutdown = pulls(&log);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pulls(&log), after_shutdown);
    }

    #[tokio::test]
    async fn test_dropping_handle_cancels() {
        let log = CallLog::default();
        let handle = SyncScheduler::spawn(engine(log).await, Duration::from_secs(3600));
        let cancel = handle.cancel.clone();

        drop(handle);
        assert!(cancel.is_cancelled());
    }
}
