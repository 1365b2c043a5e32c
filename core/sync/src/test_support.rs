//! Recording fakes for engine tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use storekeep_common::{
    AccessToken, Error, PendingMutation, RemoteChange, Result, SettingsUpload,
};
use storekeep_storage::{CredentialError, MetadataApi, Session, SessionProvider};

use crate::queue::{MutationQueue, ProgressFn};

/// Ordered log of calls shared between fakes.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn record(&self, call: impl Into<String>) {
        self.0.lock().unwrap().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, call: &str) -> Option<usize> {
        self.calls().iter().position(|c| c == call)
    }
}

/// [`MetadataApi`] that records uploads and can be told to fail.
#[derive(Default)]
pub struct RecordingMetadata {
    log: CallLog,
    settings: Mutex<Vec<SettingsUpload>>,
    pushed: Mutex<Vec<PendingMutation>>,
    changes: Mutex<Vec<RemoteChange>>,
    fail_settings: AtomicBool,
    fail_pull: AtomicBool,
    push_budget: Mutex<Option<usize>>,
    settings_gate: Mutex<Option<Arc<Notify>>>,
}

impl RecordingMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log(log: CallLog) -> Self {
        Self {
            log,
            ..Default::default()
        }
    }

    pub fn set_fail_settings(&self, fail: bool) {
        self.fail_settings.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_pull(&self, fail: bool) {
        self.fail_pull.store(fail, Ordering::SeqCst);
    }

    /// Hold every settings upload until the returned gate is notified once
    /// per upload.
    pub fn gate_settings(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.settings_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Accept `n` more mutation pushes, then reject the rest.
    pub fn fail_pushes_after(&self, n: usize) {
        *self.push_budget.lock().unwrap() = Some(n);
    }

    pub fn set_changes(&self, changes: Vec<RemoteChange>) {
        *self.changes.lock().unwrap() = changes;
    }

    pub fn settings_uploads(&self) -> Vec<SettingsUpload> {
        self.settings.lock().unwrap().clone()
    }

    pub fn pushed(&self) -> Vec<PendingMutation> {
        self.pushed.lock().unwrap().clone()
    }
}

fn rejected() -> Error {
    Error::RemoteRejected {
        status: 503,
        message: "unavailable".to_string(),
    }
}

#[async_trait]
impl MetadataApi for RecordingMetadata {
    async fn put_settings(&self, settings: &SettingsUpload) -> Result<()> {
        self.log.record("put_settings");
        let gate = self.settings_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail_settings.load(Ordering::SeqCst) {
            return Err(rejected());
        }
        self.settings.lock().unwrap().push(settings.clone());
        Ok(())
    }

    async fn push_mutation(&self, mutation: &PendingMutation) -> Result<()> {
        self.log.record("push_mutation");
        let mut budget = self.push_budget.lock().unwrap();
        match budget.as_mut() {
            Some(0) => return Err(rejected()),
            Some(n) => *n -= 1,
            None => {}
        }
        self.pushed.lock().unwrap().push(mutation.clone());
        Ok(())
    }

    async fn pull_changes(&self, _since: Option<DateTime<Utc>>) -> Result<Vec<RemoteChange>> {
        self.log.record("pull_changes");
        if self.fail_pull.load(Ordering::SeqCst) {
            return Err(Error::Network("connection reset".to_string()));
        }
        Ok(self.changes.lock().unwrap().clone())
    }
}

/// [`MutationQueue`] with a settable length that logs every call.
pub struct RecordingQueue {
    log: CallLog,
    pending: AtomicUsize,
    drains_on_retry: bool,
    fail_pull: AtomicBool,
    signed_out_pull: AtomicBool,
}

impl RecordingQueue {
    pub fn new(log: CallLog, pending: usize) -> Self {
        Self {
            log,
            pending: AtomicUsize::new(pending),
            drains_on_retry: true,
            fail_pull: AtomicBool::new(false),
            signed_out_pull: AtomicBool::new(false),
        }
    }

    /// Retries leave the queue length unchanged.
    pub fn stuck(mut self) -> Self {
        self.drains_on_retry = false;
        self
    }

    pub fn set_pending(&self, n: usize) {
        self.pending.store(n, Ordering::SeqCst);
    }

    pub fn set_fail_pull(&self, fail: bool) {
        self.fail_pull.store(fail, Ordering::SeqCst);
    }

    /// Pulls fail as if the remote session had gone away.
    pub fn set_pull_signed_out(&self, signed_out: bool) {
        self.signed_out_pull.store(signed_out, Ordering::SeqCst);
    }
}

#[async_trait]
impl MutationQueue for RecordingQueue {
    async fn pending_length(&self) -> Result<usize> {
        self.log.record("pending_length");
        Ok(self.pending.load(Ordering::SeqCst))
    }

    async fn retry_all(&self) -> Result<()> {
        self.log.record("retry_all");
        if self.drains_on_retry {
            self.pending.store(0, Ordering::SeqCst);
            Ok(())
        } else {
            Err(rejected())
        }
    }

    async fn pull_remote_changes(&self, on_progress: ProgressFn<'_>) -> Result<()> {
        self.log.record("pull_remote_changes");
        on_progress("Pulling...");
        if self.signed_out_pull.load(Ordering::SeqCst) {
            return Err(Error::CredentialUnavailable("no auth token".to_string()));
        }
        if self.fail_pull.load(Ordering::SeqCst) {
            return Err(Error::Timeout("pull".to_string()));
        }
        Ok(())
    }

    async fn reset_sync_state(&self) -> Result<()> {
        self.log.record("reset_sync_state");
        self.pending.store(0, Ordering::SeqCst);
        Ok(())
    }

    async fn reset_if_empty(&self) -> Result<usize> {
        self.log.record("reset_if_empty");
        Ok(self.pending.load(Ordering::SeqCst))
    }
}

/// [`SessionProvider`] with a fixed signed-in or signed-out answer.
pub struct StaticSession {
    signed_in: bool,
    issued: AtomicUsize,
}

impl StaticSession {
    pub fn signed_in() -> Self {
        Self {
            signed_in: true,
            issued: AtomicUsize::new(0),
        }
    }

    pub fn signed_out() -> Self {
        Self {
            signed_in: false,
            issued: AtomicUsize::new(0),
        }
    }

    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionProvider for StaticSession {
    async fn current_session(&self) -> std::result::Result<Option<Session>, CredentialError> {
        Ok(self.signed_in.then(|| Session {
            account: "owner@example.com".to_string(),
            scopes: vec!["drive".to_string()],
        }))
    }

    async fn silent_sign_in(&self) -> std::result::Result<Option<Session>, CredentialError> {
        Ok(None)
    }

    async fn request_scope(
        &self,
        _session: &Session,
        _scope: &str,
    ) -> std::result::Result<Option<Session>, CredentialError> {
        Ok(None)
    }

    async fn issue_token(
        &self,
        _session: &Session,
        scope: &str,
    ) -> std::result::Result<AccessToken, CredentialError> {
        self.issued.fetch_add(1, Ordering::SeqCst);
        Ok(AccessToken::new("token", scope))
    }
}
