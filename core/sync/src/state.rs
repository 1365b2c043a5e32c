//! Observable sync state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Phase of the orchestrator state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncPhase {
    /// No pass running.
    Idle,
    /// Reading the pending queue length.
    CheckingQueue,
    /// Re-sending queued mutations.
    RetryingQueue,
    /// Pulling authoritative changes.
    PullingRemote,
    /// Re-pushing settings after an earlier failed push.
    ReconcilingDirty,
    /// The last pass failed.
    Error,
}

impl SyncPhase {
    /// Whether a pass is in progress.
    pub fn is_active(&self) -> bool {
        !matches!(self, SyncPhase::Idle | SyncPhase::Error)
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncPhase::Idle => "idle",
            SyncPhase::CheckingQueue => "checking-queue",
            SyncPhase::RetryingQueue => "retrying-queue",
            SyncPhase::PullingRemote => "pulling-remote",
            SyncPhase::ReconcilingDirty => "reconciling-dirty",
            SyncPhase::Error => "error",
        };
        f.write_str(name)
    }
}

/// Sync status as shown to the user.
///
/// Only the engine writes it. `dirty` and `last_synced` are mirrored to the
/// state store so they survive restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub last_synced: Option<DateTime<Utc>>,
    /// Local settings differ from the last confirmed remote copy.
    pub dirty: bool,
    pub pending_queue_length: usize,
    pub status_message: String,
    /// A pass is running.
    pub uploading: bool,
    pub phase: SyncPhase,
}

impl SyncState {
    pub fn new() -> Self {
        Self {
            last_synced: None,
            dirty: false,
            pending_queue_length: 0,
            status_message: String::new(),
            uploading: false,
            phase: SyncPhase::Idle,
        }
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new()
    }
}
