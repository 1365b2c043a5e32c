//! Storekeep Sync Engine
//!
//! This module keeps the device's local copy reconciled with the remote
//! side, including:
//! - Orchestrated passes: queue retry, then pull, then dirty reconciliation
//! - Settings write path with background push and dirty tracking
//! - Logo normalization before anything leaves the device
//! - Per-user snapshot backup and restore
//! - Periodic and on-demand scheduling

pub mod config;
pub mod context;
pub mod engine;
pub mod normalize;
pub mod queue;
pub mod scheduler;
pub mod state;

#[cfg(test)]
mod test_support;

// Re-export main types
pub use config::SyncConfig;
pub use context::SyncContext;
pub use engine::{RestoreReport, SyncEngine, SETTINGS_SNAPSHOT};
pub use normalize::Normalizer;
pub use queue::{JournalQueue, MutationQueue, ProgressFn};
pub use scheduler::{SchedulerHandle, SyncScheduler};
pub use state::{SyncPhase, SyncState};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        let _config = SyncConfig::default();
        let _state = SyncState::new();
        let _normalizer = Normalizer::new();
    }
}
