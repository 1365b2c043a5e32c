//! Storage and remote service layer for Storekeep.
//!
//! This crate holds everything that touches persistence or the network:
//! - local state and table stores
//! - the REST metadata client
//! - the Drive transport and the per-user snapshot protocol built on it
//! - the credential broker that serializes token acquisition
//!
//! # Design Principles
//! - Backend isolation: the sync engine depends on traits, not on clients
//! - Bounded calls: every remote request carries a deadline
//! - Unified error semantics: all backends report through `storekeep_common::Error`

pub mod broker;
pub mod deadline;
pub mod gdrive;
pub mod local;
pub mod memory;
pub mod metadata;
pub mod snapshot;

pub use broker::{CredentialError, Session, SessionProvider, TokenBroker};
pub use deadline::{with_deadline, DEFAULT_REQUEST_TIMEOUT};
pub use local::{keys, FileStateStore, FileTableStore, StateStore, TableStore};
pub use memory::{DriveStats, MemoryDrive, MemoryStateStore, MemoryTableStore};
pub use metadata::{MetadataApi, MetadataConfig, RestMetadataClient};
pub use snapshot::{
    fetch_files, snapshot_name, DriveFiles, FileQuery, MultipartBody, SnapshotClient,
    SnapshotStore, DEFAULT_FETCH_CONCURRENCY,
};
