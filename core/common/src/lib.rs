//! Common utilities and types shared across Storekeep modules.
//!
//! This module provides foundational types that are used throughout the codebase,
//! ensuring consistency and type safety.

pub mod error;
pub mod mutation;
pub mod settings;
pub mod types;

pub use error::{Error, Result};
pub use mutation::{Operation, PendingMutation, RemoteChange};
pub use settings::{
    InvoiceTemplate, SettingsDocument, SettingsSection, SettingsUpload, StoreProfile, TaxConfig,
    UserProfile,
};
pub use types::{AccessToken, UserId};
