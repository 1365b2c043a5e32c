//! Google Drive backend for snapshot backups.
//!
//! This module provides:
//! - OAuth2 authentication with automatic token refresh
//! - A Drive REST client implementing the [`DriveFiles`](crate::snapshot::DriveFiles) transport

pub mod auth;
pub mod client;

pub use auth::{AuthConfig, AuthManager, OAuthSessionProvider, Tokens, DRIVE_SCOPE};
pub use client::{DriveClient, DriveFile};
