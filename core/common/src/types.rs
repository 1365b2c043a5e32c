//! Common types used throughout Storekeep.

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Identifier of the signed-in account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Create a new UserId from a string.
    ///
    /// # Errors
    /// - Returns error if id is empty or contains a quote, which would break
    ///   remote name queries
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(crate::Error::InvalidInput(
                "UserId cannot be empty".to_string(),
            ));
        }
        if id.contains('\'') {
            return Err(crate::Error::InvalidInput(
                "UserId cannot contain quotes".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of this user's remote namespace, `<app>-<userId>`.
    pub fn namespace(&self, app_name: &str) -> String {
        format!("{}-{}", app_name, self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Short-lived bearer token for the cloud file service.
///
/// Never persisted; the value is wiped on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AccessToken {
    value: String,
    scope: String,
}

impl AccessToken {
    /// Create a token.
    pub fn new(value: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            scope: scope.into(),
        }
    }

    /// The bearer value.
    pub fn secret(&self) -> &str {
        &self.value
    }

    /// Capability scope the token was issued for.
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Value for an `Authorization` header.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.value)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"[REDACTED]")
            .field("scope", &self.scope)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_creation() {
        let id = UserId::new("u-42").unwrap();
        assert_eq!(id.as_str(), "u-42");
        assert_eq!(id.namespace("storekeep"), "storekeep-u-42");
    }

    #[test]
    fn test_user_id_rejects_empty_and_quotes() {
        assert!(UserId::new("").is_err());
        assert!(UserId::new("   ").is_err());
        assert!(UserId::new("o'brien").is_err());
    }

    #[test]
    fn test_access_token_debug_is_redacted() {
        let token = AccessToken::new("ya29.secret", "drive.file");
        let debug = format!("{:?}", token);
        assert!(!debug.contains("ya29"));
        assert!(debug.contains("drive.file"));
        assert_eq!(token.bearer(), "Bearer ya29.secret");
    }
}
