//! Credential broker for the cloud file service.
//!
//! Concurrent callers share one outstanding acquisition: while a request is
//! in flight every `acquire_token` call awaits the same result. The in-flight
//! slot is cleared when the acquisition finishes, fails, panics or runs past
//! its deadline, so the next call after that starts fresh.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use storekeep_common::{AccessToken, Error};

use crate::deadline::DEFAULT_REQUEST_TIMEOUT;

/// Outcome of a failed acquisition, cloneable so every waiter gets a copy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    /// No session could be established; skip this sync pass.
    #[error("No credential available: {0}")]
    Unavailable(String),

    /// The identity provider failed while issuing the token.
    #[error("Credential acquisition failed: {0}")]
    Failed(String),

    /// The acquisition did not finish within the broker's deadline.
    #[error("Credential acquisition timed out: {0}")]
    Timeout(String),
}

impl From<CredentialError> for Error {
    fn from(e: CredentialError) -> Self {
        match e {
            CredentialError::Unavailable(msg) => Error::CredentialUnavailable(msg),
            CredentialError::Failed(msg) => Error::Authentication(msg),
            CredentialError::Timeout(msg) => Error::Timeout(msg),
        }
    }
}

/// An authenticated account session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub account: String,
    pub scopes: Vec<String>,
}

impl Session {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}

/// Identity platform hooks used by the acquisition policy.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// The already-authenticated session, if any.
    async fn current_session(&self) -> Result<Option<Session>, CredentialError>;

    /// Re-authenticate without user interaction.
    async fn silent_sign_in(&self) -> Result<Option<Session>, CredentialError>;

    /// Ask for an additional capability scope; `None` if it was not granted.
    async fn request_scope(
        &self,
        session: &Session,
        scope: &str,
    ) -> Result<Option<Session>, CredentialError>;

    /// Issue an access token for `session`.
    async fn issue_token(
        &self,
        session: &Session,
        scope: &str,
    ) -> Result<AccessToken, CredentialError>;
}

type TokenFuture = Shared<BoxFuture<'static, Result<AccessToken, CredentialError>>>;
type Slot = Mutex<Option<(u64, TokenFuture)>>;

/// Serializes token acquisition across concurrent callers.
pub struct TokenBroker {
    provider: Arc<dyn SessionProvider>,
    scope: String,
    timeout: Duration,
    in_flight: Arc<Slot>,
    next_id: AtomicU64,
}

/// Clears the in-flight slot when the acquisition future ends, however it ends.
struct ClearOnDrop {
    slot: Weak<Slot>,
    id: u64,
}

impl Drop for ClearOnDrop {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.upgrade() {
            let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
            if matches!(slot.as_ref(), Some((current, _)) if *current == self.id) {
                *slot = None;
            }
        }
    }
}

impl TokenBroker {
    /// Create a broker issuing tokens for `scope`.
    pub fn new(provider: Arc<dyn SessionProvider>, scope: impl Into<String>) -> Self {
        Self {
            provider,
            scope: scope.into(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            in_flight: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(0),
        }
    }

    /// Bound the whole acquisition, sign-in and token request included.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Scope requested for every token.
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Acquire a token, joining an in-flight acquisition if there is one.
    ///
    /// # Errors
    /// - [`CredentialError::Unavailable`] when no session can be established
    /// - [`CredentialError::Failed`] when the provider fails
    /// - [`CredentialError::Timeout`] when the acquisition outlives the deadline
    pub async fn acquire_token(&self) -> Result<AccessToken, CredentialError> {
        let fut = {
            let mut slot = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            match slot.as_ref() {
                Some((_, pending)) => {
                    debug!("Joining in-flight token acquisition");
                    pending.clone()
                }
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let guard = ClearOnDrop {
                        slot: Arc::downgrade(&self.in_flight),
                        id,
                    };
                    let provider = self.provider.clone();
                    let scope = self.scope.clone();
                    let limit = self.timeout;
                    let pending = async move {
                        let _guard = guard;
                        match tokio::time::timeout(limit, acquire(provider.as_ref(), &scope)).await {
                            Ok(result) => result,
                            Err(_) => {
                                warn!(?limit, "Token acquisition exceeded deadline");
                                Err(CredentialError::Timeout(format!(
                                    "no token within {:?}",
                                    limit
                                )))
                            }
                        }
                    }
                    .boxed()
                    .shared();
                    *slot = Some((id, pending.clone()));
                    pending
                }
            }
        };

        fut.await
    }
}

/// Reuse the session, else sign in silently, then elevate scope if needed.
async fn acquire(
    provider: &dyn SessionProvider,
    scope: &str,
) -> Result<AccessToken, CredentialError> {
    let session = match provider.current_session().await? {
        Some(session) => session,
        None => {
            debug!("No active session, attempting silent sign-in");
            provider.silent_sign_in().await?.ok_or_else(|| {
                CredentialError::Unavailable("No signed-in account".to_string())
            })?
        }
    };

    let session = if session.has_scope(scope) {
        session
    } else {
        info!(scope, "Session lacks required scope, requesting elevation");
        provider
            .request_scope(&session, scope)
            .await?
            .ok_or_else(|| CredentialError::Unavailable(format!("Scope {} was not granted", scope)))?
    };

    provider.issue_token(&session, scope).await
}
