//! REST client for the authoritative metadata service.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use storekeep_common::{Error, PendingMutation, RemoteChange, Result, SettingsUpload};

use crate::deadline::{with_deadline, DEFAULT_REQUEST_TIMEOUT};
use crate::local::{keys, StateStore};

/// Remote entity storage consumed by the sync engine.
#[async_trait]
pub trait MetadataApi: Send + Sync {
    /// Store (a subset of) the settings document.
    async fn put_settings(&self, settings: &SettingsUpload) -> Result<()>;

    /// Apply one queued entity write.
    async fn push_mutation(&self, mutation: &PendingMutation) -> Result<()>;

    /// Rows changed remotely after `since` (everything when `None`).
    async fn pull_changes(&self, since: Option<DateTime<Utc>>) -> Result<Vec<RemoteChange>>;
}

/// Metadata service endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    pub base_url: String,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8787/api/".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChangesResponse {
    #[serde(default)]
    changes: Vec<RemoteChange>,
}

/// [`MetadataApi`] over HTTP.
///
/// Authenticates with the session token kept under `auth_token` in the
/// state store; without it every call fails with
/// [`Error::CredentialUnavailable`].
pub struct RestMetadataClient {
    http: Client,
    base_url: Url,
    store: Arc<dyn StateStore>,
    timeout: Duration,
}

impl RestMetadataClient {
    /// Create a client.
    ///
    /// # Errors
    /// - `base_url` is not a valid URL
    pub fn new(config: &MetadataConfig, store: Arc<dyn StateStore>, timeout: Duration) -> Result<Self> {
        let mut base = config.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)
            .map_err(|e| Error::InvalidInput(format!("Invalid metadata base URL: {}", e)))?;

        let http = Client::builder()
            .user_agent(concat!("Storekeep/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url,
            store,
            timeout,
        })
    }

    /// Create a client with the default request timeout.
    pub fn with_defaults(config: &MetadataConfig, store: Arc<dyn StateStore>) -> Result<Self> {
        Self::new(config, store, DEFAULT_REQUEST_TIMEOUT)
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| Error::InvalidInput(format!("Invalid endpoint {}: {}", path, e)))
    }

    async fn auth_header(&self) -> Result<String> {
        match self.store.get(keys::AUTH_TOKEN).await? {
            Some(token) if !token.is_empty() => Ok(format!("Bearer {}", token)),
            _ => Err(Error::CredentialUnavailable(
                "No user session for the metadata service".to_string(),
            )),
        }
    }

    async fn send(&self, operation: &str, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let auth = self.auth_header().await?;
        with_deadline(self.timeout, operation, async {
            let response = request
                .header(header::AUTHORIZATION, auth)
                .send()
                .await
                .map_err(|e| Error::Network(format!("{} failed: {}", operation, e)))?;

            let status = response.status();
            if status.is_success() {
                Ok(response)
            } else if status == reqwest::StatusCode::UNAUTHORIZED {
                Err(Error::Authentication("Session token rejected".to_string()))
            } else {
                let body = response.text().await.unwrap_or_default();
                Err(Error::RemoteRejected {
                    status: status.as_u16(),
                    message: body,
                })
            }
        })
        .await
    }
}

#[async_trait]
impl MetadataApi for RestMetadataClient {
    async fn put_settings(&self, settings: &SettingsUpload) -> Result<()> {
        let request = self.http.put(self.endpoint("settings")?).json(settings);
        self.send("put settings", request).await?;
        debug!("Settings pushed to metadata service");
        Ok(())
    }

    async fn push_mutation(&self, mutation: &PendingMutation) -> Result<()> {
        let request = self.http.post(self.endpoint("mutations")?).json(mutation);
        self.send("push mutation", request).await?;
        Ok(())
    }

    async fn pull_changes(&self, since: Option<DateTime<Utc>>) -> Result<Vec<RemoteChange>> {
        let mut request = self.http.get(self.endpoint("changes")?);
        if let Some(since) = since {
            request = request.query(&[("since", since.to_rfc3339())]);
        }
        let response = self.send("pull changes", request).await?;
        let body: ChangesResponse = with_deadline(self.timeout, "read changes", async {
            response
                .json()
                .await
                .map_err(|e| Error::Network(format!("Failed to parse changes: {}", e)))
        })
        .await?;
        Ok(body.changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStateStore;

    fn client(base: &str) -> RestMetadataClient {
        let config = MetadataConfig {
            base_url: base.to_string(),
        };
        RestMetadataClient::with_defaults(&config, Arc::new(MemoryStateStore::new())).unwrap()
    }

    #[test]
    fn test_endpoint_joins_relative_to_base() {
        let client = client("https://api.example.com/v1");
        assert_eq!(
            client.endpoint("settings").unwrap().as_str(),
            "https://api.example.com/v1/settings"
        );
    }

    #[test]
    fn test_invalid_base_url_is_rejected() {
        let config = MetadataConfig {
            base_url: "not a url".to_string(),
        };
        let result = RestMetadataClient::with_defaults(&config, Arc::new(MemoryStateStore::new()));
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_missing_session_token_is_credential_unavailable() {
        let client = client("http://127.0.0.1:9/");
        let result = client.put_settings(&SettingsUpload::default()).await;
        assert!(matches!(result, Err(Error::CredentialUnavailable(_))));
    }

    #[test]
    fn test_changes_response_parsing() {
        let json = r#"{"changes":[{"table":"products","row":{"id":1}}]}"#;
        let parsed: ChangesResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.changes[0].table, "products");
    }
}
