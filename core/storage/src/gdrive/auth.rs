//! Drive sign-in: OAuth2 code flow, token refresh and the session
//! provider the credential broker runs on.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use oauth2::basic::{BasicClient, BasicErrorResponse, BasicTokenResponse};
use oauth2::{
    reqwest, AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, EndpointNotSet,
    EndpointSet, RedirectUrl, RefreshToken, RequestTokenError, Scope, TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use storekeep_common::{AccessToken, Error, Result};

use crate::broker::{CredentialError, Session, SessionProvider};
use crate::deadline::{with_deadline, DEFAULT_REQUEST_TIMEOUT};

const AUTH_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
const DEFAULT_REDIRECT: &str = "http://localhost:8080/callback";

/// Scope granting access to files created by this app.
pub const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive.file";

/// Tokens this close to expiry are refreshed before use.
const EXPIRY_MARGIN_MINUTES: i64 = 5;

/// Lifetime assumed when the provider does not report one.
const DEFAULT_LIFETIME_SECS: u64 = 3600;

type ConfiguredClient =
    BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// Token pair from a completed sign-in, persisted between runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    /// Granted scopes; older token files have none recorded.
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl Tokens {
    /// Whether the access token is expired or inside the refresh margin.
    pub fn is_expired(&self) -> bool {
        Utc::now() + Duration::minutes(EXPIRY_MARGIN_MINUTES) > self.expires_at
    }
}

/// OAuth client registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_url: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            redirect_url: DEFAULT_REDIRECT.to_string(),
        }
    }
}

fn endpoint<T>(
    raw: &str,
    what: &str,
    parse: impl FnOnce(String) -> std::result::Result<T, url::ParseError>,
) -> Result<T> {
    parse(raw.to_string()).map_err(|e| Error::InvalidInput(format!("Invalid {} URL: {}", what, e)))
}

/// Runs the authorization code flow against Google's endpoints.
pub struct AuthManager {
    client: ConfiguredClient,
    http: reqwest::Client,
    config: AuthConfig,
}

impl AuthManager {
    /// # Errors
    /// - the redirect URL does not parse
    pub fn new(config: AuthConfig) -> Result<Self> {
        let client = BasicClient::new(ClientId::new(config.client_id.clone()))
            .set_client_secret(ClientSecret::new(config.client_secret.clone()))
            .set_auth_uri(endpoint(AUTH_ENDPOINT, "auth", AuthUrl::new)?)
            .set_token_uri(endpoint(TOKEN_ENDPOINT, "token", TokenUrl::new)?)
            .set_redirect_uri(endpoint(&config.redirect_url, "redirect", RedirectUrl::new)?);

        // Token endpoints must not be followed through redirects.
        let http = reqwest::ClientBuilder::new()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            http,
            config,
        })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(AuthConfig::default())
    }

    /// Consent URL plus the CSRF state to check on callback.
    pub fn authorization_url(&self) -> (String, String) {
        let (url, state) = self
            .client
            .authorize_url(CsrfToken::new_random)
            .add_scope(Scope::new(DRIVE_SCOPE.to_string()))
            .add_extra_param("access_type", "offline")
            .add_extra_param("prompt", "consent")
            .url();
        (url.into(), state.secret().to_owned())
    }

    /// Trade the code from the consent redirect for a token pair.
    ///
    /// # Errors
    /// - [`Error::Authentication`] if the code is rejected or the response
    ///   carries no refresh token
    pub async fn exchange_code(&self, code: &str) -> Result<Tokens> {
        let response = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_owned()))
            .request_async(&self.http)
            .await
            .map_err(|e| Error::Authentication(format!("Code exchange rejected: {}", e)))?;

        let Some(refresh) = response.refresh_token() else {
            return Err(Error::Authentication(
                "Sign-in returned no refresh token; offline access was not granted".to_string(),
            ));
        };
        let refresh = refresh.secret().to_owned();
        Ok(into_tokens(&response, refresh))
    }

    /// Get a new access token. The old refresh token is kept unless the
    /// provider rotates it.
    ///
    /// # Errors
    /// - [`Error::Authentication`] if the refresh token is revoked or invalid
    /// - [`Error::Network`] if the token endpoint cannot be reached
    /// - [`Error::Timeout`] if the endpoint does not answer in time
    pub async fn refresh_token(&self, refresh_token: &str) -> Result<Tokens> {
        let response = with_deadline(DEFAULT_REQUEST_TIMEOUT, "token refresh", async {
            self.client
                .exchange_refresh_token(&RefreshToken::new(refresh_token.to_owned()))
                .request_async(&self.http)
                .await
                .map_err(refresh_error)
        })
        .await?;

        let refresh = match response.refresh_token() {
            Some(rotated) => rotated.secret().to_owned(),
            None => refresh_token.to_owned(),
        };
        Ok(into_tokens(&response, refresh))
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }
}

fn refresh_error<RE>(e: RequestTokenError<RE, BasicErrorResponse>) -> Error
where
    RE: std::error::Error + 'static,
{
    match e {
        RequestTokenError::ServerResponse(response) => {
            Error::Authentication(format!("Refresh rejected: {}", response))
        }
        other => Error::Network(format!("Token endpoint failed: {}", other)),
    }
}

fn into_tokens(response: &BasicTokenResponse, refresh_token: String) -> Tokens {
    let lifetime = response
        .expires_in()
        .unwrap_or(std::time::Duration::from_secs(DEFAULT_LIFETIME_SECS));
    let expires_at = Utc::now()
        + Duration::from_std(lifetime).unwrap_or(Duration::seconds(DEFAULT_LIFETIME_SECS as i64));

    // An omitted scope field means the requested scope was granted.
    let scopes = match response.scopes() {
        Some(granted) => granted.iter().map(|s| s.as_str().to_owned()).collect(),
        None => vec![DRIVE_SCOPE.to_string()],
    };

    Tokens {
        access_token: response.access_token().secret().to_owned(),
        refresh_token,
        expires_at,
        scopes,
    }
}

/// [`SessionProvider`] backed by stored OAuth tokens.
///
/// The session is the token pair held in memory. Silent sign-in refreshes
/// the access token; a missing scope cannot be granted without the consent
/// screen, so elevation reports the credential as unavailable.
pub struct OAuthSessionProvider {
    auth_manager: AuthManager,
    tokens: RwLock<Option<Tokens>>,
}

impl OAuthSessionProvider {
    /// Create a provider, optionally seeded with tokens from a previous login.
    pub fn new(auth_manager: AuthManager, tokens: Option<Tokens>) -> Self {
        Self {
            auth_manager,
            tokens: RwLock::new(tokens),
        }
    }

    /// Current tokens, e.g. to persist them after a refresh.
    pub async fn tokens(&self) -> Option<Tokens> {
        self.tokens.read().await.clone()
    }

    fn session_of(tokens: &Tokens) -> Session {
        Session {
            account: "drive".to_string(),
            scopes: tokens.scopes.clone(),
        }
    }
}

#[async_trait]
impl SessionProvider for OAuthSessionProvider {
    async fn current_session(&self) -> std::result::Result<Option<Session>, CredentialError> {
        let tokens = self.tokens.read().await;
        Ok(tokens
            .as_ref()
            .filter(|t| !t.is_expired())
            .map(Self::session_of))
    }

    async fn silent_sign_in(&self) -> std::result::Result<Option<Session>, CredentialError> {
        let mut tokens = self.tokens.write().await;
        let Some(current) = tokens.as_ref() else {
            return Ok(None);
        };

        info!("Refreshing expired access token");
        match self.auth_manager.refresh_token(&current.refresh_token).await {
            Ok(fresh) => {
                let session = Self::session_of(&fresh);
                *tokens = Some(fresh);
                Ok(Some(session))
            }
            Err(Error::Authentication(msg)) => {
                warn!("Silent sign-in rejected: {}", msg);
                Ok(None)
            }
            Err(Error::Timeout(msg)) => Err(CredentialError::Timeout(msg)),
            Err(e) => Err(CredentialError::Failed(e.to_string())),
        }
    }

    async fn request_scope(
        &self,
        _session: &Session,
        scope: &str,
    ) -> std::result::Result<Option<Session>, CredentialError> {
        warn!(scope, "Scope elevation requires interactive consent");
        Ok(None)
    }

    async fn issue_token(
        &self,
        _session: &Session,
        scope: &str,
    ) -> std::result::Result<AccessToken, CredentialError> {
        let tokens = self.tokens.read().await;
        tokens
            .as_ref()
            .map(|t| AccessToken::new(t.access_token.clone(), scope))
            .ok_or_else(|| CredentialError::Unavailable("Signed out".to_string()))
    }
}
