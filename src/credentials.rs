//! OAuth credential lifecycle
//!
//! A [`CredentialManager`] owns the credential for one (provider, account)
//! pair. It loads the credential from a [`CredentialStore`] on first use,
//! refreshes it through a [`TokenRefresher`] when it is within the refresh
//! skew of expiring, and persists every refreshed credential.
//!
//! Check-and-refresh runs under a single async mutex, so concurrent callers
//! that all observe an expiring token trigger exactly one refresh.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};

/// Refresh this long before the recorded expiry
pub const DEFAULT_REFRESH_SKEW_SECS: i64 = 300;

pub const GOOGLE_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Deadline for one token endpoint round trip
pub const DEFAULT_TOKEN_TIMEOUT_SECS: u64 = 30;

/// An OAuth access credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expiry_date: Option<DateTime<Utc>>,
}

impl Credential {
    /// True when the access token is missing or expires within `skew` of `now`.
    /// A credential without a recorded expiry is refreshed if it can be.
    pub fn needs_refresh_at(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        if self.access_token.is_empty() {
            return true;
        }
        match self.expiry_date {
            Some(expiry) => now >= expiry - skew,
            None => self.refresh_token.is_some(),
        }
    }
}

fn default_credential_type() -> String {
    "authorized_user".to_string()
}

/// Persisted credential document
///
/// Matches the Google `authorized_user` layout; `expiry_date` is epoch
/// milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialDocument {
    #[serde(rename = "type", default = "default_credential_type")]
    pub kind: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub expiry_date: Option<DateTime<Utc>>,
}

impl CredentialDocument {
    fn into_credential(self) -> Credential {
        Credential {
            access_token: self.access_token.unwrap_or_default(),
            refresh_token: self.refresh_token,
            expiry_date: self.expiry_date,
        }
    }
}

// ============================================================================
// Persistence
// ============================================================================

/// Where a credential lives between process runs
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self) -> Result<Option<Credential>>;
    async fn save(&self, credential: &Credential) -> Result<()>;
    async fn delete(&self) -> Result<()>;
}

/// Single-operator store: one JSON document on disk
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
    client_id: String,
    client_secret: String,
}

impl FileCredentialStore {
    pub fn new(
        path: impl Into<PathBuf>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self) -> Result<Option<Credential>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let document: CredentialDocument = serde_json::from_str(&content)?;
        debug!("Loaded credential from {}", self.path.display());
        Ok(Some(document.into_credential()))
    }

    async fn save(&self, credential: &Credential) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let document = CredentialDocument {
            kind: default_credential_type(),
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            refresh_token: credential.refresh_token.clone(),
            access_token: Some(credential.access_token.clone()),
            expiry_date: credential.expiry_date,
        };
        let content = serde_json::to_string_pretty(&document)?;
        tokio::fs::write(&self.path, content).await?;
        secure_token_file(&self.path).await?;
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Restrict a token file to its owner (0600)
#[cfg(unix)]
pub async fn secure_token_file(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = tokio::fs::metadata(path).await?.permissions();
    perms.set_mode(0o600);
    tokio::fs::set_permissions(path, perms).await?;
    Ok(())
}

/// Windows relies on the profile directory ACLs
#[cfg(not(unix))]
pub async fn secure_token_file(_path: &Path) -> Result<()> {
    Ok(())
}

/// Multi-tenant store: one `auth_users` row per (provider, user)
#[cfg(feature = "sqlite")]
#[derive(Debug, Clone)]
pub struct SqliteCredentialStore {
    db: crate::database::Database,
    provider: String,
    user_id: String,
}

#[cfg(feature = "sqlite")]
impl SqliteCredentialStore {
    pub fn new(
        db: crate::database::Database,
        provider: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            db,
            provider: provider.into(),
            user_id: user_id.into(),
        }
    }
}

#[cfg(feature = "sqlite")]
#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    async fn load(&self) -> Result<Option<Credential>> {
        use rusqlite::OptionalExtension;

        let provider = self.provider.clone();
        let user_id = self.user_id.clone();
        self.db
            .with_conn(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT access_token, refresh_token, expiry_date FROM auth_users
                         WHERE provider = ?1 AND user_id = ?2",
                        rusqlite::params![provider, user_id],
                        |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, Option<String>>(1)?,
                                row.get::<_, Option<i64>>(2)?,
                            ))
                        },
                    )
                    .optional()?;
                Ok(row.map(|(access_token, refresh_token, expiry)| Credential {
                    access_token,
                    refresh_token,
                    expiry_date: expiry.and_then(DateTime::from_timestamp_millis),
                }))
            })
            .await
    }

    async fn save(&self, credential: &Credential) -> Result<()> {
        let provider = self.provider.clone();
        let user_id = self.user_id.clone();
        let credential = credential.clone();
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO auth_users (provider, user_id, access_token, refresh_token, expiry_date, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT (provider, user_id) DO UPDATE SET
                        access_token = excluded.access_token,
                        refresh_token = excluded.refresh_token,
                        expiry_date = excluded.expiry_date,
                        updated_at = excluded.updated_at",
                    rusqlite::params![
                        provider,
                        user_id,
                        credential.access_token,
                        credential.refresh_token,
                        credential.expiry_date.map(|d| d.timestamp_millis()),
                        Utc::now().to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    async fn delete(&self) -> Result<()> {
        let provider = self.provider.clone();
        let user_id = self.user_id.clone();
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "DELETE FROM auth_users WHERE provider = ?1 AND user_id = ?2",
                    rusqlite::params![provider, user_id],
                )?;
                Ok(())
            })
            .await
    }
}

// ============================================================================
// Token refresh
// ============================================================================

/// Exchanges a refresh token for a new access credential
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<Credential>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// `grant_type=refresh_token` against an OAuth 2.0 token endpoint
#[derive(Debug, Clone)]
pub struct OAuthTokenEndpoint {
    http: reqwest::Client,
    token_uri: String,
    client_id: String,
    client_secret: Option<String>,
    scope: Option<String>,
    timeout: std::time::Duration,
}

impl OAuthTokenEndpoint {
    pub fn new(token_uri: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            token_uri: token_uri.into(),
            client_id: client_id.into(),
            client_secret: None,
            scope: None,
            timeout: std::time::Duration::from_secs(DEFAULT_TOKEN_TIMEOUT_SECS),
        }
    }

    /// Google endpoint from an installed-app `credentials.json` secret
    pub fn google(secret: &google_gmail1::yup_oauth2::ApplicationSecret) -> Self {
        let token_uri = if secret.token_uri.is_empty() {
            GOOGLE_TOKEN_URI.to_string()
        } else {
            secret.token_uri.clone()
        };
        Self::new(token_uri, secret.client_id.clone())
            .with_client_secret(secret.client_secret.clone())
    }

    /// Microsoft identity platform v2 endpoint for a tenant
    pub fn microsoft(tenant: &str, client_id: impl Into<String>) -> Self {
        Self::new(
            format!(
                "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
                tenant
            ),
            client_id,
        )
    }

    pub fn with_client_secret(mut self, client_secret: impl Into<String>) -> Self {
        let client_secret = client_secret.into();
        self.client_secret = (!client_secret.is_empty()).then_some(client_secret);
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }
}

#[async_trait]
impl TokenRefresher for OAuthTokenEndpoint {
    async fn refresh(&self, refresh_token: &str) -> Result<Credential> {
        tokio::time::timeout(self.timeout, self.request_token(refresh_token))
            .await
            .map_err(|_| {
                PipelineError::Timeout(format!(
                    "Token refresh did not complete within {:?}",
                    self.timeout
                ))
            })?
    }
}

impl OAuthTokenEndpoint {
    async fn request_token(&self, refresh_token: &str) -> Result<Credential> {
        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
            ("client_id", self.client_id.clone()),
        ];
        if let Some(client_secret) = &self.client_secret {
            form.push(("client_secret", client_secret.clone()));
        }
        if let Some(scope) = &self.scope {
            form.push(("scope", scope.clone()));
        }

        let response = self.http.post(&self.token_uri).form(&form).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let reason = match serde_json::from_str::<TokenErrorResponse>(&body) {
                Ok(err) => match err.error_description {
                    Some(description) => format!("{}: {}", err.error, description),
                    None => err.error,
                },
                Err(_) => format!("HTTP {}", status.as_u16()),
            };
            return Err(PipelineError::Auth(format!("Token refresh failed: {}", reason)));
        }

        let payload: TokenResponse = response.json().await?;
        Ok(Credential {
            access_token: payload.access_token,
            refresh_token: payload.refresh_token,
            expiry_date: payload
                .expires_in
                .map(|secs| Utc::now() + Duration::seconds(secs)),
        })
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Contract every authenticated provider operation is gated on
#[async_trait]
pub trait CredentialLifecycle: Send + Sync {
    /// Current credential, loading it from storage on first use
    async fn get_authenticated_client(&self) -> Result<Credential>;

    /// True when no credential is held or it expires within the refresh skew
    async fn needs_token_refresh(&self) -> bool;

    /// Refresh and persist the credential if it needs it; returns the
    /// credential that is valid afterwards
    async fn refresh_token_if_needed(&self) -> Result<Credential>;
}

pub struct CredentialManager {
    label: String,
    store: Arc<dyn CredentialStore>,
    refresher: Arc<dyn TokenRefresher>,
    state: Mutex<Option<Credential>>,
    skew: Duration,
}

impl CredentialManager {
    pub fn new(
        label: impl Into<String>,
        store: Arc<dyn CredentialStore>,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Self {
        Self {
            label: label.into(),
            store,
            refresher,
            state: Mutex::new(None),
            skew: Duration::seconds(DEFAULT_REFRESH_SKEW_SECS),
        }
    }

    pub fn with_refresh_skew(mut self, skew: Duration) -> Self {
        self.skew = skew;
        self
    }

    /// Persist a credential obtained from a fresh OAuth exchange
    pub async fn install(&self, credential: Credential) -> Result<()> {
        let mut state = self.state.lock().await;
        self.store.save(&credential).await?;
        *state = Some(credential);
        Ok(())
    }

    /// Drop the held credential and delete the persisted one
    pub async fn revoke(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        *state = None;
        self.store.delete().await?;
        info!(account = %self.label, "Credential revoked");
        Ok(())
    }

    async fn load_into(&self, state: &mut Option<Credential>) -> Result<Credential> {
        if let Some(credential) = state.as_ref() {
            return Ok(credential.clone());
        }
        let credential = self.store.load().await?.ok_or_else(|| {
            PipelineError::Auth(format!(
                "No stored credential for {}; complete the OAuth consent flow first",
                self.label
            ))
        })?;
        *state = Some(credential.clone());
        Ok(credential)
    }
}

#[async_trait]
impl CredentialLifecycle for CredentialManager {
    async fn get_authenticated_client(&self) -> Result<Credential> {
        let mut state = self.state.lock().await;
        self.load_into(&mut state).await
    }

    async fn needs_token_refresh(&self) -> bool {
        let state = self.state.lock().await;
        match state.as_ref() {
            Some(credential) => credential.needs_refresh_at(Utc::now(), self.skew),
            None => true,
        }
    }

    async fn refresh_token_if_needed(&self) -> Result<Credential> {
        // Held across the whole check-and-refresh sequence
        let mut state = self.state.lock().await;
        let current = self.load_into(&mut state).await?;

        if !current.needs_refresh_at(Utc::now(), self.skew) {
            return Ok(current);
        }

        let refresh_token = current.refresh_token.clone().ok_or_else(|| {
            PipelineError::Auth(format!(
                "Access token for {} expired and no refresh token is stored",
                self.label
            ))
        })?;

        debug!(account = %self.label, "Refreshing access token");
        let mut refreshed = match self.refresher.refresh(&refresh_token).await {
            Ok(credential) => credential,
            Err(e) => {
                warn!(account = %self.label, "Token refresh failed: {}", e);
                return Err(e);
            }
        };
        if refreshed.refresh_token.is_none() {
            refreshed.refresh_token = Some(refresh_token);
        }

        self.store.save(&refreshed).await?;
        *state = Some(refreshed.clone());
        info!(
            account = %self.label,
            expires = ?refreshed.expiry_date,
            "Access token refreshed"
        );
        Ok(refreshed)
    }
}
