//! Authentication guard for remote API handles
//!
//! Every authenticated provider operation starts with
//! [`AuthGuard::ensure_authenticated`]. The guard refreshes the credential
//! when it is about to expire and rebuilds the remote-API handle whenever the
//! access token it was built from has changed.

use google_gmail1::{hyper_rustls, hyper_util, yup_oauth2, Gmail};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::credentials::{Credential, CredentialLifecycle};
use crate::error::{PipelineError, Result};

/// Gmail scope used for reading messages and mutating labels
pub const GMAIL_MODIFY_SCOPE: &str = "https://www.googleapis.com/auth/gmail.modify";

/// TLS connector the Gmail hub is built on
pub type GmailConnector =
    hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>;

/// Type alias for Gmail Hub to simplify type signatures
pub type GmailHub = Gmail<GmailConnector>;

/// Builds a remote-API handle from a credential
pub type HandleBuilder<H> = Box<dyn Fn(&Credential) -> Result<H> + Send + Sync>;

struct Session<H> {
    access_token: String,
    handle: Arc<H>,
}

/// Gate in front of a remote-API handle of type `H`
pub struct AuthGuard<H> {
    credentials: Arc<dyn CredentialLifecycle>,
    builder: HandleBuilder<H>,
    session: Mutex<Option<Session<H>>>,
}

impl<H> AuthGuard<H> {
    pub fn new(credentials: Arc<dyn CredentialLifecycle>, builder: HandleBuilder<H>) -> Self {
        Self {
            credentials,
            builder,
            session: Mutex::new(None),
        }
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialLifecycle> {
        &self.credentials
    }

    /// Refresh if needed, then return a handle built from the current token.
    ///
    /// Refresh failures propagate unchanged and are never retried here.
    pub async fn ensure_authenticated(&self) -> Result<Arc<H>> {
        let credential = if self.credentials.needs_token_refresh().await {
            self.credentials.refresh_token_if_needed().await?
        } else {
            self.credentials.get_authenticated_client().await?
        };

        let mut session = self.session.lock().await;
        if let Some(current) = session.as_ref() {
            if current.access_token == credential.access_token {
                return Ok(current.handle.clone());
            }
        }

        debug!("Building remote API handle for a new access token");
        let handle = Arc::new((self.builder)(&credential)?);
        *session = Some(Session {
            access_token: credential.access_token,
            handle: handle.clone(),
        });
        Ok(handle)
    }

    /// Drop the cached handle so the next call rebuilds it
    pub async fn invalidate(&self) {
        *self.session.lock().await = None;
    }
}

/// HTTP/1 connector with native TLS roots that also accepts plain `http`
pub fn native_tls_connector() -> Result<GmailConnector> {
    Ok(hyper_rustls::HttpsConnectorBuilder::new()
        .with_native_roots()
        .map_err(|e| PipelineError::Auth(format!("Failed to load TLS roots: {}", e)))?
        .https_or_http()
        .enable_http1()
        .build())
}

/// Gmail hub on `connector`, authorised with a bare access token.
///
/// `api_root` replaces both the base and root URL when set.
pub fn gmail_hub(
    connector: GmailConnector,
    credential: &Credential,
    api_root: Option<&str>,
) -> GmailHub {
    let client = hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
        .build(connector);
    let mut hub = Gmail::new(client, credential.access_token.clone());
    if let Some(root) = api_root {
        let root = if root.ends_with('/') {
            root.to_string()
        } else {
            format!("{}/", root)
        };
        hub.base_url(root.clone());
        hub.root_url(root);
    }
    hub
}

/// Read the OAuth client id/secret from a Google `credentials.json`
pub async fn read_gmail_client_secret(path: &Path) -> Result<yup_oauth2::ApplicationSecret> {
    yup_oauth2::read_application_secret(path)
        .await
        .map_err(|e| PipelineError::Config(format!("Failed to read {}: {}", path.display(), e)))
}
