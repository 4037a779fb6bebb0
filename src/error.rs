use thiserror::Error;

/// Type alias for Result with PipelineError
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Error taxonomy for the ingestion and categorization pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Malformed provider payload. Adapters record these as diagnostics
    /// instead of returning them.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Missing, expired or unrefreshable credential
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Remote resource already exists (label creation race)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A label could not be found or created even after a forced refetch
    #[error("Unable to find or create label: {0}")]
    LabelResolution(String),

    /// Unknown provider, unknown label name or missing remote resource
    #[error("Not found: {0}")]
    NotFound(String),

    /// Any other remote failure
    #[error("Provider API error: {0}")]
    ProviderApi(String),

    /// Rate limit exceeded - should retry after specified seconds
    #[error("Rate limit exceeded, retry after {retry_after} seconds")]
    RateLimitExceeded { retry_after: u64 },

    /// Server returned 5xx error
    #[error("Server error (HTTP {status}): {message}")]
    ServerError { status: u16, message: String },

    /// Network-related error (connection issues, resets)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// A remote call or pipeline step exceeded its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The classifier failed or returned an unusable result
    #[error("Classification error: {0}")]
    Classification(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error (file operations, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// SQLite error from the credential or audit store
    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl PipelineError {
    /// Check if the error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::RateLimitExceeded { .. }
                | PipelineError::ServerError { .. }
                | PipelineError::NetworkError(_)
                | PipelineError::Timeout(_)
        )
    }

    /// Check if the error is permanent and should not be retried
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Map an HTTP status from any provider to the pipeline taxonomy
    pub fn from_status(status: u16, message: impl Into<String>, retry_after: Option<u64>) -> Self {
        let message = message.into();
        match status {
            401 => PipelineError::Auth(message),
            404 => PipelineError::NotFound(message),
            409 => PipelineError::Conflict(message),
            429 => PipelineError::RateLimitExceeded {
                retry_after: retry_after.unwrap_or(DEFAULT_RETRY_AFTER),
            },
            500..=599 => PipelineError::ServerError { status, message },
            _ => PipelineError::ProviderApi(format!("HTTP {}: {}", status, message)),
        }
    }
}

const DEFAULT_RETRY_AFTER: u64 = 5;

/// Parse a Retry-After header value given in delay-seconds.
///
/// HTTP-date values and garbage fall back to the default of 5 seconds.
pub(crate) fn parse_retry_after(value: Option<&str>) -> u64 {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

impl From<google_gmail1::Error> for PipelineError {
    fn from(error: google_gmail1::Error) -> Self {
        match error {
            // Non-success response without a JSON error body
            google_gmail1::Error::Failure(ref response) => {
                let status = response.status();
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok());
                let retry_after = Some(parse_retry_after(retry_after));
                PipelineError::from_status(
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("Unknown"),
                    retry_after,
                )
            }
            // Google returns `{"error": {"code": 409, "message": ...}}` for most failures
            google_gmail1::Error::BadRequest(ref value) => {
                let code = value
                    .pointer("/error/code")
                    .and_then(|c| c.as_u64())
                    .unwrap_or(400) as u16;
                let message = value
                    .pointer("/error/message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("Bad request")
                    .to_string();
                PipelineError::from_status(code, message, None)
            }
            google_gmail1::Error::MissingToken(ref err) => {
                PipelineError::Auth(format!("Missing token: {}", err))
            }
            google_gmail1::Error::HttpError(ref err) => {
                PipelineError::NetworkError(format!("Connection error: {}", err))
            }
            google_gmail1::Error::Io(err) => PipelineError::NetworkError(err.to_string()),
            _ => PipelineError::ProviderApi(error.to_string()),
        }
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            return PipelineError::Timeout(error.to_string());
        }
        if let Some(status) = error.status() {
            return PipelineError::from_status(status.as_u16(), error.to_string(), None);
        }
        if error.is_decode() {
            return PipelineError::ProviderApi(format!("Invalid response body: {}", error));
        }
        PipelineError::NetworkError(error.to_string())
    }
}
