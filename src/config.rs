use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{PipelineError, Result};
use crate::providers::{ExchangeSettings, GmailSettings};
use crate::retry::RetryPolicy;

pub const ENV_EXCHANGE_CLIENT_SECRET: &str = "MAIL_CATEGORIZER_EXCHANGE_CLIENT_SECRET";
pub const ENV_EXCHANGE_CLIENT_STATE: &str = "MAIL_CATEGORIZER_EXCHANGE_CLIENT_STATE";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub gmail: GmailConfig,
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub labels: LabelConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GmailConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Registry name
    #[serde(default = "default_gmail_name")]
    pub name: String,
    /// OAuth client secret downloaded from the Google Cloud console
    #[serde(default = "default_credentials_path")]
    pub credentials_path: PathBuf,
    #[serde(default = "default_gmail_token_path")]
    pub token_path: PathBuf,
    #[serde(default = "default_user_id")]
    pub user_id: String,
    /// Pub/Sub topic for push notifications
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_name: Option<String>,
    #[serde(default = "default_watch_label_ids")]
    pub watch_label_ids: Vec<String>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,
    #[serde(default = "default_quota_units")]
    pub quota_units_per_second: f64,
    /// Override for the Gmail API root, e.g. a local emulator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_root: Option<String>,
}

impl Default for GmailConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name: default_gmail_name(),
            credentials_path: default_credentials_path(),
            token_path: default_gmail_token_path(),
            user_id: default_user_id(),
            topic_name: None,
            watch_label_ids: default_watch_label_ids(),
            max_concurrent_requests: default_max_concurrent(),
            quota_units_per_second: default_quota_units(),
            api_root: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_exchange_name")]
    pub name: String,
    #[serde(default = "default_exchange_token_path")]
    pub token_path: PathBuf,
    #[serde(default = "default_tenant")]
    pub tenant: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default = "default_exchange_scope")]
    pub scope: String,
    #[serde(default = "default_graph_base_url")]
    pub graph_base_url: String,
    /// Public URL Graph posts change notifications to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_url: Option<String>,
    #[serde(default)]
    pub client_state: String,
    #[serde(default = "default_subscription_lifetime_secs")]
    pub subscription_lifetime_secs: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            name: default_exchange_name(),
            token_path: default_exchange_token_path(),
            tenant: default_tenant(),
            client_id: String::new(),
            client_secret: String::new(),
            scope: default_exchange_scope(),
            graph_base_url: default_graph_base_url(),
            notification_url: None,
            client_state: String::new(),
            subscription_lifetime_secs: default_subscription_lifetime_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

/// Where refreshed credentials are persisted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialStoreKind {
    /// One JSON token file per provider
    #[default]
    File,
    /// `auth_users` rows in the audit database
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Refresh this many seconds before the access token expires
    #[serde(default = "default_refresh_skew_secs")]
    pub refresh_skew_secs: i64,
    #[serde(default)]
    pub store: CredentialStoreKind,
    /// Row key for the sqlite store
    #[serde(default = "default_user_id")]
    pub user_id: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            refresh_skew_secs: default_refresh_skew_secs(),
            store: CredentialStoreKind::default(),
            user_id: default_user_id(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Deadline for each remote call attempt
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_classify_timeout_secs")]
    pub classify_timeout_secs: u64,
    /// Deadline for one push notification item
    #[serde(default = "default_item_timeout_secs")]
    pub item_timeout_secs: u64,
    #[serde(default = "default_fetch_count")]
    pub fetch_count: usize,
    #[serde(default = "default_window_hours")]
    pub window_hours: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
            classify_timeout_secs: default_classify_timeout_secs(),
            item_timeout_secs: default_item_timeout_secs(),
            fetch_count: default_fetch_count(),
            window_hours: default_window_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// SQLite database; set to "" to keep the audit log in memory
    #[serde(default = "default_database_path", skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

impl AuditConfig {
    /// Configured database file; an empty path selects the in-memory log
    pub fn database(&self) -> Option<&Path> {
        self.database_path
            .as_deref()
            .filter(|path| !path.as_os_str().is_empty())
    }
}

fn default_true() -> bool {
    true
}

fn default_gmail_name() -> String {
    "gmail".to_string()
}

fn default_exchange_name() -> String {
    "exchange".to_string()
}

fn default_credentials_path() -> PathBuf {
    PathBuf::from("credentials.json")
}

fn default_gmail_token_path() -> PathBuf {
    PathBuf::from(".mail-categorizer/gmail-token.json")
}

fn default_exchange_token_path() -> PathBuf {
    PathBuf::from(".mail-categorizer/exchange-token.json")
}

fn default_user_id() -> String {
    "me".to_string()
}

fn default_watch_label_ids() -> Vec<String> {
    vec!["INBOX".to_string()]
}

fn default_max_concurrent() -> usize {
    10
}

fn default_quota_units() -> f64 {
    crate::rate_limiter::DEFAULT_UNITS_PER_SECOND
}

fn default_tenant() -> String {
    "common".to_string()
}

fn default_exchange_scope() -> String {
    "offline_access https://graph.microsoft.com/Mail.ReadWrite https://graph.microsoft.com/MailboxSettings.ReadWrite".to_string()
}

fn default_graph_base_url() -> String {
    crate::providers::exchange::GRAPH_API_BASE.to_string()
}

fn default_subscription_lifetime_secs() -> u64 {
    3600
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_refresh_skew_secs() -> i64 {
    crate::credentials::DEFAULT_REFRESH_SKEW_SECS
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_classify_timeout_secs() -> u64 {
    30
}

fn default_item_timeout_secs() -> u64 {
    60
}

fn default_fetch_count() -> usize {
    50
}

fn default_window_hours() -> u32 {
    24
}

fn default_database_path() -> Option<PathBuf> {
    Some(PathBuf::from(".mail-categorizer/audit.db"))
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            let mut config = Self::default();
            config.apply_env_overrides();
            return Ok(config);
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| PipelineError::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Self = toml::from_str(&content)
            .map_err(|e| PipelineError::Config(format!("Failed to parse config file: {}", e)))?;

        config.apply_env_overrides();
        config.validate()?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Secrets that should not live in the config file
    fn apply_env_overrides(&mut self) {
        if let Ok(secret) = std::env::var(ENV_EXCHANGE_CLIENT_SECRET) {
            self.exchange.client_secret = secret;
        }
        if let Ok(state) = std::env::var(ENV_EXCHANGE_CLIENT_STATE) {
            self.exchange.client_state = state;
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    PipelineError::Config(format!("Failed to create config directory: {}", e))
                })?;
            }
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| PipelineError::Config(format!("Failed to serialize config: {}", e)))?;

        tokio::fs::write(path, content)
            .await
            .map_err(|e| PipelineError::Config(format!("Failed to write config file: {}", e)))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !self.gmail.enabled && !self.exchange.enabled {
            return Err(config_error("at least one of gmail or exchange must be enabled"));
        }

        if self.gmail.enabled {
            if self.gmail.name.is_empty() {
                return Err(config_error("gmail.name cannot be empty"));
            }
            if self.gmail.credentials_path.as_os_str().is_empty() {
                return Err(config_error("gmail.credentials_path cannot be empty"));
            }
            if self.gmail.token_path.as_os_str().is_empty() {
                return Err(config_error("gmail.token_path cannot be empty"));
            }
            // Gmail allows 250 quota units per second per user
            if self.gmail.max_concurrent_requests == 0 || self.gmail.max_concurrent_requests > 50 {
                return Err(config_error("gmail.max_concurrent_requests must be between 1 and 50"));
            }
            if self.gmail.quota_units_per_second.is_nan() || self.gmail.quota_units_per_second <= 0.0 {
                return Err(config_error("gmail.quota_units_per_second must be positive"));
            }
        }

        if self.exchange.enabled {
            if self.exchange.name.is_empty() {
                return Err(config_error("exchange.name cannot be empty"));
            }
            if self.exchange.token_path.as_os_str().is_empty() {
                return Err(config_error("exchange.token_path cannot be empty"));
            }
            if self.exchange.client_id.is_empty() {
                return Err(config_error("exchange.client_id is required when exchange is enabled"));
            }
            if self.exchange.subscription_lifetime_secs == 0 {
                return Err(config_error("exchange.subscription_lifetime_secs must be greater than 0"));
            }
        }

        if self.gmail.enabled && self.exchange.enabled && self.gmail.name == self.exchange.name {
            return Err(config_error("gmail.name and exchange.name must differ"));
        }

        if self.labels.cache_ttl_secs == 0 {
            return Err(config_error("labels.cache_ttl_secs must be greater than 0"));
        }

        if self.auth.refresh_skew_secs < 0 {
            return Err(config_error("auth.refresh_skew_secs cannot be negative"));
        }
        if self.auth.store == CredentialStoreKind::Sqlite {
            if !cfg!(feature = "sqlite") {
                return Err(config_error("auth.store = \"sqlite\" requires the sqlite feature"));
            }
            if self.audit.database().is_none() {
                return Err(config_error("auth.store = \"sqlite\" requires audit.database_path"));
            }
        }

        if self.pipeline.request_timeout_secs == 0 {
            return Err(config_error("pipeline.request_timeout_secs must be greater than 0"));
        }
        if self.pipeline.classify_timeout_secs == 0 {
            return Err(config_error("pipeline.classify_timeout_secs must be greater than 0"));
        }
        if self.pipeline.item_timeout_secs == 0 {
            return Err(config_error("pipeline.item_timeout_secs must be greater than 0"));
        }
        if self.pipeline.fetch_count == 0 {
            return Err(config_error("pipeline.fetch_count must be at least 1"));
        }
        if self.pipeline.window_hours == 0 {
            return Err(config_error("pipeline.window_hours must be at least 1"));
        }

        tracing::debug!("Configuration validation passed");
        Ok(())
    }

    /// Default configuration rendered as TOML
    pub fn example_toml() -> Result<String> {
        toml::to_string_pretty(&Self::default())
            .map_err(|e| PipelineError::Config(format!("Failed to serialize config: {}", e)))
    }

    pub async fn create_example(path: &Path) -> Result<()> {
        Self::default().save(path).await
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.pipeline.max_retries,
            timeout: Duration::from_secs(self.pipeline.request_timeout_secs),
            ..RetryPolicy::default()
        }
    }

    pub fn label_ttl(&self) -> Duration {
        Duration::from_secs(self.labels.cache_ttl_secs)
    }

    pub fn refresh_skew(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.auth.refresh_skew_secs)
    }

    pub fn gmail_settings(&self) -> GmailSettings {
        GmailSettings {
            user_id: self.gmail.user_id.clone(),
            topic_name: self.gmail.topic_name.clone(),
            watch_label_ids: self.gmail.watch_label_ids.clone(),
            max_concurrent_requests: self.gmail.max_concurrent_requests,
            quota_units_per_second: self.gmail.quota_units_per_second,
            api_root: self.gmail.api_root.clone(),
            label_ttl: self.label_ttl(),
            retry: self.retry_policy(),
        }
    }

    pub fn exchange_settings(&self) -> ExchangeSettings {
        ExchangeSettings {
            graph_base_url: self.exchange.graph_base_url.clone(),
            notification_url: self.exchange.notification_url.clone(),
            client_state: self.exchange.client_state.clone(),
            subscription_lifetime: Duration::from_secs(self.exchange.subscription_lifetime_secs),
            label_ttl: self.label_ttl(),
            retry: self.retry_policy(),
        }
    }
}

fn config_error(message: &str) -> PipelineError {
    PipelineError::Config(message.to_string())
}
