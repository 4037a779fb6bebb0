//! Explicit application context built once at startup

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::audit::{AuditLog, MemoryAuditLog};
use crate::auth::read_gmail_client_secret;
use crate::categorizer::CategorizationService;
use crate::classifier::{Classifier, RuleClassifier};
use crate::config::{Config, CredentialStoreKind};
use crate::credentials::{
    CredentialLifecycle, CredentialManager, CredentialStore, FileCredentialStore,
    OAuthTokenEndpoint, TokenRefresher,
};
use crate::error::{PipelineError, Result};
use crate::providers::{ExchangeProvider, FetchQuery, GmailProvider};
use crate::push::PushNotificationProcessor;
use crate::registry::ProviderRegistry;

#[cfg(feature = "sqlite")]
use crate::database::Database;

/// Everything a command needs, wired together in one place
pub struct AppContext {
    config: Config,
    audit: Arc<dyn AuditLog>,
    categorizer: Arc<CategorizationService>,
    registry: Arc<ProviderRegistry>,
    push: Arc<PushNotificationProcessor>,
    listening: AtomicBool,
}

impl AppContext {
    /// Open the audit log and register every enabled provider
    pub async fn initialize(config: &Config) -> Result<Self> {
        config.validate()?;

        #[cfg(feature = "sqlite")]
        let database = match config.audit.database() {
            Some(path) => Some(Database::open(path).await?),
            None => None,
        };

        #[cfg(feature = "sqlite")]
        let audit: Arc<dyn AuditLog> = match &database {
            Some(db) => Arc::new(crate::audit::SqliteAuditLog::new(db.clone())),
            None => Arc::new(MemoryAuditLog::new()),
        };
        #[cfg(not(feature = "sqlite"))]
        let audit: Arc<dyn AuditLog> = {
            if config.audit.database().is_some() {
                warn!("Built without sqlite support, keeping the audit log in memory");
            }
            Arc::new(MemoryAuditLog::new())
        };

        let registry = Arc::new(ProviderRegistry::new());
        let stores = StoreFactory {
            config,
            #[cfg(feature = "sqlite")]
            database,
        };

        let token_timeout = Duration::from_secs(config.pipeline.request_timeout_secs);

        if config.gmail.enabled {
            let secret = read_gmail_client_secret(&config.gmail.credentials_path).await?;
            let store = stores.build(
                &config.gmail.name,
                &config.gmail.token_path,
                &secret.client_id,
                &secret.client_secret,
            )?;
            let refresher: Arc<dyn TokenRefresher> =
                Arc::new(OAuthTokenEndpoint::google(&secret).with_timeout(token_timeout));
            let credentials = credential_manager(config, &config.gmail.name, store, refresher);
            let provider = GmailProvider::new(
                config.gmail.name.clone(),
                credentials,
                config.gmail_settings(),
            );
            registry.add(config.gmail.name.clone(), Arc::new(provider)).await;
        }

        if config.exchange.enabled {
            let exchange = &config.exchange;
            let store = stores.build(
                &exchange.name,
                &exchange.token_path,
                &exchange.client_id,
                &exchange.client_secret,
            )?;
            let refresher: Arc<dyn TokenRefresher> = Arc::new(
                OAuthTokenEndpoint::microsoft(&exchange.tenant, exchange.client_id.clone())
                    .with_client_secret(exchange.client_secret.clone())
                    .with_scope(exchange.scope.clone())
                    .with_timeout(token_timeout),
            );
            let credentials = credential_manager(config, &exchange.name, store, refresher);
            let provider = ExchangeProvider::new(
                exchange.name.clone(),
                credentials,
                config.exchange_settings(),
            );
            registry.add(exchange.name.clone(), Arc::new(provider)).await;
        }

        let context = Self::from_parts(
            config.clone(),
            audit,
            Arc::new(RuleClassifier::new()),
            registry,
        );
        info!(
            providers = ?context.registry.names().await,
            "Application context initialized"
        );
        Ok(context)
    }

    /// Wire a context around an existing registry and audit log
    pub fn from_parts(
        config: Config,
        audit: Arc<dyn AuditLog>,
        classifier: Arc<dyn Classifier>,
        registry: Arc<ProviderRegistry>,
    ) -> Self {
        let categorizer = Arc::new(CategorizationService::new(
            classifier,
            audit.clone(),
            Duration::from_secs(config.pipeline.classify_timeout_secs),
        ));
        let push = Arc::new(
            PushNotificationProcessor::new(registry.clone(), categorizer.clone(), audit.clone())
                .with_item_timeout(Duration::from_secs(config.pipeline.item_timeout_secs)),
        );
        Self {
            config,
            audit,
            categorizer,
            registry,
            push,
            listening: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn audit(&self) -> &Arc<dyn AuditLog> {
        &self.audit
    }

    pub fn categorizer(&self) -> &Arc<CategorizationService> {
        &self.categorizer
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn push(&self) -> &Arc<PushNotificationProcessor> {
        &self.push
    }

    /// Configured fetch bounds, with optional overrides
    pub fn fetch_query(&self, count: Option<usize>, window_hours: Option<u32>) -> FetchQuery {
        FetchQuery::new(
            count.unwrap_or(self.config.pipeline.fetch_count),
            window_hours.unwrap_or(self.config.pipeline.window_hours),
        )
    }

    /// Start push subscriptions on every provider
    pub async fn listen(&self) -> Result<usize> {
        let started = self.registry.listen_all().await;
        self.listening.store(true, Ordering::SeqCst);
        started
    }

    /// Stop push subscriptions started through this context
    pub async fn shutdown(&self) -> Result<()> {
        if self.listening.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.registry.stop_all().await {
                warn!("Failed to stop every push subscription: {}", e);
                return Err(e);
            }
        }
        info!("Application context shut down");
        Ok(())
    }
}

/// Builds the configured credential store for each provider
struct StoreFactory<'a> {
    config: &'a Config,
    #[cfg(feature = "sqlite")]
    database: Option<Database>,
}

impl StoreFactory<'_> {
    fn build(
        &self,
        provider: &str,
        token_path: &Path,
        client_id: &str,
        client_secret: &str,
    ) -> Result<Arc<dyn CredentialStore>> {
        match self.config.auth.store {
            CredentialStoreKind::File => Ok(Arc::new(FileCredentialStore::new(
                token_path,
                client_id,
                client_secret,
            ))),
            #[cfg(feature = "sqlite")]
            CredentialStoreKind::Sqlite => {
                let db = self.database.clone().ok_or_else(|| {
                    PipelineError::Config(
                        "auth.store = \"sqlite\" requires audit.database_path".to_string(),
                    )
                })?;
                Ok(Arc::new(crate::credentials::SqliteCredentialStore::new(
                    db,
                    provider,
                    self.config.auth.user_id.clone(),
                )))
            }
            #[cfg(not(feature = "sqlite"))]
            CredentialStoreKind::Sqlite => Err(PipelineError::Config(format!(
                "Cannot store {} credentials in sqlite without the sqlite feature",
                provider
            ))),
        }
    }
}

fn credential_manager(
    config: &Config,
    provider: &str,
    store: Arc<dyn CredentialStore>,
    refresher: Arc<dyn TokenRefresher>,
) -> Arc<dyn CredentialLifecycle> {
    Arc::new(
        CredentialManager::new(provider, store, refresher).with_refresh_skew(config.refresh_skew()),
    )
}
