//! Mail Categorizer
//!
//! Provider-agnostic email ingestion and categorization for Gmail and
//! Exchange (Microsoft Graph) mailboxes.
//!
//! # Overview
//!
//! Messages arrive either from a bulk fetch or from a provider push
//! notification. Each raw payload is validated and normalized by the
//! provider's adapter, classified, and labelled on the remote mailbox at
//! most once. Every processed message leaves an audit record, which also
//! lets re-delivered notifications be recognised and skipped.
//!
//! - **Adapters**: provider JSON to the canonical [`Message`]
//! - **Credentials**: stored OAuth tokens refreshed ahead of expiry, one
//!   refresh at a time per account
//! - **Label registry**: TTL-cached remote labels with serialized creation and
//!   conflict recovery
//! - **Categorization**: classifier call, confidence clamping, label
//!   application and audit
//! - **Push processing**: webhook batches with per-item isolation and timeouts
//!
//! # Example Usage
//!
//! ```no_run
//! use mail_categorizer::{config::Config, context::AppContext};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml".as_ref()).await?;
//!     let ctx = AppContext::initialize(&config).await?;
//!
//!     let query = ctx.fetch_query(None, None);
//!     let report = ctx
//!         .registry()
//!         .fetch_and_categorize(ctx.categorizer(), "*", query)
//!         .await?;
//!     println!("categorized {} message(s)", report.categorized);
//!
//!     ctx.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`adapter`] - Gmail and Exchange payload validation and normalization
//! - [`audit`] - Append-only record of processed objects
//! - [`auth`] - Authentication guard in front of every remote call
//! - [`categorizer`] - At-most-once labelling of a message
//! - [`classifier`] - Classifier seam and the built-in rule classifier
//! - [`cli`] - Command-line interface
//! - [`config`] - Configuration management
//! - [`context`] - Startup wiring and teardown
//! - [`credentials`] - Credential storage and refresh lifecycle
//! - [`error`] - Error types and result aliases
//! - [`label_registry`] - Remote label cache and creation mutex
//! - [`models`] - Canonical message and label vocabulary
//! - [`providers`] - Gmail and Exchange clients
//! - [`push`] - Webhook batch processing
//! - [`rate_limiter`] - Gmail quota-unit token bucket
//! - [`registry`] - Active provider clients
//! - [`retry`] - Timeouts and exponential backoff for remote calls

pub mod adapter;
pub mod audit;
pub mod auth;
pub mod categorizer;
pub mod classifier;
pub mod cli;
pub mod config;
pub mod context;
pub mod credentials;
#[cfg(feature = "sqlite")]
pub mod database;
pub mod error;
pub mod label_registry;
pub mod models;
pub mod providers;
pub mod push;
pub mod rate_limiter;
pub mod registry;
pub mod retry;

pub use error::{PipelineError, Result};

pub use models::{Attachment, Classification, Label, Message, RemoteLabelHandle};

pub use adapter::{EmailAdapter, ExchangeAdapter, GmailAdapter};
pub use audit::{AuditLog, AuditRecord, MemoryAuditLog, ObjectType};
pub use categorizer::CategorizationService;
pub use classifier::{Classifier, RuleClassifier};
pub use config::Config;
pub use context::AppContext;
pub use credentials::{
    Credential, CredentialLifecycle, CredentialManager, CredentialStore, FileCredentialStore,
    OAuthTokenEndpoint, TokenRefresher,
};
pub use label_registry::{LabelRegistry, RemoteLabelApi};
pub use providers::{
    EmailProvider, ExchangeProvider, ExchangeSettings, FetchQuery, GmailProvider, GmailSettings,
};
pub use push::{BatchReport, PushNotificationProcessor};
pub use registry::{ProviderRegistry, RunReport};
