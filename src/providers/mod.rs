//! Provider clients
//!
//! An [`EmailProvider`] composes a credential guard, a label registry and the
//! provider's remote API. One implementation exists per provider; they share
//! no base type.

pub mod exchange;
pub mod gmail;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::adapter::EmailAdapter;
use crate::error::Result;
use crate::models::{Label, Message, RemoteLabelHandle};

pub use exchange::{ExchangeProvider, ExchangeSettings};
pub use gmail::{GmailProvider, GmailSettings};

/// Bounds for a bulk fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchQuery {
    /// Maximum number of messages
    pub count: usize,
    /// Only messages received within this many hours
    pub window_hours: u32,
}

impl FetchQuery {
    pub fn new(count: usize, window_hours: u32) -> Self {
        Self {
            count,
            window_hours,
        }
    }
}

#[async_trait]
pub trait EmailProvider: Send + Sync {
    /// Registry name, e.g. `gmail`
    fn name(&self) -> &str;

    /// Adapter for this provider's raw payloads
    fn adapter(&self) -> Arc<dyn EmailAdapter>;

    /// Most recent messages, newest first. Payloads that fail validation are
    /// logged and skipped.
    async fn fetch_last_emails(&self, query: FetchQuery) -> Result<Vec<Message>>;

    /// Resolve `label` remotely, attach it to the message and return the
    /// message with the label appended
    async fn apply_label(&self, message: Message, label: &Label) -> Result<Message>;

    /// Ensure every label in `labels` exists remotely
    async fn ensure_labels(&self, labels: &[Label]) -> Result<Vec<RemoteLabelHandle>>;

    /// Register the push subscription
    async fn listen_for_incoming_emails(&self) -> Result<()>;

    /// Remove the push subscription
    async fn stop_listening(&self) -> Result<()>;

    /// Split a webhook body into its notification items. No I/O.
    fn notification_items(&self, body: &Value) -> Result<Vec<Value>>;

    /// Fetch or decode the raw message resources one notification refers to
    async fn resolve_notification(&self, item: &Value) -> Result<Vec<Value>>;

    /// Called once every message an item resolved to was handled without
    /// error. Providers that track a delivery cursor advance it here.
    async fn acknowledge_notification(&self, _item: &Value) -> Result<()> {
        Ok(())
    }
}

/// Validate and adapt raw payloads, logging and dropping invalid ones
pub(crate) fn adapt_valid(adapter: &dyn EmailAdapter, provider: &str, raw: &[Value]) -> Vec<Message> {
    raw.iter()
        .filter_map(|payload| {
            if adapter.validate(payload) {
                Some(adapter.adapt(payload))
            } else {
                for diagnostic in adapter.take_diagnostics() {
                    tracing::warn!(provider = %provider, "{}", diagnostic);
                }
                None
            }
        })
        .collect()
}
