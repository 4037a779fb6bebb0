//! Webhook entry point: turns provider callbacks into categorization jobs
//!
//! A batch is split into items by the provider, and every item runs under its
//! own timeout. Item failures are logged and counted; they never abort the
//! rest of the batch. Failing to resolve the provider does.
//!
//! An item is acknowledged to its provider only when all of its messages
//! were handled, so a provider cursor never moves past a failed message.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditLog, AuditRecord, ObjectType};
use crate::categorizer::CategorizationService;
use crate::error::Result;
use crate::providers::EmailProvider;
use crate::registry::ProviderRegistry;

/// Default bound on one notification item
pub const DEFAULT_ITEM_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// Messages that went through categorization
    pub processed: usize,
    /// Payloads that failed validation
    pub skipped: usize,
    /// Messages already present in the audit log
    pub replayed: usize,
    /// Items or messages that errored or timed out
    pub failed: usize,
}

impl BatchReport {
    fn absorb(&mut self, other: BatchReport) {
        self.processed += other.processed;
        self.skipped += other.skipped;
        self.replayed += other.replayed;
        self.failed += other.failed;
    }
}

#[derive(Debug, Serialize)]
struct AlreadyCategorized<'a> {
    provider: &'a str,
    skipped: &'static str,
    labels: Vec<&'a str>,
}

pub struct PushNotificationProcessor {
    registry: Arc<ProviderRegistry>,
    categorizer: Arc<CategorizationService>,
    audit: Arc<dyn AuditLog>,
    item_timeout: Duration,
}

impl PushNotificationProcessor {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        categorizer: Arc<CategorizationService>,
        audit: Arc<dyn AuditLog>,
    ) -> Self {
        Self {
            registry,
            categorizer,
            audit,
            item_timeout: DEFAULT_ITEM_TIMEOUT,
        }
    }

    pub fn with_item_timeout(mut self, item_timeout: Duration) -> Self {
        self.item_timeout = item_timeout;
        self
    }

    /// Acknowledge a webhook body and process it in the background.
    ///
    /// Fails fast only when the provider is unknown or the body cannot be
    /// split into items.
    pub async fn accept(
        self: &Arc<Self>,
        provider_name: &str,
        body: Value,
    ) -> Result<JoinHandle<Result<BatchReport>>> {
        let provider = self.registry.get(provider_name).await?;
        let items = provider.notification_items(&body)?;
        debug!(provider = %provider_name, items = items.len(), "Accepted push notification");

        let processor = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let report = processor.process_items(provider, items).await;
            Ok(report)
        }))
    }

    /// Process a webhook body inline
    pub async fn process(&self, provider_name: &str, body: &Value) -> Result<BatchReport> {
        let provider = self.registry.get(provider_name).await?;
        let items = provider.notification_items(body)?;
        Ok(self.process_items(provider, items).await)
    }

    async fn process_items(&self, provider: Arc<dyn EmailProvider>, items: Vec<Value>) -> BatchReport {
        let mut report = BatchReport::default();

        for (index, item) in items.iter().enumerate() {
            // Counts gathered before a timeout are kept
            let mut item_report = BatchReport::default();
            let outcome = tokio::time::timeout(
                self.item_timeout,
                self.process_item(provider.as_ref(), item, &mut item_report),
            )
            .await;
            match outcome {
                Ok(Ok(())) if item_report.failed == 0 => {
                    if let Err(e) = provider.acknowledge_notification(item).await {
                        warn!(
                            provider = %provider.name(),
                            item = index,
                            "Push item not acknowledged: {}",
                            e
                        );
                    }
                }
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(provider = %provider.name(), item = index, "Push item failed: {}", e);
                    item_report.failed += 1;
                }
                Err(_) => {
                    error!(
                        provider = %provider.name(),
                        item = index,
                        "Push item timed out after {:?}",
                        self.item_timeout
                    );
                    item_report.failed += 1;
                }
            }
            report.absorb(item_report);
        }

        info!(
            provider = %provider.name(),
            processed = report.processed,
            skipped = report.skipped,
            replayed = report.replayed,
            failed = report.failed,
            "Push batch complete"
        );
        report
    }

    async fn process_item(
        &self,
        provider: &dyn EmailProvider,
        item: &Value,
        report: &mut BatchReport,
    ) -> Result<()> {
        let adapter = provider.adapter();

        for raw in provider.resolve_notification(item).await? {
            if !adapter.validate(&raw) {
                for diagnostic in adapter.take_diagnostics() {
                    warn!(provider = %provider.name(), "{}", diagnostic);
                }
                report.skipped += 1;
                continue;
            }
            let message = adapter.adapt(&raw);

            if self
                .audit
                .exists(&message.thread_id, &message.id, ObjectType::Email)
                .await?
            {
                debug!(
                    provider = %provider.name(),
                    message_id = %message.id,
                    "Replayed notification, already processed"
                );
                report.replayed += 1;
                continue;
            }

            let categorized_on_arrival = message.is_categorized();
            let message_id = message.id.clone();
            let message = match self.categorizer.categorize(provider, message).await {
                Ok(message) => message,
                Err(e) => {
                    warn!(
                        provider = %provider.name(),
                        message_id = %message_id,
                        "Categorization failed: {}",
                        e
                    );
                    report.failed += 1;
                    continue;
                }
            };

            if categorized_on_arrival {
                let outcome = AlreadyCategorized {
                    provider: provider.name(),
                    skipped: "already categorized",
                    labels: message.labels.iter().map(String::as_str).collect(),
                };
                self.audit
                    .append(AuditRecord::for_message(&message, serde_json::to_string(&outcome)?))
                    .await?;
            }
            report.processed += 1;
        }

        Ok(())
    }
}

impl std::fmt::Debug for PushNotificationProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushNotificationProcessor")
            .field("item_timeout", &self.item_timeout)
            .finish_non_exhaustive()
    }
}
