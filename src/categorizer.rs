//! Categorization service: at-most-once labelling of a message

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::audit::{AuditLog, AuditRecord};
use crate::classifier::Classifier;
use crate::error::{PipelineError, Result};
use crate::models::{Label, Message};
use crate::providers::EmailProvider;

/// Confidence stored when the classifier reports one outside `[0, 1]`
pub const FALLBACK_CONFIDENCE: f64 = 0.5;

/// Serialized into the audit record's `result`
#[derive(Debug, Clone, Serialize)]
pub struct CategorizationOutcome<'a> {
    pub provider: &'a str,
    pub label: &'a str,
    pub confidence: f64,
    pub reason: &'a str,
}

pub struct CategorizationService {
    classifier: Arc<dyn Classifier>,
    audit: Arc<dyn AuditLog>,
    classify_timeout: Duration,
}

impl CategorizationService {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        audit: Arc<dyn AuditLog>,
        classify_timeout: Duration,
    ) -> Self {
        Self {
            classifier,
            audit,
            classify_timeout,
        }
    }

    pub fn audit(&self) -> &Arc<dyn AuditLog> {
        &self.audit
    }

    /// Label `message` through `provider` unless it already carries a
    /// vocabulary label, and record the outcome in the audit log.
    pub async fn categorize(
        &self,
        provider: &dyn EmailProvider,
        message: Message,
    ) -> Result<Message> {
        if message.is_categorized() {
            debug!(
                provider = %provider.name(),
                message_id = %message.id,
                "Message already categorized, skipping"
            );
            return Ok(message);
        }

        let mut classification =
            tokio::time::timeout(self.classify_timeout, self.classifier.categorise(&message))
                .await
                .map_err(|_| {
                    PipelineError::Timeout(format!(
                        "Classifier did not answer for message {} within {:?}",
                        message.id, self.classify_timeout
                    ))
                })??;

        if !(0.0..=1.0).contains(&classification.confidence) {
            warn!(
                message_id = %message.id,
                confidence = classification.confidence,
                "Classifier confidence out of range, using {}",
                FALLBACK_CONFIDENCE
            );
            classification.confidence = FALLBACK_CONFIDENCE;
        }

        let label = Label::lookup(&classification.label)?;
        let message = provider.apply_label(message, &label).await?;

        let outcome = CategorizationOutcome {
            provider: provider.name(),
            label: &label.name,
            confidence: classification.confidence,
            reason: &classification.reason,
        };
        let record = AuditRecord::for_message(&message, serde_json::to_string(&outcome)?);
        self.audit.append(record).await?;

        info!(
            provider = %provider.name(),
            message_id = %message.id,
            label = %label.name,
            confidence = classification.confidence,
            "Categorized message"
        );
        Ok(message)
    }
}
