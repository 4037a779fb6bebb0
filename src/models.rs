use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{PipelineError, Result};

/// Canonical message every provider payload is normalized into.
///
/// Everything except `labels` is fixed once an adapter has produced it;
/// `labels` only ever grows (see [`Message::add_label`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub thread_id: String,
    pub subject: String,
    pub body: String,
    pub sender: String,
    pub recipients: Vec<String>,
    pub cc_recipients: Vec<String>,
    pub bcc_recipients: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub labels: BTreeSet<String>,
    pub attachments: Vec<Attachment>,
    /// Provider-specific URI or folder
    pub location: String,
}

impl Message {
    /// Append a label. Returns false when it was already present.
    pub fn add_label(&mut self, name: &str) -> bool {
        self.labels.insert(name.to_string())
    }

    /// True when any label on the message belongs to the closed vocabulary
    pub fn is_categorized(&self) -> bool {
        self.labels.iter().any(|name| is_vocabulary_label(name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    pub filename: String,
    pub content: String,
    pub content_hash: String,
}

/// A categorization tag from the closed vocabulary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub description: String,
    /// Hierarchy parent; not traversed by the pipeline
    pub parent: Option<String>,
}

static VOCABULARY: Lazy<Vec<Label>> = Lazy::new(|| {
    [
        ("Primary", "Primary label"),
        ("Work", "Work label"),
        ("Personal", "Personal label"),
        ("Finance", "Finance label"),
        ("Social", "Social label"),
        ("Promotions", "Promotions label"),
        ("Updates", "Updates label"),
        ("Spam", "Spam label"),
        ("Other", "Other label"),
    ]
    .into_iter()
    .map(|(name, description)| Label {
        name: name.to_string(),
        description: description.to_string(),
        parent: None,
    })
    .collect()
});

impl Label {
    /// Resolve a label name against the closed vocabulary.
    ///
    /// Unknown names are a [`PipelineError::NotFound`]; they are never coerced.
    pub fn lookup(name: &str) -> Result<Label> {
        VOCABULARY
            .iter()
            .find(|label| label.name == name)
            .cloned()
            .ok_or_else(|| PipelineError::NotFound(format!("Label {} not found", name)))
    }

    /// The full vocabulary in declaration order
    pub fn vocabulary() -> &'static [Label] {
        &VOCABULARY
    }
}

pub fn is_vocabulary_label(name: &str) -> bool {
    VOCABULARY.iter().any(|label| label.name == name)
}

/// Provider-assigned identity of a label, required to mutate a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteLabelHandle {
    pub id: String,
    pub name: String,
}

/// Result returned by a classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub label: String,
    pub confidence: f64,
    pub reason: String,
}

/// Custom deserializers for provider wire types
pub mod deserializers {
    use base64::{
        engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD},
        Engine as _,
    };
    use chrono::{DateTime, Utc};
    use serde_json::Value;

    /// Gmail `internalDate`: milliseconds since epoch, as a string or a number
    pub fn gmail_timestamp(value: &Value) -> Option<DateTime<Utc>> {
        let millis = match value {
            Value::String(s) => s.parse::<i64>().ok()?,
            Value::Number(n) => n.as_i64()?,
            _ => return None,
        };
        DateTime::from_timestamp_millis(millis)
    }

    /// Gmail body data is base64url, with or without padding. Standard
    /// alphabet input is accepted too.
    pub fn base64url(data: &str) -> Option<Vec<u8>> {
        let trimmed = data.trim_end_matches('=');
        URL_SAFE_NO_PAD
            .decode(trimmed)
            .or_else(|_| STANDARD_NO_PAD.decode(trimmed))
            .ok()
    }

    /// RFC 3339 timestamps as used by Microsoft Graph
    pub fn rfc3339(value: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(value)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }
}
