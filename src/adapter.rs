//! Provider payload adapters
//!
//! An adapter turns a raw provider payload (Gmail API message JSON or a
//! Microsoft Graph message resource) into the canonical [`Message`].
//! `validate` never fails loudly: each missing field becomes a diagnostic and
//! the call returns `false`. Callers must run `validate` before `adapt`.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Mutex;

use crate::models::{deserializers, Attachment, Message};

/// Maximum number of payload characters echoed into a diagnostic
const DIAGNOSTIC_PAYLOAD_MAX_LEN: usize = 200;

/// Capability set shared by every provider adapter
pub trait EmailAdapter: Send + Sync {
    /// Adapter name used as the diagnostic prefix
    fn name(&self) -> &'static str;

    /// Check required fields, recording one diagnostic per missing field
    fn validate(&self, raw: &Value) -> bool;

    /// Map a validated payload to a [`Message`]. Pure and total for any
    /// payload that passed `validate`.
    fn adapt(&self, raw: &Value) -> Message;

    /// Diagnostics recorded so far, oldest first
    fn diagnostics(&self) -> Vec<String>;

    /// Drain the recorded diagnostics
    fn take_diagnostics(&self) -> Vec<String>;
}

/// Ordered, append-only diagnostic log shared by concurrent validations
#[derive(Debug, Default)]
struct Diagnostics {
    entries: Mutex<Vec<String>>,
}

impl Diagnostics {
    fn push(&self, entry: String) {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(entry);
    }

    fn snapshot(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn take(&self) -> Vec<String> {
        std::mem::take(
            &mut *self
                .entries
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }
}

/// Collects the failures of one `validate` call
struct Checker<'a> {
    adapter: &'static str,
    raw: &'a Value,
    diagnostics: &'a Diagnostics,
    valid: bool,
}

impl<'a> Checker<'a> {
    fn new(adapter: &'static str, raw: &'a Value, diagnostics: &'a Diagnostics) -> Self {
        Self {
            adapter,
            raw,
            diagnostics,
            valid: true,
        }
    }

    fn require(&mut self, present: bool, what: &str) {
        if !present {
            self.diagnostics.push(format!(
                "{}.validate: No {} for email: {}",
                self.adapter,
                what,
                truncate_payload(self.raw)
            ));
            self.valid = false;
        }
    }
}

fn truncate_payload(raw: &Value) -> String {
    let text = raw.to_string();
    if text.chars().count() <= DIAGNOSTIC_PAYLOAD_MAX_LEN {
        text
    } else {
        let head: String = text.chars().take(DIAGNOSTIC_PAYLOAD_MAX_LEN).collect();
        format!("{}...", head)
    }
}

fn non_empty_str<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

fn string_or_default(value: &Value, pointer: &str) -> String {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

// ============================================================================
// Gmail
// ============================================================================

/// Adapter for Gmail API `users.messages` resources
#[derive(Debug, Default)]
pub struct GmailAdapter {
    diagnostics: Diagnostics,
}

impl GmailAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Case-insensitive lookup of a top-level payload header
    fn header<'a>(raw: &'a Value, name: &str) -> Option<&'a str> {
        raw.pointer("/payload/headers")?
            .as_array()?
            .iter()
            .find(|h| {
                h.get("name")
                    .and_then(Value::as_str)
                    .is_some_and(|n| n.eq_ignore_ascii_case(name))
            })?
            .get("value")?
            .as_str()
    }

    fn address_list(raw: &Value, name: &str) -> Vec<String> {
        Self::header(raw, name)
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Depth-first walk over the MIME tree, root included
    fn walk_parts<'a>(part: &'a Value, out: &mut Vec<&'a Value>) {
        out.push(part);
        if let Some(parts) = part.get("parts").and_then(Value::as_array) {
            for child in parts {
                Self::walk_parts(child, out);
            }
        }
    }

    fn parts(raw: &Value) -> Vec<&Value> {
        let mut parts = Vec::new();
        if let Some(payload) = raw.get("payload") {
            Self::walk_parts(payload, &mut parts);
        }
        parts
    }

    fn plain_text_body(raw: &Value) -> Option<String> {
        Self::parts(raw)
            .into_iter()
            .filter(|part| {
                part.get("mimeType").and_then(Value::as_str) == Some("text/plain")
                    && part
                        .get("filename")
                        .and_then(Value::as_str)
                        .map_or(true, str::is_empty)
            })
            .find_map(|part| {
                let data = non_empty_str(part, "/body/data")?;
                let bytes = deserializers::base64url(data)?;
                Some(String::from_utf8_lossy(&bytes).into_owned())
            })
    }

    fn attachments(raw: &Value) -> Vec<Attachment> {
        Self::parts(raw)
            .into_iter()
            .filter_map(|part| {
                let filename = non_empty_str(part, "/filename")?;
                let id = string_or_default(part, "/body/attachmentId");
                let content = string_or_default(part, "/body/data");
                let content_hash = deserializers::base64url(&content)
                    .filter(|bytes| !bytes.is_empty())
                    .map(|bytes| content_hash(&bytes))
                    .unwrap_or_else(|| id.clone());
                Some(Attachment {
                    id,
                    filename: filename.to_string(),
                    content,
                    content_hash,
                })
            })
            .collect()
    }
}

impl EmailAdapter for GmailAdapter {
    fn name(&self) -> &'static str {
        "GmailAdapter"
    }

    fn validate(&self, raw: &Value) -> bool {
        let mut check = Checker::new(self.name(), raw, &self.diagnostics);
        check.require(non_empty_str(raw, "/id").is_some(), "id");
        check.require(non_empty_str(raw, "/threadId").is_some(), "threadId");
        check.require(
            Self::header(raw, "subject").is_some_and(|s| !s.trim().is_empty()),
            "subject",
        );
        check.require(
            Self::header(raw, "from").is_some_and(|s| !s.trim().is_empty()),
            "from address",
        );
        check.require(!Self::address_list(raw, "to").is_empty(), "to recipients");
        check.require(
            raw.get("internalDate")
                .and_then(deserializers::gmail_timestamp)
                .is_some(),
            "internal date",
        );
        check.valid
    }

    fn adapt(&self, raw: &Value) -> Message {
        let id = string_or_default(raw, "/id");
        // `labelNames` is added by the provider client when it knows the
        // names behind the account's label ids
        let labels: BTreeSet<String> = ["labelIds", "labelNames"]
            .iter()
            .filter_map(|field| raw.get(*field).and_then(Value::as_array))
            .flatten()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();

        Message {
            location: format!("gmail:{}", id),
            id,
            thread_id: string_or_default(raw, "/threadId"),
            subject: Self::header(raw, "subject")
                .unwrap_or("No Subject")
                .to_string(),
            body: Self::plain_text_body(raw)
                .unwrap_or_else(|| string_or_default(raw, "/snippet")),
            sender: Self::header(raw, "from")
                .unwrap_or("Unknown Sender")
                .to_string(),
            recipients: Self::address_list(raw, "to"),
            cc_recipients: Self::address_list(raw, "cc"),
            bcc_recipients: Self::address_list(raw, "bcc"),
            timestamp: raw
                .get("internalDate")
                .and_then(deserializers::gmail_timestamp)
                .unwrap_or_default(),
            labels,
            attachments: Self::attachments(raw),
        }
    }

    fn diagnostics(&self) -> Vec<String> {
        self.diagnostics.snapshot()
    }

    fn take_diagnostics(&self) -> Vec<String> {
        self.diagnostics.take()
    }
}

// ============================================================================
// Exchange (Microsoft Graph)
// ============================================================================

/// Adapter for Microsoft Graph `message` resources
#[derive(Debug, Default)]
pub struct ExchangeAdapter {
    diagnostics: Diagnostics,
}

impl ExchangeAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Render a Graph `recipient` as `Name <address>` or a bare address
    fn format_recipient(recipient: &Value) -> Option<String> {
        let address = recipient
            .pointer("/emailAddress/address")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let name = recipient
            .pointer("/emailAddress/name")
            .and_then(Value::as_str)
            .unwrap_or_default();
        match (name.is_empty(), address.is_empty()) {
            (true, true) => None,
            (true, false) => Some(address.to_string()),
            (false, _) => Some(format!("{} <{}>", name, address)),
        }
    }

    fn recipients(raw: &Value, field: &str) -> Vec<String> {
        raw.get(field)
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(Self::format_recipient).collect())
            .unwrap_or_default()
    }

    fn attachments(raw: &Value) -> Vec<Attachment> {
        raw.get("attachments")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .map(|attachment| {
                        let id = string_or_default(attachment, "/id");
                        let content = string_or_default(attachment, "/contentBytes");
                        let content_hash = STANDARD
                            .decode(&content)
                            .ok()
                            .filter(|bytes| !bytes.is_empty())
                            .map(|bytes| content_hash(&bytes))
                            .unwrap_or_else(|| id.clone());
                        Attachment {
                            id,
                            filename: string_or_default(attachment, "/name"),
                            content,
                            content_hash,
                        }
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn received_at(raw: &Value) -> Option<DateTime<Utc>> {
        non_empty_str(raw, "/receivedDateTime").and_then(deserializers::rfc3339)
    }

    /// `conversationId`, or `threadId` on notification payloads
    fn thread_id(raw: &Value) -> Option<&str> {
        non_empty_str(raw, "/conversationId").or_else(|| non_empty_str(raw, "/threadId"))
    }

    /// Graph `recipient` object or a bare address string
    fn sender(raw: &Value) -> Option<String> {
        match raw.get("from")? {
            Value::String(address) if !address.is_empty() => Some(address.clone()),
            recipient => Self::format_recipient(recipient),
        }
    }
}

impl EmailAdapter for ExchangeAdapter {
    fn name(&self) -> &'static str {
        "ExchangeAdapter"
    }

    fn validate(&self, raw: &Value) -> bool {
        let mut check = Checker::new(self.name(), raw, &self.diagnostics);
        check.require(non_empty_str(raw, "/id").is_some(), "id");
        check.require(Self::thread_id(raw).is_some(), "conversationId");
        check.require(non_empty_str(raw, "/subject").is_some(), "subject");
        check.require(
            Self::sender(raw).is_some_and(|sender| sender.contains('@')),
            "from address",
        );
        check.require(
            raw.get("toRecipients").is_some_and(Value::is_array),
            "to recipients",
        );
        check.require(Self::received_at(raw).is_some(), "received date time");
        check.valid
    }

    fn adapt(&self, raw: &Value) -> Message {
        let body = non_empty_str(raw, "/body/content")
            .or_else(|| non_empty_str(raw, "/body"))
            .or_else(|| non_empty_str(raw, "/bodyPreview"))
            .unwrap_or_default()
            .to_string();
        let labels: BTreeSet<String> = raw
            .get("categories")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Message {
            id: string_or_default(raw, "/id"),
            thread_id: Self::thread_id(raw).unwrap_or_default().to_string(),
            subject: string_or_default(raw, "/subject"),
            body,
            sender: Self::sender(raw).unwrap_or_default(),
            recipients: Self::recipients(raw, "toRecipients"),
            cc_recipients: Self::recipients(raw, "ccRecipients"),
            bcc_recipients: Self::recipients(raw, "bccRecipients"),
            timestamp: Self::received_at(raw).unwrap_or_default(),
            labels,
            attachments: Self::attachments(raw),
            location: string_or_default(raw, "/webLink"),
        }
    }

    fn diagnostics(&self) -> Vec<String> {
        self.diagnostics.snapshot()
    }

    fn take_diagnostics(&self) -> Vec<String> {
        self.diagnostics.take()
    }
}
