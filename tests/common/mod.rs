//! Common test utilities and fixtures
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use mail_categorizer::adapter::{EmailAdapter, ExchangeAdapter};
use mail_categorizer::classifier::Classifier;
use mail_categorizer::credentials::{Credential, CredentialLifecycle};
use mail_categorizer::error::{PipelineError, Result};
use mail_categorizer::label_registry::{LabelRegistry, RemoteLabelApi};
use mail_categorizer::models::{Classification, Label, Message, RemoteLabelHandle};
use mail_categorizer::providers::{EmailProvider, FetchQuery};
use mockall::mock;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

mock! {
    pub Classifier {}

    #[async_trait::async_trait]
    impl Classifier for Classifier {
        async fn categorise(&self, message: &Message) -> Result<Classification>;
    }
}

/// Classifier mock that always answers with the same verdict
pub fn classifier_returning(label: &str, confidence: f64, reason: &str) -> MockClassifier {
    let verdict = Classification {
        label: label.to_string(),
        confidence,
        reason: reason.to_string(),
    };
    let mut classifier = MockClassifier::new();
    classifier
        .expect_categorise()
        .returning(move |_| Ok(verdict.clone()));
    classifier
}

/// The end-to-end scenario message in notification shape
pub fn end_to_end_payload() -> Value {
    json!({
        "id": "m1",
        "threadId": "t1",
        "subject": "Invoice #4",
        "from": "billing@acme.com",
        "receivedDateTime": "2024-01-01T00:00:00Z",
        "toRecipients": [{"emailAddress": {"address": "me@x.com"}}]
    })
}

/// Notification-shaped payload with a bare sender address
pub fn flat_payload(id: &str, thread_id: &str, subject: &str, from: &str) -> Value {
    json!({
        "id": id,
        "threadId": thread_id,
        "subject": subject,
        "from": from,
        "receivedDateTime": "2024-01-01T00:00:00Z",
        "toRecipients": [{"emailAddress": {"address": "me@x.com"}}]
    })
}

/// Webhook body carrying one item per resource
pub fn notification_body(resources: Vec<Value>) -> Value {
    json!({
        "value": resources
            .into_iter()
            .map(|resource| json!({"resource": resource}))
            .collect::<Vec<_>>()
    })
}

pub fn create_test_message(id: &str, thread_id: &str, subject: &str) -> Message {
    Message {
        id: id.to_string(),
        thread_id: thread_id.to_string(),
        subject: subject.to_string(),
        body: String::new(),
        sender: "sender@example.com".to_string(),
        recipients: vec!["me@example.com".to_string()],
        cc_recipients: Vec::new(),
        bcc_recipients: Vec::new(),
        timestamp: Utc::now(),
        labels: Default::default(),
        attachments: Vec::new(),
        location: format!("test:{}", id),
    }
}

/// In-memory remote label store that counts calls
#[derive(Debug, Default)]
pub struct FakeLabelApi {
    pub remote: Mutex<Vec<RemoteLabelHandle>>,
    pub lists: AtomicUsize,
    pub creates: AtomicUsize,
}

impl FakeLabelApi {
    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn list_count(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteLabelApi for FakeLabelApi {
    async fn list_labels(&self) -> Result<Vec<RemoteLabelHandle>> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        Ok(self.remote.lock().unwrap().clone())
    }

    async fn create_label(&self, label: &Label) -> Result<RemoteLabelHandle> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let mut remote = self.remote.lock().unwrap();
        if remote.iter().any(|h| h.name.eq_ignore_ascii_case(&label.name)) {
            return Err(PipelineError::Conflict(format!("{} exists", label.name)));
        }
        let handle = RemoteLabelHandle {
            id: format!("Label_{}", remote.len() + 1),
            name: label.name.clone(),
        };
        remote.push(handle.clone());
        Ok(handle)
    }
}

/// Provider double with a real label registry in front of [`FakeLabelApi`].
///
/// Notification items are `{"resource": <payload>}` or
/// `{"resources": [<payload>, ...]}`; an item may also carry `"fail": true`
/// or `"delayMs": n`.
pub struct FakeProvider {
    name: String,
    adapter: Arc<ExchangeAdapter>,
    labels: LabelRegistry,
    pub api: FakeLabelApi,
    pub inbox: Mutex<Vec<Value>>,
    /// (message id, remote label id) for every apply
    pub applied: Mutex<Vec<(String, String)>>,
    pub fail_apply_for: Mutex<HashSet<String>>,
    pub fail_fetch: AtomicBool,
    pub fail_listen: AtomicBool,
    pub listening: AtomicBool,
    pub stop_calls: AtomicUsize,
    /// Items passed to `acknowledge_notification`
    pub acknowledged: Mutex<Vec<Value>>,
}

impl FakeProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            adapter: Arc::new(ExchangeAdapter::new()),
            labels: LabelRegistry::new(name),
            api: FakeLabelApi::default(),
            inbox: Mutex::new(Vec::new()),
            applied: Mutex::new(Vec::new()),
            fail_apply_for: Mutex::new(HashSet::new()),
            fail_fetch: AtomicBool::new(false),
            fail_listen: AtomicBool::new(false),
            listening: AtomicBool::new(false),
            stop_calls: AtomicUsize::new(0),
            acknowledged: Mutex::new(Vec::new()),
        }
    }

    pub fn with_inbox(name: &str, payloads: Vec<Value>) -> Self {
        let provider = Self::new(name);
        *provider.inbox.lock().unwrap() = payloads;
        provider
    }

    pub fn applied(&self) -> Vec<(String, String)> {
        self.applied.lock().unwrap().clone()
    }
}

#[async_trait]
impl EmailProvider for FakeProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn adapter(&self) -> Arc<dyn EmailAdapter> {
        self.adapter.clone()
    }

    async fn fetch_last_emails(&self, query: FetchQuery) -> Result<Vec<Message>> {
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(PipelineError::ServerError {
                status: 503,
                message: "backend unavailable".to_string(),
            });
        }
        let inbox = self.inbox.lock().unwrap().clone();
        Ok(inbox
            .iter()
            .filter(|raw| self.adapter.validate(raw))
            .map(|raw| self.adapter.adapt(raw))
            .take(query.count)
            .collect())
    }

    async fn apply_label(&self, mut message: Message, label: &Label) -> Result<Message> {
        let handle = self.labels.get_or_create(&self.api, label).await?;
        if self.fail_apply_for.lock().unwrap().contains(&message.id) {
            return Err(PipelineError::ProviderApi(format!(
                "modify failed for {}",
                message.id
            )));
        }
        self.applied
            .lock()
            .unwrap()
            .push((message.id.clone(), handle.id.clone()));
        message.add_label(&label.name);
        Ok(message)
    }

    async fn ensure_labels(&self, labels: &[Label]) -> Result<Vec<RemoteLabelHandle>> {
        let mut handles = Vec::with_capacity(labels.len());
        for label in labels {
            handles.push(self.labels.get_or_create(&self.api, label).await?);
        }
        Ok(handles)
    }

    async fn listen_for_incoming_emails(&self) -> Result<()> {
        if self.fail_listen.load(Ordering::SeqCst) {
            return Err(PipelineError::Auth("token revoked".to_string()));
        }
        self.listening.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_listening(&self) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.listening.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn notification_items(&self, body: &Value) -> Result<Vec<Value>> {
        body.get("value")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| PipelineError::Validation("Notification has no value array".to_string()))
    }

    async fn resolve_notification(&self, item: &Value) -> Result<Vec<Value>> {
        if let Some(delay) = item.get("delayMs").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if item.get("fail").and_then(Value::as_bool).unwrap_or(false) {
            return Err(PipelineError::ProviderApi("resource fetch failed".to_string()));
        }
        if let Some(resources) = item.get("resources").and_then(Value::as_array) {
            return Ok(resources.clone());
        }
        Ok(item.get("resource").cloned().into_iter().collect())
    }

    async fn acknowledge_notification(&self, item: &Value) -> Result<()> {
        self.acknowledged.lock().unwrap().push(item.clone());
        Ok(())
    }
}

/// Credential source that always returns the same valid token
pub struct StaticCredentials {
    pub token: String,
}

impl StaticCredentials {
    pub fn new(token: &str) -> Arc<dyn CredentialLifecycle> {
        Arc::new(Self {
            token: token.to_string(),
        })
    }

    fn credential(&self) -> Credential {
        Credential {
            access_token: self.token.clone(),
            refresh_token: Some("refresh".to_string()),
            expiry_date: Some(Utc::now() + chrono::Duration::hours(1)),
        }
    }
}

#[async_trait]
impl CredentialLifecycle for StaticCredentials {
    async fn get_authenticated_client(&self) -> Result<Credential> {
        Ok(self.credential())
    }

    async fn needs_token_refresh(&self) -> bool {
        false
    }

    async fn refresh_token_if_needed(&self) -> Result<Credential> {
        Ok(self.credential())
    }
}
