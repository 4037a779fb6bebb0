//! Gmail provider client built on `google-gmail1`

use async_trait::async_trait;
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE},
    Engine as _,
};
use chrono::{Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use google_gmail1::api::{Label as GmailLabel, ModifyMessageRequest, WatchRequest};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{adapt_valid, EmailProvider, FetchQuery};
use crate::adapter::{EmailAdapter, GmailAdapter};
use crate::auth::{
    gmail_hub, native_tls_connector, AuthGuard, GmailConnector, GmailHub, HandleBuilder,
    GMAIL_MODIFY_SCOPE,
};
use crate::credentials::{Credential, CredentialLifecycle};
use crate::error::{PipelineError, Result};
use crate::label_registry::{LabelRegistry, RemoteLabelApi, DEFAULT_LABEL_TTL};
use crate::models::{Label, Message, RemoteLabelHandle};
use crate::rate_limiter::{QuotaCost, QuotaRateLimiter};
use crate::retry::{with_retry, RetryPolicy};

/// Gmail caps `messages.list` pages at 500
const MAX_LIST_RESULTS: usize = 500;

#[derive(Debug, Clone)]
pub struct GmailSettings {
    /// Mailbox owner, normally `me`
    pub user_id: String,
    /// Pub/Sub topic for `users.watch`, e.g. `projects/p/topics/gmail`
    pub topic_name: Option<String>,
    /// Label ids the watch is restricted to
    pub watch_label_ids: Vec<String>,
    /// Concurrent `messages.get` calls during a bulk fetch
    pub max_concurrent_requests: usize,
    pub quota_units_per_second: f64,
    /// Replaces `https://gmail.googleapis.com/` when set
    pub api_root: Option<String>,
    pub label_ttl: Duration,
    pub retry: RetryPolicy,
}

impl Default for GmailSettings {
    fn default() -> Self {
        Self {
            user_id: "me".to_string(),
            topic_name: None,
            watch_label_ids: vec!["INBOX".to_string()],
            max_concurrent_requests: 10,
            quota_units_per_second: crate::rate_limiter::DEFAULT_UNITS_PER_SECOND,
            api_root: None,
            label_ttl: DEFAULT_LABEL_TTL,
            retry: RetryPolicy::default(),
        }
    }
}

/// Decoded `data` of a Gmail Pub/Sub push message
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailPushData {
    pub email_address: String,
    #[serde(deserialize_with = "history_id")]
    pub history_id: u64,
}

/// Gmail sends `historyId` as a number; tolerate strings as well
fn history_id<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| serde::de::Error::custom("historyId out of range")),
        Value::String(s) => s.parse().map_err(serde::de::Error::custom),
        other => Err(serde::de::Error::custom(format!(
            "invalid historyId: {}",
            other
        ))),
    }
}

/// Decode the base64 `data` of a Pub/Sub message envelope
pub fn decode_push_data(item: &Value) -> Result<GmailPushData> {
    let data = item
        .get("data")
        .and_then(Value::as_str)
        .ok_or_else(|| PipelineError::Validation("Pub/Sub message has no data".to_string()))?;
    let bytes = STANDARD
        .decode(data)
        .or_else(|_| URL_SAFE.decode(data))
        .map_err(|e| PipelineError::Validation(format!("Pub/Sub data is not base64: {}", e)))?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub struct GmailProvider {
    name: String,
    settings: GmailSettings,
    guard: AuthGuard<GmailHub>,
    labels: LabelRegistry,
    adapter: Arc<GmailAdapter>,
    quota: QuotaRateLimiter,
    /// Last history id this client has caught up to
    history_id: Mutex<Option<u64>>,
}

impl GmailProvider {
    pub fn new(
        name: impl Into<String>,
        credentials: Arc<dyn CredentialLifecycle>,
        settings: GmailSettings,
    ) -> Self {
        let api_root = settings.api_root.clone();
        let builder: HandleBuilder<GmailHub> = Box::new(move |credential: &Credential| {
            Ok(gmail_hub(native_tls_connector()?, credential, api_root.as_deref()))
        });
        Self::with_hub_builder(name, credentials, settings, builder)
    }

    /// Provider whose hubs are built on a caller-supplied connector
    pub fn with_connector(
        name: impl Into<String>,
        credentials: Arc<dyn CredentialLifecycle>,
        settings: GmailSettings,
        connector: GmailConnector,
    ) -> Self {
        let api_root = settings.api_root.clone();
        let builder: HandleBuilder<GmailHub> = Box::new(move |credential: &Credential| {
            Ok(gmail_hub(connector.clone(), credential, api_root.as_deref()))
        });
        Self::with_hub_builder(name, credentials, settings, builder)
    }

    fn with_hub_builder(
        name: impl Into<String>,
        credentials: Arc<dyn CredentialLifecycle>,
        settings: GmailSettings,
        builder: HandleBuilder<GmailHub>,
    ) -> Self {
        let name = name.into();
        Self {
            guard: AuthGuard::new(credentials, builder),
            labels: LabelRegistry::with_ttl(name.clone(), settings.label_ttl),
            adapter: Arc::new(GmailAdapter::new()),
            quota: QuotaRateLimiter::with_rate(settings.quota_units_per_second),
            history_id: Mutex::new(None),
            settings,
            name,
        }
    }

    /// Seed the history baseline, e.g. from a previous `users.watch`
    pub async fn set_history_baseline(&self, history_id: u64) {
        *self.history_id.lock().await = Some(history_id);
    }

    async fn get_raw_message(&self, hub: &GmailHub, id: &str) -> Result<Value> {
        with_retry("messages.get", &self.settings.retry, || async {
            self.quota.acquire(QuotaCost::Read).await;
            let (_, message) = hub
                .users()
                .messages_get(&self.settings.user_id, id)
                .format("full")
                .add_scope(GMAIL_MODIFY_SCOPE)
                .doit()
                .await?;
            Ok(serde_json::to_value(message)?)
        })
        .await
    }

    /// Add `labelNames` next to `labelIds` so the adapter sees label names
    async fn annotate_label_names(&self, raw: &mut [Value]) -> Result<()> {
        if raw.is_empty() {
            return Ok(());
        }
        let names: HashMap<String, String> = self
            .labels
            .snapshot(self)
            .await?
            .into_iter()
            .map(|handle| (handle.id, handle.name))
            .collect();

        for payload in raw.iter_mut() {
            let label_names: Vec<Value> = payload
                .get("labelIds")
                .and_then(Value::as_array)
                .map(|ids| {
                    ids.iter()
                        .filter_map(Value::as_str)
                        .filter_map(|id| names.get(id))
                        .map(|name| Value::String(name.clone()))
                        .collect()
                })
                .unwrap_or_default();
            if let Some(object) = payload.as_object_mut() {
                object.insert("labelNames".to_string(), Value::Array(label_names));
            }
        }
        Ok(())
    }

    /// Message ids added since `start`, following every history page
    async fn added_since(&self, hub: &GmailHub, start: u64) -> Result<Vec<String>> {
        let mut ids: Vec<String> = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let token = page_token.clone();
            let response = with_retry("history.list", &self.settings.retry, || {
                let token = token.clone();
                async move {
                    self.quota.acquire(QuotaCost::Read).await;
                    let mut call = hub
                        .users()
                        .history_list(&self.settings.user_id)
                        .start_history_id(start)
                        .add_history_types("messageAdded")
                        .add_scope(GMAIL_MODIFY_SCOPE);
                    if let Some(token) = token.as_ref() {
                        call = call.page_token(token);
                    }
                    let (_, response) = call.doit().await?;
                    Ok(response)
                }
            })
            .await?;

            for record in response.history.unwrap_or_default() {
                for added in record.messages_added.unwrap_or_default() {
                    if let Some(id) = added.message.and_then(|m| m.id) {
                        if !ids.contains(&id) {
                            ids.push(id);
                        }
                    }
                }
            }

            page_token = response.next_page_token;
            if page_token.is_none() {
                break;
            }
        }
        Ok(ids)
    }
}

#[async_trait]
impl RemoteLabelApi for GmailProvider {
    async fn list_labels(&self) -> Result<Vec<RemoteLabelHandle>> {
        let hub = self.guard.ensure_authenticated().await?;
        with_retry("labels.list", &self.settings.retry, || async {
            self.quota.acquire(QuotaCost::Read).await;
            let (_, response) = hub
                .users()
                .labels_list(&self.settings.user_id)
                .add_scope(GMAIL_MODIFY_SCOPE)
                .doit()
                .await?;
            Ok(response
                .labels
                .unwrap_or_default()
                .into_iter()
                .filter_map(|label| {
                    Some(RemoteLabelHandle {
                        id: label.id?,
                        name: label.name?,
                    })
                })
                .collect())
        })
        .await
    }

    async fn create_label(&self, label: &Label) -> Result<RemoteLabelHandle> {
        let hub = self.guard.ensure_authenticated().await?;
        with_retry("labels.create", &self.settings.retry, || async {
            self.quota.acquire(QuotaCost::Write).await;
            let request = GmailLabel {
                name: Some(label.name.clone()),
                message_list_visibility: Some("show".to_string()),
                label_list_visibility: Some("labelShow".to_string()),
                ..Default::default()
            };
            let (_, created) = hub
                .users()
                .labels_create(request, &self.settings.user_id)
                .add_scope(GMAIL_MODIFY_SCOPE)
                .doit()
                .await?;
            let id = created.id.ok_or_else(|| {
                PipelineError::ProviderApi(format!("Created label {} has no id", label.name))
            })?;
            Ok(RemoteLabelHandle {
                id,
                name: created.name.unwrap_or_else(|| label.name.clone()),
            })
        })
        .await
    }
}

#[async_trait]
impl EmailProvider for GmailProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn adapter(&self) -> Arc<dyn EmailAdapter> {
        self.adapter.clone()
    }

    async fn fetch_last_emails(&self, query: FetchQuery) -> Result<Vec<Message>> {
        let hub = self.guard.ensure_authenticated().await?;
        let after = (Utc::now() - ChronoDuration::hours(query.window_hours as i64)).timestamp();
        let search = format!("after:{}", after);
        let max_results = query.count.min(MAX_LIST_RESULTS) as u32;

        let ids: Vec<String> = with_retry("messages.list", &self.settings.retry, || async {
            self.quota.acquire(QuotaCost::Read).await;
            let (_, response) = hub
                .users()
                .messages_list(&self.settings.user_id)
                .q(&search)
                .max_results(max_results)
                .add_scope(GMAIL_MODIFY_SCOPE)
                .doit()
                .await?;
            Ok(response
                .messages
                .unwrap_or_default()
                .into_iter()
                .filter_map(|m| m.id)
                .collect())
        })
        .await?;

        debug!(provider = %self.name, count = ids.len(), "Listed recent messages");

        let hub_ref = hub.as_ref();
        let mut raw: Vec<Value> = stream::iter(ids)
            .map(|id| async move { self.get_raw_message(hub_ref, &id).await })
            .buffered(self.settings.max_concurrent_requests.max(1))
            .try_collect()
            .await?;

        self.annotate_label_names(&mut raw).await?;
        let quota = self.quota.stats().await;
        debug!(provider = %self.name, quota = ?quota, "Fetch complete");
        Ok(adapt_valid(self.adapter.as_ref(), &self.name, &raw))
    }

    async fn apply_label(&self, mut message: Message, label: &Label) -> Result<Message> {
        let handle = self.labels.get_or_create(self, label).await?;
        let hub = self.guard.ensure_authenticated().await?;

        with_retry("messages.modify", &self.settings.retry, || async {
            self.quota.acquire(QuotaCost::Write).await;
            let request = ModifyMessageRequest {
                add_label_ids: Some(vec![handle.id.clone()]),
                remove_label_ids: None,
            };
            hub.users()
                .messages_modify(request, &self.settings.user_id, &message.id)
                .add_scope(GMAIL_MODIFY_SCOPE)
                .doit()
                .await?;
            Ok(())
        })
        .await?;

        message.add_label(&label.name);
        info!(
            provider = %self.name,
            message_id = %message.id,
            label = %label.name,
            "Applied label"
        );
        Ok(message)
    }

    async fn ensure_labels(&self, labels: &[Label]) -> Result<Vec<RemoteLabelHandle>> {
        let mut handles = Vec::with_capacity(labels.len());
        for label in labels {
            handles.push(self.labels.get_or_create(self, label).await?);
        }
        Ok(handles)
    }

    async fn listen_for_incoming_emails(&self) -> Result<()> {
        let topic = self.settings.topic_name.clone().ok_or_else(|| {
            PipelineError::Config("gmail.topic_name is required to listen".to_string())
        })?;
        let hub = self.guard.ensure_authenticated().await?;

        let response = with_retry("users.watch", &self.settings.retry, || async {
            self.quota.acquire(QuotaCost::Watch).await;
            let request = WatchRequest {
                topic_name: Some(topic.clone()),
                label_ids: (!self.settings.watch_label_ids.is_empty())
                    .then(|| self.settings.watch_label_ids.clone()),
                ..Default::default()
            };
            let (_, response) = hub
                .users()
                .watch(request, &self.settings.user_id)
                .add_scope(GMAIL_MODIFY_SCOPE)
                .doit()
                .await?;
            Ok(response)
        })
        .await?;

        if let Some(history_id) = response.history_id {
            self.set_history_baseline(history_id).await;
        }
        info!(
            provider = %self.name,
            topic = %topic,
            expiration = ?response.expiration,
            "Gmail watch registered"
        );
        Ok(())
    }

    async fn stop_listening(&self) -> Result<()> {
        let hub = self.guard.ensure_authenticated().await?;
        with_retry("users.stop", &self.settings.retry, || async {
            self.quota.acquire(QuotaCost::Watch).await;
            hub.users()
                .stop(&self.settings.user_id)
                .add_scope(GMAIL_MODIFY_SCOPE)
                .doit()
                .await?;
            Ok(())
        })
        .await?;
        info!(provider = %self.name, "Gmail watch stopped");
        Ok(())
    }

    fn notification_items(&self, body: &Value) -> Result<Vec<Value>> {
        match body {
            Value::Array(envelopes) => Ok(envelopes
                .iter()
                .filter_map(|envelope| envelope.get("message").cloned())
                .collect()),
            Value::Object(_) => body
                .get("message")
                .cloned()
                .map(|message| vec![message])
                .ok_or_else(|| {
                    PipelineError::Validation("Pub/Sub envelope has no message".to_string())
                }),
            _ => Err(PipelineError::Validation(
                "Gmail push body must be a Pub/Sub envelope".to_string(),
            )),
        }
    }

    async fn resolve_notification(&self, item: &Value) -> Result<Vec<Value>> {
        let push = decode_push_data(item)?;

        let start = {
            let mut baseline = self.history_id.lock().await;
            match *baseline {
                Some(previous) if previous < push.history_id => previous,
                Some(previous) => {
                    debug!(
                        provider = %self.name,
                        history_id = push.history_id,
                        previous,
                        "Push notification already covered"
                    );
                    return Ok(Vec::new());
                }
                None => {
                    info!(
                        provider = %self.name,
                        history_id = push.history_id,
                        "No history baseline yet, recording this push as the baseline"
                    );
                    *baseline = Some(push.history_id);
                    return Ok(Vec::new());
                }
            }
        };

        let hub = self.guard.ensure_authenticated().await?;
        let ids = self.added_since(&hub, start).await?;

        let mut raw = Vec::with_capacity(ids.len());
        for id in &ids {
            match self.get_raw_message(&hub, id).await {
                Ok(message) => raw.push(message),
                // Added and then deleted before we got to it
                Err(PipelineError::NotFound(_)) => {
                    warn!(provider = %self.name, message_id = %id, "Message vanished before fetch")
                }
                Err(e) => return Err(e),
            }
        }

        self.annotate_label_names(&mut raw).await?;
        Ok(raw)
    }

    /// Move the history baseline up to this push once its messages are done
    async fn acknowledge_notification(&self, item: &Value) -> Result<()> {
        let push = decode_push_data(item)?;
        let mut baseline = self.history_id.lock().await;
        if baseline.map_or(true, |previous| previous < push.history_id) {
            *baseline = Some(push.history_id);
            debug!(provider = %self.name, history_id = push.history_id, "History baseline advanced");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct NoCredentials;

    #[async_trait]
    impl CredentialLifecycle for NoCredentials {
        async fn get_authenticated_client(&self) -> Result<Credential> {
            Err(PipelineError::Auth("no credential".to_string()))
        }
        async fn needs_token_refresh(&self) -> bool {
            true
        }
        async fn refresh_token_if_needed(&self) -> Result<Credential> {
            Err(PipelineError::Auth("no credential".to_string()))
        }
    }

    fn provider() -> GmailProvider {
        GmailProvider::new("gmail", Arc::new(NoCredentials), GmailSettings::default())
    }

    fn envelope(history_id: u64) -> Value {
        let data = STANDARD.encode(
            json!({"emailAddress": "me@x.com", "historyId": history_id}).to_string(),
        );
        json!({
            "message": {"data": data, "messageId": "2070443601311540", "publishTime": "2024-01-01T00:00:00Z"},
            "subscription": "projects/p/subscriptions/gmail-push"
        })
    }

    #[test]
    fn test_decode_push_data() {
        let item = envelope(9876)["message"].clone();
        let data = decode_push_data(&item).unwrap();
        assert_eq!(data.email_address, "me@x.com");
        assert_eq!(data.history_id, 9876);

        let data = STANDARD.encode(r#"{"emailAddress":"me@x.com","historyId":"42"}"#);
        assert_eq!(decode_push_data(&json!({"data": data})).unwrap().history_id, 42);

        let err = decode_push_data(&json!({"data": "%%%"})).unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[test]
    fn test_notification_items() {
        let provider = provider();
        let items = provider.notification_items(&envelope(1)).unwrap();
        assert_eq!(items.len(), 1);
        assert!(items[0].get("data").is_some());

        let batch = json!([envelope(1), envelope(2), {"noise": true}]);
        assert_eq!(provider.notification_items(&batch).unwrap().len(), 2);

        assert!(provider.notification_items(&json!("text")).is_err());
    }

    #[tokio::test]
    async fn test_first_push_records_baseline() {
        let provider = provider();
        let item = envelope(100)["message"].clone();
        assert!(provider.resolve_notification(&item).await.unwrap().is_empty());
        assert_eq!(*provider.history_id.lock().await, Some(100));

        // Already covered: no API call, so the missing credential is never hit
        let older = envelope(90)["message"].clone();
        assert!(provider.resolve_notification(&older).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_new_history_requires_credentials() {
        let provider = provider();
        provider.set_history_baseline(10).await;
        let item = envelope(20)["message"].clone();
        let err = provider.resolve_notification(&item).await.unwrap_err();
        assert!(matches!(err, PipelineError::Auth(_)));
        assert_eq!(*provider.history_id.lock().await, Some(10));
    }

    #[tokio::test]
    async fn test_acknowledge_only_moves_baseline_forward() {
        let provider = provider();
        provider.set_history_baseline(10).await;

        provider
            .acknowledge_notification(&envelope(20)["message"])
            .await
            .unwrap();
        assert_eq!(*provider.history_id.lock().await, Some(20));

        provider
            .acknowledge_notification(&envelope(15)["message"])
            .await
            .unwrap();
        assert_eq!(*provider.history_id.lock().await, Some(20));
    }

    #[tokio::test]
    async fn test_listen_requires_topic() {
        let err = provider().listen_for_incoming_emails().await.unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }
}
