//! Exchange provider client over Microsoft Graph
//!
//! Labels map to Outlook master categories. Push notifications come from a
//! Graph change-notification subscription on the inbox.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{adapt_valid, EmailProvider, FetchQuery};
use crate::adapter::{EmailAdapter, ExchangeAdapter};
use crate::auth::AuthGuard;
use crate::credentials::{Credential, CredentialLifecycle};
use crate::error::{parse_retry_after, PipelineError, Result};
use crate::label_registry::{LabelRegistry, RemoteLabelApi, DEFAULT_LABEL_TTL};
use crate::models::{Label, Message, RemoteLabelHandle};
use crate::retry::{with_retry, RetryPolicy};

pub const GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0";

/// Graph caps `$top` on message lists
const MAX_PAGE_SIZE: usize = 1000;

/// Fields requested when fetching message resources
const MESSAGE_FIELDS: &str = "id,conversationId,subject,body,bodyPreview,from,toRecipients,ccRecipients,bccRecipients,receivedDateTime,categories,webLink";

#[derive(Debug, Clone)]
pub struct ExchangeSettings {
    pub graph_base_url: String,
    /// Public webhook URL Graph posts change notifications to
    pub notification_url: Option<String>,
    /// Shared secret echoed back in every notification
    pub client_state: String,
    pub subscription_lifetime: Duration,
    pub label_ttl: Duration,
    pub retry: RetryPolicy,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            graph_base_url: GRAPH_API_BASE.to_string(),
            notification_url: None,
            client_state: String::new(),
            subscription_lifetime: Duration::from_secs(3600),
            label_ttl: DEFAULT_LABEL_TTL,
            retry: RetryPolicy::default(),
        }
    }
}

/// Bearer-authenticated Graph client for one access token
#[derive(Debug, Clone)]
pub struct GraphClient {
    http: reqwest::Client,
    base_url: String,
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct GraphErrorBody {
    error: GraphError,
}

#[derive(Debug, Deserialize)]
struct GraphError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

impl GraphClient {
    pub fn new(http: reqwest::Client, base_url: &str, access_token: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Option<Value>> {
        let mut request = self
            .http
            .request(method, self.url(path))
            .bearer_auth(&self.access_token);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            if status == StatusCode::NO_CONTENT {
                return Ok(None);
            }
            let bytes = response.bytes().await?;
            if bytes.is_empty() {
                return Ok(None);
            }
            return Ok(Some(serde_json::from_slice(&bytes)?));
        }

        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .map(|v| parse_retry_after(Some(v)));
        let text = response.text().await.unwrap_or_default();
        let (code, message) = match serde_json::from_str::<GraphErrorBody>(&text) {
            Ok(body) => (body.error.code, body.error.message),
            Err(_) => (String::new(), text),
        };

        // Graph reports some duplicates as 400 with a descriptive code
        if status == StatusCode::BAD_REQUEST
            && (code.contains("Duplicate") || code.contains("AlreadyExists"))
        {
            return Err(PipelineError::Conflict(message));
        }
        Err(PipelineError::from_status(
            status.as_u16(),
            if code.is_empty() {
                message
            } else {
                format!("{}: {}", code, message)
            },
            retry_after,
        ))
    }

    pub async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        self.send(Method::GET, path, query, None)
            .await
            .map(Option::unwrap_or_default)
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        self.send(Method::POST, path, &[], Some(body))
            .await
            .map(Option::unwrap_or_default)
    }

    pub async fn patch(&self, path: &str, body: &Value) -> Result<()> {
        self.send(Method::PATCH, path, &[], Some(body)).await?;
        Ok(())
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        self.send(Method::DELETE, path, &[], None).await?;
        Ok(())
    }
}

/// Message id referenced by a notification's `resource` path,
/// e.g. `Users/{user}/Messages/{id}`
fn resource_message_id(resource: &str) -> Option<&str> {
    let (collection, id) = resource.trim_end_matches('/').rsplit_once('/')?;
    let collection = collection.rsplit('/').next()?;
    (collection.eq_ignore_ascii_case("messages") && !id.is_empty()).then_some(id)
}

/// True when `resourceData` already carries the fields the adapter needs
fn is_complete_message(resource: &Value) -> bool {
    ["id", "conversationId", "subject", "from", "toRecipients", "receivedDateTime"]
        .iter()
        .all(|field| resource.get(*field).is_some())
}

pub struct ExchangeProvider {
    name: String,
    settings: ExchangeSettings,
    guard: AuthGuard<GraphClient>,
    labels: LabelRegistry,
    adapter: Arc<ExchangeAdapter>,
    subscription_id: Mutex<Option<String>>,
}

impl ExchangeProvider {
    pub fn new(
        name: impl Into<String>,
        credentials: Arc<dyn CredentialLifecycle>,
        settings: ExchangeSettings,
    ) -> Self {
        Self::with_http_client(name, credentials, settings, reqwest::Client::new())
    }

    pub fn with_http_client(
        name: impl Into<String>,
        credentials: Arc<dyn CredentialLifecycle>,
        settings: ExchangeSettings,
        http: reqwest::Client,
    ) -> Self {
        let name = name.into();
        let base_url = settings.graph_base_url.clone();
        Self {
            guard: AuthGuard::new(
                credentials,
                Box::new(move |credential: &Credential| {
                    Ok(GraphClient::new(
                        http.clone(),
                        &base_url,
                        &credential.access_token,
                    ))
                }),
            ),
            labels: LabelRegistry::with_ttl(name.clone(), settings.label_ttl),
            adapter: Arc::new(ExchangeAdapter::new()),
            subscription_id: Mutex::new(None),
            settings,
            name,
        }
    }

    /// Id of the active Graph subscription, if any
    pub async fn subscription_id(&self) -> Option<String> {
        self.subscription_id.lock().await.clone()
    }

    async fn get_raw_message(&self, graph: &GraphClient, id: &str) -> Result<Value> {
        let path = format!("me/messages/{}", id);
        let query = [("$select", MESSAGE_FIELDS.to_string())];
        with_retry("messages.get", &self.settings.retry, || {
            graph.get(&path, &query)
        })
        .await
    }
}

#[async_trait]
impl RemoteLabelApi for ExchangeProvider {
    async fn list_labels(&self) -> Result<Vec<RemoteLabelHandle>> {
        let graph = self.guard.ensure_authenticated().await?;
        let response = with_retry("masterCategories.list", &self.settings.retry, || {
            graph.get("me/outlook/masterCategories", &[])
        })
        .await?;

        Ok(response
            .get("value")
            .and_then(Value::as_array)
            .map(|categories| {
                categories
                    .iter()
                    .filter_map(|category| {
                        Some(RemoteLabelHandle {
                            id: category.get("id")?.as_str()?.to_string(),
                            name: category.get("displayName")?.as_str()?.to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create_label(&self, label: &Label) -> Result<RemoteLabelHandle> {
        let graph = self.guard.ensure_authenticated().await?;
        let body = json!({ "displayName": label.name, "color": "preset0" });
        let created = with_retry("masterCategories.create", &self.settings.retry, || {
            graph.post("me/outlook/masterCategories", &body)
        })
        .await?;

        let id = created
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                PipelineError::ProviderApi(format!("Created category {} has no id", label.name))
            })?
            .to_string();
        Ok(RemoteLabelHandle {
            id,
            name: label.name.clone(),
        })
    }
}

#[async_trait]
impl EmailProvider for ExchangeProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn adapter(&self) -> Arc<dyn EmailAdapter> {
        self.adapter.clone()
    }

    async fn fetch_last_emails(&self, query: FetchQuery) -> Result<Vec<Message>> {
        let graph = self.guard.ensure_authenticated().await?;
        let since = (Utc::now() - ChronoDuration::hours(query.window_hours as i64))
            .to_rfc3339_opts(SecondsFormat::Secs, true);
        let first_page = [
            ("$filter", format!("receivedDateTime ge {}", since)),
            ("$orderby", "receivedDateTime desc".to_string()),
            ("$top", query.count.clamp(1, MAX_PAGE_SIZE).to_string()),
            ("$select", MESSAGE_FIELDS.to_string()),
        ];

        let mut raw: Vec<Value> = Vec::new();
        let mut next: Option<String> = Some("me/messages".to_string());
        let mut first = true;
        while let Some(path) = next.take() {
            // nextLink already carries the query string
            let params: &[(&str, String)] = if first { &first_page } else { &[] };
            first = false;
            let page = with_retry("messages.list", &self.settings.retry, || {
                graph.get(&path, params)
            })
            .await?;

            if let Some(values) = page.get("value").and_then(Value::as_array) {
                raw.extend(values.iter().cloned());
            }
            if raw.len() >= query.count {
                raw.truncate(query.count);
                break;
            }
            next = page
                .get("@odata.nextLink")
                .and_then(Value::as_str)
                .map(str::to_string);
        }

        debug!(provider = %self.name, count = raw.len(), "Fetched recent messages");
        Ok(adapt_valid(self.adapter.as_ref(), &self.name, &raw))
    }

    async fn apply_label(&self, mut message: Message, label: &Label) -> Result<Message> {
        self.labels.get_or_create(self, label).await?;
        let graph = self.guard.ensure_authenticated().await?;

        let mut categories: Vec<String> = message.labels.iter().cloned().collect();
        if !categories.contains(&label.name) {
            categories.push(label.name.clone());
        }
        let path = format!("me/messages/{}", message.id);
        let body = json!({ "categories": categories });
        with_retry("messages.update", &self.settings.retry, || {
            graph.patch(&path, &body)
        })
        .await?;

        message.add_label(&label.name);
        info!(
            provider = %self.name,
            message_id = %message.id,
            label = %label.name,
            "Applied category"
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
        let notification_url = self.settings.notification_url.clone().ok_or_else(|| {
            PipelineError::Config("exchange.notification_url is required to listen".to_string())
        })?;
        let graph = self.guard.ensure_authenticated().await?;

        let lifetime = ChronoDuration::from_std(self.settings.subscription_lifetime)
            .map_err(|e| PipelineError::Config(format!("Invalid subscription lifetime: {}", e)))?;
        let body = json!({
            "changeType": "created",
            "notificationUrl": notification_url,
            "resource": "me/mailFolders('Inbox')/messages",
            "expirationDateTime": (Utc::now() + lifetime).to_rfc3339_opts(SecondsFormat::Secs, true),
            "clientState": self.settings.client_state,
        });
        let created = with_retry("subscriptions.create", &self.settings.retry, || {
            graph.post("subscriptions", &body)
        })
        .await?;

        let id = created
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| PipelineError::ProviderApi("Subscription response has no id".to_string()))?
            .to_string();
        let expires = created
            .get("expirationDateTime")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        info!(
            provider = %self.name,
            subscription = %id,
            expires = expires,
            "Graph subscription created"
        );
        *self.subscription_id.lock().await = Some(id);
        Ok(())
    }

    async fn stop_listening(&self) -> Result<()> {
        let mut subscription = self.subscription_id.lock().await;
        let Some(id) = subscription.clone() else {
            debug!(provider = %self.name, "No active subscription to remove");
            return Ok(());
        };

        let graph = self.guard.ensure_authenticated().await?;
        let path = format!("subscriptions/{}", id);
        match with_retry("subscriptions.delete", &self.settings.retry, || {
            graph.delete(&path)
        })
        .await
        {
            Ok(()) => {}
            Err(PipelineError::NotFound(_)) => {
                warn!(provider = %self.name, subscription = %id, "Subscription already gone")
            }
            Err(e) => return Err(e),
        }

        *subscription = None;
        info!(provider = %self.name, subscription = %id, "Graph subscription removed");
        Ok(())
    }

    fn notification_items(&self, body: &Value) -> Result<Vec<Value>> {
        body.get("value")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| {
                PipelineError::Validation("Graph notification body has no value array".to_string())
            })
    }

    async fn resolve_notification(&self, item: &Value) -> Result<Vec<Value>> {
        if !self.settings.client_state.is_empty() {
            let state = item.get("clientState").and_then(Value::as_str);
            if state != Some(self.settings.client_state.as_str()) {
                return Err(PipelineError::Validation(
                    "Notification clientState does not match".to_string(),
                ));
            }
        }

        let resource_data = item.get("resourceData").cloned().unwrap_or(Value::Null);
        if is_complete_message(&resource_data) {
            return Ok(vec![resource_data]);
        }

        let id = resource_data
            .get("id")
            .and_then(Value::as_str)
            .or_else(|| {
                item.get("resource")
                    .and_then(Value::as_str)
                    .and_then(resource_message_id)
            })
            .ok_or_else(|| {
                PipelineError::Validation("Notification does not reference a message".to_string())
            })?
            .to_string();

        let graph = self.guard.ensure_authenticated().await?;
        let message = self.get_raw_message(&graph, &id).await?;
        Ok(vec![message])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_message_id() {
        assert_eq!(
            resource_message_id("Users/abc/Messages/AAMkAD="),
            Some("AAMkAD=")
        );
        assert_eq!(resource_message_id("me/mailFolders('Inbox')/messages/m1"), Some("m1"));
        assert_eq!(resource_message_id("Users/abc/Events/e1"), None);
        assert_eq!(resource_message_id("m1"), None);
    }

    #[test]
    fn test_complete_message_detection() {
        let partial = json!({"@odata.type": "#Microsoft.Graph.Message", "id": "m1"});
        assert!(!is_complete_message(&partial));

        let full = json!({
            "id": "m1", "conversationId": "t1", "subject": "s",
            "from": {}, "toRecipients": [], "receivedDateTime": "2024-01-01T00:00:00Z"
        });
        assert!(is_complete_message(&full));
    }

    #[test]
    fn test_graph_url_joining() {
        let client = GraphClient::new(reqwest::Client::new(), "http://localhost:1/v1.0/", "t");
        assert_eq!(client.url("/me/messages"), "http://localhost:1/v1.0/me/messages");
        assert_eq!(
            client.url("https://graph.microsoft.com/v1.0/me/messages?$skip=10"),
            "https://graph.microsoft.com/v1.0/me/messages?$skip=10"
        );
    }
}
