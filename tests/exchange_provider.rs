//! Exchange provider against a mocked Microsoft Graph

mod common;

use mail_categorizer::audit::{AuditLog, MemoryAuditLog, ObjectType};
use mail_categorizer::categorizer::CategorizationService;
use mail_categorizer::error::PipelineError;
use mail_categorizer::models::Label;
use mail_categorizer::providers::{EmailProvider, ExchangeProvider, ExchangeSettings, FetchQuery};
use mail_categorizer::push::PushNotificationProcessor;
use mail_categorizer::registry::ProviderRegistry;
use mail_categorizer::retry::RetryPolicy;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_json, body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{classifier_returning, StaticCredentials};

fn settings(server: &MockServer) -> ExchangeSettings {
    ExchangeSettings {
        graph_base_url: server.uri(),
        notification_url: Some("https://hooks.example.com/webhooks/exchange/subscription".to_string()),
        client_state: "secret-state".to_string(),
        retry: RetryPolicy {
            max_retries: 1,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            timeout: Duration::from_secs(5),
        },
        ..ExchangeSettings::default()
    }
}

fn provider(server: &MockServer) -> ExchangeProvider {
    ExchangeProvider::new("exchange", StaticCredentials::new("token-1"), settings(server))
}

fn graph_message(id: &str, subject: &str) -> Value {
    json!({
        "id": id,
        "conversationId": format!("conv-{}", id),
        "subject": subject,
        "from": {"emailAddress": {"name": "Acme Billing", "address": "billing@acme.com"}},
        "toRecipients": [{"emailAddress": {"address": "me@x.com"}}],
        "receivedDateTime": "2024-01-01T00:00:00Z",
        "body": {"contentType": "text", "content": "Amount due: $40"},
        "categories": [],
        "webLink": format!("https://outlook.office.com/mail/{}", id)
    })
}

#[tokio::test]
async fn test_fetch_last_emails_skips_invalid_payloads() {
    let server = MockServer::start().await;
    let mut invalid = graph_message("m2", "Broken");
    invalid.as_object_mut().unwrap().remove("conversationId");

    Mock::given(method("GET"))
        .and(path("/me/messages"))
        .and(header("authorization", "Bearer token-1"))
        .and(query_param("$top", "5"))
        .and(query_param("$orderby", "receivedDateTime desc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [graph_message("m1", "Invoice #4"), invalid]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let messages = provider(&server)
        .fetch_last_emails(FetchQuery::new(5, 24))
        .await
        .unwrap();

    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, "m1");
    assert_eq!(messages[0].thread_id, "conv-m1");
    assert_eq!(messages[0].sender, "Acme Billing <billing@acme.com>");
}

#[tokio::test]
async fn test_fetch_follows_next_link_until_count() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/me/messages"))
        .and(query_param("$top", "3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [graph_message("m1", "One"), graph_message("m2", "Two")],
            "@odata.nextLink": format!("{}/me/messages?page=2", server.uri())
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/me/messages"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [graph_message("m3", "Three"), graph_message("m4", "Four")],
            "@odata.nextLink": format!("{}/me/messages?page=3", server.uri())
        })))
        .expect(1)
        .mount(&server)
        .await;

    let messages = provider(&server)
        .fetch_last_emails(FetchQuery::new(3, 24))
        .await
        .unwrap();

    let ids: Vec<&str> = messages.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["m1", "m2", "m3"]);
}

#[tokio::test]
async fn test_apply_label_creates_category_once_and_patches_message() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/me/outlook/masterCategories"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": []})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/me/outlook/masterCategories"))
        .and(body_partial_json(json!({"displayName": "Finance"})))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(json!({"id": "cat-1", "displayName": "Finance"})),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/me/messages/m1"))
        .and(body_json(json!({"categories": ["Finance"]})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/me/messages/m2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let exchange = provider(&server);
    let adapter = exchange.adapter();
    let finance = Label::lookup("Finance").unwrap();

    let first = adapter.adapt(&graph_message("m1", "Invoice #4"));
    let first = exchange.apply_label(first, &finance).await.unwrap();
    assert!(first.labels.contains("Finance"));

    // Cached handle; no second create
    let second = adapter.adapt(&graph_message("m2", "Invoice #5"));
    exchange.apply_label(second, &finance).await.unwrap();
}

#[tokio::test]
async fn test_category_conflict_recovers_by_refetching() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/me/outlook/masterCategories"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": []})))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/me/outlook/masterCategories"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [{"id": "cat-9", "displayName": "finance", "color": "preset3"}]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/me/outlook/masterCategories"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "error": {"code": "ErrorItemAlreadyExists", "message": "A category with that name exists"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let exchange = provider(&server);
    let handles = exchange
        .ensure_labels(&[Label::lookup("Finance").unwrap()])
        .await
        .unwrap();

    assert_eq!(handles.len(), 1);
    assert_eq!(handles[0].id, "cat-9");
}

#[tokio::test]
async fn test_unauthorized_is_auth_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/me/messages"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": {"code": "InvalidAuthenticationToken", "message": "Access token has expired"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let err = provider(&server)
        .fetch_last_emails(FetchQuery::new(5, 24))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Auth(ref msg) if msg.contains("InvalidAuthenticationToken")));
}

#[tokio::test]
async fn test_throttled_request_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/me/messages"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/me/messages"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"value": [graph_message("m1", "Hello")]})),
        )
        .mount(&server)
        .await;

    let messages = provider(&server)
        .fetch_last_emails(FetchQuery::new(5, 24))
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
}

#[tokio::test]
async fn test_subscription_lifecycle() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/subscriptions"))
        .and(body_partial_json(json!({
            "changeType": "created",
            "resource": "me/mailFolders('Inbox')/messages",
            "clientState": "secret-state",
            "notificationUrl": "https://hooks.example.com/webhooks/exchange/subscription"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "sub-1",
            "expirationDateTime": "2024-01-01T01:00:00Z"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/subscriptions/sub-1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let exchange = provider(&server);
    exchange.listen_for_incoming_emails().await.unwrap();
    assert_eq!(exchange.subscription_id().await.as_deref(), Some("sub-1"));

    exchange.stop_listening().await.unwrap();
    assert_eq!(exchange.subscription_id().await, None);

    // Nothing left to delete
    exchange.stop_listening().await.unwrap();
}

#[tokio::test]
async fn test_listen_requires_notification_url() {
    let server = MockServer::start().await;
    let exchange = ExchangeProvider::new(
        "exchange",
        StaticCredentials::new("token-1"),
        ExchangeSettings {
            notification_url: None,
            ..settings(&server)
        },
    );

    let err = exchange.listen_for_incoming_emails().await.unwrap_err();
    assert!(matches!(err, PipelineError::Config(_)));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_resolve_notification_fetches_message_by_id() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/me/messages/m1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(graph_message("m1", "Invoice #4")))
        .expect(1)
        .mount(&server)
        .await;

    let exchange = provider(&server);
    let item = json!({
        "subscriptionId": "sub-1",
        "clientState": "secret-state",
        "changeType": "created",
        "resource": "Users/u1/Messages/m1",
        "resourceData": {"@odata.type": "#Microsoft.Graph.Message", "id": "m1"}
    });

    let raw = exchange.resolve_notification(&item).await.unwrap();
    assert_eq!(raw.len(), 1);
    assert_eq!(raw[0]["subject"], "Invoice #4");
}

#[tokio::test]
async fn test_resolve_notification_rejects_foreign_client_state() {
    let server = MockServer::start().await;
    let exchange = provider(&server);
    let item = json!({
        "clientState": "someone-else",
        "resource": "Users/u1/Messages/m1",
        "resourceData": {"id": "m1"}
    });

    let err = exchange.resolve_notification(&item).await.unwrap_err();
    assert!(matches!(err, PipelineError::Validation(_)));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_graph_notification_is_categorized_end_to_end() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/me/messages/m1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(graph_message("m1", "Invoice #4")))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/me/outlook/masterCategories"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": []})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/me/outlook/masterCategories"))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(json!({"id": "cat-1", "displayName": "Finance"})),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/me/messages/m1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let registry = Arc::new(ProviderRegistry::new());
    registry.add("exchange", Arc::new(provider(&server))).await;
    let audit = Arc::new(MemoryAuditLog::new());
    let categorizer = Arc::new(CategorizationService::new(
        Arc::new(classifier_returning("Finance", 0.9, "invoice keyword")),
        audit.clone(),
        Duration::from_secs(5),
    ));
    let processor = PushNotificationProcessor::new(registry, categorizer, audit.clone());

    let body = json!({
        "value": [{
            "subscriptionId": "sub-1",
            "clientState": "secret-state",
            "changeType": "created",
            "resource": "Users/u1/Messages/m1",
            "resourceData": {"id": "m1"}
        }]
    });

    let report = processor.process("exchange", &body).await.unwrap();
    assert_eq!(report.processed, 1);
    assert!(audit.exists("conv-m1", "m1", ObjectType::Email).await.unwrap());

    // Redelivery is recognised from the audit log
    let again = processor.process("exchange", &body).await.unwrap();
    assert_eq!(again.replayed, 1);
}
