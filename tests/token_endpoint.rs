//! OAuth refresh against a mock token endpoint

use chrono::{Duration, Utc};
use mail_categorizer::credentials::{
    Credential, CredentialLifecycle, CredentialManager, CredentialStore, FileCredentialStore,
    OAuthTokenEndpoint, TokenRefresher,
};
use mail_categorizer::error::PipelineError;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn endpoint(server: &MockServer) -> OAuthTokenEndpoint {
    OAuthTokenEndpoint::new(format!("{}/token", server.uri()), "client-id")
        .with_client_secret("client-secret")
}

fn expired(refresh_token: &str) -> Credential {
    Credential {
        access_token: "stale".to_string(),
        refresh_token: Some(refresh_token.to_string()),
        expiry_date: Some(Utc::now() - Duration::minutes(5)),
    }
}

#[tokio::test]
async fn test_refresh_posts_form_and_parses_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=old-refresh"))
        .and(body_string_contains("client_id=client-id"))
        .and(body_string_contains("client_secret=client-secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "fresh-access",
            "refresh_token": "rotated-refresh",
            "expires_in": 3600,
            "token_type": "Bearer"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let credential = endpoint(&server).refresh("old-refresh").await.unwrap();

    assert_eq!(credential.access_token, "fresh-access");
    assert_eq!(credential.refresh_token.as_deref(), Some("rotated-refresh"));
    let expiry = credential.expiry_date.unwrap();
    assert!(expiry > Utc::now() + Duration::minutes(55));
}

#[tokio::test]
async fn test_scope_is_sent_when_configured() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("scope=offline_access"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "graph-access",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&server)
        .await;

    let credential = endpoint(&server)
        .with_scope("offline_access Mail.ReadWrite")
        .refresh("old-refresh")
        .await
        .unwrap();

    assert_eq!(credential.access_token, "graph-access");
    assert!(credential.refresh_token.is_none());
}

#[tokio::test]
async fn test_error_body_becomes_auth_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "Token has been expired or revoked."
        })))
        .mount(&server)
        .await;

    let err = endpoint(&server).refresh("revoked").await.unwrap_err();

    match err {
        PipelineError::Auth(msg) => {
            assert!(msg.contains("invalid_grant"));
            assert!(msg.contains("expired or revoked"));
        }
        other => panic!("expected Auth, got {:?}", other),
    }
}

#[tokio::test]
async fn test_non_json_error_reports_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .mount(&server)
        .await;

    let err = endpoint(&server).refresh("old-refresh").await.unwrap_err();
    assert!(matches!(err, PipelineError::Auth(msg) if msg.contains("HTTP 502")));
}

#[tokio::test]
async fn test_hung_token_endpoint_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"access_token": "late", "expires_in": 3600}))
                .set_delay(std::time::Duration::from_secs(10)),
        )
        .mount(&server)
        .await;

    let started = std::time::Instant::now();
    let err = endpoint(&server)
        .with_timeout(std::time::Duration::from_millis(200))
        .refresh("old-refresh")
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Timeout(_)));
    assert!(started.elapsed() < std::time::Duration::from_secs(5));
}

#[tokio::test]
async fn test_manager_releases_lock_after_refresh_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"access_token": "late", "expires_in": 3600}))
                .set_delay(std::time::Duration::from_secs(10)),
        )
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileCredentialStore::new(
        dir.path().join("token.json"),
        "client-id",
        "",
    ));
    store.save(&expired("r")).await.unwrap();
    let refresher = endpoint(&server).with_timeout(std::time::Duration::from_millis(200));
    let manager = CredentialManager::new("exchange", store, Arc::new(refresher));

    let err = manager.refresh_token_if_needed().await.unwrap_err();
    assert!(matches!(err, PipelineError::Timeout(_)));

    // The credential mutex is free again
    let held = manager.get_authenticated_client().await.unwrap();
    assert_eq!(held.access_token, "stale");
}

#[tokio::test]
async fn test_manager_refreshes_and_persists_to_file() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "fresh-access",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let token_path = dir.path().join("tokens").join("gmail.json");
    let store = Arc::new(FileCredentialStore::new(&token_path, "client-id", "client-secret"));
    store.save(&expired("keep-me")).await.unwrap();

    let manager = CredentialManager::new("gmail", store.clone(), Arc::new(endpoint(&server)));
    assert!(manager.needs_token_refresh().await);

    let credential = manager.refresh_token_if_needed().await.unwrap();
    assert_eq!(credential.access_token, "fresh-access");
    // No rotation in the response keeps the stored refresh token
    assert_eq!(credential.refresh_token.as_deref(), Some("keep-me"));
    assert!(!manager.needs_token_refresh().await);

    // Second call is served from the held credential
    manager.refresh_token_if_needed().await.unwrap();

    let document: Value =
        serde_json::from_str(&std::fs::read_to_string(&token_path).unwrap()).unwrap();
    assert_eq!(document["type"], "authorized_user");
    assert_eq!(document["client_id"], "client-id");
    assert_eq!(document["access_token"], "fresh-access");
    assert_eq!(document["refresh_token"], "keep-me");
    assert!(document["expiry_date"].as_i64().unwrap() > Utc::now().timestamp_millis());

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&token_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}

#[tokio::test]
async fn test_manager_surfaces_refresh_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant"
        })))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileCredentialStore::new(
        dir.path().join("token.json"),
        "client-id",
        "",
    ));
    store.save(&expired("revoked")).await.unwrap();

    let manager = CredentialManager::new("exchange", store.clone(), Arc::new(endpoint(&server)));
    let err = manager.refresh_token_if_needed().await.unwrap_err();
    assert!(matches!(err, PipelineError::Auth(_)));

    // The stale credential stays on disk for the next attempt
    let stored = store.load().await.unwrap().unwrap();
    assert_eq!(stored.access_token, "stale");
}

#[tokio::test]
async fn test_missing_credential_is_auth_error() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileCredentialStore::new(
        dir.path().join("absent.json"),
        "client-id",
        "",
    ));
    let manager = CredentialManager::new(
        "gmail",
        store,
        Arc::new(OAuthTokenEndpoint::new("http://127.0.0.1:9/token", "client-id")),
    );

    let err = manager.get_authenticated_client().await.unwrap_err();
    assert!(matches!(err, PipelineError::Auth(_)));
}
