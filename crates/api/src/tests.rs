use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::body::to_bytes;
use axum::http::header::CONTENT_TYPE;
use axum::http::{Request, StatusCode};
use jsonwebtoken::{EncodingKey, Header, encode};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tower_util::ServiceExt;

use parley_domain::ports::directory::UserDirectory;
use parley_domain::ports::messages::MessageRepository;
use parley_infra::config::AppConfig;
use parley_infra::directory::InMemoryUserDirectory;
use parley_infra::repositories::InMemoryMessageRepository;

use crate::routes;
use crate::state::AppState;

#[derive(Serialize)]
struct Claims {
    sub: String,
    username: String,
    exp: usize,
}

fn test_config() -> AppConfig {
    AppConfig {
        app_env: "test".to_string(),
        port: 0,
        log_level: "info".to_string(),
        data_backend: "memory".to_string(),
        surreal_endpoint: "ws://127.0.0.1:8000".to_string(),
        surreal_ns: "parley".to_string(),
        surreal_db: "chat".to_string(),
        surreal_user: "root".to_string(),
        surreal_pass: "root".to_string(),
        jwt_secret: "test-secret".to_string(),
        auth_dev_bypass_enabled: false,
        auth_handshake_timeout_ms: 5_000,
    }
}

fn test_token(sub: &str) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time")
        .as_secs();
    let claims = Claims {
        sub: sub.to_string(),
        username: format!("{sub}-name"),
        exp: (now + 3600) as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret("test-secret".as_bytes()),
    )
    .expect("token")
}

fn test_app_state() -> AppState {
    let repository: Arc<dyn MessageRepository> = Arc::new(InMemoryMessageRepository::new());
    let directory: Arc<dyn UserDirectory> = Arc::new(InMemoryUserDirectory::new());
    AppState::with_components(test_config(), repository, directory)
}

fn test_app_state_router() -> (AppState, axum::Router) {
    let state = test_app_state();
    let app = routes::router(state.clone());
    (state, app)
}

fn test_app() -> axum::Router {
    test_app_state_router().1
}

async fn response_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

fn get_request(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::empty()).expect("request")
}

fn post_json(uri: &str, token: &str, payload: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(CONTENT_TYPE, "application/json")
        .header("authorization", format!("Bearer {token}"))
        .body(Body::from(payload.to_string()))
        .expect("request")
}

async fn send_message(
    app: &axum::Router,
    token: &str,
    receiver_id: &str,
    content: &str,
) -> axum::response::Response {
    let payload = json!({ "receiver_id": receiver_id, "content": content });
    app.clone()
        .oneshot(post_json("/v1/messages", token, &payload))
        .await
        .expect("response")
}

#[tokio::test]
async fn health_reports_ok_with_environment() {
    let app = test_app();
    let response = app
        .oneshot(get_request("/health", None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let body = response_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["environment"], "test");
}

#[tokio::test]
async fn protected_routes_reject_missing_and_invalid_tokens() {
    let app = test_app();

    for uri in [
        "/v1/conversations",
        "/v1/conversations/bob/messages",
        "/v1/presence/online",
    ] {
        let response = app
            .clone()
            .oneshot(get_request(uri, None))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{uri}");
    }

    let response = app
        .oneshot(get_request("/v1/conversations", Some("not-a-jwt")))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn send_message_returns_canonical_record() {
    let app = test_app();
    let alice = test_token("alice");

    let response = send_message(&app, &alice, "bob", "  Hello  ").await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let body = response_json(response).await;
    assert_eq!(body["sender_id"], "alice");
    assert_eq!(body["receiver_id"], "bob");
    assert_eq!(body["content"], "Hello");
    assert!(body["message_id"].as_str().is_some_and(|id| !id.is_empty()));
    assert!(body["created_at_ms"].as_i64().is_some_and(|ts| ts > 0));
    assert_eq!(body["read_by"], json!([]));
}

#[tokio::test]
async fn thread_and_conversations_reflect_sent_messages() {
    let app = test_app();
    let alice = test_token("alice");
    let bob = test_token("bob");

    for content in ["Hi", "Still there?"] {
        let response = send_message(&app, &alice, "bob", content).await;
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    let response = app
        .clone()
        .oneshot(get_request("/v1/conversations/alice/messages", Some(&bob)))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let thread = response_json(response).await;
    let contents: Vec<&str> = thread
        .as_array()
        .expect("array")
        .iter()
        .map(|m| m["content"].as_str().expect("content"))
        .collect();
    assert_eq!(contents, vec!["Hi", "Still there?"]);

    let response = app
        .clone()
        .oneshot(get_request("/v1/conversations", Some(&bob)))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let summaries = response_json(response).await;
    let summaries = summaries.as_array().expect("array");
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0]["other_user"]["user_id"], "alice");
    // Display snapshot recorded from alice's token claims.
    assert_eq!(summaries[0]["other_user"]["username"], "alice-name");
    assert_eq!(summaries[0]["last_message"]["content"], "Still there?");
    assert_eq!(summaries[0]["last_message"]["sender_id"], "alice");
}

#[tokio::test]
async fn thread_pagination_returns_newest_messages_first_page() {
    let app = test_app();
    let alice = test_token("alice");

    for i in 0..5 {
        send_message(&app, &alice, "bob", &format!("m{i}")).await;
    }

    let response = app
        .clone()
        .oneshot(get_request(
            "/v1/conversations/bob/messages?limit=2",
            Some(&alice),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let page = response_json(response).await;
    let contents: Vec<&str> = page
        .as_array()
        .expect("array")
        .iter()
        .map(|m| m["content"].as_str().expect("content"))
        .collect();
    assert_eq!(contents, vec!["m3", "m4"]);
}

#[tokio::test]
async fn self_addressed_message_is_rejected_and_never_stored() {
    let app = test_app();
    let alice = test_token("alice");

    let response = send_message(&app, &alice, "alice", "talking to myself").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response_json(response).await;
    assert_eq!(body["error"]["code"], "validation_error");

    let response = app
        .oneshot(get_request("/v1/conversations", Some(&alice)))
        .await
        .expect("response");
    let summaries = response_json(response).await;
    assert_eq!(summaries, json!([]));
}

#[tokio::test]
async fn empty_content_is_rejected() {
    let app = test_app();
    let alice = test_token("alice");

    let response = send_message(&app, &alice, "bob", "   ").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn mark_read_is_idempotent_and_missing_message_is_404() {
    let app = test_app();
    let alice = test_token("alice");
    let bob = test_token("bob");

    let response = send_message(&app, &alice, "bob", "read me").await;
    let message = response_json(response).await;
    let message_id = message["message_id"].as_str().expect("id");

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/v1/messages/{message_id}/read"),
                &bob,
                &json!({}),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = response_json(response).await;
        assert_eq!(body["read_by"], json!(["bob"]));
    }

    let response = app
        .oneshot(post_json("/v1/messages/missing/read", &bob, &json!({})))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn online_snapshot_excludes_the_caller() {
    let (state, app) = test_app_state_router();
    let bob = test_token("bob");

    let (alice_tx, _alice_rx) = mpsc::unbounded_channel();
    let (bob_tx, _bob_rx) = mpsc::unbounded_channel();
    state.realtime.register("alice", "a-1", alice_tx).await;
    state.realtime.register("bob", "b-1", bob_tx).await;

    let response = app
        .oneshot(get_request("/v1/presence/online", Some(&bob)))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["users"], json!(["alice"]));
}

#[tokio::test]
async fn conversation_list_survives_index_loss_via_rebuild() {
    let (state, app) = test_app_state_router();
    let alice = test_token("alice");
    let bob = test_token("bob");

    send_message(&app, &alice, "bob", "first").await;
    send_message(&app, &alice, "bob", "latest").await;

    // A fresh index over the same store simulates a restart; listing must
    // rebuild to the same result the incremental path produced.
    state
        .conversations
        .rebuild("bob")
        .await
        .expect("rebuild");

    let response = app
        .oneshot(get_request("/v1/conversations", Some(&bob)))
        .await
        .expect("response");
    let summaries = response_json(response).await;
    assert_eq!(summaries[0]["last_message"]["content"], "latest");
}
