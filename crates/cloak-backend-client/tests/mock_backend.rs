#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use cloak_backend_client::{BackendClientError, IdentityClient, IdentityClientConfig};
use cloak_client_core::auth::{IdentityBackend, LinkedAccountProfile};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

const ANON_KEY: &str = "anon-test-key";

#[derive(Default)]
struct MockState {
    seen_api_keys: Vec<String>,
    refresh_calls: usize,
    linked_logins: Vec<Value>,
}

type Shared = Arc<Mutex<MockState>>;

struct MockBackend {
    base_url: String,
    state: Shared,
    shutdown: oneshot::Sender<()>,
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn record_api_key(state: &Shared, headers: &HeaderMap) {
    if let Some(key) = headers.get("apikey").and_then(|value| value.to_str().ok()) {
        state.lock().unwrap().seen_api_keys.push(key.to_string());
    }
}

async fn current_user(State(state): State<Shared>, headers: HeaderMap) -> Response {
    record_api_key(&state, &headers);
    match bearer(&headers).as_deref() {
        Some("access-good" | "access-fresh") => {
            Json(json!({"id": "user-1", "email": "ada@example.com"})).into_response()
        }
        _ => (StatusCode::UNAUTHORIZED, Json(json!({"msg": "invalid JWT"}))).into_response(),
    }
}

async fn refresh_token(
    State(state): State<Shared>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    record_api_key(&state, &headers);
    state.lock().unwrap().refresh_calls += 1;
    if query.get("grant_type").map(String::as_str) != Some("refresh_token") {
        return (StatusCode::BAD_REQUEST, "unsupported grant").into_response();
    }
    match body.get("refresh_token").and_then(Value::as_str) {
        Some("refresh-good") => Json(json!({
            "access_token": "access-fresh",
            "refresh_token": "refresh-next",
            "user": {"id": "user-1"}
        }))
        .into_response(),
        _ => (StatusCode::BAD_REQUEST, "invalid refresh token").into_response(),
    }
}

async fn users_table(
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if bearer(&headers).is_none() {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match query.get("id").map(String::as_str) {
        Some("eq.user-1") => Json(json!([{
            "id": "user-1",
            "email": "ada@example.com",
            "name": "Ada Lovelace",
            "subscription_plan": "premium",
            "subscription_is_active": true,
            "created_at": "2024-01-01T00:00:00Z"
        }]))
        .into_response(),
        _ => Json(json!([])).into_response(),
    }
}

async fn telegram_auth(State(state): State<Shared>, Json(body): Json<Value>) -> Response {
    state.lock().unwrap().linked_logins.push(body.clone());
    let Some(id) = body.get("id").and_then(Value::as_i64).filter(|id| *id > 0) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Invalid telegram id"})),
        )
            .into_response();
    };
    if id == 7 {
        return Json(json!({"error": "account disabled"})).into_response();
    }
    Json(json!({
        "user": {
            "id": format!("tg-user-{id}"),
            "telegram_id": id,
            "name": body.get("first_name").cloned().unwrap_or(Value::Null),
        }
    }))
    .into_response()
}

async fn start_mock_backend() -> MockBackend {
    let state: Shared = Arc::new(Mutex::new(MockState::default()));
    let router = Router::new()
        .route("/auth/v1/user", get(current_user))
        .route("/auth/v1/token", post(refresh_token))
        .route("/rest/v1/users", get(users_table))
        .route("/api/telegram/auth", post(telegram_auth))
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock backend");
    let addr = listener.local_addr().expect("mock backend addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await;
    });

    MockBackend {
        base_url: format!("http://{addr}"),
        state,
        shutdown: shutdown_tx,
    }
}

fn client_for(mock: &MockBackend) -> IdentityClient {
    let mut config = IdentityClientConfig::new(&mock.base_url, &mock.base_url);
    config.anon_key = Some(ANON_KEY.to_string());
    IdentityClient::new(config).expect("identity client")
}

fn profile(id: i64) -> LinkedAccountProfile {
    LinkedAccountProfile {
        id,
        first_name: "Ada".to_string(),
        last_name: Some("Lovelace".to_string()),
        username: Some("ada".to_string()),
        photo_url: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn credential_exchange_then_profile_fetch() {
    let mock = start_mock_backend().await;
    let client = client_for(&mock);

    let session = IdentityBackend::exchange_credential(&client, "access-good", None)
        .await
        .expect("exchange");
    assert_eq!(session.user_id, "user-1");
    assert_eq!(session.email.as_deref(), Some("ada@example.com"));
    assert_eq!(session.access_token, "access-good");

    let row = IdentityBackend::fetch_profile(&client, &session)
        .await
        .expect("profile");
    assert_eq!(row.name.as_deref(), Some("Ada Lovelace"));
    assert_eq!(row.subscription_plan.as_deref(), Some("premium"));

    assert!(
        mock.state
            .lock()
            .unwrap()
            .seen_api_keys
            .iter()
            .all(|key| key == ANON_KEY)
    );
    let _ = mock.shutdown.send(());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_access_credential_is_refreshed_once() {
    let mock = start_mock_backend().await;
    let client = client_for(&mock);

    let session = client
        .exchange_credential("access-stale", Some("refresh-good"))
        .await
        .expect("refresh path");
    assert_eq!(session.access_token, "access-fresh");
    assert_eq!(session.refresh_token.as_deref(), Some("refresh-next"));
    assert_eq!(mock.state.lock().unwrap().refresh_calls, 1);

    let _ = mock.shutdown.send(());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_access_without_refresh_surfaces_http_error() {
    let mock = start_mock_backend().await;
    let client = client_for(&mock);

    let error = client
        .exchange_credential("access-stale", Some("   "))
        .await
        .expect_err("must fail");
    assert!(matches!(
        error,
        BackendClientError::Http { status, .. } if status == reqwest::StatusCode::UNAUTHORIZED
    ));
    assert_eq!(mock.state.lock().unwrap().refresh_calls, 0);

    let error = client
        .exchange_credential("access-stale", Some("refresh-bad"))
        .await
        .expect_err("bad refresh must fail");
    assert!(matches!(
        error,
        BackendClientError::Http { status, .. } if status == reqwest::StatusCode::BAD_REQUEST
    ));

    let _ = mock.shutdown.send(());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_profile_row_is_reported() {
    let mock = start_mock_backend().await;
    let client = client_for(&mock);

    let mut session = client
        .exchange_credential("access-good", None)
        .await
        .expect("exchange");
    session.user_id = "ghost".to_string();
    let error = client.fetch_profile(&session).await.expect_err("no row");
    assert!(matches!(
        error,
        BackendClientError::ProfileNotFound { ref user_id } if user_id == "ghost"
    ));

    let _ = mock.shutdown.send(());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn linked_account_login_posts_profile_fields() {
    let mock = start_mock_backend().await;
    let client = client_for(&mock);

    let row = client
        .linked_account_login(&profile(42))
        .await
        .expect("linked login");
    assert_eq!(row.id, "tg-user-42");
    assert_eq!(row.telegram_id, Some(42));

    let sent = mock.state.lock().unwrap().linked_logins[0].clone();
    assert_eq!(sent["id"], json!(42));
    assert_eq!(sent["first_name"], json!("Ada"));
    assert_eq!(sent["last_name"], json!("Lovelace"));
    assert_eq!(sent["username"], json!("ada"));
    assert!(sent.get("photo_url").is_none());
    assert!(sent["auth_date"].as_i64().is_some_and(|value| value > 0));

    let _ = mock.shutdown.send(());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn linked_account_login_errors_are_typed() {
    let mock = start_mock_backend().await;
    let client = client_for(&mock);

    let error = client
        .linked_account_login(&profile(7))
        .await
        .expect_err("rejected");
    assert!(matches!(
        error,
        BackendClientError::LinkedLoginRejected { ref message } if message == "account disabled"
    ));

    let error = client
        .linked_account_login(&profile(0))
        .await
        .expect_err("bad request");
    assert!(error.to_string().starts_with("identity_http_400"));

    let _ = mock.shutdown.send(());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_backend_maps_to_request_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let base_url = format!("http://{addr}");
    let mut config = IdentityClientConfig::new(&base_url, &base_url);
    config.request_attempts = 1;
    let client = IdentityClient::new(config).expect("client");

    let error = client
        .exchange_credential("access-good", None)
        .await
        .expect_err("connection refused");
    assert!(matches!(error, BackendClientError::Request { .. }));
}
