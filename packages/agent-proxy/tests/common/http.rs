use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::extract::{Path as UrlPath, State as StubState};
use axum::http::{Method, Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete as axum_delete, get as axum_get, post as axum_post};
use axum::{Json, Router};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::util::ServiceExt;

use agent_proxy::config::{ConfigOptions, RuntimeConfig};
use agent_proxy::router::{build_router, AppState};
use agent_proxy_foundry::StaticTokenCredential;

const STUB_PLUGIN: &str = "stub-bot";
const STUB_SECRET: &str = "stub-secret";
const STUB_USER: &str = "user-1";

#[derive(Default)]
struct DirectLineStub {
    /// Activities served on every poll.
    activities: Mutex<Vec<Value>>,
    /// `expires_in` returned from token generation.
    token_expires_in: Mutex<i64>,
    token_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    post_calls: AtomicUsize,
    poll_calls: AtomicUsize,
    last_posted: Mutex<Option<Value>>,
    last_auth: Mutex<Option<String>>,
}

impl DirectLineStub {
    fn new() -> Arc<Self> {
        let stub = Self::default();
        *stub.token_expires_in.lock().unwrap() = 1800;
        Arc::new(stub)
    }

    fn set_activities(&self, activities: Vec<Value>) {
        *self.activities.lock().unwrap() = activities;
    }

    fn set_token_expires_in(&self, seconds: i64) {
        *self.token_expires_in.lock().unwrap() = seconds;
    }
}

async fn stub_generate_token(StubState(stub): StubState<Arc<DirectLineStub>>) -> Json<Value> {
    stub.token_calls.fetch_add(1, Ordering::SeqCst);
    let expires_in = *stub.token_expires_in.lock().unwrap();
    Json(json!({
        "conversationId": "conv-1",
        "token": "token-initial",
        "expires_in": expires_in,
    }))
}

async fn stub_start_conversation() -> Json<Value> {
    Json(json!({
        "conversationId": "conv-1",
        "streamUrl": "wss://stub/stream",
    }))
}

async fn stub_refresh_token(StubState(stub): StubState<Arc<DirectLineStub>>) -> Json<Value> {
    stub.refresh_calls.fetch_add(1, Ordering::SeqCst);
    Json(json!({ "token": "token-refreshed", "expires_in": 1800 }))
}

async fn stub_post_activity(
    StubState(stub): StubState<Arc<DirectLineStub>>,
    headers: axum::http::HeaderMap,
    UrlPath(_id): UrlPath<String>,
    Json(activity): Json<Value>,
) -> Json<Value> {
    stub.post_calls.fetch_add(1, Ordering::SeqCst);
    *stub.last_auth.lock().unwrap() = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    *stub.last_posted.lock().unwrap() = Some(activity);
    Json(json!({ "id": "posted-1" }))
}

async fn stub_get_activities(
    StubState(stub): StubState<Arc<DirectLineStub>>,
    UrlPath(_id): UrlPath<String>,
) -> Json<Value> {
    stub.poll_calls.fetch_add(1, Ordering::SeqCst);
    let activities = stub.activities.lock().unwrap().clone();
    Json(json!({ "activities": activities, "watermark": "wm-1" }))
}

fn directline_router(stub: Arc<DirectLineStub>) -> Router {
    Router::new()
        .route("/v3/directline/tokens/generate", axum_post(stub_generate_token))
        .route("/v3/directline/conversations", axum_post(stub_start_conversation))
        .route("/v3/directline/tokens/refresh", axum_post(stub_refresh_token))
        .route(
            "/v3/directline/conversations/:id/activities",
            axum_post(stub_post_activity).get(stub_get_activities),
        )
        .with_state(stub)
}

#[derive(Default)]
struct FoundryStub {
    thread_creates: AtomicUsize,
    thread_deletes: AtomicUsize,
    message_creates: AtomicUsize,
    run_creates: AtomicUsize,
    /// Raw SSE body returned for streaming run creates.
    stream_body: Mutex<String>,
}

impl FoundryStub {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn set_stream_body(&self, body: &str) {
        *self.stream_body.lock().unwrap() = body.to_string();
    }
}

async fn stub_create_thread(StubState(stub): StubState<Arc<FoundryStub>>) -> Json<Value> {
    stub.thread_creates.fetch_add(1, Ordering::SeqCst);
    Json(json!({ "id": "thread-1", "object": "thread" }))
}

async fn stub_delete_thread(
    StubState(stub): StubState<Arc<FoundryStub>>,
    UrlPath((_project, _thread)): UrlPath<(String, String)>,
) -> StatusCode {
    stub.thread_deletes.fetch_add(1, Ordering::SeqCst);
    StatusCode::NO_CONTENT
}

async fn stub_create_message(
    StubState(stub): StubState<Arc<FoundryStub>>,
    UrlPath((_project, thread)): UrlPath<(String, String)>,
    Json(body): Json<Value>,
) -> Json<Value> {
    stub.message_creates.fetch_add(1, Ordering::SeqCst);
    Json(json!({
        "id": "msg-1",
        "thread_id": thread,
        "role": body["role"],
        "content": body["content"],
    }))
}

async fn stub_list_messages(
    UrlPath((_project, thread)): UrlPath<(String, String)>,
) -> Json<Value> {
    Json(json!({
        "data": [
            { "id": "msg-1", "thread_id": thread, "role": "user" },
            { "id": "msg-2", "thread_id": thread, "role": "assistant" },
        ]
    }))
}

async fn stub_create_run(
    StubState(stub): StubState<Arc<FoundryStub>>,
    UrlPath((_project, _thread)): UrlPath<(String, String)>,
    Json(body): Json<Value>,
) -> axum::response::Response {
    stub.run_creates.fetch_add(1, Ordering::SeqCst);
    if body["stream"] == json!(true) {
        let sse = stub.stream_body.lock().unwrap().clone();
        return (
            [("content-type", "text/event-stream")],
            sse,
        )
            .into_response();
    }
    Json(json!({ "id": "run-1", "status": "queued" })).into_response()
}

async fn stub_get_run(
    UrlPath((_project, _thread, run)): UrlPath<(String, String, String)>,
) -> Json<Value> {
    Json(json!({ "id": run, "status": "completed" }))
}

fn foundry_router(stub: Arc<FoundryStub>) -> Router {
    Router::new()
        .route(
            "/api/projects/:project/threads",
            axum_post(stub_create_thread),
        )
        .route(
            "/api/projects/:project/threads/:thread",
            axum_delete(stub_delete_thread),
        )
        .route(
            "/api/projects/:project/threads/:thread/messages",
            axum_post(stub_create_message).get(stub_list_messages),
        )
        .route(
            "/api/projects/:project/threads/:thread/runs",
            axum_post(stub_create_run),
        )
        .route(
            "/api/projects/:project/threads/:thread/runs/:run",
            axum_get(stub_get_run),
        )
        .with_state(stub)
}

async fn serve_ephemeral(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub server");
    let addr = listener.local_addr().expect("stub addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{addr}")
}

struct TestApp {
    app: Router,
    directline: Arc<DirectLineStub>,
    foundry: Arc<FoundryStub>,
    foundry_url: String,
    _plugins_dir: TempDir,
}

impl TestApp {
    async fn new() -> Self {
        Self::with_expose_config(false).await
    }

    async fn with_expose_config(expose_config: bool) -> Self {
        let directline = DirectLineStub::new();
        let foundry = FoundryStub::new();
        let directline_url = serve_ephemeral(directline_router(directline.clone())).await;
        let foundry_url = serve_ephemeral(foundry_router(foundry.clone())).await;

        let plugins_dir = tempfile::tempdir().expect("plugins dir");
        let manifest = json!({
            "id": STUB_PLUGIN,
            "label": "Stub Bot",
            "default": true,
            "connection": {
                "provider": "copilot_studio",
                "directLineEndpoint": directline_url,
                "directLineSecret": STUB_SECRET,
                "directLineUserId": STUB_USER,
                "directLineBotId": "bot-1",
            }
        });
        std::fs::write(
            plugins_dir.path().join("manifest.json"),
            manifest.to_string(),
        )
        .expect("write manifest");

        let config = RuntimeConfig::load(&ConfigOptions {
            plugins_dir: Some(plugins_dir.path().to_path_buf()),
            poll_interval_ms: Some(10),
            stream_timeout_ms: Some(250),
            expose_config,
            ..Default::default()
        });
        let state = AppState::with_credential(
            config,
            Arc::new(StaticTokenCredential::new("test-token")),
        );
        Self {
            app: build_router(state),
            directline,
            foundry,
            foundry_url,
            _plugins_dir: plugins_dir,
        }
    }

    /// Create a polling conversation through the API and return its id.
    async fn create_polling_thread(&self) -> String {
        let (status, payload) = send_json(
            &self.app,
            Method::POST,
            "/thread",
            Some(json!({ "provider": "copilot_studio" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "thread create: {payload}");
        payload["id"].as_str().expect("conversation id").to_string()
    }
}

async fn send_json(
    app: &Router,
    method: Method,
    path: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(path);
    let body = if let Some(body) = body {
        builder = builder.header("content-type", "application/json");
        Body::from(body.to_string())
    } else {
        Body::empty()
    };
    let request = builder.body(body).expect("request");
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("request handled");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or(Value::String(String::from_utf8_lossy(&bytes).to_string()))
    };
    (status, value)
}

async fn send_status(app: &Router, method: Method, path: &str, body: Option<Value>) -> StatusCode {
    let (status, _) = send_json(app, method, path, body).await;
    status
}

/// Run an SSE request to completion and parse the body into named events.
async fn collect_sse(app: &Router, path: &str) -> Vec<(String, Value)> {
    let request = Request::builder()
        .method(Method::GET)
        .uri(path)
        .body(Body::empty())
        .expect("sse request");
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("sse handled");
    assert_eq!(response.status(), StatusCode::OK, "sse status");
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("sse body")
        .to_bytes();
    parse_sse(&String::from_utf8_lossy(&bytes))
}

fn parse_sse(body: &str) -> Vec<(String, Value)> {
    let mut events = Vec::new();
    let mut name = String::new();
    let mut data = String::new();
    for line in body.lines() {
        if let Some(value) = line.strip_prefix("event:") {
            name = value.trim().to_string();
        } else if let Some(value) = line.strip_prefix("data:") {
            data.push_str(value.trim());
        } else if line.is_empty() && !(name.is_empty() && data.is_empty()) {
            let parsed = serde_json::from_str(&data).unwrap_or(Value::String(data.clone()));
            events.push((name.clone(), parsed));
            name.clear();
            data.clear();
        }
    }
    events
}

fn event_names(events: &[(String, Value)]) -> Vec<&str> {
    events.iter().map(|(name, _)| name.as_str()).collect()
}
