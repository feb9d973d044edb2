//! HTTP surface of the bridge.
//!
//! One uniform thread/message/stream API fronts two very different
//! backends. Routing between them follows the resolved provider, with one
//! deliberate fallback: a thread id that lives in the conversation store is
//! always treated as a polling conversation, hint or no hint.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use agent_proxy_directline::{
    Activity, ChannelAccount, DirectLineClient, DirectLineError, TokenRequest, WireAttachment,
};
use agent_proxy_error::{BridgeError, ErrorType, ProblemDetails};
use agent_proxy_foundry::{AgentsClient, EnvTokenCredential, FoundryError, TokenCredential};
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Span};
use utoipa::{OpenApi, ToSchema};
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::conversations::{ensure_token, ConversationRecord, ConversationStore};
use crate::events::{to_sse_event, BridgeEvent, CompletionPayload, ContentBlock, DeltaPayload};
use crate::normalize::normalize_user_content;
use crate::providers::{normalize_provider, resolve_context, ProviderKind, ResolvedContext};
use crate::stream::{
    run_polling_turn, run_streaming_relay, CancelFlag, CancelOnDrop, PollingTurn,
};

pub struct AppState {
    pub config: RuntimeConfig,
    pub store: ConversationStore,
    directline: DirectLineClient,
    http: reqwest::Client,
    credential: Arc<dyn TokenCredential>,
    foundry_clients: std::sync::Mutex<HashMap<String, AgentsClient>>,
}

impl AppState {
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_credential(config, Arc::new(EnvTokenCredential::default()))
    }

    pub fn with_credential(config: RuntimeConfig, credential: Arc<dyn TokenCredential>) -> Self {
        let http = reqwest::Client::new();
        Self {
            config,
            store: ConversationStore::new(),
            directline: DirectLineClient::new(http.clone()),
            http,
            credential,
            foundry_clients: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Streaming-backend clients are cached per endpoint and project, the
    /// same pair that scopes their base URL.
    fn foundry_client(&self, endpoint: &str, project_id: &str) -> AgentsClient {
        let key = format!("{}|{}", endpoint.trim_end_matches('/'), project_id);
        let mut clients = self
            .foundry_clients
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        clients
            .entry(key)
            .or_insert_with(|| {
                AgentsClient::new(
                    self.http.clone(),
                    endpoint,
                    project_id,
                    self.credential.clone(),
                )
            })
            .clone()
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let mut router = Router::new()
        .route("/health", get(get_health))
        .route("/thread", post(create_thread))
        .route("/thread/:thread_id", delete(delete_thread))
        .route("/message", post(post_message))
        .route("/run", post(create_run))
        .route("/run/:thread_id/:run_id", get(get_run))
        .route("/messages/:thread_id", get(list_messages))
        .route("/run-stream", get(run_stream));

    if shared.config.expose_config() {
        router = router.route("/config", get(get_config));
    }

    let router = router.with_state(shared.clone()).fallback(not_found);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|req: &Request| {
            tracing::info_span!(
                "http.request",
                method = %req.method(),
                uri = %req.uri()
            )
        })
        .on_request(|_req: &Request, span: &Span| {
            tracing::info!(parent: span, "request");
        })
        .on_response(|res: &Response, latency: Duration, span: &Span| {
            tracing::info!(
                parent: span,
                status = %res.status(),
                latency_ms = latency.as_millis()
            );
        });

    (router.layer(trace_layer), shared)
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        get_config,
        create_thread,
        delete_thread,
        post_message,
        create_run,
        get_run,
        list_messages,
        run_stream
    ),
    components(schemas(
        HealthResponse,
        CreateThreadRequest,
        DeleteThreadRequest,
        MessageRequest,
        RunRequest,
        ProviderKind,
        ContentBlock,
        DeltaPayload,
        CompletionPayload,
        ProblemDetails,
        ErrorType
    )),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "threads", description = "Conversation lifecycle"),
        (name = "runs", description = "Agent runs and streaming")
    )
)]
pub struct ApiDoc;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Bridge(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

fn from_directline(err: DirectLineError) -> BridgeError {
    match (err.upstream_status(), &err) {
        (Some(status), _) => BridgeError::Upstream {
            operation: err.operation().to_string(),
            status,
            body: err.upstream_body().unwrap_or_default().to_string(),
        },
        (None, _) => BridgeError::Transport {
            operation: err.operation().to_string(),
            message: err.to_string(),
        },
    }
}

fn from_foundry(err: FoundryError) -> BridgeError {
    match &err {
        FoundryError::Status { .. } => BridgeError::Upstream {
            operation: err.operation().to_string(),
            status: err.upstream_status().unwrap_or(502),
            body: err.upstream_body().unwrap_or_default().to_string(),
        },
        FoundryError::Credential { message } => BridgeError::NotConfigured {
            message: message.clone(),
        },
        _ => BridgeError::Transport {
            operation: err.operation().to_string(),
            message: err.to_string(),
        },
    }
}

#[derive(Debug, serde::Serialize, ToSchema)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateThreadRequest {
    pub provider: Option<String>,
    pub plugin_id: Option<String>,
    pub endpoint: Option<String>,
    pub project_id: Option<String>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct DeleteThreadRequest {
    pub provider: Option<String>,
    pub plugin_id: Option<String>,
    pub endpoint: Option<String>,
    pub project_id: Option<String>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct MessageRequest {
    pub thread_id: Option<String>,
    pub role: Option<String>,
    #[schema(value_type = Object)]
    pub content: Option<Value>,
    pub provider: Option<String>,
    pub plugin_id: Option<String>,
    pub locale: Option<String>,
    pub endpoint: Option<String>,
    pub project_id: Option<String>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct RunRequest {
    pub endpoint: Option<String>,
    pub project_id: Option<String>,
    pub thread_id: Option<String>,
    pub agent_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackendQuery {
    pub endpoint: Option<String>,
    pub project_id: Option<String>,
    pub provider: Option<String>,
    pub plugin_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunStreamQuery {
    pub thread_id: Option<String>,
    pub provider: Option<String>,
    pub plugin_id: Option<String>,
    pub endpoint: Option<String>,
    pub project_id: Option<String>,
    pub agent_id: Option<String>,
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[utoipa::path(
    get,
    path = "/config",
    responses((status = 200, description = "Sanitized runtime configuration")),
    tag = "meta"
)]
async fn get_config(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(state.config.public_config())
}

#[utoipa::path(
    post,
    path = "/thread",
    request_body = CreateThreadRequest,
    responses(
        (status = 200, description = "New conversation or thread"),
        (status = 400, body = ProblemDetails),
        (status = 500, body = ProblemDetails)
    ),
    tag = "threads"
)]
async fn create_thread(
    State(state): State<Arc<AppState>>,
    body: Option<Json<CreateThreadRequest>>,
) -> Result<Json<Value>, ApiError> {
    let request = body.map(|Json(body)| body).unwrap_or_default();
    let context = resolve_context(
        &state.config,
        request.provider.as_deref(),
        request.plugin_id.as_deref(),
    );

    if context.provider == ProviderKind::CopilotStudio {
        let record = create_polling_conversation(&state, &context).await?;
        info!(conversation_id = %record.id, "created polling conversation");
        return Ok(Json(json!({ "id": record.id })));
    }

    let (endpoint, project_id) = require_backend(request.endpoint, request.project_id)?;
    let client = state.foundry_client(&endpoint, &project_id);
    let thread = client.create_thread().await.map_err(from_foundry)?;
    let thread_id = thread
        .get("id")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default();
    info!(thread_id, "created thread");
    Ok(Json(thread))
}

#[utoipa::path(
    delete,
    path = "/thread/{thread_id}",
    request_body = DeleteThreadRequest,
    params(("thread_id" = String, Path, description = "Thread id")),
    responses(
        (status = 204, description = "Deleted"),
        (status = 409, body = ProblemDetails)
    ),
    tag = "threads"
)]
async fn delete_thread(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
    body: Option<Json<DeleteThreadRequest>>,
) -> Result<StatusCode, ApiError> {
    let request = body.map(|Json(body)| body).unwrap_or_default();
    let context = resolve_context(
        &state.config,
        request.provider.as_deref(),
        request.plugin_id.as_deref(),
    );

    if context.provider == ProviderKind::CopilotStudio {
        check_plugin_ownership(&state, &thread_id, request.plugin_id.as_deref()).await?;
        if state.store.remove(&thread_id) {
            info!(conversation_id = %thread_id, "deleted polling conversation");
        }
        return Ok(StatusCode::NO_CONTENT);
    }

    let (endpoint, project_id) = require_backend(request.endpoint, request.project_id)?;
    let client = state.foundry_client(&endpoint, &project_id);
    client.delete_thread(&thread_id).await.map_err(from_foundry)?;
    info!(thread_id = %thread_id, "deleted thread");
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/message",
    request_body = MessageRequest,
    responses(
        (status = 200, description = "Posted message"),
        (status = 400, body = ProblemDetails),
        (status = 404, body = ProblemDetails),
        (status = 409, body = ProblemDetails)
    ),
    tag = "threads"
)]
async fn post_message(
    State(state): State<Arc<AppState>>,
    Json(request): Json<MessageRequest>,
) -> Result<Json<Value>, ApiError> {
    let (Some(thread_id), Some(content)) = (request.thread_id.clone(), request.content.clone())
    else {
        return Err(BridgeError::InvalidRequest {
            message: "missing threadId or content".to_string(),
        }
        .into());
    };
    let context = resolve_context(
        &state.config,
        request.provider.as_deref(),
        request.plugin_id.as_deref(),
    );
    let role = request.role.as_deref().unwrap_or("user");

    if context.provider == ProviderKind::CopilotStudio || state.store.contains(&thread_id) {
        let handle = state.store.get(&thread_id).ok_or(BridgeError::ConversationNotFound {
            thread_id: thread_id.clone(),
        })?;

        // Validation comes before any upstream traffic, token refresh
        // included.
        let normalized = normalize_user_content(&content);
        if normalized.is_empty() {
            return Err(BridgeError::InvalidRequest {
                message: "message content is empty".to_string(),
            }
            .into());
        }

        let mut record = handle.lock().await;
        if plugin_mismatch(&record, request.plugin_id.as_deref()) {
            return Err(BridgeError::PluginMismatch { thread_id }.into());
        }
        ensure_token(&state.directline, &mut record)
            .await
            .map_err(from_directline)?;

        let activity = Activity {
            activity_type: Some("message".to_string()),
            from: Some(ChannelAccount {
                id: record.user_id.clone(),
            }),
            locale: Some(
                request
                    .locale
                    .clone()
                    .unwrap_or_else(|| "en-US".to_string()),
            ),
            text: (!normalized.text.is_empty()).then(|| normalized.text.clone()),
            attachments: normalized
                .attachments
                .iter()
                .map(|attachment| WireAttachment {
                    content_type: if attachment.content_type.is_empty() {
                        "application/octet-stream".to_string()
                    } else {
                        attachment.content_type.clone()
                    },
                    content_url: attachment.content_url.clone(),
                    name: attachment.name.clone(),
                })
                .collect(),
            channel_data: Some(json!({
                "pluginId": record.plugin_id,
                "role": role,
            })),
            ..Default::default()
        };

        let posted = state
            .directline
            .post_activity(&record.endpoint, &record.token, &record.id, &activity)
            .await
            .map_err(from_directline)?;
        return Ok(Json(posted));
    }

    let (endpoint, project_id) = require_backend(request.endpoint, request.project_id)?;
    let client = state.foundry_client(&endpoint, &project_id);
    let message = client
        .create_message(&thread_id, role, &content)
        .await
        .map_err(from_foundry)?;
    Ok(Json(message))
}

#[utoipa::path(
    post,
    path = "/run",
    request_body = RunRequest,
    responses(
        (status = 200, description = "Created run"),
        (status = 400, body = ProblemDetails)
    ),
    tag = "runs"
)]
async fn create_run(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RunRequest>,
) -> Result<Json<Value>, ApiError> {
    let (Some(endpoint), Some(project_id), Some(thread_id), Some(agent_id)) = (
        request.endpoint,
        request.project_id,
        request.thread_id,
        request.agent_id,
    ) else {
        return Err(BridgeError::InvalidRequest {
            message: "missing endpoint, projectId, threadId, or agentId".to_string(),
        }
        .into());
    };
    let client = state.foundry_client(&endpoint, &project_id);
    let run = client
        .create_run(&thread_id, &agent_id)
        .await
        .map_err(from_foundry)?;
    Ok(Json(run))
}

#[utoipa::path(
    get,
    path = "/run/{thread_id}/{run_id}",
    params(
        ("thread_id" = String, Path, description = "Thread id"),
        ("run_id" = String, Path, description = "Run id"),
        ("endpoint" = String, Query, description = "Backend endpoint"),
        ("projectId" = String, Query, description = "Backend project id")
    ),
    responses(
        (status = 200, description = "Run state"),
        (status = 400, body = ProblemDetails)
    ),
    tag = "runs"
)]
async fn get_run(
    State(state): State<Arc<AppState>>,
    Path((thread_id, run_id)): Path<(String, String)>,
    Query(query): Query<BackendQuery>,
) -> Result<Json<Value>, ApiError> {
    let (endpoint, project_id) = require_backend(query.endpoint, query.project_id)?;
    let client = state.foundry_client(&endpoint, &project_id);
    let run = client
        .get_run(&thread_id, &run_id)
        .await
        .map_err(from_foundry)?;
    Ok(Json(run))
}

#[utoipa::path(
    get,
    path = "/messages/{thread_id}",
    params(
        ("thread_id" = String, Path, description = "Thread id"),
        ("endpoint" = Option<String>, Query, description = "Backend endpoint"),
        ("projectId" = Option<String>, Query, description = "Backend project id"),
        ("provider" = Option<String>, Query, description = "Provider hint"),
        ("pluginId" = Option<String>, Query, description = "Plugin id")
    ),
    responses(
        (status = 200, description = "Ordered message list"),
        (status = 404, body = ProblemDetails),
        (status = 409, body = ProblemDetails),
        (status = 501, body = ProblemDetails)
    ),
    tag = "threads"
)]
async fn list_messages(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
    Query(query): Query<BackendQuery>,
) -> Result<Json<Value>, ApiError> {
    let provider = normalize_provider(query.provider.as_deref());
    if provider == Some(ProviderKind::CopilotStudio) || state.store.contains(&thread_id) {
        check_plugin_ownership_strict(&state, &thread_id, query.plugin_id.as_deref()).await?;
        return Err(BridgeError::NotSupported {
            message: "listing messages is not supported for polling conversations".to_string(),
        }
        .into());
    }

    let (endpoint, project_id) = require_backend(query.endpoint, query.project_id)?;
    let client = state.foundry_client(&endpoint, &project_id);
    let messages = client.list_messages(&thread_id).await.map_err(from_foundry)?;
    Ok(Json(json!({ "messages": messages })))
}

#[utoipa::path(
    get,
    path = "/run-stream",
    params(
        ("threadId" = String, Query, description = "Thread id"),
        ("provider" = Option<String>, Query, description = "Provider hint"),
        ("pluginId" = Option<String>, Query, description = "Plugin id"),
        ("endpoint" = Option<String>, Query, description = "Backend endpoint"),
        ("projectId" = Option<String>, Query, description = "Backend project id"),
        ("agentId" = Option<String>, Query, description = "Agent id")
    ),
    responses(
        (status = 200, description = "SSE event stream"),
        (status = 400, body = ProblemDetails)
    ),
    tag = "runs"
)]
async fn run_stream(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunStreamQuery>,
) -> Result<Sse<impl futures::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    if query.thread_id.as_deref().unwrap_or("").is_empty() {
        return Err(BridgeError::InvalidRequest {
            message: "missing threadId".to_string(),
        }
        .into());
    }

    let (tx, rx) = mpsc::channel::<BridgeEvent>(32);
    let cancel = CancelFlag::new();
    let guard = CancelOnDrop(cancel.clone());
    tokio::spawn(run_stream_task(state, query, cancel, tx));

    // The guard rides inside the stream so dropping the response body
    // cancels the backing task.
    let stream = ReceiverStream::new(rx).map(move |event| {
        let _ = &guard;
        Ok::<Event, Infallible>(to_sse_event(&event))
    });
    Ok(Sse::new(stream))
}

/// Everything past pre-flight validation happens on the open stream;
/// failures from here on are `error` events, never a status change.
async fn run_stream_task(
    state: Arc<AppState>,
    query: RunStreamQuery,
    cancel: CancelFlag,
    tx: mpsc::Sender<BridgeEvent>,
) {
    let thread_id = query.thread_id.unwrap_or_default();
    let provider = normalize_provider(query.provider.as_deref());

    if provider == Some(ProviderKind::CopilotStudio) || state.store.contains(&thread_id) {
        let Some(handle) = state.store.get(&thread_id) else {
            let _ = tx
                .send(BridgeEvent::error(
                    "Conversation not found. Please start a new thread.",
                ))
                .await;
            return;
        };
        {
            let record = handle.lock().await;
            if plugin_mismatch(&record, query.plugin_id.as_deref()) {
                let _ = tx
                    .send(BridgeEvent::error(
                        "Thread is associated with a different plugin.",
                    ))
                    .await;
                return;
            }
        }
        run_polling_turn(
            PollingTurn {
                client: state.directline.clone(),
                record: handle,
                poll_interval: state.config.poll_interval(),
                stream_timeout: state.config.stream_timeout(),
                cancel,
            },
            tx,
        )
        .await;
        return;
    }

    let (Some(endpoint), Some(project_id), Some(agent_id)) =
        (query.endpoint, query.project_id, query.agent_id)
    else {
        let _ = tx
            .send(BridgeEvent::error("Missing endpoint, projectId, or agentId"))
            .await;
        return;
    };
    let client = state.foundry_client(&endpoint, &project_id);
    run_streaming_relay(client, thread_id, agent_id, cancel, tx).await;
}

async fn not_found() -> Response {
    let mut problem =
        ProblemDetails::new(ErrorType::InvalidRequest, Some("unknown route".to_string()));
    problem.status = 404;
    (StatusCode::NOT_FOUND, Json(problem)).into_response()
}

fn require_backend(
    endpoint: Option<String>,
    project_id: Option<String>,
) -> Result<(String, String), BridgeError> {
    match (endpoint, project_id) {
        (Some(endpoint), Some(project_id)) if !endpoint.is_empty() && !project_id.is_empty() => {
            Ok((endpoint, project_id))
        }
        _ => Err(BridgeError::InvalidRequest {
            message: "missing endpoint or projectId".to_string(),
        }),
    }
}

fn plugin_mismatch(record: &ConversationRecord, requested: Option<&str>) -> bool {
    match (requested, record.plugin_id.as_deref()) {
        (Some(requested), Some(owned)) => requested != owned,
        _ => false,
    }
}

/// Ownership check for delete: a mismatch is a conflict, a missing record
/// is fine (delete is idempotent).
async fn check_plugin_ownership(
    state: &AppState,
    thread_id: &str,
    plugin_id: Option<&str>,
) -> Result<(), BridgeError> {
    if let Some(record) = state.store.snapshot(thread_id).await {
        if plugin_mismatch(&record, plugin_id) {
            return Err(BridgeError::PluginMismatch {
                thread_id: thread_id.to_string(),
            });
        }
    }
    Ok(())
}

/// Ownership check for reads: the record must exist and the plugin must
/// match.
async fn check_plugin_ownership_strict(
    state: &AppState,
    thread_id: &str,
    plugin_id: Option<&str>,
) -> Result<(), BridgeError> {
    let record = state
        .store
        .snapshot(thread_id)
        .await
        .ok_or(BridgeError::ConversationNotFound {
            thread_id: thread_id.to_string(),
        })?;
    if plugin_mismatch(&record, plugin_id) {
        return Err(BridgeError::PluginMismatch {
            thread_id: thread_id.to_string(),
        });
    }
    Ok(())
}

/// Two-step conversation create: token issuance binds the identity, the
/// start call enriches it. A failed start is non-fatal once a conversation
/// id exists.
async fn create_polling_conversation(
    state: &AppState,
    context: &ResolvedContext,
) -> Result<ConversationRecord, BridgeError> {
    let transport = &context.transport;
    let secret = transport.secret.clone().ok_or_else(|| BridgeError::NotConfigured {
        message: format!(
            "transport secret is not configured for plugin '{}'",
            context.plugin_id.as_deref().unwrap_or("unknown")
        ),
    })?;

    let endpoint = transport.endpoint.trim_end_matches('/').to_string();
    let user_id = transport
        .user_id
        .clone()
        .unwrap_or_else(|| format!("user-{}", Uuid::new_v4()));
    let token_request = TokenRequest {
        user: ChannelAccount {
            id: user_id.clone(),
        },
        bot: transport
            .bot_id
            .clone()
            .map(|id| ChannelAccount { id }),
        scope: transport.scope.clone(),
    };

    let issued = state
        .directline
        .generate_token(&endpoint, &secret, &token_request)
        .await
        .map_err(from_directline)?;
    let token = issued
        .token
        .ok_or_else(|| from_directline(DirectLineError::MissingToken))?;
    let mut conversation_id = issued.conversation_id;
    let mut stream_url = issued.stream_url;
    let mut expires_in = issued.expires_in;

    match state.directline.start_conversation(&endpoint, &token).await {
        Ok(started) => {
            conversation_id = started.conversation_id.or(conversation_id);
            stream_url = started.stream_url.or(stream_url);
            if started.expires_in.is_some() {
                expires_in = started.expires_in;
            }
        }
        Err(err) if conversation_id.is_some() => {
            warn!(error = %err, "conversation start failed, continuing with issued id");
        }
        Err(err) => return Err(from_directline(err)),
    }

    let id = conversation_id
        .ok_or_else(|| from_directline(DirectLineError::MissingConversationId))?;
    let record = ConversationRecord::new(
        id,
        context.plugin_id.clone(),
        token,
        expires_in,
        endpoint,
        user_id,
        transport.bot_id.clone(),
        stream_url,
    );
    state.store.insert(record.clone());
    Ok(record)
}
