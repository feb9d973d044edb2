//! Client for the push-streaming agent-run backend.
//!
//! Threads, messages, and runs are plain REST resources under a project
//! endpoint; run streaming is consumed as server-sent events over the
//! response body. Dropping the returned stream aborts the underlying
//! request, which is how cancellation releases upstream resources.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use reqwest::Client;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

mod sse;

pub use sse::{RawSseEvent, SseParser};

/// Token scope requested for every backend call.
pub const DEFAULT_TOKEN_SCOPE: &str = "https://ai.azure.com/.default";

const API_VERSION: &str = "v1";

#[derive(Debug, Error)]
pub enum FoundryError {
    #[error("{operation} failed ({status}): {body}")]
    Status {
        operation: &'static str,
        status: u16,
        body: String,
    },
    #[error("{operation} failed: {source}")]
    Http {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("credential error: {message}")]
    Credential { message: String },
    #[error("run stream error: {message}")]
    Stream { message: String },
}

impl FoundryError {
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Status { operation, .. } | Self::Http { operation, .. } => operation,
            Self::Credential { .. } => "credential acquisition",
            Self::Stream { .. } => "run stream",
        }
    }

    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn upstream_body(&self) -> Option<&str> {
        match self {
            Self::Status { body, .. } => Some(body.as_str()),
            _ => None,
        }
    }
}

/// Seam for bearer-token acquisition. How a token is minted (managed
/// identity, device code, static secret) is outside this crate; callers
/// inject an implementation.
pub trait TokenCredential: Send + Sync + 'static {
    fn bearer_token(
        &self,
        scope: &str,
    ) -> Pin<Box<dyn Future<Output = Result<String, String>> + Send + '_>>;
}

/// Fixed token, used by tests and by deployments that front the backend
/// with a sidecar that already owns authentication.
#[derive(Debug, Clone)]
pub struct StaticTokenCredential {
    token: String,
}

impl StaticTokenCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl TokenCredential for StaticTokenCredential {
    fn bearer_token(
        &self,
        _scope: &str,
    ) -> Pin<Box<dyn Future<Output = Result<String, String>> + Send + '_>> {
        let token = self.token.clone();
        Box::pin(async move { Ok(token) })
    }
}

/// Reads the bearer token from an environment variable on each call.
#[derive(Debug, Clone)]
pub struct EnvTokenCredential {
    var: String,
}

impl EnvTokenCredential {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvTokenCredential {
    fn default() -> Self {
        Self::new("AGENT_PROXY_API_TOKEN")
    }
}

impl TokenCredential for EnvTokenCredential {
    fn bearer_token(
        &self,
        _scope: &str,
    ) -> Pin<Box<dyn Future<Output = Result<String, String>> + Send + '_>> {
        let var = self.var.clone();
        Box::pin(async move {
            std::env::var(&var).map_err(|_| format!("environment variable {var} is not set"))
        })
    }
}

/// A named event relayed from the backend's run stream.
#[derive(Debug, Clone, PartialEq)]
pub struct RunStreamEvent {
    pub event: String,
    pub data: Value,
}

#[derive(Clone)]
pub struct AgentsClient {
    http: Client,
    base_url: String,
    credential: Arc<dyn TokenCredential>,
}

impl std::fmt::Debug for AgentsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentsClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl AgentsClient {
    pub fn new(
        http: Client,
        endpoint: &str,
        project_id: &str,
        credential: Arc<dyn TokenCredential>,
    ) -> Self {
        let base_url = format!(
            "{}/api/projects/{}",
            endpoint.trim_end_matches('/'),
            project_id
        );
        Self {
            http,
            base_url,
            credential,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn token(&self) -> Result<String, FoundryError> {
        self.credential
            .bearer_token(DEFAULT_TOKEN_SCOPE)
            .await
            .map_err(|message| FoundryError::Credential { message })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}?api-version={}", self.base_url, path, API_VERSION)
    }

    pub async fn create_thread(&self) -> Result<Value, FoundryError> {
        const OPERATION: &str = "thread create";
        let token = self.token().await?;
        let response = self
            .http
            .post(self.url("/threads"))
            .bearer_auth(token)
            .json(&json!({}))
            .send()
            .await
            .map_err(|source| FoundryError::Http {
                operation: OPERATION,
                source,
            })?;
        read_json(OPERATION, response).await
    }

    pub async fn delete_thread(&self, thread_id: &str) -> Result<(), FoundryError> {
        const OPERATION: &str = "thread delete";
        let token = self.token().await?;
        let response = self
            .http
            .delete(self.url(&format!("/threads/{thread_id}")))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|source| FoundryError::Http {
                operation: OPERATION,
                source,
            })?;
        check_status(OPERATION, response).await.map(|_| ())
    }

    pub async fn create_message(
        &self,
        thread_id: &str,
        role: &str,
        content: &Value,
    ) -> Result<Value, FoundryError> {
        const OPERATION: &str = "message create";
        let token = self.token().await?;
        let response = self
            .http
            .post(self.url(&format!("/threads/{thread_id}/messages")))
            .bearer_auth(token)
            .json(&json!({ "role": role, "content": content }))
            .send()
            .await
            .map_err(|source| FoundryError::Http {
                operation: OPERATION,
                source,
            })?;
        read_json(OPERATION, response).await
    }

    /// Full message list for a thread, oldest first.
    pub async fn list_messages(&self, thread_id: &str) -> Result<Vec<Value>, FoundryError> {
        const OPERATION: &str = "message list";
        let token = self.token().await?;
        let response = self
            .http
            .get(format!(
                "{}&order=asc",
                self.url(&format!("/threads/{thread_id}/messages"))
            ))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|source| FoundryError::Http {
                operation: OPERATION,
                source,
            })?;
        let payload = read_json(OPERATION, response).await?;
        let messages = match payload {
            Value::Array(items) => items,
            Value::Object(mut map) => match map.remove("data") {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };
        Ok(messages)
    }

    pub async fn create_run(&self, thread_id: &str, agent_id: &str) -> Result<Value, FoundryError> {
        const OPERATION: &str = "run create";
        let token = self.token().await?;
        let response = self
            .http
            .post(self.url(&format!("/threads/{thread_id}/runs")))
            .bearer_auth(token)
            .json(&json!({ "assistant_id": agent_id }))
            .send()
            .await
            .map_err(|source| FoundryError::Http {
                operation: OPERATION,
                source,
            })?;
        read_json(OPERATION, response).await
    }

    pub async fn get_run(&self, thread_id: &str, run_id: &str) -> Result<Value, FoundryError> {
        const OPERATION: &str = "run get";
        let token = self.token().await?;
        let response = self
            .http
            .get(self.url(&format!("/threads/{thread_id}/runs/{run_id}")))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|source| FoundryError::Http {
                operation: OPERATION,
                source,
            })?;
        read_json(OPERATION, response).await
    }

    /// Create a run and consume its native event stream. Events are yielded
    /// under their native names; the stream ends when the backend closes the
    /// response or emits the `[DONE]` sentinel.
    pub async fn stream_run(
        &self,
        thread_id: &str,
        agent_id: &str,
    ) -> Result<impl Stream<Item = Result<RunStreamEvent, FoundryError>>, FoundryError> {
        const OPERATION: &str = "run stream";
        let token = self.token().await?;
        let response = self
            .http
            .post(self.url(&format!("/threads/{thread_id}/runs")))
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&json!({ "assistant_id": agent_id, "stream": true }))
            .send()
            .await
            .map_err(|source| FoundryError::Http {
                operation: OPERATION,
                source,
            })?;
        let response = check_status(OPERATION, response).await?;
        debug!(thread_id, agent_id, "run stream opened");

        let bytes = response.bytes_stream();
        let events = futures::stream::unfold(
            (bytes, SseParser::default(), Vec::<RawSseEvent>::new(), false),
            |(mut bytes, mut parser, mut pending, mut ended)| async move {
                loop {
                    if let Some(raw) = if pending.is_empty() {
                        None
                    } else {
                        Some(pending.remove(0))
                    } {
                        if raw.data.trim() == "[DONE]" {
                            ended = true;
                            continue;
                        }
                        let data = serde_json::from_str::<Value>(&raw.data)
                            .unwrap_or(Value::String(raw.data.clone()));
                        let event = RunStreamEvent {
                            event: raw.event.unwrap_or_else(|| "message".to_string()),
                            data,
                        };
                        return Some((Ok(event), (bytes, parser, pending, ended)));
                    }
                    if ended {
                        return None;
                    }
                    match bytes.next().await {
                        Some(Ok(chunk)) => {
                            pending = parser.push(&chunk);
                        }
                        Some(Err(err)) => {
                            ended = true;
                            return Some((
                                Err(FoundryError::Stream {
                                    message: err.to_string(),
                                }),
                                (bytes, parser, pending, ended),
                            ));
                        }
                        None => {
                            ended = true;
                            if let Some(raw) = parser.finish() {
                                pending.push(raw);
                            } else {
                                return None;
                            }
                        }
                    }
                }
            },
        );
        Ok(events)
    }
}

async fn check_status(
    operation: &'static str,
    response: reqwest::Response,
) -> Result<reqwest::Response, FoundryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(FoundryError::Status {
        operation,
        status: status.as_u16(),
        body,
    })
}

async fn read_json(
    operation: &'static str,
    response: reqwest::Response,
) -> Result<Value, FoundryError> {
    let response = check_status(operation, response).await?;
    response
        .json::<Value>()
        .await
        .map_err(|source| FoundryError::Http {
            operation,
            source,
        })
}
