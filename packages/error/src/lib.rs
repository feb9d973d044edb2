use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    NotConfigured,
    ConversationNotFound,
    PluginMismatch,
    NotSupported,
    Upstream,
    Transport,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:agent-proxy:error:invalid_request",
            Self::NotConfigured => "urn:agent-proxy:error:not_configured",
            Self::ConversationNotFound => "urn:agent-proxy:error:conversation_not_found",
            Self::PluginMismatch => "urn:agent-proxy:error:plugin_mismatch",
            Self::NotSupported => "urn:agent-proxy:error:not_supported",
            Self::Upstream => "urn:agent-proxy:error:upstream",
            Self::Transport => "urn:agent-proxy:error:transport",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::NotConfigured => "Not Configured",
            Self::ConversationNotFound => "Conversation Not Found",
            Self::PluginMismatch => "Plugin Mismatch",
            Self::NotSupported => "Not Supported",
            Self::Upstream => "Upstream Error",
            Self::Transport => "Transport Error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::NotConfigured => 500,
            Self::ConversationNotFound => 404,
            Self::PluginMismatch => 409,
            Self::NotSupported => 501,
            Self::Upstream => 502,
            Self::Transport => 502,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            extensions: Map::new(),
        }
    }
}

/// Error taxonomy for the conversation bridge. Upstream failures keep the
/// backend status and raw body so diagnostics survive the translation.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("not configured: {message}")]
    NotConfigured { message: String },
    #[error("conversation not found: {thread_id}")]
    ConversationNotFound { thread_id: String },
    #[error("thread {thread_id} is associated with a different plugin")]
    PluginMismatch { thread_id: String },
    #[error("not supported: {message}")]
    NotSupported { message: String },
    #[error("{operation} failed ({status})")]
    Upstream {
        operation: String,
        status: u16,
        body: String,
    },
    #[error("{operation} failed: {message}")]
    Transport { operation: String, message: String },
}

impl BridgeError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::NotConfigured { .. } => ErrorType::NotConfigured,
            Self::ConversationNotFound { .. } => ErrorType::ConversationNotFound,
            Self::PluginMismatch { .. } => ErrorType::PluginMismatch,
            Self::NotSupported { .. } => ErrorType::NotSupported,
            Self::Upstream { .. } => ErrorType::Upstream,
            Self::Transport { .. } => ErrorType::Transport,
        }
    }

    /// HTTP status for the caller. Upstream errors pass the backend status
    /// through when it is a valid HTTP status, otherwise fall back to the
    /// taxonomy default.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Upstream { status, .. } if (100..=599).contains(status) => *status,
            other => other.error_type().status_code(),
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        problem.status = self.status_code();

        let mut extensions = Map::new();
        match self {
            Self::ConversationNotFound { thread_id } | Self::PluginMismatch { thread_id } => {
                extensions.insert("threadId".to_string(), Value::String(thread_id.clone()));
            }
            Self::Upstream {
                operation,
                status,
                body,
            } => {
                extensions.insert("operation".to_string(), Value::String(operation.clone()));
                extensions.insert("upstreamStatus".to_string(), Value::from(*status));
                if !body.is_empty() {
                    extensions.insert("details".to_string(), Value::String(body.clone()));
                }
            }
            Self::Transport { operation, .. } => {
                extensions.insert("operation".to_string(), Value::String(operation.clone()));
            }
            _ => {}
        }
        problem.extensions = extensions;
        problem
    }
}

impl From<BridgeError> for ProblemDetails {
    fn from(value: BridgeError) -> Self {
        value.to_problem_details()
    }
}

impl From<&BridgeError> for ProblemDetails {
    fn from(value: &BridgeError) -> Self {
        value.to_problem_details()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_status_passes_through() {
        let err = BridgeError::Upstream {
            operation: "direct line activities".to_string(),
            status: 403,
            body: "forbidden".to_string(),
        };
        assert_eq!(err.status_code(), 403);
        let problem = err.to_problem_details();
        assert_eq!(problem.status, 403);
        assert_eq!(
            problem.extensions.get("details"),
            Some(&Value::String("forbidden".to_string()))
        );
    }

    #[test]
    fn invalid_upstream_status_falls_back() {
        let err = BridgeError::Upstream {
            operation: "token refresh".to_string(),
            status: 0,
            body: String::new(),
        };
        assert_eq!(err.status_code(), 502);
    }

    #[test]
    fn every_error_type_has_a_urn_and_http_status() {
        let all = [
            ErrorType::InvalidRequest,
            ErrorType::NotConfigured,
            ErrorType::ConversationNotFound,
            ErrorType::PluginMismatch,
            ErrorType::NotSupported,
            ErrorType::Upstream,
            ErrorType::Transport,
        ];
        for error_type in all {
            assert!(error_type.as_urn().starts_with("urn:agent-proxy:error:"));
            assert!((400..=599).contains(&error_type.status_code()));
        }
    }

    #[test]
    fn mismatch_carries_thread_id() {
        let err = BridgeError::PluginMismatch {
            thread_id: "conv-1".to_string(),
        };
        assert_eq!(err.status_code(), 409);
        let problem = err.to_problem_details();
        assert_eq!(
            problem.extensions.get("threadId"),
            Some(&Value::String("conv-1".to_string()))
        );
    }
}
