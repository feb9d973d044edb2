//! Client for the pull-based bot transport (Direct Line v3 REST surface).
//!
//! Conversation identity is bound at token issuance; the separate
//! conversation-start call only enriches the session. Activity consumption
//! is cursor-based: the caller passes back the opaque watermark from the
//! previous poll verbatim.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DirectLineError {
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
    #[error("token response missing token value")]
    MissingToken,
    #[error("conversation id could not be determined")]
    MissingConversationId,
}

impl DirectLineError {
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Status { operation, .. } | Self::Http { operation, .. } => operation,
            Self::MissingToken | Self::MissingConversationId => "conversation create",
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

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelAccount {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireAttachment {
    pub content_type: String,
    pub content_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A single conversational event on the wire. Only `type == "message"`
/// activities matter to the bridge; everything else (typing indicators,
/// conversation updates) is filtered by the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub activity_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<ChannelAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<WireAttachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_data: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub stream_url: Option<String>,
    #[serde(default, alias = "expires_in")]
    pub expires_in: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivitySet {
    #[serde(default)]
    pub activities: Vec<Activity>,
    #[serde(default)]
    pub watermark: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    pub user: ChannelAccount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot: Option<ChannelAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DirectLineClient {
    http: Client,
}

impl Default for DirectLineClient {
    fn default() -> Self {
        Self::new(Client::new())
    }
}

impl DirectLineClient {
    pub fn new(http: Client) -> Self {
        Self { http }
    }

    /// Issue a conversation-scoped token from the static secret. The secret
    /// must not travel further than this call.
    pub async fn generate_token(
        &self,
        endpoint: &str,
        secret: &str,
        request: &TokenRequest,
    ) -> Result<TokenResponse, DirectLineError> {
        const OPERATION: &str = "direct line token generate";
        let url = format!("{}/v3/directline/tokens/generate", trim_base(endpoint));
        debug!(user_id = %request.user.id, "requesting direct line token");
        let response = self
            .http
            .post(&url)
            .bearer_auth(secret)
            .json(request)
            .send()
            .await
            .map_err(|source| DirectLineError::Http {
                operation: OPERATION,
                source,
            })?;
        let response = check_status(OPERATION, response).await?;
        response
            .json::<TokenResponse>()
            .await
            .map_err(|source| DirectLineError::Http {
                operation: OPERATION,
                source,
            })
    }

    /// Best-effort session start. Some transports bind the conversation at
    /// token issuance and reject this call; the caller treats failure as
    /// non-fatal when it already holds a conversation id.
    pub async fn start_conversation(
        &self,
        endpoint: &str,
        token: &str,
    ) -> Result<TokenResponse, DirectLineError> {
        const OPERATION: &str = "direct line conversation start";
        let url = format!("{}/v3/directline/conversations", trim_base(endpoint));
        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&Value::Object(Default::default()))
            .send()
            .await
            .map_err(|source| DirectLineError::Http {
                operation: OPERATION,
                source,
            })?;
        let response = check_status(OPERATION, response).await?;
        response
            .json::<TokenResponse>()
            .await
            .map_err(|source| DirectLineError::Http {
                operation: OPERATION,
                source,
            })
    }

    pub async fn refresh_token(
        &self,
        endpoint: &str,
        token: &str,
    ) -> Result<TokenResponse, DirectLineError> {
        const OPERATION: &str = "direct line token refresh";
        let url = format!("{}/v3/directline/tokens/refresh", trim_base(endpoint));
        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|source| DirectLineError::Http {
                operation: OPERATION,
                source,
            })?;
        let response = check_status(OPERATION, response).await?;
        response
            .json::<TokenResponse>()
            .await
            .map_err(|source| DirectLineError::Http {
                operation: OPERATION,
                source,
            })
    }

    pub async fn post_activity(
        &self,
        endpoint: &str,
        token: &str,
        conversation_id: &str,
        activity: &Activity,
    ) -> Result<Value, DirectLineError> {
        const OPERATION: &str = "direct line activity post";
        let url = format!(
            "{}/v3/directline/conversations/{}/activities",
            trim_base(endpoint),
            urlencode(conversation_id)
        );
        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(activity)
            .send()
            .await
            .map_err(|source| DirectLineError::Http {
                operation: OPERATION,
                source,
            })?;
        let response = check_status(OPERATION, response).await?;
        response
            .json::<Value>()
            .await
            .map_err(|source| DirectLineError::Http {
                operation: OPERATION,
                source,
            })
    }

    /// Fetch activities after `watermark`. The watermark is an opaque
    /// backend cursor and is forwarded exactly as last received.
    pub async fn activities(
        &self,
        endpoint: &str,
        token: &str,
        conversation_id: &str,
        watermark: Option<&str>,
    ) -> Result<ActivitySet, DirectLineError> {
        const OPERATION: &str = "direct line activities";
        let mut url = format!(
            "{}/v3/directline/conversations/{}/activities",
            trim_base(endpoint),
            urlencode(conversation_id)
        );
        if let Some(watermark) = watermark {
            url.push_str("?watermark=");
            url.push_str(&urlencode(watermark));
        }
        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|source| DirectLineError::Http {
                operation: OPERATION,
                source,
            })?;
        let response = check_status(OPERATION, response).await?;
        response
            .json::<ActivitySet>()
            .await
            .map_err(|source| DirectLineError::Http {
                operation: OPERATION,
                source,
            })
    }
}

async fn check_status(
    operation: &'static str,
    response: reqwest::Response,
) -> Result<reqwest::Response, DirectLineError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(DirectLineError::Status {
        operation,
        status: status.as_u16(),
        body,
    })
}

fn trim_base(endpoint: &str) -> &str {
    endpoint.trim_end_matches('/')
}

fn urlencode(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char);
            }
            other => {
                encoded.push('%');
                encoded.push_str(&format!("{other:02X}"));
            }
        }
    }
    encoded
}
