//! Event vocabulary shared by both backend adapters.
//!
//! Every payload that crosses the SSE boundary is described here. Polling
//! turns synthesize these payloads from activities; the streaming relay
//! forwards backend events under their native names and only wraps the
//! terminal markers.

use axum::response::sse::Event;
use schemars::JsonSchema;
use serde::Serialize;
use serde_json::{json, Value};
use utoipa::ToSchema;

pub const EVENT_MESSAGE_DELTA: &str = "message.delta";
pub const EVENT_MESSAGE_COMPLETED: &str = "message.completed";
pub const EVENT_RUN_COMPLETED: &str = "run.completed";
pub const EVENT_ERROR: &str = "error";
pub const EVENT_DONE: &str = "done";

/// One named SSE event ready for the wire.
#[derive(Debug, Clone)]
pub struct BridgeEvent {
    pub event: String,
    pub data: Value,
}

impl BridgeEvent {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(EVENT_ERROR, json!({ "error": message.into() }))
    }

    pub fn error_with_details(message: impl Into<String>, details: Value) -> Self {
        Self::new(
            EVENT_ERROR,
            json!({ "error": message.into(), "details": details }),
        )
    }

    pub fn run_completed(status: &str) -> Self {
        Self::new(EVENT_RUN_COMPLETED, json!({ "status": status }))
    }

    pub fn done() -> Self {
        Self::new(EVENT_DONE, json!({}))
    }

    /// The `thread.`-prefixed twin of this event. `done` and `error` have
    /// no twin.
    pub fn mirrored(&self) -> Option<Self> {
        if self.event.starts_with("message.") || self.event.starts_with("run.") {
            Some(Self::new(format!("thread.{}", self.event), self.data.clone()))
        } else {
            None
        }
    }
}

pub fn to_sse_event(event: &BridgeEvent) -> Event {
    let base = Event::default().event(&event.event);
    base.json_data(&event.data)
        .unwrap_or_else(|_| Event::default().event(&event.event).data("{}"))
}

/// Serialized chunk of assistant output. The wire shape mirrors the
/// structured-content items clients already consume: a `type` tag plus
/// whichever of the remaining fields that type carries.
#[derive(Debug, Clone, Serialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ContentBlock {
    pub fn output_text(value: impl Into<String>) -> Self {
        Self {
            kind: "output_text".to_string(),
            text: Some(json!({ "value": value.into() })),
            url: None,
            title: None,
            content_type: None,
            name: None,
        }
    }

    pub fn image(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            kind: "image".to_string(),
            text: None,
            url: Some(url.into()),
            title: Some(title.into()),
            content_type: None,
            name: None,
        }
    }

    pub fn passthrough(kind: impl Into<String>, text: Value, title: Option<String>) -> Self {
        Self {
            kind: kind.into(),
            text: Some(text),
            url: None,
            title,
            content_type: None,
            name: None,
        }
    }
}

/// Attachment in normalized form, both as completion metadata and as the
/// source for trailing content blocks.
#[derive(Debug, Clone, Serialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MappedAttachment {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    pub title: String,
    pub content_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl MappedAttachment {
    pub fn into_block(self) -> ContentBlock {
        ContentBlock {
            kind: self.kind,
            text: None,
            url: Some(self.url),
            title: Some(self.title),
            content_type: Some(self.content_type),
            name: self.name,
        }
    }
}

/// Incremental text for TTS-style consumers. Only speakable text travels
/// in deltas; structured payloads wait for the completion.
#[derive(Debug, Clone, Serialize, JsonSchema, ToSchema)]
pub struct DeltaPayload {
    pub id: String,
    pub message_id: String,
    pub delta: DeltaBody,
}

#[derive(Debug, Clone, Serialize, JsonSchema, ToSchema)]
pub struct DeltaBody {
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Serialize, JsonSchema, ToSchema)]
pub struct CompletionPayload {
    pub id: String,
    pub role: &'static str,
    pub message: CompletionMessage,
    pub data: CompletionData,
    pub content: Vec<ContentBlock>,
    pub attachments: Vec<MappedAttachment>,
}

#[derive(Debug, Clone, Serialize, JsonSchema, ToSchema)]
pub struct CompletionMessage {
    pub id: String,
    pub role: &'static str,
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Serialize, JsonSchema, ToSchema)]
pub struct CompletionData {
    #[schema(value_type = Object)]
    pub activity: Value,
    pub content: Vec<ContentBlock>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirrors_message_and_run_events() {
        let delta = BridgeEvent::new(EVENT_MESSAGE_DELTA, json!({"id": "a1"}));
        let mirror = delta.mirrored().expect("mirror");
        assert_eq!(mirror.event, "thread.message.delta");
        assert_eq!(mirror.data, delta.data);

        assert!(BridgeEvent::done().mirrored().is_none());
        assert!(BridgeEvent::error("boom").mirrored().is_none());
    }

    #[test]
    fn content_block_omits_unset_fields() {
        let block = serde_json::to_value(ContentBlock::output_text("hi")).unwrap();
        assert_eq!(block["type"], "output_text");
        assert_eq!(block["text"]["value"], "hi");
        assert!(block.get("url").is_none());
        assert!(block.get("contentType").is_none());

        let image = serde_json::to_value(ContentBlock::image("https://x/i.png", "t")).unwrap();
        assert_eq!(image["type"], "image");
        assert_eq!(image["url"], "https://x/i.png");
        assert!(image.get("text").is_none());
    }
}
