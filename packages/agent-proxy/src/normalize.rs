//! Content normalization between the bot transport's activity shape and the
//! block-structured payloads clients consume.
//!
//! Everything here is pure. The precedence rules are load-bearing: a text
//! field that parses as a typed JSON array wins over the channel-data side
//! channel, and deltas only ever carry speakable text.

use agent_proxy_directline::{Activity, WireAttachment};
use serde_json::Value;

use crate::events::{
    CompletionData, CompletionMessage, CompletionPayload, ContentBlock, DeltaBody, DeltaPayload,
    MappedAttachment,
};

const IMAGE_TITLE: &str = "Assistant shared an image";
const FILE_TITLE: &str = "Assistant shared a file";

/// Structured content carried by an activity, if any. The text field is
/// checked first: trimmed, it must look like a JSON array and parse to one
/// where at least one element carries a `type` tag. Failing that, the
/// `channelData.content` array is used verbatim.
pub fn structured_content(activity: &Activity) -> Option<Vec<Value>> {
    let raw_text = activity.text.as_deref().unwrap_or("");
    let trimmed = raw_text.trim();
    if trimmed.starts_with('[') && trimmed.ends_with(']') {
        if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(raw_text) {
            if items.iter().any(|item| item.get("type").is_some()) {
                return Some(items);
            }
        }
    }
    if let Some(Value::Array(items)) = activity
        .channel_data
        .as_ref()
        .and_then(|data| data.get("content"))
    {
        return Some(items.clone());
    }
    None
}

/// Text suitable for speech: structured content filtered to `text` items
/// joined with single spaces, else the raw text verbatim. Empty means the
/// activity produces no delta.
pub fn speakable_text(activity: &Activity) -> String {
    if let Some(items) = structured_content(activity) {
        let parts: Vec<&str> = items
            .iter()
            .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect();
        return parts.join(" ").trim().to_string();
    }
    activity.text.clone().unwrap_or_default()
}

pub fn delta_payload(activity: &Activity) -> Option<DeltaPayload> {
    let id = activity.id.clone()?;
    let text = speakable_text(activity);
    if text.is_empty() {
        return None;
    }
    Some(DeltaPayload {
        id: id.clone(),
        message_id: id,
        delta: DeltaBody {
            content: vec![ContentBlock::output_text(text)],
        },
    })
}

pub fn completion_payload(activity: &Activity) -> Option<CompletionPayload> {
    let id = activity.id.clone()?;
    let attachments = map_attachments(&activity.attachments);

    let mut content = Vec::new();
    if let Some(items) = structured_content(activity) {
        for item in items {
            let Some(kind) = item.get("type").and_then(Value::as_str) else {
                continue;
            };
            // Falsy text (absent, null, "", 0, false) renders nothing.
            let Some(text) = item.get("text").filter(|text| is_truthy(text)) else {
                continue;
            };
            match (kind, text) {
                ("text", Value::String(value)) => {
                    content.push(ContentBlock::output_text(value.clone()));
                }
                ("image", Value::String(url)) => {
                    let title = item
                        .get("title")
                        .and_then(Value::as_str)
                        .unwrap_or(IMAGE_TITLE);
                    content.push(ContentBlock::image(url.clone(), title));
                }
                _ => {
                    let title = item
                        .get("title")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    content.push(ContentBlock::passthrough(kind, text.clone(), title));
                }
            }
        }
    } else if let Some(text) = activity.text.as_deref().filter(|text| !text.is_empty()) {
        content.push(ContentBlock::output_text(text));
    }

    for attachment in &attachments {
        content.push(attachment.clone().into_block());
    }

    let activity_echo = serde_json::to_value(activity).unwrap_or(Value::Null);
    Some(CompletionPayload {
        id: id.clone(),
        role: "assistant",
        message: CompletionMessage {
            id,
            role: "assistant",
            content: content.clone(),
        },
        data: CompletionData {
            activity: activity_echo,
            content: content.clone(),
        },
        content,
        attachments,
    })
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64() != Some(0.0),
        Value::String(text) => !text.is_empty(),
        _ => true,
    }
}

/// Conventional wire attachments in normalized form. Attachments without a
/// url are dropped.
pub fn map_attachments(attachments: &[WireAttachment]) -> Vec<MappedAttachment> {
    attachments
        .iter()
        .filter(|attachment| !attachment.content_url.is_empty())
        .map(|attachment| {
            let is_image = attachment.content_type.starts_with("image/");
            let title = attachment
                .name
                .clone()
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| {
                    if is_image {
                        IMAGE_TITLE.to_string()
                    } else {
                        FILE_TITLE.to_string()
                    }
                });
            MappedAttachment {
                kind: if is_image { "image" } else { "attachment" }.to_string(),
                url: attachment.content_url.clone(),
                title,
                content_type: attachment.content_type.clone(),
                name: attachment.name.clone(),
            }
        })
        .collect()
}

/// Outbound user content reduced to a text plus attachments. Accepts a bare
/// string, a `{text}` object, or a block list; in a block list the last
/// `text` block wins and `image_url` blocks become attachments.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct UserContent {
    pub text: String,
    pub attachments: Vec<WireAttachment>,
}

impl UserContent {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.attachments.is_empty()
    }
}

pub fn normalize_user_content(content: &Value) -> UserContent {
    let mut normalized = UserContent::default();
    match content {
        Value::String(text) => normalized.text = text.clone(),
        Value::Array(items) => {
            for item in items {
                let Some(kind) = item.get("type").and_then(Value::as_str) else {
                    continue;
                };
                if kind == "text" {
                    if let Some(text) = item.get("text").and_then(Value::as_str) {
                        if !text.trim().is_empty() {
                            normalized.text = text.trim().to_string();
                        }
                    }
                }
                if kind == "image_url" {
                    if let Some(attachment) = image_url_attachment(item.get("image_url")) {
                        normalized.attachments.push(attachment);
                    }
                }
            }
        }
        Value::Object(map) => {
            if let Some(text) = map.get("text").and_then(Value::as_str) {
                normalized.text = text.to_string();
            }
        }
        _ => {}
    }
    normalized
}

fn image_url_attachment(image_url: Option<&Value>) -> Option<WireAttachment> {
    let image_url = image_url?;
    let url = image_url.get("url").and_then(Value::as_str)?.trim();
    if url.is_empty() {
        return None;
    }
    let explicit = image_url
        .get("content_type")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .or_else(|| {
            image_url
                .get("mimeType")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
        });
    let content_type = infer_image_content_type(url, explicit);
    let name = image_url
        .get("name")
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .unwrap_or("image");
    Some(WireAttachment {
        content_type,
        content_url: url.to_string(),
        name: Some(name.to_string()),
    })
}

/// An explicit content type wins unless it is absent or the `image/png`
/// placeholder, in which case the URL suffix decides (query string
/// ignored), defaulting back to `image/png`.
pub fn infer_image_content_type(url: &str, explicit: Option<&str>) -> String {
    match explicit {
        Some(value) if value != "image/png" => return value.to_string(),
        _ => {}
    }
    let path = url.split('?').next().unwrap_or(url).to_ascii_lowercase();
    if path.ends_with(".jpg") || path.ends_with(".jpeg") {
        "image/jpeg".to_string()
    } else if path.ends_with(".gif") {
        "image/gif".to_string()
    } else if path.ends_with(".webp") {
        "image/webp".to_string()
    } else {
        "image/png".to_string()
    }
}
