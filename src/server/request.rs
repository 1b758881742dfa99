//! Inbound request bodies and their validation

use crate::store::{MessagePart, Visibility};
use crate::session::RequestHints;
use axum::http::HeaderMap;
use serde::Deserialize;

pub const MAX_TEXT_CHARS: usize = 2000;
const ALLOWED_MEDIA_TYPES: &[&str] = &["image/jpeg", "image/png"];

/// Body of `POST /api/chat`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostChatRequest {
    pub id: String,
    pub message: IncomingMessage,
    pub selected_chat_model: String,
    #[serde(default)]
    pub selected_visibility_type: Visibility,
    /// Capability provider to discover tools from for this request.
    #[serde(default)]
    pub mcp_server_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingMessage {
    pub id: String,
    pub role: String,
    pub parts: Vec<IncomingPart>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum IncomingPart {
    Text {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    File {
        media_type: String,
        name: String,
        url: String,
    },
}

impl IncomingPart {
    pub fn into_stored(self) -> MessagePart {
        match self {
            Self::Text { text } => MessagePart::Text { text },
            Self::File {
                media_type,
                name,
                url,
            } => MessagePart::File {
                media_type,
                name: Some(name),
                url,
            },
        }
    }
}

/// Body of `PATCH /api/chat/{id}/visibility`.
#[derive(Debug, Clone, Deserialize)]
pub struct VisibilityRequest {
    pub visibility: Visibility,
}

impl PostChatRequest {
    /// Check shape constraints serde cannot express. Returns the cause on failure.
    pub fn validate(&self) -> Result<(), String> {
        uuid::Uuid::parse_str(&self.id).map_err(|_| "id must be a UUID".to_string())?;
        uuid::Uuid::parse_str(&self.message.id)
            .map_err(|_| "message.id must be a UUID".to_string())?;
        if self.message.role != "user" {
            return Err("message.role must be 'user'".to_string());
        }
        if self.message.parts.is_empty() {
            return Err("message.parts must not be empty".to_string());
        }
        for part in &self.message.parts {
            match part {
                IncomingPart::Text { text } => {
                    let len = text.chars().count();
                    if len == 0 || len > MAX_TEXT_CHARS {
                        return Err(format!(
                            "text parts must be 1-{MAX_TEXT_CHARS} characters"
                        ));
                    }
                }
                IncomingPart::File {
                    media_type,
                    name,
                    url,
                } => {
                    if !ALLOWED_MEDIA_TYPES.contains(&media_type.as_str()) {
                        return Err(format!("unsupported media type '{media_type}'"));
                    }
                    if name.trim().is_empty() {
                        return Err("file parts need a name".to_string());
                    }
                    reqwest::Url::parse(url).map_err(|_| "file url is not a valid URL".to_string())?;
                }
            }
        }
        if let Some(endpoint) = &self.mcp_server_url {
            let parsed = reqwest::Url::parse(endpoint)
                .map_err(|_| "mcpServerUrl is not a valid URL".to_string())?;
            if parsed.scheme() != "http" && parsed.scheme() != "https" {
                return Err("mcpServerUrl must be http or https".to_string());
            }
        }
        Ok(())
    }

    /// Text of the first text part, used for the chat title.
    pub fn first_text(&self) -> &str {
        self.message
            .parts
            .iter()
            .find_map(|p| match p {
                IncomingPart::Text { text } => Some(text.as_str()),
                IncomingPart::File { .. } => None,
            })
            .unwrap_or("")
    }
}

/// Location hints from optional request headers.
pub fn hints_from_headers(headers: &HeaderMap) -> RequestHints {
    let get = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    RequestHints {
        latitude: get("x-geo-latitude"),
        longitude: get("x-geo-longitude"),
        city: get("x-geo-city"),
        country: get("x-geo-country"),
    }
}
