//! OpenAI-compatible chat completions backend over raw HTTP
//!
//! Streams `/chat/completions` server-sent events directly with reqwest so
//! that tool-call deltas and the trailing usage frame are both visible.

use super::{CompletionRequest, ContentPart, Message, Provider, Role, StreamChunk, ToolDefinition, Usage};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAIProvider {
    client: Client,
    api_key: String,
    base_url: String,
    provider_name: String,
}

impl std::fmt::Debug for OpenAIProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAIProvider")
            .field("provider_name", &self.provider_name)
            .field("base_url", &self.base_url)
            .field("api_key", &"<REDACTED>")
            .finish()
    }
}

impl OpenAIProvider {
    pub fn new(api_key: String) -> Result<Self> {
        Self::with_base_url(api_key, DEFAULT_BASE_URL.to_string(), "openai")
    }

    /// Create with custom base URL (for OpenAI-compatible providers)
    pub fn with_base_url(api_key: String, base_url: String, provider_name: &str) -> Result<Self> {
        tracing::debug!(
            provider = provider_name,
            base_url = %base_url,
            api_key_len = api_key.len(),
            "Creating OpenAI-compatible provider"
        );
        let client = Client::builder()
            .user_agent(concat!("chatrelay/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            provider_name: provider_name.to_string(),
        })
    }

    fn convert_messages(messages: &[Message]) -> Vec<Value> {
        let mut result = Vec::new();
        for msg in messages {
            match msg.role {
                Role::Tool => {
                    for part in &msg.content {
                        if let ContentPart::ToolResult {
                            tool_call_id,
                            content,
                        } = part
                        {
                            result.push(json!({
                                "role": "tool",
                                "tool_call_id": tool_call_id,
                                "content": content
                            }));
                        }
                    }
                }
                Role::Assistant => {
                    let text = msg.text();
                    let tool_calls: Vec<Value> = msg
                        .content
                        .iter()
                        .filter_map(|p| match p {
                            ContentPart::ToolCall {
                                id,
                                name,
                                arguments,
                            } => Some(json!({
                                "id": id,
                                "type": "function",
                                "function": { "name": name, "arguments": arguments }
                            })),
                            _ => None,
                        })
                        .collect();

                    if tool_calls.is_empty() {
                        result.push(json!({"role": "assistant", "content": text}));
                    } else {
                        result.push(json!({
                            "role": "assistant",
                            "content": text,
                            "tool_calls": tool_calls
                        }));
                    }
                }
                Role::User => {
                    let parts: Vec<Value> = msg
                        .content
                        .iter()
                        .filter_map(|p| match p {
                            ContentPart::Text { text } => {
                                Some(json!({"type": "text", "text": text}))
                            }
                            ContentPart::Image { url, .. } => {
                                Some(json!({"type": "image_url", "image_url": {"url": url}}))
                            }
                            _ => None,
                        })
                        .collect();
                    result.push(json!({"role": "user", "content": parts}));
                }
                Role::System => {
                    result.push(json!({"role": "system", "content": msg.text()}));
                }
            }
        }
        result
    }

    fn convert_tools(tools: &[ToolDefinition]) -> Vec<Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters
                    }
                })
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCall {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunction>,
}

#[derive(Debug, Deserialize)]
struct StreamFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: usize,
    #[serde(default)]
    completion_tokens: usize,
    #[serde(default)]
    total_tokens: usize,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Incremental SSE decoder for one completion stream.
///
/// Only the first delta of a tool call carries its id; later deltas refer to
/// it by `index`, so the decoder remembers which id each index was given.
#[derive(Default)]
struct SseDecoder {
    /// Raw bytes of the unfinished line; a character may straddle two reads.
    buffer: Vec<u8>,
    call_ids: HashMap<u32, String>,
    open_calls: Vec<String>,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<StreamChunk> {
        self.buffer.extend_from_slice(bytes);
        let mut chunks = Vec::new();
        while let Some(line_end) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=line_end).collect();
            let line = String::from_utf8_lossy(&line[..line_end]);
            self.decode_line(line.trim(), &mut chunks);
        }
        chunks
    }

    fn decode_line(&mut self, line: &str, chunks: &mut Vec<StreamChunk>) {
        let Some(data) = line.strip_prefix("data:").map(str::trim) else {
            return;
        };
        if data == "[DONE]" {
            self.close_calls(chunks);
            return;
        }
        let parsed: StreamResponse = match serde_json::from_str(data) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::debug!(error = %e, "Skipping unparseable stream frame");
                return;
            }
        };

        for choice in &parsed.choices {
            if let Some(content) = &choice.delta.content
                && !content.is_empty()
            {
                chunks.push(StreamChunk::Text(content.clone()));
            }

            for tc in choice.delta.tool_calls.iter().flatten() {
                if let Some(id) = &tc.id
                    && !self.call_ids.contains_key(&tc.index)
                {
                    self.call_ids.insert(tc.index, id.clone());
                    self.open_calls.push(id.clone());
                    let name = tc
                        .function
                        .as_ref()
                        .and_then(|f| f.name.clone())
                        .unwrap_or_default();
                    chunks.push(StreamChunk::ToolCallStart {
                        id: id.clone(),
                        name,
                    });
                }
                let Some(id) = self.call_ids.get(&tc.index).cloned() else {
                    continue;
                };
                if let Some(args) = tc.function.as_ref().and_then(|f| f.arguments.as_ref())
                    && !args.is_empty()
                {
                    chunks.push(StreamChunk::ToolCallDelta {
                        id,
                        arguments_delta: args.clone(),
                    });
                }
            }

            if choice.finish_reason.is_some() {
                self.close_calls(chunks);
            }
        }

        if let Some(usage) = parsed.usage {
            chunks.push(StreamChunk::Done {
                usage: Some(Usage {
                    prompt_tokens: usage.prompt_tokens,
                    completion_tokens: usage.completion_tokens,
                    total_tokens: usage.total_tokens,
                }),
            });
        }
    }

    fn close_calls(&mut self, chunks: &mut Vec<StreamChunk>) {
        for id in self.open_calls.drain(..) {
            chunks.push(StreamChunk::ToolCallEnd { id });
        }
    }
}

#[async_trait]
impl Provider for OpenAIProvider {
    fn name(&self) -> &str {
        &self.provider_name
    }

    async fn complete_stream(
        &self,
        request: CompletionRequest,
    ) -> Result<futures::stream::BoxStream<'static, StreamChunk>> {
        tracing::debug!(
            provider = %self.provider_name,
            model = %request.model,
            message_count = request.messages.len(),
            tool_count = request.tools.len(),
            "Starting streaming completion request"
        );

        let mut body = json!({
            "model": request.model,
            "messages": Self::convert_messages(&request.messages),
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        let tools = Self::convert_tools(&request.tools);
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }
        if let Some(temp) = request.temperature {
            body["temperature"] = json!(temp);
        }
        if let Some(max) = request.max_tokens {
            body["max_completion_tokens"] = json!(max);
        }

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.provider_name))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            if let Ok(err) = serde_json::from_str::<ApiError>(&text) {
                anyhow::bail!("{} API error: {}", self.provider_name, err.error.message);
            }
            anyhow::bail!("{} API error: {} {}", self.provider_name, status, text);
        }

        let mut decoder = SseDecoder::default();
        Ok(response
            .bytes_stream()
            .flat_map(move |chunk| {
                let chunks = match chunk {
                    Ok(bytes) => decoder.push(&bytes),
                    Err(e) => vec![StreamChunk::Error(e.to_string())],
                };
                futures::stream::iter(chunks)
            })
            .boxed())
    }
}
