//! Events emitted onto a generation's output channel

use crate::provider::Usage;
use crate::store::DbMessage;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One frame of a generation stream, serialized as a single SSE `data:` line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SessionEvent {
    #[serde(rename_all = "camelCase")]
    Start { message_id: String, chat_id: String },
    TextDelta { delta: String },
    #[serde(rename_all = "camelCase")]
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        input: Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        output: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        error_text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_call_id: Option<String>,
    },
    /// Terminal event synthesized for a client that reconnects after the
    /// generation already finished.
    #[serde(rename = "data-appendMessage")]
    AppendMessage { data: DbMessage },
    #[serde(rename_all = "camelCase")]
    Finish {
        finish_reason: FinishReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
}

impl SessionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::TextDelta { .. } => "text-delta",
            Self::ToolCall { .. } => "tool-call",
            Self::ToolResult { .. } => "tool-result",
            Self::Error { .. } => "error",
            Self::AppendMessage { .. } => "data-appendMessage",
            Self::Finish { .. } => "finish",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    /// The model stopped on its own.
    Stop,
    /// The step ceiling was reached.
    MaxSteps,
    /// The wall-clock ceiling was reached.
    Timeout,
    Error,
}
