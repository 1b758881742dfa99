//! Tool system
//!
//! Tools are the callable units the model may invoke mid-generation. Static
//! tools are built once at startup; dynamic tools are discovered per request
//! from a capability provider and merged into a request-scoped registry.

pub mod mcp_tools;
pub mod normalize;
pub mod schema;
pub mod weather;

pub use schema::{ContractViolation, ParamContract, ParamKind, ParamSpec};

use crate::session::SessionEvent;
use crate::stream::EventSink;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A tool that can be executed by the generation loop
#[async_trait]
pub trait Tool: Send + Sync {
    /// Invocation key presented to the model
    fn id(&self) -> &str;

    /// Description for the LLM
    fn description(&self) -> &str;

    /// Declared parameters
    fn contract(&self) -> &ParamContract;

    /// JSON Schema for parameters
    fn parameters(&self) -> Value {
        self.contract().to_json_schema()
    }

    /// Execute the tool with validated arguments
    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult>;
}

/// Result from tool execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    /// Narrative fed back to the model
    pub output: String,
    pub success: bool,
    /// Structured payload forwarded to the client for rendering
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ToolResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            success: true,
            data: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            output: message.into(),
            success: false,
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Per-call handle a tool uses to report onto the output channel.
///
/// Exactly one `tool-result` or `error` event is published per call:
/// whichever of the tool or the loop publishes first wins.
pub struct ToolContext {
    pub call_id: String,
    pub tool_name: String,
    events: EventSink,
    published: AtomicBool,
}

impl ToolContext {
    pub fn new(call_id: impl Into<String>, tool_name: impl Into<String>, events: EventSink) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            events,
            published: AtomicBool::new(false),
        }
    }

    /// Publish the call's outcome. Later calls are ignored.
    pub fn publish(&self, result: &ToolResult) {
        if self.published.swap(true, Ordering::SeqCst) {
            return;
        }
        let event = if result.success {
            SessionEvent::ToolResult {
                tool_call_id: self.call_id.clone(),
                tool_name: self.tool_name.clone(),
                output: result.output.clone(),
                data: result.data.clone(),
            }
        } else {
            SessionEvent::Error {
                error_text: result.output.clone(),
                tool_call_id: Some(self.call_id.clone()),
            }
        };
        self.events.emit(event);
    }

    pub fn has_published(&self) -> bool {
        self.published.load(Ordering::SeqCst)
    }
}

/// Registry of available tools
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any tool with the same id
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.id().to_string(), tool);
    }

    /// Register a discovered tool unless its id is already taken.
    pub fn register_dynamic(&mut self, tool: Arc<dyn Tool>) -> bool {
        let id = tool.id().to_string();
        if self.tools.contains_key(&id) {
            tracing::warn!(tool = %id, "Discovered tool collides with an existing tool; dropping it");
            return false;
        }
        self.tools.insert(id, tool);
        true
    }

    /// Get a tool by ID
    pub fn get(&self, id: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(id).cloned()
    }

    /// List all tool IDs, sorted
    pub fn list(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Get tool definitions for LLM, sorted by name
    pub fn definitions(&self) -> Vec<crate::provider::ToolDefinition> {
        let mut defs: Vec<_> = self
            .tools
            .values()
            .map(|t| crate::provider::ToolDefinition {
                name: t.id().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Create registry with the built-in tools
    pub fn with_static_tools(config: &crate::config::Config) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(weather::WeatherTool::new(
            &config.tools.weather_base_url,
        )?));
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named {
        id: &'static str,
        contract: ParamContract,
    }

    #[async_trait]
    impl Tool for Named {
        fn id(&self) -> &str {
            self.id
        }
        fn description(&self) -> &str {
            "test"
        }
        fn contract(&self) -> &ParamContract {
            &self.contract
        }
        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolResult> {
            Ok(ToolResult::success(self.id))
        }
    }

    fn named(id: &'static str) -> Arc<dyn Tool> {
        Arc::new(Named {
            id,
            contract: ParamContract::new(),
        })
    }

    #[test]
    fn dynamic_tools_never_shadow_existing_ones() {
        let mut registry = ToolRegistry::new();
        registry.register(named("get_weather"));
        assert!(!registry.register_dynamic(named("get_weather")));
        assert!(registry.register_dynamic(named("lookup")));
        assert_eq!(registry.list(), vec!["get_weather", "lookup"]);
        assert_eq!(registry.definitions()[1].name, "lookup");
    }

    #[tokio::test]
    async fn context_publishes_once() {
        let sink = EventSink::new(8);
        let mut rx = sink.subscribe();
        let ctx = ToolContext::new("c1", "lookup", sink);

        ctx.publish(&ToolResult::error("Tool 'lookup' failed: boom"));
        ctx.publish(&ToolResult::success("ignored"));
        assert!(ctx.has_published());

        assert_eq!(
            rx.recv().await.unwrap(),
            SessionEvent::Error {
                error_text: "Tool 'lookup' failed: boom".to_string(),
                tool_call_id: Some("c1".to_string()),
            }
        );
        assert!(rx.try_recv().is_err());
    }
}
