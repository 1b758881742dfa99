//! Remote capability-provider tools
//!
//! [`load_capabilities`] lists a provider's operations and turns each one into
//! a [`ToolSpec`]. [`McpToolWrapper`] exposes a spec through the local
//! [`Tool`] trait. Every listing and every invocation uses its own
//! short-lived connection.

use super::normalize::{self, Normalized};
use super::{ParamContract, Tool, ToolContext, ToolResult};
use crate::mcp::{CallToolResult, McpConnection, McpConnector};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// One remote operation bound to the provider that serves it.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub contract: ParamContract,
    pub endpoint: String,
    pub remote_name: String,
}

/// List the operations a provider offers.
///
/// Never fails: a connection, listing, or schema failure is logged and
/// yields an empty map so generation can continue without dynamic tools.
pub async fn load_capabilities(
    connector: &dyn McpConnector,
    endpoint: &str,
) -> HashMap<String, ToolSpec> {
    let started = Instant::now();
    let connection = match connector.connect(endpoint).await {
        Ok(connection) => connection,
        Err(e) => {
            tracing::warn!(endpoint, error = %e, "Capability provider unreachable");
            return HashMap::new();
        }
    };

    let listing = connection.list_tools().await;
    if let Err(e) = connection.close().await {
        tracing::debug!(endpoint, error = %e, "Failed to close listing connection");
    }

    let tools = match listing {
        Ok(tools) => tools,
        Err(e) => {
            tracing::warn!(endpoint, error = %e, "Failed to list capabilities");
            return HashMap::new();
        }
    };

    let mut specs = HashMap::with_capacity(tools.len());
    for tool in tools {
        let contract = match ParamContract::from_json_schema(&tool.input_schema) {
            Ok(contract) => contract,
            Err(e) => {
                tracing::warn!(
                    endpoint,
                    tool = %tool.name,
                    error = %e,
                    "Unusable parameter schema; ignoring provider"
                );
                return HashMap::new();
            }
        };
        if specs.contains_key(&tool.name) {
            tracing::warn!(
                endpoint,
                tool = %tool.name,
                "Operation listed twice; keeping the first"
            );
            continue;
        }
        specs.insert(
            tool.name.clone(),
            ToolSpec {
                description: tool
                    .description
                    .unwrap_or_else(|| format!("Remote tool {}", tool.name)),
                contract,
                endpoint: endpoint.to_string(),
                remote_name: tool.name.clone(),
                name: tool.name,
            },
        );
    }

    tracing::info!(
        endpoint,
        count = specs.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Loaded capabilities"
    );
    specs
}

/// Wrap every spec as a tool, sorted by name.
pub fn into_tools(
    specs: HashMap<String, ToolSpec>,
    connector: Arc<dyn McpConnector>,
) -> Vec<Arc<dyn Tool>> {
    let mut specs: Vec<ToolSpec> = specs.into_values().collect();
    specs.sort_by(|a, b| a.name.cmp(&b.name));
    specs
        .into_iter()
        .map(|spec| Arc::new(McpToolWrapper::new(spec, Arc::clone(&connector))) as Arc<dyn Tool>)
        .collect()
}

/// Closes its connection when dropped, so a cancelled invocation still
/// releases the provider session.
struct ConnectionGuard {
    connection: Option<Arc<dyn McpConnection>>,
}

impl ConnectionGuard {
    fn new(connection: Arc<dyn McpConnection>) -> Self {
        Self {
            connection: Some(connection),
        }
    }

    async fn close(mut self) {
        if let Some(connection) = self.connection.take()
            && let Err(e) = connection.close().await
        {
            tracing::debug!(error = %e, "Failed to close tool connection");
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = connection.close().await;
            });
        }
    }
}

/// Wraps a single remote operation so it can be executed via the local Tool trait.
#[derive(Clone)]
pub struct McpToolWrapper {
    spec: ToolSpec,
    connector: Arc<dyn McpConnector>,
}

impl McpToolWrapper {
    pub fn new(spec: ToolSpec, connector: Arc<dyn McpConnector>) -> Self {
        Self { spec, connector }
    }

    async fn invoke(&self, args: Value) -> Normalized {
        let connection = match self.connector.connect(&self.spec.endpoint).await {
            Ok(connection) => connection,
            Err(e) => {
                tracing::warn!(tool = %self.spec.name, error = %e, "Tool provider unreachable");
                return normalize::connection_failure(&self.spec.name, &e);
            }
        };
        let guard = ConnectionGuard::new(Arc::clone(&connection));
        let call = connection.call_tool(&self.spec.remote_name, args).await;
        guard.close().await;

        match call {
            Ok(result) => normalize::normalize(&self.spec.name, &result),
            Err(e) => {
                tracing::warn!(tool = %self.spec.name, error = %e, "Tool call failed");
                let failed = CallToolResult {
                    error: Some(Value::String(format!("{e:#}"))),
                    ..Default::default()
                };
                normalize::normalize(&self.spec.name, &failed)
            }
        }
    }
}

#[async_trait]
impl Tool for McpToolWrapper {
    fn id(&self) -> &str {
        &self.spec.name
    }

    fn description(&self) -> &str {
        &self.spec.description
    }

    fn contract(&self) -> &ParamContract {
        &self.spec.contract
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult> {
        let started = Instant::now();
        let result = self.invoke(args).await.into_tool_result();
        tracing::debug!(
            tool = %self.spec.name,
            success = result.success,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Remote tool finished"
        );
        ctx.publish(&result);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::{McpTool, ToolContent};
    use crate::session::SessionEvent;
    use crate::stream::EventSink;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counters {
        opened: AtomicUsize,
        closed: AtomicUsize,
        calls: Mutex<Vec<(String, Value)>>,
    }

    struct FakeConnection {
        counters: Arc<Counters>,
        tools: Vec<McpTool>,
        fail_calls: bool,
    }

    #[async_trait]
    impl McpConnection for FakeConnection {
        async fn list_tools(&self) -> Result<Vec<McpTool>> {
            Ok(self.tools.clone())
        }

        async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult> {
            self.counters
                .calls
                .lock()
                .push((name.to_string(), arguments.clone()));
            if self.fail_calls {
                anyhow::bail!("connection reset");
            }
            Ok(CallToolResult {
                content: vec![ToolContent::text(format!("weather in {}", arguments["city"]))],
                ..Default::default()
            })
        }

        async fn close(&self) -> Result<()> {
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeConnector {
        counters: Arc<Counters>,
        tools: Vec<McpTool>,
        fail_calls: bool,
    }

    #[async_trait]
    impl McpConnector for FakeConnector {
        async fn connect(&self, _endpoint: &str) -> Result<Arc<dyn McpConnection>> {
            self.counters.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeConnection {
                counters: Arc::clone(&self.counters),
                tools: self.tools.clone(),
                fail_calls: self.fail_calls,
            }))
        }
    }

    struct Unreachable;

    #[async_trait]
    impl McpConnector for Unreachable {
        async fn connect(&self, endpoint: &str) -> Result<Arc<dyn McpConnection>> {
            anyhow::bail!("connection refused: {endpoint}")
        }
    }

    fn lookup_tool() -> McpTool {
        McpTool {
            name: "lookup".to_string(),
            description: Some("Look up a city".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "city": {"type": "string"},
                    "units": {"type": "string", "enum": ["c", "f"]}
                },
                "required": ["city"]
            }),
        }
    }

    fn connector(fail_calls: bool) -> (Arc<Counters>, Arc<FakeConnector>) {
        let counters = Arc::new(Counters::default());
        let connector = Arc::new(FakeConnector {
            counters: Arc::clone(&counters),
            tools: vec![lookup_tool()],
            fail_calls,
        });
        (counters, connector)
    }

    #[tokio::test]
    async fn loader_builds_specs_and_closes_connection() {
        let (counters, connector) = connector(false);
        let specs = load_capabilities(connector.as_ref(), "http://provider/mcp").await;
        let spec = &specs["lookup"];
        assert!(spec.contract.get("city").unwrap().required);
        assert!(!spec.contract.get("units").unwrap().required);
        assert_eq!(spec.endpoint, "http://provider/mcp");
        assert_eq!(counters.opened.load(Ordering::SeqCst), 1);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn loader_degrades_to_empty_map() {
        for _ in 0..2 {
            assert!(load_capabilities(&Unreachable, "http://127.0.0.1:9/mcp").await.is_empty());
        }

        let counters = Arc::new(Counters::default());
        let bad_schema = FakeConnector {
            counters: Arc::clone(&counters),
            tools: vec![
                lookup_tool(),
                McpTool {
                    name: "broken".to_string(),
                    description: None,
                    input_schema: json!("not a schema"),
                },
            ],
            fail_calls: false,
        };
        assert!(load_capabilities(&bad_schema, "http://provider/mcp").await.is_empty());
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplicate_operation_keeps_first_listing() {
        let counters = Arc::new(Counters::default());
        let mut second = lookup_tool();
        second.description = Some("Shadow".to_string());
        let duplicated = FakeConnector {
            counters: Arc::clone(&counters),
            tools: vec![lookup_tool(), second],
            fail_calls: false,
        };
        let specs = load_capabilities(&duplicated, "http://provider/mcp").await;
        assert_eq!(specs.len(), 1);
        assert_eq!(specs["lookup"].description, "Look up a city");
    }

    #[tokio::test]
    async fn invocation_publishes_and_closes() {
        let (counters, connector) = connector(false);
        let specs = load_capabilities(connector.as_ref(), "http://provider/mcp").await;
        let tools = into_tools(specs, connector.clone());

        let sink = EventSink::new(8);
        let mut rx = sink.subscribe();
        let ctx = ToolContext::new("call_1", "lookup", sink);
        let result = tools[0]
            .execute(json!({"city": "Rome"}), &ctx)
            .await
            .unwrap();

        assert_eq!(result.output, "weather in \"Rome\"");
        assert_eq!(counters.opened.load(Ordering::SeqCst), 2);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 2);
        assert_eq!(counters.calls.lock()[0].0, "lookup");
        assert!(matches!(
            rx.recv().await.unwrap(),
            SessionEvent::ToolResult { tool_call_id, .. } if tool_call_id == "call_1"
        ));
    }

    #[tokio::test]
    async fn call_failure_becomes_error_narrative() {
        let (counters, connector) = connector(true);
        let specs = load_capabilities(connector.as_ref(), "http://provider/mcp").await;
        let tools = into_tools(specs, connector.clone());

        let sink = EventSink::new(8);
        let mut rx = sink.subscribe();
        let ctx = ToolContext::new("call_1", "lookup", sink);
        let result = tools[0]
            .execute(json!({"city": "Rome"}), &ctx)
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.output, "Tool 'lookup' failed: connection reset");
        assert_eq!(counters.closed.load(Ordering::SeqCst), 2);
        assert!(matches!(rx.recv().await.unwrap(), SessionEvent::Error { .. }));
    }
}
