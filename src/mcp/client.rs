//! MCP Client - short-lived connections to remote capability providers
//!
//! A connection is opened per listing or per invocation and closed right
//! after, so nothing here pools or caches sessions.

use super::transport::{HttpTransport, McpMessage, Transport};
use super::types::*;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// One open session with a capability provider.
#[async_trait]
pub trait McpConnection: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<McpTool>>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult>;

    async fn close(&self) -> Result<()>;
}

/// Opens connections to capability providers by address.
#[async_trait]
pub trait McpConnector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn McpConnection>>;
}

/// Connector for streamable-HTTP MCP servers.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    request_timeout: Duration,
}

impl HttpConnector {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl McpConnector for HttpConnector {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn McpConnection>> {
        let client: Arc<dyn McpConnection> =
            McpClient::connect_http(endpoint, self.request_timeout).await?;
        Ok(client)
    }
}

/// MCP Client for connecting to external servers
pub struct McpClient {
    transport: Arc<dyn Transport>,
    pending_requests: RwLock<HashMap<RequestId, oneshot::Sender<JsonRpcResponse>>>,
    request_id: AtomicI64,
    request_timeout: Duration,
    server_info: RwLock<Option<Implementation>>,
}

impl McpClient {
    /// Connect to a streamable-HTTP MCP server and run the handshake.
    pub async fn connect_http(endpoint: &str, request_timeout: Duration) -> Result<Arc<Self>> {
        let transport = Arc::new(HttpTransport::new(endpoint, request_timeout)?);
        let client = Arc::new(Self::new(transport, request_timeout));

        let client_clone = Arc::clone(&client);
        tokio::spawn(async move {
            client_clone.receive_loop().await;
        });

        if let Err(e) = client.initialize().await {
            // The receive loop holds a clone; closing is what ends it.
            let _ = client.transport.close().await;
            return Err(e);
        }

        Ok(client)
    }

    /// Create a new MCP client with custom transport
    pub fn new(transport: Arc<dyn Transport>, request_timeout: Duration) -> Self {
        Self {
            transport,
            pending_requests: RwLock::new(HashMap::new()),
            request_id: AtomicI64::new(1),
            request_timeout,
            server_info: RwLock::new(None),
        }
    }

    /// Initialize the connection with the server
    pub async fn initialize(&self) -> Result<InitializeResult> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: json!({}),
            client_info: Implementation {
                name: "chatrelay".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };

        let response = self
            .request("initialize", Some(serde_json::to_value(&params)?))
            .await?;
        let result: InitializeResult = serde_json::from_value(response)?;

        *self.server_info.write().await = Some(result.server_info.clone());

        self.notify("notifications/initialized", None).await?;

        info!(
            server = %result.server_info.name,
            version = %result.server_info.version,
            protocol = %result.protocol_version,
            "Connected to MCP server"
        );

        Ok(result)
    }

    pub async fn server_info(&self) -> Option<Implementation> {
        self.server_info.read().await.clone()
    }

    /// List every tool, following pagination cursors.
    pub async fn list_tools(&self) -> Result<Vec<McpTool>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let response = self.request("tools/list", params).await?;
            let page: ListToolsResult = serde_json::from_value(response)?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if Some(&next) != cursor.as_ref() => cursor = Some(next),
                _ => break,
            }
        }
        debug!(count = tools.len(), "Listed MCP tools");
        Ok(tools)
    }

    /// Call a tool
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult> {
        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };

        let response = self
            .request("tools/call", Some(serde_json::to_value(&params)?))
            .await?;
        let result: CallToolResult = serde_json::from_value(response)?;

        Ok(result)
    }

    /// Send a JSON-RPC request and wait for response
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let id = RequestId::Number(self.request_id.fetch_add(1, Ordering::SeqCst));
        let request = JsonRpcRequest::new(id.clone(), method, params);

        let (tx, rx) = oneshot::channel();
        self.pending_requests.write().await.insert(id.clone(), tx);

        if let Err(e) = self.transport.send_request(request).await {
            self.pending_requests.write().await.remove(&id);
            return Err(e);
        }

        let response = match timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => anyhow::bail!("MCP connection closed before '{}' completed", method),
            Err(_) => {
                self.pending_requests.write().await.remove(&id);
                anyhow::bail!("MCP request '{}' timed out", method);
            }
        };

        if let Some(error) = response.error {
            anyhow::bail!("MCP error {}: {}", error.code, error.message);
        }

        response
            .result
            .ok_or_else(|| anyhow::anyhow!("Empty response to '{}'", method))
    }

    /// Send a notification (no response expected)
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = JsonRpcNotification::new(method, params);
        self.transport.send_notification(notification).await
    }

    /// Message receive loop
    async fn receive_loop(&self) {
        loop {
            match self.transport.receive().await {
                Ok(Some(message)) => self.handle_message(message).await,
                Ok(None) => {
                    debug!("MCP connection closed");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Error receiving MCP message");
                    break;
                }
            }
        }
        // Wake anything still waiting so it fails fast instead of timing out.
        self.pending_requests.write().await.clear();
    }

    async fn handle_message(&self, message: McpMessage) {
        match message {
            McpMessage::Response(response) => {
                if let Some(tx) = self.pending_requests.write().await.remove(&response.id) {
                    let _ = tx.send(response);
                } else {
                    warn!(id = ?response.id, "Received response for unknown request");
                }
            }
            McpMessage::Request(request) => {
                // Sampling and roots are not offered during initialize.
                debug!(method = %request.method, "Ignoring server-initiated request");
            }
            McpMessage::Notification(notification) => {
                debug!(method = %notification.method, "Received notification");
            }
        }
    }

    /// Close the connection
    pub async fn close(&self) -> Result<()> {
        self.transport.close().await
    }
}

#[async_trait]
impl McpConnection for McpClient {
    async fn list_tools(&self) -> Result<Vec<McpTool>> {
        McpClient::list_tools(self).await
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult> {
        McpClient::call_tool(self, name, arguments).await
    }

    async fn close(&self) -> Result<()> {
        McpClient::close(self).await
    }
}
