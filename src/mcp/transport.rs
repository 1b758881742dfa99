//! MCP transport layer - streamable HTTP

use super::types::*;
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

pub const SESSION_HEADER: &str = "mcp-session-id";

/// Transport trait for MCP communication
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a JSON-RPC request
    async fn send_request(&self, request: JsonRpcRequest) -> Result<()>;

    /// Send a JSON-RPC notification
    async fn send_notification(&self, notification: JsonRpcNotification) -> Result<()>;

    /// Receive incoming messages. `None` once the transport is closed.
    async fn receive(&self) -> Result<Option<McpMessage>>;

    /// Close the transport
    async fn close(&self) -> Result<()>;
}

/// Incoming MCP message (can be request, response, or notification)
#[derive(Debug, Clone)]
pub enum McpMessage {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

impl McpMessage {
    pub fn from_json(value: Value) -> Result<Self> {
        if value.get("id").is_some() {
            if value.get("method").is_some() {
                Ok(McpMessage::Request(serde_json::from_value(value)?))
            } else {
                Ok(McpMessage::Response(serde_json::from_value(value)?))
            }
        } else {
            Ok(McpMessage::Notification(serde_json::from_value(value)?))
        }
    }
}

/// Streamable HTTP transport.
///
/// Every outgoing message is a POST to the endpoint. The reply body is either
/// plain JSON or an event stream whose `data:` frames carry JSON-RPC messages;
/// both are fed into the receive channel. The session id issued on
/// `initialize` is echoed on every later request and released with `DELETE`
/// on close.
pub struct HttpTransport {
    endpoint: String,
    client: reqwest::Client,
    session_id: Mutex<Option<String>>,
    tx: Mutex<Option<mpsc::UnboundedSender<Value>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Value>>,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("chatrelay/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build MCP HTTP client")?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            endpoint: endpoint.into(),
            client,
            session_id: Mutex::new(None),
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
        })
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().clone()
    }

    async fn post(&self, body: Value) -> Result<()> {
        trace!(endpoint = %self.endpoint, "MCP TX: {}", body);

        let mut request = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .json(&body);
        if let Some(session) = self.session_id() {
            request = request.header(SESSION_HEADER, session);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to reach MCP endpoint {}", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("MCP endpoint returned {}: {}", status, text);
        }

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock() = Some(session.to_string());
        }

        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        let text = response
            .text()
            .await
            .context("Failed to read MCP response body")?;

        let messages = if is_event_stream {
            parse_event_stream(&text)
        } else {
            parse_json_body(&text)?
        };

        let tx = self.tx.lock().clone();
        let Some(tx) = tx else {
            debug!("MCP transport closed before reply was delivered");
            return Ok(());
        };
        for message in messages {
            trace!("MCP RX: {}", message);
            if tx.send(message).is_err() {
                break;
            }
        }
        Ok(())
    }
}

/// Split an event-stream body into the JSON payloads of its `data:` frames.
fn parse_event_stream(body: &str) -> Vec<Value> {
    let mut messages = Vec::new();
    let mut data = String::new();

    let mut flush = |data: &mut String| {
        if data.is_empty() {
            return;
        }
        match serde_json::from_str::<Value>(data) {
            Ok(value) => messages.extend(flatten_batch(value)),
            Err(e) => warn!(error = %e, "Ignoring malformed MCP event frame"),
        }
        data.clear();
    };

    for line in body.lines() {
        if line.is_empty() {
            flush(&mut data);
        } else if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    flush(&mut data);
    messages
}

fn parse_json_body(body: &str) -> Result<Vec<Value>> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_str(body).context("MCP endpoint returned invalid JSON")?;
    Ok(flatten_batch(value))
}

fn flatten_batch(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        other => vec![other],
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send_request(&self, request: JsonRpcRequest) -> Result<()> {
        self.post(serde_json::to_value(&request)?).await
    }

    async fn send_notification(&self, notification: JsonRpcNotification) -> Result<()> {
        self.post(serde_json::to_value(&notification)?).await
    }

    async fn receive(&self) -> Result<Option<McpMessage>> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(value) => Ok(Some(McpMessage::from_json(value)?)),
            None => Ok(None),
        }
    }

    async fn close(&self) -> Result<()> {
        // Dropping the sender ends the receive loop.
        self.tx.lock().take();

        let session = self.session_id.lock().take();
        if let Some(session) = session {
            let result = self
                .client
                .delete(&self.endpoint)
                .header(SESSION_HEADER, &session)
                .send()
                .await;
            if let Err(e) = result {
                debug!(error = %e, "Failed to release MCP session");
            }
        }
        Ok(())
    }
}
