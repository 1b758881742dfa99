//! Dynamic tools over streamable HTTP
//!
//! A small axum app plays the capability provider: JSON replies for the
//! handshake and listing, an event-stream reply for `tools/call`, and a
//! session id that must be released with `DELETE`.

use axum::{
    Router,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use chatrelay::config::{Config, ModelConfig, UserCredential, UserKind};
use chatrelay::mcp::{HttpConnector, McpClient, SESSION_HEADER};
use chatrelay::provider::ProviderRegistry;
use chatrelay::provider::mock::ScriptedProvider;
use chatrelay::server::{AppState, router};
use chatrelay::store::{ChatStore, MemoryStore, MessagePart};
use chatrelay::tool::ToolRegistry;
use chatrelay::tool::mcp_tools::load_capabilities;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Default)]
struct Counters {
    initialize: AtomicUsize,
    deletes: AtomicUsize,
    calls: AtomicUsize,
    missing_session: AtomicUsize,
}

async fn handle_post(
    State(counters): State<Arc<Counters>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let message: Value = match serde_json::from_str(&body) {
        Ok(message) => message,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };
    let method = message["method"].as_str().unwrap_or_default();
    let id = message["id"].clone();

    if method != "initialize" && !headers.contains_key(SESSION_HEADER) {
        counters.missing_session.fetch_add(1, Ordering::SeqCst);
    }

    match method {
        "initialize" => {
            let n = counters.initialize.fetch_add(1, Ordering::SeqCst);
            let reply = json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": "2025-03-26",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "fake-geo", "version": "0.1.0"}
                }
            });
            (
                [
                    (header::CONTENT_TYPE, "application/json".to_string()),
                    (
                        header::HeaderName::from_static(SESSION_HEADER),
                        format!("session-{n}"),
                    ),
                ],
                reply.to_string(),
            )
                .into_response()
        }
        "notifications/initialized" => StatusCode::ACCEPTED.into_response(),
        "tools/list" => axum::Json(json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "tools": [{
                    "name": "lookup",
                    "description": "Look up a city",
                    "inputSchema": {
                        "type": "object",
                        "properties": {"city": {"type": "string"}},
                        "required": ["city"]
                    }
                }]
            }
        }))
        .into_response(),
        "tools/call" => {
            counters.calls.fetch_add(1, Ordering::SeqCst);
            let city = message["params"]["arguments"]["city"]
                .as_str()
                .unwrap_or("nowhere");
            let text = format!(
                "Found it:\n```json {{\"city\": \"{city}\", \"population\": 2873000}}```"
            );
            let reply = json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {"content": [{"type": "text", "text": text}]}
            });
            (
                [(header::CONTENT_TYPE, "text/event-stream")],
                format!("event: message\ndata: {reply}\n\n"),
            )
                .into_response()
        }
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn handle_delete(State(counters): State<Arc<Counters>>, headers: HeaderMap) -> StatusCode {
    if headers.contains_key(SESSION_HEADER) {
        counters.deletes.fetch_add(1, Ordering::SeqCst);
    }
    StatusCode::OK
}

async fn spawn_provider() -> (SocketAddr, Arc<Counters>) {
    let counters = Arc::new(Counters::default());
    let app = Router::new()
        .route("/mcp", post(handle_post).delete(handle_delete))
        .with_state(counters.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, counters)
}

/// An address nothing listens on.
async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

#[tokio::test]
async fn client_echoes_and_releases_session() {
    let (addr, counters) = spawn_provider().await;
    let endpoint = format!("http://{addr}/mcp");

    let client = McpClient::connect_http(&endpoint, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(client.server_info().await.unwrap().name, "fake-geo");
    let tools = client.list_tools().await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "lookup");

    let result = client
        .call_tool("lookup", json!({"city": "Oslo"}))
        .await
        .unwrap();
    assert!(!result.is_error);
    assert_eq!(counters.calls.load(Ordering::SeqCst), 1);

    client.close().await.unwrap();
    assert_eq!(counters.initialize.load(Ordering::SeqCst), 1);
    assert_eq!(counters.deletes.load(Ordering::SeqCst), 1);
    assert_eq!(counters.missing_session.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unreachable_provider_yields_no_capabilities_each_time() {
    let endpoint = format!("http://{}/mcp", closed_port().await);
    let connector = HttpConnector::new(Duration::from_secs(2));

    for _ in 0..2 {
        let specs = load_capabilities(&connector, &endpoint).await;
        assert!(specs.is_empty());
    }
}

#[tokio::test]
async fn listing_is_parsed_into_contracts() {
    let (addr, counters) = spawn_provider().await;
    let endpoint = format!("http://{addr}/mcp");
    let connector = HttpConnector::new(Duration::from_secs(5));

    let specs = load_capabilities(&connector, &endpoint).await;
    let lookup = specs.get("lookup").expect("lookup advertised");
    assert!(lookup.contract.get("city").is_some_and(|p| p.required));
    assert_eq!(lookup.endpoint, endpoint);
    assert_eq!(counters.deletes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn remote_tool_runs_inside_a_chat_turn() {
    let (addr, counters) = spawn_provider().await;
    let endpoint = format!("http://{addr}/mcp");

    let mut config = Config::default();
    config.models.insert(
        "chat-model".to_string(),
        ModelConfig {
            provider: "scripted".to_string(),
            model: "scripted-chat".to_string(),
            reasoning: false,
        },
    );
    config.auth.users = vec![UserCredential {
        token: "alice-token".to_string(),
        user_id: "alice".to_string(),
        kind: UserKind::Regular,
    }];

    let provider = ScriptedProvider::new(vec![
        ScriptedProvider::tool_call_step("call_rome", "lookup", json!({"city": "Rome"})),
        ScriptedProvider::text_step("Rome has about 2.9 million people."),
    ]);
    let mut providers = ProviderRegistry::new();
    providers.register(Arc::new(provider.clone()));
    let store = Arc::new(MemoryStore::new());

    let state = AppState::from_config(config)
        .await
        .unwrap()
        .with_store(store.clone())
        .with_providers(providers)
        .with_tools(ToolRegistry::new())
        .with_connector(Arc::new(HttpConnector::new(Duration::from_secs(5))));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });

    let chat_id = uuid::Uuid::new_v4().to_string();
    let body = reqwest::Client::new()
        .post(format!("http://{server}/api/chat"))
        .bearer_auth("alice-token")
        .json(&json!({
            "id": chat_id,
            "message": {
                "id": uuid::Uuid::new_v4().to_string(),
                "role": "user",
                "parts": [{"type": "text", "text": "How many people live in Rome?"}]
            },
            "selectedChatModel": "chat-model",
            "mcpServerUrl": endpoint
        }))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    let events: Vec<Value> = body
        .lines()
        .filter_map(|l| l.strip_prefix("data:"))
        .filter_map(|d| serde_json::from_str(d.trim()).ok())
        .collect();
    let results: Vec<&Value> = events
        .iter()
        .filter(|e| e["type"] == "tool-result")
        .collect();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["toolCallId"], "call_rome");
    assert_eq!(results[0]["toolName"], "lookup");
    assert_eq!(results[0]["data"]["city"], "Rome");
    assert_eq!(events.last().unwrap()["finishReason"], "stop");

    let requests = provider.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].tools.len(), 1);
    let second = serde_json::to_string(&requests[1].messages).unwrap();
    assert!(second.contains("Tool 'lookup' executed successfully. Result:"));
    assert!(second.contains("Rome"));

    // One session for the listing, one for the invocation.
    assert_eq!(counters.initialize.load(Ordering::SeqCst), 2);
    assert_eq!(counters.deletes.load(Ordering::SeqCst), 2);
    assert_eq!(counters.calls.load(Ordering::SeqCst), 1);

    let messages = store.get_messages_by_chat(&chat_id).await.unwrap();
    let assistant = messages.last().unwrap();
    assert!(assistant.parts.iter().any(|p| matches!(
        p,
        MessagePart::ToolInvocation { tool_name, is_error: false, .. } if tool_name == "lookup"
    )));
}
