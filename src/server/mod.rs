//! HTTP Server
//!
//! Chat API: create a generation, resume its stream, delete a chat, and
//! change a chat's visibility. Generations run on their own task so a client
//! that disconnects never cancels persistence.

pub mod auth;
pub mod entitlements;
pub mod error;
pub mod request;

use crate::config::Config;
use crate::mcp::{HttpConnector, McpConnector};
use crate::provider::ProviderRegistry;
use crate::session::{self, Generation, SessionEvent};
use crate::store::{self, ChatSession, ChatStore, DbMessage, MessageRole, Visibility};
use crate::stream::{self, EventSink, StreamContext};
use crate::telemetry::{TOKEN_USAGE, TokenUsageReport};
use crate::tool::{self, ToolRegistry};
use anyhow::Result;
use auth::{AuthState, AuthUser};
use axum::{
    Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Json, Response},
    routing::{get, patch},
};
use chrono::Utc;
use error::{ChatError, Surface};
use futures::{Stream, StreamExt, stream as futures_stream};
use request::{PostChatRequest, VisibilityRequest};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

/// Server state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn ChatStore>,
    pub providers: Arc<ProviderRegistry>,
    pub connector: Arc<dyn McpConnector>,
    /// Static tools; dynamic ones are merged per request.
    pub tools: Arc<ToolRegistry>,
    /// `None` when resumable streaming is disabled.
    pub streams: Option<Arc<StreamContext>>,
    pub auth: AuthState,
}

impl AppState {
    /// Build every collaborator from config.
    pub async fn from_config(config: Config) -> Result<Self> {
        let store = store::open(&config.store).await?;
        let providers = ProviderRegistry::from_config(&config)?;
        let tools = ToolRegistry::with_static_tools(&config)?;
        let streams = stream::stream_context(&config.stream).await;
        let connector = HttpConnector::new(config.mcp.request_timeout());
        let auth = AuthState::from_config(&config.auth);
        Ok(Self {
            store,
            providers: Arc::new(providers),
            connector: Arc::new(connector),
            tools: Arc::new(tools),
            streams,
            auth,
            config: Arc::new(config),
        })
    }

    pub fn with_store(mut self, store: Arc<dyn ChatStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_providers(mut self, providers: ProviderRegistry) -> Self {
        self.providers = Arc::new(providers);
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn McpConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = Arc::new(tools);
        self
    }

    pub fn with_streams(mut self, streams: Option<Arc<StreamContext>>) -> Self {
        self.streams = streams;
        self
    }
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/version", get(get_version))
        .route("/api/usage", get(get_usage))
        .route("/api/chat", axum::routing::post(post_chat).delete(delete_chat))
        .route("/api/chat/stream", get(resume_chat))
        .route("/api/chat/{id}/visibility", patch(update_visibility))
        .with_state(state)
        .layer(CatchPanicLayer::custom(error::panic_response))
        .layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::mirror_request())
                .allow_credentials(true)
                .allow_methods(AllowMethods::mirror_request())
                .allow_headers(AllowHeaders::mirror_request()),
        )
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
pub async fn serve(config: Config) -> Result<()> {
    let t0 = std::time::Instant::now();
    let addr = format!("{}:{}", config.server.hostname, config.server.port);
    let state = AppState::from_config(config).await?;
    tracing::info!(
        elapsed_ms = t0.elapsed().as_millis() as u64,
        providers = ?state.providers.list(),
        tools = ?state.tools.list(),
        resumable = state.streams.is_some(),
        "[startup] state ready"
    );

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("[startup] listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Health check response
async fn health() -> &'static str {
    "ok"
}

/// Version info
#[derive(Serialize)]
struct VersionInfo {
    version: &'static str,
    name: &'static str,
}

async fn get_version() -> Json<VersionInfo> {
    Json(VersionInfo {
        version: env!("CARGO_PKG_VERSION"),
        name: env!("CARGO_PKG_NAME"),
    })
}

/// Token usage since startup, per model and in total.
async fn get_usage(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<TokenUsageReport>, ChatError> {
    state.auth.authenticate(&headers)?;
    Ok(Json(TOKEN_USAGE.report()))
}

/// Create a generation for a new user message and stream its events.
async fn post_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ChatError> {
    let deadline = tokio::time::Instant::now() + state.config.limits.max_duration();

    let request: PostChatRequest = serde_json::from_slice(&body)
        .map_err(|e| ChatError::bad_request(Surface::Api, e.to_string()))?;
    request
        .validate()
        .map_err(|cause| ChatError::bad_request(Surface::Api, cause))?;
    let model = state
        .config
        .model(&request.selected_chat_model)
        .cloned()
        .ok_or_else(|| {
            ChatError::bad_request(
                Surface::Api,
                format!("unknown model '{}'", request.selected_chat_model),
            )
        })?;

    let user = state.auth.authenticate(&headers)?;

    let sent = state
        .store
        .get_message_count_by_user(&user.id, chrono::Duration::hours(24))
        .await?;
    if entitlements::is_exceeded(&state.config.entitlements, user.kind, sent) {
        tracing::info!(user = %user.id, sent, "Message allowance exceeded");
        return Err(ChatError::rate_limited(Surface::Chat));
    }

    let provider = state.providers.get(&model.provider).ok_or_else(|| {
        tracing::error!(provider = %model.provider, "Configured model has no usable provider");
        ChatError::offline(Surface::Chat)
    })?;

    let chat_id = request.id.clone();
    match state.store.get_chat_by_id(&chat_id).await? {
        Some(chat) if chat.user_id != user.id => return Err(ChatError::forbidden(Surface::Chat)),
        Some(_) => {}
        None => {
            let chat = ChatSession {
                id: chat_id.clone(),
                user_id: user.id.clone(),
                title: session::chat_title(request.first_text()),
                visibility: request.selected_visibility_type,
                created_at: Utc::now(),
            };
            state.store.save_chat(&chat).await?;
            tracing::info!(chat_id = %chat_id, user = %user.id, "Created chat");
        }
    }

    let previous = state.store.get_messages_by_chat(&chat_id).await?;
    let user_message = DbMessage {
        id: request.message.id.clone(),
        chat_id: chat_id.clone(),
        role: MessageRole::User,
        parts: request
            .message
            .parts
            .iter()
            .cloned()
            .map(|p| p.into_stored())
            .collect(),
        created_at: Utc::now(),
    };
    state
        .store
        .save_messages(std::slice::from_ref(&user_message))
        .await?;

    let stream_id = uuid::Uuid::new_v4().to_string();
    state.store.create_stream_id(&stream_id, &chat_id).await?;

    let sink = match &state.streams {
        Some(streams) => streams.create(&stream_id),
        None => EventSink::new(state.config.stream.capacity),
    };
    let rx = sink.subscribe();

    // A retried message id is already stored; keep it once.
    let mut history: Vec<DbMessage> = previous
        .into_iter()
        .filter(|m| m.id != user_message.id)
        .collect();
    history.push(user_message.clone());
    let hints = request::hints_from_headers(&headers);
    let generation = Generation {
        chat_id: chat_id.clone(),
        message_id: uuid::Uuid::new_v4().to_string(),
        user_message,
        provider,
        model: model.model.clone(),
        history: session::to_provider_messages(&history),
        system_prompt: session::system_prompt(&hints, model.reasoning),
        tools: (*state.tools).clone(),
        reasoning: model.reasoning,
        max_steps: state.config.limits.max_steps,
        deadline,
    };

    let endpoint = request.mcp_server_url.clone();
    tokio::spawn(run_generation(state, generation, endpoint, sink, stream_id));

    Ok(sse_response(rx))
}

/// Runs detached from the request so persistence survives a disconnect.
async fn run_generation(
    state: AppState,
    mut generation: Generation,
    endpoint: Option<String>,
    sink: EventSink,
    stream_id: String,
) {
    if let Some(endpoint) = endpoint.filter(|_| !generation.reasoning) {
        let discovery = tool::mcp_tools::load_capabilities(state.connector.as_ref(), &endpoint);
        let specs = match tokio::time::timeout_at(generation.deadline, discovery).await {
            Ok(specs) => specs,
            Err(_) => {
                tracing::warn!(endpoint = %endpoint, "Capability discovery hit the deadline");
                Default::default()
            }
        };
        for dynamic in tool::mcp_tools::into_tools(specs, Arc::clone(&state.connector)) {
            generation.tools.register_dynamic(dynamic);
        }
    }

    // Unregister before `finish` so a late resume takes the replay path.
    let streams = state.streams.clone();
    let release_id = stream_id.clone();
    let outcome = generation
        .run_releasing(&sink, state.store.as_ref(), move || {
            if let Some(streams) = streams {
                streams.finish(&release_id);
            }
        })
        .await;
    tracing::debug!(
        stream_id = %stream_id,
        persisted = outcome.message.is_some(),
        "Generation task done"
    );
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResumeQuery {
    chat_id: Option<String>,
}

/// Reattach to the most recent generation of a chat.
async fn resume_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ResumeQuery>,
) -> Result<Response, ChatError> {
    let Some(streams) = state.streams.clone() else {
        return Ok(StatusCode::NO_CONTENT.into_response());
    };
    let chat_id = query
        .chat_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ChatError::bad_request(Surface::Api, "chatId is required"))?;

    let user = state.auth.authenticate(&headers)?;
    let chat = load_chat(&state, &chat_id).await?;
    if chat.visibility == Visibility::Private && chat.user_id != user.id {
        return Err(ChatError::forbidden(Surface::Chat));
    }

    let stream_ids = state.store.get_stream_ids_by_chat(&chat_id).await?;
    let stream_id = stream_ids
        .last()
        .ok_or_else(|| ChatError::not_found(Surface::Stream))?;

    if let Some(rx) = streams.resume(stream_id) {
        tracing::debug!(chat_id = %chat_id, stream_id = %stream_id, "Resuming live stream");
        return Ok(sse_response(rx));
    }

    let messages = state.store.get_messages_by_chat(&chat_id).await?;
    let replay = stream::append_for_late_resume(
        messages.last(),
        Utc::now(),
        state.config.limits.resume_freshness_secs,
    );
    tracing::debug!(
        chat_id = %chat_id,
        replayed = replay.is_some(),
        "Stream already finished"
    );
    let events = futures_stream::iter(replay
        .into_iter()
        .map(|event| Ok::<_, Infallible>(to_sse(&event))));
    Ok(Sse::new(events).into_response())
}

#[derive(Debug, Deserialize)]
struct DeleteQuery {
    id: Option<String>,
}

async fn delete_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<DeleteQuery>,
) -> Result<Json<ChatSession>, ChatError> {
    let id = query
        .id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ChatError::bad_request(Surface::Api, "id is required"))?;
    let user = state.auth.authenticate(&headers)?;
    owned_chat(&state, &user, &id).await?;

    let deleted = state
        .store
        .delete_chat_by_id(&id)
        .await?
        .ok_or_else(|| ChatError::not_found(Surface::Chat))?;
    tracing::info!(chat_id = %id, user = %user.id, "Deleted chat");
    Ok(Json(deleted))
}

async fn update_visibility(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<ChatSession>, ChatError> {
    let request: VisibilityRequest = serde_json::from_slice(&body)
        .map_err(|e| ChatError::bad_request(Surface::Api, e.to_string()))?;
    let user = state.auth.authenticate(&headers)?;
    let mut chat = owned_chat(&state, &user, &id).await?;

    if !state
        .store
        .update_chat_visibility(&id, request.visibility)
        .await?
    {
        return Err(ChatError::not_found(Surface::Chat));
    }
    chat.visibility = request.visibility;
    Ok(Json(chat))
}

async fn load_chat(state: &AppState, id: &str) -> Result<ChatSession, ChatError> {
    state
        .store
        .get_chat_by_id(id)
        .await?
        .ok_or_else(|| ChatError::not_found(Surface::Chat))
}

async fn owned_chat(state: &AppState, user: &AuthUser, id: &str) -> Result<ChatSession, ChatError> {
    let chat = load_chat(state, id).await?;
    if chat.user_id != user.id {
        return Err(ChatError::forbidden(Surface::Chat));
    }
    Ok(chat)
}

fn to_sse(event: &SessionEvent) -> Event {
    let payload = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Event::default().data(payload)
}

fn event_stream(
    rx: broadcast::Receiver<SessionEvent>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    futures_stream::unfold(rx, |mut rx| async move {
        match rx.recv().await {
            Ok(event) => Some((Ok(to_sse(&event)), rx)),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                let lag_event = Event::default()
                    .event("lag")
                    .data(format!("skipped {}", skipped));
                Some((Ok(lag_event), rx))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    })
}

fn sse_response(rx: broadcast::Receiver<SessionEvent>) -> Response {
    Sse::new(event_stream(rx).boxed())
        .keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(15)))
        .into_response()
}
