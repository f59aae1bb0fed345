//! RocketChat-compatible read API that prefers the search index and falls
//! back to the chat server, plus the agent tool surface.

pub mod mcp;
pub mod tools;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    async_trait,
    extract::{FromRequestParts, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::{Config, HEALTH_RECHECK_INTERVAL};
use crate::document::IndexDocument;
use crate::index::query;
use crate::index::{self, IndexGateway, SearchHit};
use crate::rest::{HistorySource, RestAuth, RocketChatClient};

pub struct ProxyState {
    pub gateway: IndexGateway,
    pub chat: RocketChatClient,
    available: AtomicBool,
    pub sessions: mcp::SseSessions,
}

impl ProxyState {
    pub fn new(gateway: IndexGateway, chat: RocketChatClient) -> Self {
        Self {
            gateway,
            chat,
            available: AtomicBool::new(false),
            sessions: mcp::SseSessions::default(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    pub fn mark_unavailable(&self) {
        self.available.store(false, Ordering::Relaxed);
    }

    /// Re-probe engine health and record the result.
    pub async fn check_health(&self) -> bool {
        let healthy = match self.gateway.health().await {
            Ok(_) => {
                if !self.is_available() {
                    info!("Search engine connected");
                }
                true
            }
            Err(e) => {
                if self.is_available() {
                    warn!("Search engine disconnected: {}", e);
                }
                false
            }
        };
        self.available.store(healthy, Ordering::Relaxed);
        healthy
    }
}

/// Caller's chat credentials, forwarded to the chat server on fallback.
pub struct ChatAuth(pub RestAuth);

#[async_trait]
impl<S> FromRequestParts<S> for ChatAuth
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        match (header("x-auth-token"), header("x-user-id")) {
            (Some(token), Some(user_id)) => Ok(ChatAuth(RestAuth { token, user_id })),
            _ => Err((
                StatusCode::UNAUTHORIZED,
                Json(json!({
                    "success": false,
                    "error": "Unauthorized",
                    "message": "X-Auth-Token and X-User-Id headers are required"
                })),
            )
                .into_response()),
        }
    }
}

pub fn router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route("/api/v1/channels.list", get(channels_list))
        .route("/api/v1/chat.search", get(chat_search))
        .route("/api/v1/chat.getMessage", get(get_message))
        .route("/health", get(health))
        .route("/mcp/tools", get(mcp::list_tools))
        .route("/mcp/execute", post(mcp::execute))
        .route("/sse", get(mcp::sse_handler))
        .route("/messages", post(mcp::messages_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Serve the query API until Ctrl+C.
pub async fn serve(config: &Config, port: u16) -> Result<()> {
    let gateway = index::connect(&config.search)?;
    let chat = RocketChatClient::new(&config.rocketchat.url)
        .with_context(|| format!("Failed to configure chat client for {}", config.rocketchat.url))?;
    let state = Arc::new(ProxyState::new(gateway, chat));

    info!("Search engine: {}", config.search.url);
    info!("Chat server: {}", config.rocketchat.url);

    let monitor_state = state.clone();
    let monitor = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEALTH_RECHECK_INTERVAL);
        loop {
            ticker.tick().await;
            monitor_state.check_health().await;
        }
    });

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind port {}", port))?;
    info!("Search proxy listening on port {}", port);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        res = axum::serve(listener, router(state)) => {
            res.context("Search proxy server failed")?;
        }
    }

    monitor.abort();
    Ok(())
}

fn doc_as_chat_message(doc: &IndexDocument) -> Value {
    let name = if doc.author_name.is_empty() {
        &doc.author_username
    } else {
        &doc.author_name
    };
    json!({
        "_id": doc.message_id,
        "rid": doc.channel_id,
        "msg": doc.text,
        "ts": doc.timestamp,
        "u": {
            "_id": doc.author_id,
            "username": doc.author_username,
            "name": name,
        }
    })
}

fn hit_as_chat_message(hit: &SearchHit) -> Value {
    let mut message = doc_as_chat_message(&hit.source);
    message["_score"] = json!(hit.score);
    message["_highlight"] = json!(hit.text_highlight());
    message
}

fn error_response(status: StatusCode, body: Value) -> Response {
    (status, Json(body)).into_response()
}

// -----------------------------------------------------------------------------
// GET /api/v1/channels.list
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ChannelsListParams {
    query: Option<String>,
}

/// `{"name":{"$regex":"..."}}` becomes a case-insensitive name filter.
/// Unparseable query documents are ignored.
fn name_filter(query: Option<&str>) -> Result<Option<Regex>, regex::Error> {
    let pattern = query
        .and_then(|q| serde_json::from_str::<Value>(q).ok())
        .and_then(|v| v.pointer("/name/$regex").and_then(Value::as_str).map(str::to_string));

    match pattern {
        Some(p) => RegexBuilder::new(&p).case_insensitive(true).build().map(Some),
        None => Ok(None),
    }
}

fn apply_name_filter(channels: &mut Vec<Value>, filter: &Regex) {
    channels.retain(|ch| {
        ch.get("name")
            .and_then(Value::as_str)
            .map(|name| filter.is_match(name))
            .unwrap_or(false)
    });
}

async fn channels_list(
    State(state): State<Arc<ProxyState>>,
    ChatAuth(auth): ChatAuth,
    Query(params): Query<ChannelsListParams>,
) -> Response {
    let filter = match name_filter(params.query.as_deref()) {
        Ok(filter) => filter,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                json!({ "success": false, "error": format!("Invalid name filter: {}", e) }),
            )
        }
    };

    let mut channels: Vec<Value> = Vec::new();
    let mut source = "none";
    let mut filtered_client_side = false;

    if state.is_available() {
        match state.gateway.search(&query::channel_buckets()).await {
            Ok(response) => {
                channels = query::parse_channel_buckets(response.aggregations.as_ref())
                    .into_iter()
                    .map(|c| json!({ "_id": c.id, "name": c.name, "t": "c" }))
                    .collect();
                source = "opensearch";
                if let Some(filter) = &filter {
                    apply_name_filter(&mut channels, filter);
                    filtered_client_side = true;
                }
            }
            Err(e) => {
                warn!("Search engine channel listing failed: {}", e);
                if e.is_engine_failure() {
                    state.mark_unavailable();
                }
            }
        }
    }

    if !state.is_available() || channels.is_empty() {
        match state.chat.list_channels(&auth).await {
            Ok(list) => {
                channels = list
                    .into_iter()
                    .filter_map(|c| serde_json::to_value(c).ok())
                    .collect();
                source = "rocketchat";
                if let Some(filter) = &filter {
                    apply_name_filter(&mut channels, filter);
                    filtered_client_side = true;
                }
            }
            Err(e) => {
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({
                        "success": false,
                        "error": "Failed to fetch channels",
                        "details": e.to_string()
                    }),
                )
            }
        }
    }

    Json(json!({
        "channels": channels,
        "count": channels.len(),
        "offset": 0,
        "total": channels.len(),
        "success": true,
        "_metadata": {
            "source": source,
            "opensearch_available": state.is_available(),
            "filtered_client_side": filtered_client_side
        }
    }))
    .into_response()
}

// -----------------------------------------------------------------------------
// GET /api/v1/chat.search
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ChatSearchParams {
    #[serde(rename = "roomId")]
    room_id: Option<String>,
    #[serde(rename = "searchText")]
    search_text: Option<String>,
    count: Option<u32>,
}

async fn chat_search(
    State(state): State<Arc<ProxyState>>,
    ChatAuth(auth): ChatAuth,
    Query(params): Query<ChatSearchParams>,
) -> Response {
    let count = params.count.unwrap_or(20);
    let room_id = params.room_id.as_deref().filter(|r| !r.is_empty());
    let search_text = params.search_text.as_deref();

    let mut messages: Vec<Value> = Vec::new();
    let mut source = "none";

    if state.is_available() {
        match state
            .gateway
            .search(&query::room_search(search_text, room_id, count))
            .await
        {
            Ok(response) => {
                messages = response.hits.hits.iter().map(hit_as_chat_message).collect();
                source = "opensearch";
            }
            Err(e) => {
                warn!("Search engine search failed: {}", e);
                if e.is_engine_failure() {
                    state.mark_unavailable();
                }
            }
        }
    }

    let fall_back = !state.is_available() || (messages.is_empty() && room_id.is_some());
    if fall_back {
        let Some(room_id) = room_id else {
            return error_response(
                StatusCode::BAD_REQUEST,
                json!({
                    "success": false,
                    "error": "roomId is required when OpenSearch is not available",
                    "_metadata": { "opensearch_available": false }
                }),
            );
        };

        match state
            .chat
            .search_messages(&auth, room_id, search_text, count)
            .await
        {
            Ok(found) => {
                messages = found;
                source = "rocketchat";
            }
            Err(e) => {
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "success": false, "error": "Search failed", "details": e.to_string() }),
                )
            }
        }
    }

    let available = state.is_available();
    Json(json!({
        "messages": messages,
        "count": messages.len(),
        "success": true,
        "_metadata": {
            "source": source,
            "opensearch_available": available,
            "global_search_enabled": available
        }
    }))
    .into_response()
}

// -----------------------------------------------------------------------------
// GET /api/v1/chat.getMessage
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct GetMessageParams {
    #[serde(rename = "msgId")]
    msg_id: Option<String>,
}

async fn get_message(
    State(state): State<Arc<ProxyState>>,
    ChatAuth(auth): ChatAuth,
    Query(params): Query<GetMessageParams>,
) -> Response {
    let Some(msg_id) = params.msg_id.filter(|m| !m.is_empty()) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            json!({ "success": false, "error": "msgId is required" }),
        );
    };

    let mut message: Option<Value> = None;
    let mut source = "none";

    if state.is_available() {
        match state.gateway.search(&query::message_by_id(&msg_id)).await {
            Ok(response) => {
                if let Some(hit) = response.hits.hits.first() {
                    message = Some(doc_as_chat_message(&hit.source));
                    source = "opensearch";
                }
            }
            Err(e) => {
                warn!("Search engine getMessage failed: {}", e);
                if e.is_engine_failure() {
                    state.mark_unavailable();
                }
            }
        }
    }

    if message.is_none() {
        match state.chat.get_message(&auth, &msg_id).await {
            Ok(Some(found)) => {
                message = Some(found);
                source = "rocketchat";
            }
            Ok(None) | Err(_) => {
                return error_response(
                    StatusCode::NOT_FOUND,
                    json!({ "success": false, "error": "Message not found" }),
                )
            }
        }
    }

    Json(json!({
        "message": message,
        "success": true,
        "_metadata": { "source": source, "opensearch_available": state.is_available() }
    }))
    .into_response()
}

// -----------------------------------------------------------------------------
// GET /health
// -----------------------------------------------------------------------------

async fn health(State(state): State<Arc<ProxyState>>) -> Json<Value> {
    match state.gateway.health().await {
        Ok(cluster) => Json(json!({
            "status": "ok",
            "opensearch": cluster.status,
            "opensearch_available": state.is_available()
        })),
        Err(e) => Json(json!({
            "status": "degraded",
            "error": e.to_string(),
            "opensearch_available": false
        })),
    }
}
