use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::tools::{self, ToolError};
use super::{ChatAuth, ProxyState};

// -----------------------------------------------------------------------------
// JSON-RPC transport types
// -----------------------------------------------------------------------------

const INVALID_PARAMS: i32 = -32602;
const METHOD_NOT_FOUND: i32 = -32601;
const TOOL_FAILED: i32 = -32000;

#[derive(Debug, Deserialize)]
#[serde(tag = "method")]
pub enum JsonRpcRequest {
    #[serde(rename = "initialize")]
    Initialize {
        #[serde(default)]
        params: Option<InitializeParams>,
        id: Value,
    },
    #[serde(rename = "tools/list")]
    ListTools { id: Value },
    #[serde(rename = "tools/call")]
    CallTool { params: CallToolParams, id: Value },
    // Notifications and methods we do not serve
    #[serde(untagged)]
    Unknown {
        method: String,
        #[serde(default)]
        id: Option<Value>,
    },
}

#[derive(Debug, Deserialize)]
pub struct InitializeParams {
    #[serde(rename = "protocolVersion", default)]
    pub protocol_version: Option<String>,
    #[serde(rename = "clientInfo", default)]
    pub client_info: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct CallToolParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Option<Value>,
}

/// A reply carries either a result or an error, never both.
#[derive(Debug, Serialize)]
pub struct RpcReply {
    jsonrpc: &'static str,
    id: Value,
    #[serde(flatten)]
    outcome: RpcOutcome,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
enum RpcOutcome {
    Result(Value),
    Error { code: i32, message: String },
}

impl RpcReply {
    fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            outcome: RpcOutcome::Result(result),
        }
    }

    fn err(id: Value, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            outcome: RpcOutcome::Error { code, message },
        }
    }
}

// -----------------------------------------------------------------------------
// SSE sessions
// -----------------------------------------------------------------------------

const SESSION_BUFFER: usize = 64;

/// Open SSE streams, each with its own outbound channel. Replies posted with
/// a `session_id` go to that stream only.
#[derive(Default)]
pub struct SseSessions {
    streams: Mutex<HashMap<String, mpsc::Sender<String>>>,
}

impl SseSessions {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, mpsc::Sender<String>>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn open(&self) -> (String, mpsc::Receiver<String>) {
        let id = Uuid::new_v4().simple().to_string();
        let (tx, rx) = mpsc::channel(SESSION_BUFFER);
        self.lock().insert(id.clone(), tx);
        (id, rx)
    }

    pub fn close(&self, id: &str) {
        if self.lock().remove(id).is_some() {
            debug!("SSE session {} closed", id);
        }
    }

    /// Queue `text` on one session. False when the session is unknown or full.
    pub fn deliver(&self, id: &str, text: String) -> bool {
        match self.lock().get(id) {
            Some(tx) => tx.try_send(text).is_ok(),
            None => false,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Drops the session once its stream is gone.
struct SessionGuard {
    state: Arc<ProxyState>,
    id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.state.sessions.close(&self.id);
    }
}

/// Run a tool, flipping the engine to unavailable when it stops answering.
async fn run_tool(state: &ProxyState, name: &str, arguments: Value) -> Result<Value, ToolError> {
    let result = tools::execute(&state.gateway, name, arguments).await;
    if let Err(ToolError::Index(e)) = &result {
        warn!("Tool {} failed against search engine: {}", name, e);
        if e.is_engine_failure() {
            state.mark_unavailable();
        }
    }
    result
}

// -----------------------------------------------------------------------------
// Plain JSON surface
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
}

pub async fn list_tools(_auth: ChatAuth) -> Json<Value> {
    Json(json!({ "tools": tools::definitions() }))
}

pub async fn execute(
    State(state): State<Arc<ProxyState>>,
    _auth: ChatAuth,
    Json(request): Json<ExecuteRequest>,
) -> Response {
    match run_tool(&state, &request.tool, request.arguments).await {
        Ok(result) => Json(json!({ "result": result })).into_response(),
        Err(ToolError::UnknownTool(_)) => {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": "Unknown tool" }))).into_response()
        }
        Err(e @ ToolError::InvalidArguments(_)) => {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))).into_response()
        }
        Err(e) => {
            error!("Tool {} failed: {}", request.tool, e);
            let body = Json(json!({ "error": e.to_string() }));
            (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
        }
    }
}

// -----------------------------------------------------------------------------
// MCP over SSE
// -----------------------------------------------------------------------------

pub async fn sse_handler(
    State(state): State<Arc<ProxyState>>,
    _auth: ChatAuth,
) -> Sse<impl Stream<Item = Result<Event, axum::BoxError>>> {
    let (session_id, mut rx) = state.sessions.open();
    info!("New SSE connection established: session {}", session_id);

    let guard = SessionGuard { state, id: session_id };
    let stream = async_stream::stream! {
        let guard = guard;
        // Tell the client where to POST its requests.
        let endpoint = format!("/messages?session_id={}", guard.id);
        yield Ok(Event::default().event("endpoint").data(endpoint));

        while let Some(msg) = rx.recv().await {
            yield Ok(Event::default().event("message").data(msg));
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    session_id: Option<String>,
}

pub async fn messages_handler(
    State(state): State<Arc<ProxyState>>,
    _auth: ChatAuth,
    Query(query): Query<MessagesQuery>,
    Json(request): Json<JsonRpcRequest>,
) -> Response {
    debug!("Received MCP message: {:?}", request);

    let reply = match request {
        JsonRpcRequest::Initialize { params, id } => {
            info!(
                "Initializing MCP session: client={:?} protocol={:?}",
                params.as_ref().and_then(|p| p.client_info.as_ref()),
                params.as_ref().and_then(|p| p.protocol_version.as_deref())
            );
            RpcReply::ok(
                id,
                json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": { "tools": {} },
                    "serverInfo": {
                        "name": "rocketsync-search",
                        "version": env!("CARGO_PKG_VERSION")
                    }
                }),
            )
        }

        JsonRpcRequest::ListTools { id } => {
            RpcReply::ok(id, json!({ "tools": tools::definitions() }))
        }

        JsonRpcRequest::CallTool { params, id } => {
            let arguments = params.arguments.unwrap_or(Value::Null);
            match run_tool(&state, &params.name, arguments).await {
                Ok(value) => {
                    let text =
                        serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
                    RpcReply::ok(id, json!({ "content": [{ "type": "text", "text": text }] }))
                }
                Err(ToolError::UnknownTool(name)) => {
                    RpcReply::err(id, INVALID_PARAMS, format!("Unknown tool: {}", name))
                }
                Err(e) => RpcReply::err(id, TOOL_FAILED, e.to_string()),
            }
        }

        JsonRpcRequest::Unknown { method, id } => match id {
            Some(id) => {
                warn!("Unknown method: {}", method);
                RpcReply::err(id, METHOD_NOT_FOUND, format!("Method not found: {}", method))
            }
            None => {
                // Notification: nothing to answer.
                debug!("Notification: {}", method);
                return StatusCode::ACCEPTED.into_response();
            }
        },
    };

    if let Some(session_id) = query.session_id.as_deref() {
        match serde_json::to_string(&reply) {
            Ok(text) => {
                if !state.sessions.deliver(session_id, text) {
                    debug!("SSE session {} not connected, reply sent inline only", session_id);
                }
            }
            Err(e) => warn!("Failed to encode reply for SSE session {}: {}", session_id, e),
        }
    }

    Json(reply).into_response()
}
