//! Named read operations over the message index, exposed to AI agents.

use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::document::IndexDocument;
use crate::index::query::{self, SearchFilters};
use crate::index::{IndexError, IndexGateway};

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Message not found")]
    NotFound,

    #[error(transparent)]
    Index(#[from] IndexError),
}

#[derive(Debug, Deserialize)]
struct ThreadArgs {
    thread_id: String,
}

#[derive(Debug, Deserialize)]
struct ContextArgs {
    message_id: String,
    #[serde(default = "default_context_size")]
    context_size: u32,
}

fn default_context_size() -> u32 {
    5
}

pub fn definitions() -> Vec<Value> {
    vec![
        json!({
            "name": "search_messages",
            "description": "Full-text search over chat messages. Query parameters sent over HTTP must be URL-encoded.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Search text, Korean or English" },
                    "channel": { "type": "string", "description": "Filter by channel name" },
                    "author": { "type": "string", "description": "Filter by author username" },
                    "from_date": { "type": "string", "description": "Start date (ISO 8601)" },
                    "to_date": { "type": "string", "description": "End date (ISO 8601)" },
                    "limit": { "type": "number", "description": "Max results (default: 20)" }
                },
                "required": ["query"]
            }
        }),
        json!({
            "name": "get_thread",
            "description": "Get a thread's root message and all replies",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "thread_id": { "type": "string", "description": "Thread root message id" }
                },
                "required": ["thread_id"]
            }
        }),
        json!({
            "name": "get_message_context",
            "description": "Get the messages around a message in its channel",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "message_id": { "type": "string", "description": "Message id" },
                    "context_size": { "type": "number", "description": "Messages before/after (default: 5)" }
                },
                "required": ["message_id"]
            }
        }),
    ]
}

fn parse_args<T: for<'de> Deserialize<'de>>(arguments: Value) -> Result<T, ToolError> {
    let arguments = if arguments.is_null() { json!({}) } else { arguments };
    serde_json::from_value(arguments).map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

pub async fn execute(
    gateway: &IndexGateway,
    tool: &str,
    arguments: Value,
) -> Result<Value, ToolError> {
    debug!(tool, arguments = %arguments, "Executing tool");
    match tool {
        "search_messages" => search_messages(gateway, parse_args(arguments)?).await,
        "get_thread" => get_thread(gateway, parse_args(arguments)?).await,
        "get_message_context" => get_message_context(gateway, parse_args(arguments)?).await,
        unknown => Err(ToolError::UnknownTool(unknown.to_string())),
    }
}

async fn search_messages(
    gateway: &IndexGateway,
    filters: SearchFilters,
) -> Result<Value, ToolError> {
    if filters.query.trim().is_empty() {
        warn!("search_messages called with empty query");
        return Ok(json!({ "total": 0, "messages": [], "error": "Query is required" }));
    }

    let response = gateway.search(&query::filtered_search(&filters)).await?;
    debug!(total = response.total(), "search_messages results");

    let messages: Vec<Value> = response
        .hits
        .hits
        .iter()
        .map(|hit| {
            json!({
                "message_id": hit.source.message_id,
                "channel_name": hit.source.channel_name,
                "author": hit.source.author_username,
                "text": hit.source.text,
                "timestamp": hit.source.timestamp,
                "highlight": hit.text_highlight(),
            })
        })
        .collect();

    Ok(json!({ "total": response.total(), "messages": messages }))
}

async fn get_thread(gateway: &IndexGateway, args: ThreadArgs) -> Result<Value, ToolError> {
    let response = gateway.search(&query::thread(&args.thread_id)).await?;

    let messages: Vec<Value> = response
        .hits
        .hits
        .iter()
        .map(|hit| {
            json!({
                "message_id": hit.source.message_id,
                "author": hit.source.author_username,
                "text": hit.source.text,
                "timestamp": hit.source.timestamp,
                "is_root": hit.source.message_id == args.thread_id,
            })
        })
        .collect();

    Ok(json!({
        "thread_id": args.thread_id,
        "message_count": response.total(),
        "messages": messages,
    }))
}

async fn get_message_context(
    gateway: &IndexGateway,
    args: ContextArgs,
) -> Result<Value, ToolError> {
    let target = gateway
        .search(&query::message_by_id(&args.message_id))
        .await?
        .hits
        .hits
        .into_iter()
        .next()
        .map(|hit| hit.source)
        .ok_or(ToolError::NotFound)?;

    let (channel, ts, id, n) = (
        target.channel_id.as_str(),
        target.timestamp.as_str(),
        target.message_id.as_str(),
        args.context_size,
    );
    let before = gateway.search(&query::context_before(channel, ts, id, n)).await?;
    let after = gateway.search(&query::context_after(channel, ts, id, n)).await?;

    // `before` comes back newest first.
    let mut window: Vec<IndexDocument> =
        before.hits.hits.into_iter().rev().map(|h| h.source).collect();
    window.push(target.clone());
    window.extend(after.hits.hits.into_iter().map(|h| h.source));

    let context: Vec<Value> = window
        .iter()
        .map(|doc| {
            json!({
                "message_id": doc.message_id,
                "text": doc.text,
                "author": doc.author_username,
                "timestamp": doc.timestamp,
                "is_target": doc.message_id == target.message_id,
            })
        })
        .collect();

    Ok(json!({
        "target_message": {
            "message_id": target.message_id,
            "text": target.text,
            "author": target.author_username,
            "timestamp": target.timestamp,
        },
        "context": context,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AnalyzerProfile, SearchConfig};
    use mockito::Matcher;

    fn gateway(url: &str) -> IndexGateway {
        IndexGateway::new(&SearchConfig {
            url: url.to_string(),
            index: "rocketchat_messages".to_string(),
            user: None,
            password: None,
            tls_verify: false,
            analyzer: AnalyzerProfile::Standard,
        })
        .unwrap()
    }

    fn hit(id: &str, text: &str, ts: &str) -> Value {
        json!({
            "_id": id,
            "_source": {
                "message_id": id, "channel_id": "r1", "channel_name": "general",
                "text": text, "author_id": "u1", "author_username": "alice",
                "author_name": "Alice", "timestamp": ts, "thread_id": null,
                "is_thread_reply": false, "url": format!("http://localhost:3000/channel/general?msg={}", id)
            }
        })
    }

    fn hits(items: Vec<Value>) -> String {
        json!({ "hits": { "total": { "value": items.len() }, "hits": items } }).to_string()
    }

    #[tokio::test]
    async fn blank_query_short_circuits() {
        let gateway = gateway("http://127.0.0.1:1");
        let result = execute(&gateway, "search_messages", json!({ "query": "  " }))
            .await
            .unwrap();
        assert_eq!(result["total"], 0);
        assert_eq!(result["error"], "Query is required");
    }

    #[tokio::test]
    async fn unknown_tool_is_rejected() {
        let err = execute(&gateway("http://127.0.0.1:1"), "drop_index", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool(_)));
    }

    #[tokio::test]
    async fn missing_required_argument_is_invalid() {
        let err = execute(&gateway("http://127.0.0.1:1"), "get_thread", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn thread_flags_root() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/rocketchat_messages/_search")
            .match_body(Matcher::PartialJson(json!({ "sort": [{ "timestamp": "asc" }] })))
            .with_status(200)
            .with_body(hits(vec![
                hit("t1", "root", "2024-01-01T00:00:00.000Z"),
                hit("t2", "reply", "2024-01-01T00:01:00.000Z"),
            ]))
            .create_async()
            .await;

        let result = execute(&gateway(&server.url()), "get_thread", json!({ "thread_id": "t1" }))
            .await
            .unwrap();
        assert_eq!(result["message_count"], 2);
        assert_eq!(result["messages"][0]["is_root"], true);
        assert_eq!(result["messages"][1]["is_root"], false);
    }

    #[tokio::test]
    async fn context_window_is_chronological() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/rocketchat_messages/_search")
            .match_body(Matcher::PartialJson(
                json!({ "query": { "term": { "message_id": "m3" } } }),
            ))
            .with_status(200)
            .with_body(hits(vec![hit("m3", "target", "2024-01-01T00:03:00.000Z")]))
            .create_async()
            .await;
        server
            .mock("POST", "/rocketchat_messages/_search")
            .match_body(Matcher::PartialJson(
                json!({ "sort": [{ "timestamp": "desc" }], "size": 2 }),
            ))
            .with_status(200)
            .with_body(hits(vec![
                hit("m2", "two", "2024-01-01T00:02:00.000Z"),
                hit("m1", "one", "2024-01-01T00:01:00.000Z"),
            ]))
            .create_async()
            .await;
        server
            .mock("POST", "/rocketchat_messages/_search")
            .match_body(Matcher::PartialJson(
                json!({ "sort": [{ "timestamp": "asc" }], "size": 2 }),
            ))
            .with_status(200)
            .with_body(hits(vec![hit("m4", "four", "2024-01-01T00:04:00.000Z")]))
            .create_async()
            .await;

        let result = execute(
            &gateway(&server.url()),
            "get_message_context",
            json!({ "message_id": "m3", "context_size": 2 }),
        )
        .await
        .unwrap();

        let ids: Vec<&str> = result["context"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["message_id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["m1", "m2", "m3", "m4"]);
        assert_eq!(result["context"][2]["is_target"], true);
        assert_eq!(result["target_message"]["text"], "target");
    }

    #[tokio::test]
    async fn context_for_missing_message_is_not_found() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/rocketchat_messages/_search")
            .with_status(200)
            .with_body(hits(Vec::new()))
            .create_async()
            .await;

        let gateway = gateway(&server.url());
        let err = execute(&gateway, "get_message_context", json!({ "message_id": "nope" }))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::NotFound));
    }
}
