//! Query bodies for the read side of the index.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Maximum number of distinct channels returned by the channel aggregation.
pub const CHANNEL_BUCKETS: u32 = 1000;
/// Maximum number of messages returned for one thread.
pub const THREAD_LIMIT: u32 = 100;

fn highlight() -> Value {
    json!({
        "fields": {
            "text": { "pre_tags": ["<mark>"], "post_tags": ["</mark>"] }
        }
    })
}

/// Distinct channels, one bucket per channel name, with the newest hit
/// carrying the channel id.
pub fn channel_buckets() -> Value {
    json!({
        "size": 0,
        "aggs": {
            "channels": {
                "terms": { "field": "channel_name", "size": CHANNEL_BUCKETS },
                "aggs": {
                    "channel_info": {
                        "top_hits": { "size": 1, "_source": ["channel_id", "channel_name"] }
                    }
                }
            }
        }
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelRef {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
}

/// Read the buckets produced by [`channel_buckets`].
pub fn parse_channel_buckets(aggregations: Option<&Value>) -> Vec<ChannelRef> {
    let Some(buckets) = aggregations
        .and_then(|aggs| aggs.pointer("/channels/buckets"))
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };

    buckets
        .iter()
        .filter_map(|bucket| {
            let name = bucket.get("key").and_then(Value::as_str)?;
            let id = bucket
                .pointer("/channel_info/hits/hits/0/_source/channel_id")
                .and_then(Value::as_str)
                .unwrap_or(name);
            Some(ChannelRef {
                id: id.to_string(),
                name: name.to_string(),
            })
        })
        .collect()
}

/// RocketChat-style room search: optional text match, optional room filter.
pub fn room_search(search_text: Option<&str>, room_id: Option<&str>, count: u32) -> Value {
    let mut must = Vec::new();
    if let Some(text) = search_text.filter(|t| !t.is_empty()) {
        must.push(json!({ "match": { "text": text } }));
    }
    if let Some(room) = room_id.filter(|r| !r.is_empty()) {
        must.push(json!({ "term": { "channel_id": room } }));
    }

    json!({
        "query": { "bool": { "must": must } },
        "sort": [{ "timestamp": "desc" }],
        "size": count,
        "highlight": highlight()
    })
}

pub fn message_by_id(message_id: &str) -> Value {
    json!({
        "query": { "term": { "message_id": message_id } },
        "size": 1
    })
}

/// Arguments of the `search_messages` tool.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchFilters {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub from_date: Option<String>,
    #[serde(default)]
    pub to_date: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    20
}

pub fn filtered_search(filters: &SearchFilters) -> Value {
    let mut must = vec![json!({ "match": { "text": filters.query } })];
    if let Some(channel) = filters.channel.as_deref().filter(|c| !c.is_empty()) {
        must.push(json!({ "term": { "channel_name": channel } }));
    }
    if let Some(author) = filters.author.as_deref().filter(|a| !a.is_empty()) {
        must.push(json!({ "term": { "author_username": author } }));
    }

    let mut filter = Vec::new();
    let from = filters.from_date.as_deref().filter(|d| !d.is_empty());
    let to = filters.to_date.as_deref().filter(|d| !d.is_empty());
    if from.is_some() || to.is_some() {
        let mut range = serde_json::Map::new();
        if let Some(from) = from {
            range.insert("gte".to_string(), json!(from));
        }
        if let Some(to) = to {
            range.insert("lte".to_string(), json!(to));
        }
        filter.push(json!({ "range": { "timestamp": range } }));
    }

    json!({
        "query": { "bool": { "must": must, "filter": filter } },
        "highlight": highlight(),
        "sort": [{ "timestamp": "desc" }],
        "size": filters.limit
    })
}

/// The thread root and all of its replies, oldest first.
pub fn thread(thread_id: &str) -> Value {
    json!({
        "query": {
            "bool": {
                "should": [
                    { "term": { "thread_id": thread_id } },
                    { "term": { "message_id": thread_id } }
                ],
                "minimum_should_match": 1
            }
        },
        "sort": [{ "timestamp": "asc" }],
        "size": THREAD_LIMIT
    })
}

/// Up to `size` messages in `channel_id` at or before `timestamp`, newest
/// first, excluding the target itself.
pub fn context_before(channel_id: &str, timestamp: &str, exclude_id: &str, size: u32) -> Value {
    context_side(channel_id, json!({ "lte": timestamp }), exclude_id, "desc", size)
}

/// Up to `size` messages in `channel_id` strictly after `timestamp`, oldest
/// first.
pub fn context_after(channel_id: &str, timestamp: &str, exclude_id: &str, size: u32) -> Value {
    context_side(channel_id, json!({ "gt": timestamp }), exclude_id, "asc", size)
}

fn context_side(channel_id: &str, range: Value, exclude_id: &str, order: &str, size: u32) -> Value {
    json!({
        "query": {
            "bool": {
                "must": [{ "term": { "channel_id": channel_id } }],
                "filter": [{ "range": { "timestamp": range } }],
                "must_not": [{ "term": { "message_id": exclude_id } }]
            }
        },
        "sort": [{ "timestamp": order }],
        "size": size
    })
}
