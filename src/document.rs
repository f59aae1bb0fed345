//! Chat message to search document projection.
//!
//! The mapping is pure: the same message, channel name and root URL always
//! produce the same document. The only exception is a message without any
//! timestamp, which is stamped with the current time.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::chat::ChatMessage;
use crate::entity::Author;

/// One indexed chat message. `message_id` doubles as the document id, which
/// makes every write an overwrite of the previous version.
///
/// Reading is lenient: stored documents from older writers may lack fields
/// or hold nulls, and those read back as empty values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexDocument {
    #[serde(deserialize_with = "lenient_string")]
    pub message_id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub channel_id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub channel_name: String,
    #[serde(deserialize_with = "lenient_string")]
    pub text: String,
    #[serde(deserialize_with = "lenient_string")]
    pub author_id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub author_username: String,
    #[serde(deserialize_with = "lenient_string")]
    pub author_name: String,
    #[serde(deserialize_with = "timestamp_from_any")]
    pub timestamp: String,
    pub thread_id: Option<String>,
    #[serde(deserialize_with = "lenient_bool")]
    pub is_thread_reply: bool,
    #[serde(deserialize_with = "lenient_string")]
    pub url: String,
}

impl IndexDocument {
    /// Project a message into its document. `channel_name` is the resolved
    /// room name, if known; the room id stands in for it otherwise.
    pub fn from_message(message: &ChatMessage, channel_name: Option<&str>, root_url: &str) -> Self {
        let author = Author::resolve(message.u.as_ref());
        let channel_id = message.room_id().to_string();
        let channel_name = channel_name
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| channel_id.clone());
        let thread_id = message.thread_id().map(str::to_string);
        let url = deep_link(root_url, &channel_name, message.id());

        Self {
            message_id: message.id().to_string(),
            channel_id,
            channel_name,
            text: message.text().to_string(),
            author_id: author.id,
            author_username: author.username,
            author_name: author.name,
            timestamp: message
                .timestamp()
                .unwrap_or_else(|| Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
            is_thread_reply: thread_id.is_some(),
            thread_id,
            url,
        }
    }

    /// Map only search-worthy messages; empty bodies and id-less payloads
    /// yield `None`.
    pub fn from_indexable(
        message: &ChatMessage,
        channel_name: Option<&str>,
        root_url: &str,
    ) -> Option<Self> {
        message
            .is_indexable()
            .then(|| Self::from_message(message, channel_name, root_url))
    }

    /// Text prefix for log lines.
    pub fn preview(&self) -> String {
        self.text.chars().take(50).collect()
    }
}

pub fn deep_link(root_url: &str, channel_name: &str, message_id: &str) -> String {
    format!(
        "{}/channel/{}?msg={}",
        root_url.trim_end_matches('/'),
        channel_name,
        message_id
    )
}

// Documents written by older writers may carry epoch-millis timestamps.
fn timestamp_from_any<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(crate::chat::normalize_timestamp(&value).unwrap_or_default())
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or(false))
}
