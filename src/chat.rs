use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::entity::ChatUser;

/// A chat message as carried by stream-change events and the history API.
///
/// Every field is optional on the wire; accessors apply the blank-means-absent
/// rule so callers never see empty ids or thread ids.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(rename = "_id", default)]
    pub id: Option<String>,
    #[serde(default)]
    pub rid: Option<String>,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub u: Option<ChatUser>,
    #[serde(default)]
    pub ts: Option<Value>,
    #[serde(default)]
    pub tmid: Option<String>,
}

impl ChatMessage {
    pub fn id(&self) -> &str {
        self.id.as_deref().unwrap_or_default()
    }

    pub fn room_id(&self) -> &str {
        self.rid.as_deref().unwrap_or_default()
    }

    pub fn text(&self) -> &str {
        self.msg.as_deref().unwrap_or_default()
    }

    /// Parent thread id, if this message is a thread reply.
    pub fn thread_id(&self) -> Option<&str> {
        self.tmid.as_deref().filter(|t| !t.is_empty())
    }

    /// Only messages with an id and a body are search-worthy; system events
    /// (joins, topic changes) carry an empty body.
    pub fn is_indexable(&self) -> bool {
        !self.id().is_empty() && !self.text().is_empty()
    }

    /// Source timestamp normalised to a string the search engine accepts.
    pub fn timestamp(&self) -> Option<String> {
        self.ts.as_ref().and_then(normalize_timestamp)
    }
}

/// Accepts EJSON dates (`{"$date": millis}`), epoch millis and date strings.
/// Strings are kept verbatim.
pub fn normalize_timestamp(ts: &Value) -> Option<String> {
    match ts {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
        Value::Object(map) => map.get("$date").and_then(normalize_timestamp),
        _ => None,
    }
}

/// Messages and room metadata found in one change event's argument list.
#[derive(Debug, Default)]
pub struct ChangeBatch {
    pub messages: Vec<ChatMessage>,
    /// `roomName` from a metadata object travelling with the messages.
    pub room_name: Option<String>,
}

impl ChangeBatch {
    /// The room the metadata name belongs to, with that name. The metadata
    /// carries no room id of its own, so it is only attributable when every
    /// message in the batch is from the same room.
    pub fn named_room(&self) -> Option<(&str, &str)> {
        let name = self.room_name.as_deref()?;
        let mut rooms = self
            .messages
            .iter()
            .map(ChatMessage::room_id)
            .filter(|rid| !rid.is_empty());
        let room = rooms.next()?;
        if rooms.all(|other| other == room) {
            Some((room, name))
        } else {
            debug!(channel = %name, "Room metadata spans several rooms, not caching");
            None
        }
    }
}

/// Unpack raw argument objects into messages. Entries that do not look like
/// messages are skipped; malformed messages are logged and skipped.
pub fn unpack_args(args: &[Value]) -> ChangeBatch {
    let mut batch = ChangeBatch::default();

    for arg in args {
        let Some(obj) = arg.as_object() else {
            debug!("Skipping non-object change argument");
            continue;
        };

        if obj.contains_key("_id") {
            match serde_json::from_value::<ChatMessage>(arg.clone()) {
                Ok(message) => batch.messages.push(message),
                Err(e) => warn!(error = %e, "Discarding malformed message payload"),
            }
        } else if let Some(name) = obj.get("roomName").and_then(Value::as_str) {
            if !name.is_empty() {
                batch.room_name = Some(name.to_string());
            }
        }
    }

    batch
}
