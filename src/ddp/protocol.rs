use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::Credentials;

/// Subscription that streams messages from every room the user belongs to.
pub const MESSAGE_STREAM: &str = "stream-room-messages";
/// Room selector for [`MESSAGE_STREAM`] meaning "all my rooms".
pub const MY_MESSAGES: &str = "__my_messages__";

const PROTOCOL_VERSION: &str = "1";
const SUPPORTED_VERSIONS: [&str; 3] = ["1", "pre2", "pre1"];

// -----------------------------------------------------------------------------
// Outbound frames
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "msg", rename_all = "lowercase")]
pub enum ClientFrame {
    Connect {
        version: String,
        support: Vec<String>,
    },
    Method {
        method: String,
        id: String,
        params: Vec<Value>,
    },
    Sub {
        id: String,
        name: String,
        params: Vec<Value>,
    },
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
}

impl ClientFrame {
    pub fn connect() -> Self {
        Self::Connect {
            version: PROTOCOL_VERSION.to_string(),
            support: SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect(),
        }
    }

    pub fn login(id: &str, credentials: &Credentials) -> Self {
        Self::Method {
            method: "login".to_string(),
            id: id.to_string(),
            params: vec![json!({
                "user": { "username": credentials.username },
                "password": credentials.password,
            })],
        }
    }

    /// Subscribe to new messages in every room the user has joined.
    pub fn subscribe_my_messages(id: &str) -> Self {
        Self::Sub {
            id: id.to_string(),
            name: MESSAGE_STREAM.to_string(),
            params: vec![
                json!(MY_MESSAGES),
                json!({ "useCollection": false, "args": [] }),
            ],
        }
    }

    pub fn pong(id: Option<String>) -> Self {
        Self::Pong { id }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Method { .. } => "method",
            Self::Sub { .. } => "sub",
            Self::Pong { .. } => "pong",
        }
    }

    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

// -----------------------------------------------------------------------------
// Inbound frames
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "msg", rename_all = "lowercase")]
pub enum ServerFrame {
    Connected {
        #[serde(default)]
        session: String,
    },
    Result {
        id: String,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<ServerError>,
    },
    Changed {
        #[serde(default)]
        collection: String,
        #[serde(default)]
        fields: ChangeFields,
    },
    Ping {
        #[serde(default)]
        id: Option<String>,
    },
    Ready {
        #[serde(default)]
        subs: Vec<String>,
    },
    Nosub {
        id: String,
        #[serde(default)]
        error: Option<ServerError>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChangeFields {
    #[serde(rename = "eventName", default)]
    pub event_name: Option<String>,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Error object attached to method results and rejected subscriptions.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerError {
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ServerError {
    pub fn describe(&self) -> String {
        self.message
            .clone()
            .or_else(|| self.reason.clone())
            .or_else(|| self.error.as_ref().map(|e| e.to_string()))
            .unwrap_or_else(|| "unknown error".to_string())
    }
}

impl ServerFrame {
    /// Decode one text frame. Frames without a `msg` discriminator (the
    /// server's initial `{"server_id":"0"}` greeting) decode as `Other`.
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        if value.get("msg").is_none() {
            return Ok(Self::Other);
        }
        serde_json::from_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_wire_format() {
        let text = ClientFrame::connect().to_text().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            json!({ "msg": "connect", "version": "1", "support": ["1", "pre2", "pre1"] })
        );
    }

    #[test]
    fn login_carries_credentials_and_correlation_id() {
        let credentials = Credentials {
            username: "bot".to_string(),
            password: "secret".to_string(),
        };
        let value = serde_json::to_value(ClientFrame::login("login-1", &credentials)).unwrap();
        assert_eq!(value["msg"], "method");
        assert_eq!(value["method"], "login");
        assert_eq!(value["id"], "login-1");
        assert_eq!(value["params"][0]["user"]["username"], "bot");
        assert_eq!(value["params"][0]["password"], "secret");
    }

    #[test]
    fn subscribe_targets_all_rooms() {
        let value = serde_json::to_value(ClientFrame::subscribe_my_messages("s1")).unwrap();
        assert_eq!(value["msg"], "sub");
        assert_eq!(value["name"], "stream-room-messages");
        assert_eq!(value["params"][0], "__my_messages__");
        assert_eq!(value["params"][1]["useCollection"], false);
    }

    #[test]
    fn pong_echoes_optional_id() {
        assert_eq!(
            serde_json::to_value(ClientFrame::pong(None)).unwrap(),
            json!({ "msg": "pong" })
        );
        assert_eq!(
            serde_json::to_value(ClientFrame::pong(Some("p1".to_string()))).unwrap(),
            json!({ "msg": "pong", "id": "p1" })
        );
    }

    #[test]
    fn inbound_frames_decode() {
        match ServerFrame::parse(r#"{"msg":"connected","session":"S1"}"#).unwrap() {
            ServerFrame::Connected { session } => assert_eq!(session, "S1"),
            other => panic!("unexpected frame {:?}", other),
        }

        let failed = ServerFrame::parse(
            r#"{"msg":"result","id":"login-1","error":{"error":403,"reason":"User not found","message":"User not found [403]"}}"#,
        )
        .unwrap();
        match failed {
            ServerFrame::Result { id, result, error } => {
                assert_eq!(id, "login-1");
                assert!(result.is_none());
                assert_eq!(error.unwrap().describe(), "User not found [403]");
            }
            other => panic!("unexpected frame {:?}", other),
        }

        match ServerFrame::parse(r#"{"msg":"ping"}"#).unwrap() {
            ServerFrame::Ping { id } => assert!(id.is_none()),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn unknown_and_untagged_frames_are_other() {
        assert!(matches!(
            ServerFrame::parse(r#"{"server_id":"0"}"#).unwrap(),
            ServerFrame::Other
        ));
        assert!(matches!(
            ServerFrame::parse(r#"{"msg":"added","collection":"users","id":"u1"}"#).unwrap(),
            ServerFrame::Other
        ));
        assert!(ServerFrame::parse("{not json").is_err());
    }
}
