//! RocketChat REST API client, used for history backfill and as the
//! fallback source of the query proxy.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::chat::ChatMessage;
use crate::config::Credentials;

#[derive(Debug, Error)]
pub enum RestError {
    #[error("chat API request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("chat API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("login rejected: {0}")]
    LoginRejected(String),

    #[error("invalid chat API URL: {0}")]
    InvalidUrl(String),
}

/// Token pair sent as `X-Auth-Token` / `X-User-Id`.
#[derive(Debug, Clone)]
pub struct RestAuth {
    pub token: String,
    pub user_id: String,
}

#[derive(Debug, Clone)]
pub struct LoginSession {
    pub auth: RestAuth,
    pub username: String,
}

/// A channel as listed by the chat server. Fields other than the id and name
/// are carried through untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Channel {
    /// Display name, falling back to the id for unnamed rooms.
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.id)
    }
}

/// Paged access to channel history.
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn login(&self, credentials: &Credentials) -> Result<LoginSession, RestError>;
    async fn list_channels(&self, auth: &RestAuth) -> Result<Vec<Channel>, RestError>;
    /// Up to `count` most recent messages of a channel.
    async fn channel_messages(
        &self,
        auth: &RestAuth,
        room_id: &str,
        count: u32,
    ) -> Result<Vec<ChatMessage>, RestError>;
}

#[derive(Clone)]
pub struct RocketChatClient {
    http: reqwest::Client,
    base: Url,
}

#[derive(Deserialize)]
struct LoginResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<LoginData>,
}

#[derive(Deserialize)]
struct LoginData {
    #[serde(rename = "authToken")]
    auth_token: String,
    #[serde(rename = "userId")]
    user_id: String,
    #[serde(default)]
    me: Option<Value>,
}

/// Channels requested per `channels.list` page.
const CHANNEL_PAGE: u32 = 100;

#[derive(Deserialize)]
struct ChannelsResponse {
    #[serde(default)]
    channels: Vec<Channel>,
    #[serde(default)]
    total: Option<u64>,
}

#[derive(Deserialize)]
struct MessagesResponse<T> {
    #[serde(default = "Vec::new")]
    messages: Vec<T>,
}

#[derive(Deserialize)]
struct MessageResponse {
    #[serde(default)]
    message: Option<Value>,
}

impl RocketChatClient {
    pub fn new(base_url: &str) -> Result<Self, RestError> {
        let base = Url::parse(base_url)
            .map_err(|e| RestError::InvalidUrl(format!("{}: {}", base_url, e)))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { http, base })
    }

    fn endpoint(&self, method: &str) -> Result<Url, RestError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| RestError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(["api", "v1", method]);
        Ok(url)
    }

    fn request(
        &self,
        method: Method,
        endpoint: &str,
        auth: &RestAuth,
    ) -> Result<RequestBuilder, RestError> {
        Ok(self
            .http
            .request(method, self.endpoint(endpoint)?)
            .header("X-Auth-Token", &auth.token)
            .header("X-User-Id", &auth.user_id))
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, RestError> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RestError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }

    /// Room-scoped message search on the chat server. Messages are returned
    /// as the server sent them.
    pub async fn search_messages(
        &self,
        auth: &RestAuth,
        room_id: &str,
        search_text: Option<&str>,
        count: u32,
    ) -> Result<Vec<Value>, RestError> {
        let mut query = vec![("roomId", room_id.to_string()), ("count", count.to_string())];
        if let Some(text) = search_text {
            query.push(("searchText", text.to_string()));
        }
        let request = self.request(Method::GET, "chat.search", auth)?.query(&query);
        let response: MessagesResponse<Value> = self.fetch(request).await?;
        Ok(response.messages)
    }

    /// Every channel, walking `channels.list` with `offset` until `total`
    /// is reached or a short page comes back.
    async fn list_channels_paged(
        &self,
        auth: &RestAuth,
        page: u32,
    ) -> Result<Vec<Channel>, RestError> {
        let mut channels = Vec::new();
        loop {
            let offset = channels.len();
            let request = self
                .request(Method::GET, "channels.list", auth)?
                .query(&[("count", page.to_string()), ("offset", offset.to_string())]);
            let response: ChannelsResponse = self.fetch(request).await?;

            let received = response.channels.len();
            channels.extend(response.channels);
            debug!(offset, received, total = ?response.total, "Listed channel page");

            let done = match response.total {
                Some(total) => channels.len() as u64 >= total,
                None => received < page as usize,
            };
            if done || received == 0 {
                return Ok(channels);
            }
        }
    }

    pub async fn get_message(
        &self,
        auth: &RestAuth,
        message_id: &str,
    ) -> Result<Option<Value>, RestError> {
        let request = self
            .request(Method::GET, "chat.getMessage", auth)?
            .query(&[("msgId", message_id)]);
        let response: MessageResponse = self.fetch(request).await?;
        Ok(response.message.filter(|m| !m.is_null()))
    }
}

#[async_trait]
impl HistorySource for RocketChatClient {
    async fn login(&self, credentials: &Credentials) -> Result<LoginSession, RestError> {
        let request = self
            .http
            .post(self.endpoint("login")?)
            .json(&json!({ "user": credentials.username, "password": credentials.password }));

        let response = request.send().await?;
        let status = response.status();
        if status.as_u16() == 401 {
            let body = response.text().await.unwrap_or_default();
            return Err(RestError::LoginRejected(body));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RestError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let login: LoginResponse = response.json().await?;
        let data = match (login.status.as_str(), login.data) {
            ("success", Some(data)) => data,
            _ => {
                return Err(RestError::LoginRejected(
                    login.message.unwrap_or_else(|| "login failed".to_string()),
                ))
            }
        };

        let username = data
            .me
            .as_ref()
            .and_then(|me| me.get("username"))
            .and_then(Value::as_str)
            .unwrap_or(&credentials.username)
            .to_string();
        debug!(user = %username, "REST login succeeded");

        Ok(LoginSession {
            auth: RestAuth {
                token: data.auth_token,
                user_id: data.user_id,
            },
            username,
        })
    }

    async fn list_channels(&self, auth: &RestAuth) -> Result<Vec<Channel>, RestError> {
        self.list_channels_paged(auth, CHANNEL_PAGE).await
    }

    async fn channel_messages(
        &self,
        auth: &RestAuth,
        room_id: &str,
        count: u32,
    ) -> Result<Vec<ChatMessage>, RestError> {
        let request = self
            .request(Method::GET, "channels.messages", auth)?
            .query(&[("roomId", room_id.to_string()), ("count", count.to_string())]);
        let response: MessagesResponse<ChatMessage> = self.fetch(request).await?;
        Ok(response.messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn auth() -> RestAuth {
        RestAuth {
            token: "tok".to_string(),
            user_id: "uid".to_string(),
        }
    }

    fn credentials() -> Credentials {
        Credentials {
            username: "bot".to_string(),
            password: "secret".to_string(),
        }
    }

    #[tokio::test]
    async fn login_reads_tokens() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/login")
            .match_body(Matcher::Json(json!({ "user": "bot", "password": "secret" })))
            .with_status(200)
            .with_body(
                json!({
                    "status": "success",
                    "data": { "authToken": "tok", "userId": "uid", "me": { "username": "sync-bot" } }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = RocketChatClient::new(&server.url()).unwrap();
        let session = client.login(&credentials()).await.unwrap();
        assert_eq!(session.auth.token, "tok");
        assert_eq!(session.auth.user_id, "uid");
        assert_eq!(session.username, "sync-bot");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn login_rejection_is_classified() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/v1/login")
            .with_status(401)
            .with_body(r#"{"status":"error","error":"Unauthorized","message":"Unauthorized"}"#)
            .create_async()
            .await;

        let client = RocketChatClient::new(&server.url()).unwrap();
        let err = client.login(&credentials()).await.unwrap_err();
        assert!(matches!(err, RestError::LoginRejected(_)));
    }

    #[tokio::test]
    async fn channel_messages_sends_auth_headers_and_paging() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/channels.messages")
            .match_header("X-Auth-Token", "tok")
            .match_header("X-User-Id", "uid")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("roomId".into(), "GENERAL".into()),
                Matcher::UrlEncoded("count".into(), "500".into()),
            ]))
            .with_status(200)
            .with_body(
                json!({
                    "messages": [
                        { "_id": "m1", "rid": "GENERAL", "msg": "hello", "ts": "2024-01-01T00:00:00.000Z" },
                        { "_id": "m2", "rid": "GENERAL", "t": "uj", "msg": "" }
                    ],
                    "success": true
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = RocketChatClient::new(&server.url()).unwrap();
        let messages = client.channel_messages(&auth(), "GENERAL", 500).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id(), "m1");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn list_channels_keeps_extra_fields() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v1/channels.list")
            .with_status(200)
            .with_body(r#"{"channels":[{"_id":"GENERAL","name":"general","t":"c","usersCount":3}],"success":true}"#)
            .create_async()
            .await;

        let client = RocketChatClient::new(&server.url()).unwrap();
        let channels = client.list_channels(&auth()).await.unwrap();
        assert_eq!(channels[0].display_name(), "general");
        let value = serde_json::to_value(&channels[0]).unwrap();
        assert_eq!(value["usersCount"], 3);
        assert_eq!(value["_id"], "GENERAL");
    }

    #[tokio::test]
    async fn list_channels_walks_every_page() {
        let mut server = mockito::Server::new_async().await;
        let first = server
            .mock("GET", "/api/v1/channels.list")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("count".into(), "2".into()),
                Matcher::UrlEncoded("offset".into(), "0".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"channels":[{"_id":"a","name":"alpha"},{"_id":"b","name":"beta"}],"total":3}"#)
            .create_async()
            .await;
        let second = server
            .mock("GET", "/api/v1/channels.list")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("count".into(), "2".into()),
                Matcher::UrlEncoded("offset".into(), "2".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"channels":[{"_id":"c","name":"gamma"}],"total":3}"#)
            .create_async()
            .await;

        let client = RocketChatClient::new(&server.url()).unwrap();
        let channels = client.list_channels_paged(&auth(), 2).await.unwrap();
        let ids: Vec<&str> = channels.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        first.assert_async().await;
        second.assert_async().await;
    }

    #[tokio::test]
    async fn get_message_errors_surface_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v1/chat.getMessage")
            .match_query(Matcher::UrlEncoded("msgId".into(), "nope".into()))
            .with_status(400)
            .with_body(r#"{"success":false}"#)
            .create_async()
            .await;

        let client = RocketChatClient::new(&server.url()).unwrap();
        let err = client.get_message(&auth(), "nope").await.unwrap_err();
        assert!(matches!(err, RestError::Status { status: 400, .. }));
    }

    #[test]
    fn unnamed_channel_displays_id() {
        let channel: Channel = serde_json::from_value(json!({ "_id": "r9" })).unwrap();
        assert_eq!(channel.display_name(), "r9");
    }
}
