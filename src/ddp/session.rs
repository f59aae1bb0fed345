//! One protocol session, modelled as a state machine without I/O.
//!
//! The connection driver feeds transport events in (`on_open`, `on_text`,
//! `on_closed`) and executes the returned [`Action`]s in order. A session is
//! never reused: every reconnect builds a fresh one, which drops the session
//! id, the channel-name cache and the subscription registry together.

use std::collections::HashMap;
use std::fmt;

use tracing::{debug, error, info, warn};

use super::protocol::{ClientFrame, ServerFrame, ServerError, MESSAGE_STREAM, MY_MESSAGES};
use crate::chat;
use crate::config::Credentials;
use crate::document::IndexDocument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticating,
    Authenticated,
    Subscribing,
    Streaming,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Authenticating => "authenticating",
            Self::Authenticated => "authenticated",
            Self::Subscribing => "subscribing",
            Self::Streaming => "streaming",
        };
        f.write_str(name)
    }
}

/// Work the connection driver must carry out, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Send(ClientFrame),
    Index(IndexDocument),
    /// Close the transport; the supervisor decides whether to reconnect.
    Disconnect(String),
}

pub struct Session {
    state: SessionState,
    session_id: Option<String>,
    credentials: Credentials,
    root_url: String,
    login_id: Option<String>,
    channel_names: HashMap<String, String>,
    /// Subscription id to room selector.
    subscriptions: HashMap<String, String>,
}

impl Session {
    pub fn new(credentials: Credentials, root_url: impl Into<String>) -> Self {
        Self {
            state: SessionState::Disconnected,
            session_id: None,
            credentials,
            root_url: root_url.into(),
            login_id: None,
            channel_names: HashMap::new(),
            subscriptions: HashMap::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    #[cfg(test)]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn channel_name(&self, room_id: &str) -> Option<&str> {
        self.channel_names.get(room_id).map(String::as_str)
    }

    #[cfg(test)]
    pub fn subscriptions(&self) -> &HashMap<String, String> {
        &self.subscriptions
    }

    fn transition(&mut self, to: SessionState) {
        if self.state != to {
            info!(from = %self.state, to = %to, "Session state changed");
            self.state = to;
        }
    }

    pub fn begin_connect(&mut self) {
        self.transition(SessionState::Connecting);
    }

    /// Transport is open: negotiate the protocol version.
    pub fn on_open(&mut self) -> Vec<Action> {
        self.transition(SessionState::Connected);
        vec![Action::Send(ClientFrame::connect())]
    }

    pub fn on_closed(&mut self, reason: &str) {
        if self.state != SessionState::Disconnected {
            info!(state = %self.state, reason, "Transport closed");
        }
        self.transition(SessionState::Disconnected);
    }

    /// Handle one inbound text frame. Undecodable frames are logged and
    /// dropped; the stream carries on.
    pub fn on_text(&mut self, text: &str) -> Vec<Action> {
        match ServerFrame::parse(text) {
            Ok(frame) => self.handle(frame),
            Err(e) => {
                warn!(error = %e, frame = %truncate(text, 200), "Discarding malformed frame");
                Vec::new()
            }
        }
    }

    pub fn handle(&mut self, frame: ServerFrame) -> Vec<Action> {
        match frame {
            ServerFrame::Connected { session } => self.on_connected(session),
            ServerFrame::Result { id, result, error } => self.on_result(id, result, error),
            ServerFrame::Changed { collection, fields } => {
                if self.state != SessionState::Streaming {
                    debug!(state = %self.state, "Ignoring change before streaming");
                    return Vec::new();
                }
                if collection != MESSAGE_STREAM {
                    debug!(collection = %collection, "Ignoring change for other collection");
                    return Vec::new();
                }
                debug!(
                    event = fields.event_name.as_deref().unwrap_or(""),
                    count = fields.args.len(),
                    "Stream change"
                );
                self.on_messages(&fields.args)
            }
            ServerFrame::Ping { id } => vec![Action::Send(ClientFrame::pong(id))],
            ServerFrame::Ready { subs } => {
                for sub in subs {
                    debug!(subscription = %sub, "Subscription ready");
                }
                Vec::new()
            }
            ServerFrame::Nosub { id, error } => {
                let selector = self.subscriptions.remove(&id);
                warn!(
                    subscription = %id,
                    room = selector.as_deref().unwrap_or("?"),
                    error = %error.map(|e| e.describe()).unwrap_or_else(|| "none".to_string()),
                    "Subscription rejected by server"
                );
                Vec::new()
            }
            ServerFrame::Other => Vec::new(),
        }
    }

    fn on_connected(&mut self, session: String) -> Vec<Action> {
        if self.state != SessionState::Connected {
            warn!(state = %self.state, "Unexpected handshake acknowledgment");
            return Vec::new();
        }

        info!(session = %session, "Handshake acknowledged");
        self.session_id = Some(session);
        self.transition(SessionState::Authenticating);

        let login_id = format!("login-{}", uuid::Uuid::new_v4().simple());
        let frame = ClientFrame::login(&login_id, &self.credentials);
        self.login_id = Some(login_id);
        vec![Action::Send(frame)]
    }

    fn on_result(
        &mut self,
        id: String,
        result: Option<serde_json::Value>,
        error: Option<ServerError>,
    ) -> Vec<Action> {
        let is_login = self.state == SessionState::Authenticating
            && self.login_id.as_deref() == Some(id.as_str());
        if !is_login {
            debug!(id = %id, "Ignoring result for unknown request");
            return Vec::new();
        }
        self.login_id = None;

        if let Some(error) = error {
            let reason = format!("login rejected: {}", error.describe());
            error!(user = %self.credentials.username, error = %error.describe(), "Login failed");
            self.transition(SessionState::Disconnected);
            return vec![Action::Disconnect(reason)];
        }
        if result.is_none() {
            error!(user = %self.credentials.username, "Login returned no result");
            self.transition(SessionState::Disconnected);
            return vec![Action::Disconnect("login returned no result".to_string())];
        }

        info!(
            user = %self.credentials.username,
            session = self.session_id.as_deref().unwrap_or_default(),
            "Logged in"
        );
        self.transition(SessionState::Authenticated);

        self.transition(SessionState::Subscribing);
        let sub_id = uuid::Uuid::new_v4().simple().to_string();
        self.subscriptions
            .insert(sub_id.clone(), MY_MESSAGES.to_string());
        let frame = ClientFrame::subscribe_my_messages(&sub_id);

        self.transition(SessionState::Streaming);
        vec![Action::Send(frame)]
    }

    fn on_messages(&mut self, args: &[serde_json::Value]) -> Vec<Action> {
        let batch = chat::unpack_args(args);

        if let Some((room, name)) = batch.named_room() {
            if !self.channel_names.contains_key(room) {
                debug!(room, channel = %name, "Learned channel name");
                self.channel_names.insert(room.to_string(), name.to_string());
            }
        }

        let mut actions = Vec::with_capacity(batch.messages.len());
        for message in &batch.messages {
            let channel = self.channel_name(message.room_id());
            match IndexDocument::from_indexable(message, channel, &self.root_url) {
                Some(document) => actions.push(Action::Index(document)),
                None => debug!(message_id = message.id(), "Skipping message without text"),
            }
        }
        actions
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
