use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::session::{Action, Session, SessionState};
use crate::writer::IndexWriter;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEnd {
    /// Operator asked the process to stop.
    Shutdown,
    /// Transport closed or failed; carries the reason.
    Closed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOutcome {
    pub reached_streaming: bool,
    pub end: ConnectionEnd,
}

impl ConnectionOutcome {
    fn closed(reached_streaming: bool, reason: impl Into<String>) -> Self {
        Self {
            reached_streaming,
            end: ConnectionEnd::Closed(reason.into()),
        }
    }

    fn shutdown(reached_streaming: bool) -> Self {
        Self {
            reached_streaming,
            end: ConnectionEnd::Shutdown,
        }
    }
}

/// Drive `session` over one WebSocket until it closes or shutdown is
/// signalled. Frames are handled strictly in arrival order.
pub async fn run(
    ws_url: &str,
    session: &mut Session,
    writer: &IndexWriter,
    shutdown: &mut watch::Receiver<bool>,
) -> ConnectionOutcome {
    if *shutdown.borrow() {
        return ConnectionOutcome::shutdown(false);
    }

    session.begin_connect();
    info!("Connecting to {}", ws_url);

    let connected = tokio::select! {
        result = connect_async(ws_url) => result,
        _ = shutdown.changed() => return ConnectionOutcome::shutdown(false),
    };

    let mut ws = match connected {
        Ok((ws, _response)) => ws,
        Err(e) => {
            let reason = format!("connect failed: {}", e);
            session.on_closed(&reason);
            return ConnectionOutcome::closed(false, reason);
        }
    };

    let mut reached_streaming = false;
    let actions = session.on_open();
    if let Err(reason) = apply(&mut ws, actions, writer).await {
        session.on_closed(&reason);
        return ConnectionOutcome::closed(false, reason);
    }

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Shutdown requested, closing connection");
                    if let Err(e) = ws.close(None).await {
                        debug!("Close handshake failed: {}", e);
                    }
                    session.on_closed("shutdown");
                    return ConnectionOutcome::shutdown(reached_streaming);
                }
            }
            frame = ws.next() => {
                let result = match frame {
                    Some(Ok(Message::Text(text))) => {
                        debug!("<- {}", text);
                        let actions = session.on_text(&text);
                        apply(&mut ws, actions, writer).await
                    }
                    Some(Ok(Message::Close(frame))) => Err(match frame {
                        Some(frame) => format!("closed by server: {} {}", frame.code, frame.reason),
                        None => "closed by server".to_string(),
                    }),
                    Some(Ok(_)) => Ok(()),
                    Some(Err(e)) => Err(format!("transport error: {}", e)),
                    None => Err("stream ended".to_string()),
                };

                if session.state() == SessionState::Streaming {
                    reached_streaming = true;
                }

                if let Err(reason) = result {
                    warn!(reason = %reason, "Connection lost");
                    session.on_closed(&reason);
                    return ConnectionOutcome::closed(reached_streaming, reason);
                }
            }
        }
    }
}

/// Carry out session actions in order. An error ends the connection.
async fn apply(
    ws: &mut WsStream,
    actions: Vec<Action>,
    writer: &IndexWriter,
) -> Result<(), String> {
    for action in actions {
        match action {
            Action::Send(frame) => {
                let text = frame
                    .to_text()
                    .map_err(|e| format!("failed to encode {} frame: {}", frame.kind(), e))?;
                debug!("-> {}", frame.kind());
                ws.send(Message::Text(text))
                    .await
                    .map_err(|e| format!("send failed: {}", e))?;
            }
            Action::Index(document) => writer.submit(document).await,
            Action::Disconnect(reason) => {
                if let Err(e) = ws.close(None).await {
                    debug!("Close handshake failed: {}", e);
                }
                return Err(reason);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use crate::index::memory::MemorySink;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn credentials() -> Credentials {
        Credentials {
            username: "bot".to_string(),
            password: "secret".to_string(),
        }
    }

    async fn recv_json(ws: &mut WebSocketStream<TcpStream>) -> Value {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("client went away: {:?}", other),
            }
        }
    }

    async fn send_json(ws: &mut WebSocketStream<TcpStream>, value: Value) {
        ws.send(Message::Text(value.to_string())).await.unwrap();
    }

    /// Minimal chat server: handshake, login, subscription, then `script`.
    async fn serve_one(listener: TcpListener, login_ok: bool, script: Vec<Value>) -> Vec<Value> {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let mut seen = Vec::new();

        send_json(&mut ws, json!({ "server_id": "0" })).await;

        let connect = recv_json(&mut ws).await;
        assert_eq!(connect["msg"], "connect");
        seen.push(connect);
        send_json(&mut ws, json!({ "msg": "connected", "session": "S1" })).await;

        let login = recv_json(&mut ws).await;
        assert_eq!(login["method"], "login");
        let login_id = login["id"].clone();
        seen.push(login);

        if !login_ok {
            send_json(
                &mut ws,
                json!({
                    "msg": "result", "id": login_id,
                    "error": { "error": 403, "message": "User not found [403]" }
                }),
            )
            .await;
            // Give the client a chance to send anything it should not.
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    seen.push(serde_json::from_str(&text).unwrap());
                }
            }
            return seen;
        }

        let accepted = json!({ "msg": "result", "id": login_id, "result": { "token": "t" } });
        send_json(&mut ws, accepted).await;
        let sub = recv_json(&mut ws).await;
        assert_eq!(sub["msg"], "sub");
        send_json(&mut ws, json!({ "msg": "ready", "subs": [sub["id"].clone()] })).await;
        seen.push(sub);

        for frame in script {
            send_json(&mut ws, frame).await;
        }
        send_json(&mut ws, json!({ "msg": "ping", "id": "k1" })).await;
        let pong = recv_json(&mut ws).await;
        seen.push(pong);

        ws.close(None).await.ok();
        seen
    }

    fn message_change(id: &str, text: &str) -> Value {
        json!({
            "msg": "changed",
            "collection": "stream-room-messages",
            "id": "id",
            "fields": {
                "eventName": "__my_messages__",
                "args": [{ "_id": id, "rid": "r1", "msg": text, "u": { "username": "alice" } }]
            }
        })
    }

    #[tokio::test]
    async fn redelivered_message_is_overwritten() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(serve_one(
            listener,
            true,
            vec![
                message_change("m1", "hello"),
                json!("not even an object"),
                message_change("m1", "hello world"),
            ],
        ));

        let sink = Arc::new(MemorySink::default());
        let (writer, handles) = IndexWriter::spawn(sink.clone(), 2);
        let (_tx, mut shutdown) = watch::channel(false);
        let mut session = Session::new(credentials(), "http://localhost:3000");

        let outcome = run(&url, &mut session, &writer, &mut shutdown).await;
        assert!(outcome.reached_streaming);
        assert!(matches!(outcome.end, ConnectionEnd::Closed(_)));
        assert_eq!(session.state(), SessionState::Disconnected);

        let seen = server.await.unwrap();
        assert_eq!(seen.last().unwrap(), &json!({ "msg": "pong", "id": "k1" }));

        drop(writer);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(sink.len(), 1);
        let doc = sink.get("m1").unwrap();
        assert_eq!(doc.text, "hello world");
        assert_eq!(doc.channel_name, "r1");
    }

    #[tokio::test]
    async fn rejected_login_disconnects_without_subscribing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(serve_one(listener, false, Vec::new()));

        let sink = Arc::new(MemorySink::default());
        let (writer, _handles) = IndexWriter::spawn(sink.clone(), 1);
        let (_tx, mut shutdown) = watch::channel(false);
        let mut session = Session::new(credentials(), "http://localhost:3000");

        let outcome = run(&url, &mut session, &writer, &mut shutdown).await;
        assert!(!outcome.reached_streaming);
        assert!(
            matches!(&outcome.end, ConnectionEnd::Closed(reason) if reason.contains("login rejected"))
        );

        let seen = server.await.unwrap();
        assert!(seen.iter().all(|frame| frame["msg"] != "sub"));
    }

    #[tokio::test]
    async fn refused_connection_reports_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let sink = Arc::new(MemorySink::default());
        let (writer, _handles) = IndexWriter::spawn(sink, 1);
        let (_tx, mut shutdown) = watch::channel(false);
        let mut session = Session::new(credentials(), "http://localhost:3000");

        let outcome = run(&url, &mut session, &writer, &mut shutdown).await;
        assert!(!outcome.reached_streaming);
        assert!(matches!(outcome.end, ConnectionEnd::Closed(_)));
    }

    #[tokio::test]
    async fn shutdown_closes_streaming_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            recv_json(&mut ws).await;
            send_json(&mut ws, json!({ "msg": "connected", "session": "S1" })).await;
            let login = recv_json(&mut ws).await;
            send_json(&mut ws, json!({ "msg": "result", "id": login["id"], "result": {} })).await;
            recv_json(&mut ws).await;
            // Hold the connection open until the client closes it.
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_close() {
                    return true;
                }
            }
            false
        });

        let sink = Arc::new(MemorySink::default());
        let (writer, _handles) = IndexWriter::spawn(sink, 1);
        let (tx, mut shutdown) = watch::channel(false);
        let mut session = Session::new(credentials(), "http://localhost:3000");

        let client = tokio::spawn(async move {
            let outcome = run(&url, &mut session, &writer, &mut shutdown).await;
            (outcome, session.state())
        });

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        tx.send(true).unwrap();

        let (outcome, state) = client.await.unwrap();
        assert_eq!(outcome.end, ConnectionEnd::Shutdown);
        assert!(outcome.reached_streaming);
        assert_eq!(state, SessionState::Disconnected);
        assert!(server.await.unwrap());
    }
}
