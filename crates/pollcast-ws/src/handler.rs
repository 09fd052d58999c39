use axum::extract::ws::{Message, WebSocket};
use futures_util::{Sink, SinkExt, StreamExt};
use governor::{Quota, RateLimiter};
use pollcast_core::{auth, observability, AppState, CoreError};
use pollcast_models::{ClientMessage, ServerMessage};
use std::num::NonZeroU32;
use uuid::Uuid;

/// Client messages accepted per second on one connection.
const INBOUND_PER_SECOND: NonZeroU32 = match NonZeroU32::new(20) {
    Some(n) => n,
    None => NonZeroU32::MIN,
};

pub async fn handle_connection(socket: WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4().to_string();
    let mut updates = state.registry.register(connection_id.clone());
    observability::ws_connection_open();
    tracing::debug!(connection_id = %connection_id, "ws: connection opened");

    let (mut sink, mut stream) = socket.split();
    let throttle = RateLimiter::direct(Quota::per_second(INBOUND_PER_SECOND));

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            update = updates.recv() => {
                let Some(payload) = update else { break };
                if sink.send(Message::Text(payload.to_string().into())).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                let message = match incoming {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        tracing::debug!(connection_id = %connection_id, "ws: read error: {e}");
                        break;
                    }
                    None => break,
                };
                let reply = match message {
                    Message::Text(text) => {
                        if throttle.check().is_err() {
                            ServerMessage::error("Too many messages")
                        } else {
                            handle_client_text(&state, &connection_id, text.as_str()).await
                        }
                    }
                    Message::Binary(_) => ServerMessage::error("Invalid message format"),
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => continue,
                };
                if send_json(&mut sink, &reply).await.is_err() {
                    break;
                }
            }
        }
    }

    state.registry.unregister(&connection_id).await;
    observability::ws_connection_close();
    tracing::debug!(connection_id = %connection_id, "ws: connection closed");
}

async fn send_json<S>(sink: &mut S, message: &ServerMessage) -> Result<(), axum::Error>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    match serde_json::to_string(message) {
        Ok(json) => sink.send(Message::Text(json.into())).await,
        Err(e) => {
            tracing::warn!("ws: failed to encode reply: {e}");
            Ok(())
        }
    }
}

/// Apply one client text frame and produce the reply. Errors are answered
/// on the connection and never close it.
pub(crate) async fn handle_client_text(
    state: &AppState,
    connection_id: &str,
    text: &str,
) -> ServerMessage {
    let message = match parse_client_message(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::debug!(connection_id = %connection_id, "ws: {e}");
            return ServerMessage::error("Invalid message format");
        }
    };

    match message {
        ClientMessage::Subscribe { poll_id, token } => {
            let verified = token
                .as_deref()
                .ok_or(CoreError::InvalidToken)
                .and_then(|token| auth::validate_token(token, &state.config.jwt_secret));
            if let Err(e) = verified {
                tracing::debug!(connection_id = %connection_id, poll_id = %poll_id, "ws: subscribe rejected: {e}");
                return ServerMessage::error("Invalid token");
            }
            state.registry.subscribe(connection_id, &poll_id).await;
            ServerMessage::Subscribed { poll_id }
        }
        ClientMessage::Unsubscribe { poll_id } => {
            state.registry.unsubscribe(connection_id, &poll_id).await;
            ServerMessage::Unsubscribed { poll_id }
        }
    }
}

fn parse_client_message(text: &str) -> Result<ClientMessage, CoreError> {
    serde_json::from_str(text).map_err(|e| CoreError::MalformedMessage(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use pollcast_bus::{Bus, MemoryBus};
    use pollcast_core::{polls, votes, AppConfig};
    use serde_json::{json, Value};
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::Message as ClientFrame;

    const SECRET: &str = "test-secret";
    const WAIT: Duration = Duration::from_secs(5);

    fn state(db: pollcast_db::DbPool, bus: &MemoryBus, node_id: &str) -> AppState {
        AppState::new(
            db,
            Bus::Memory(bus.clone()),
            AppConfig {
                node_id: node_id.into(),
                jwt_secret: SECRET.into(),
                ..AppConfig::default()
            },
        )
    }

    async fn file_pool(dir: &tempfile::TempDir) -> pollcast_db::DbPool {
        let url = format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("pollcast.db").to_string_lossy().replace('\\', "/")
        );
        let pool = pollcast_db::create_pool(&url, 4).await.expect("pool");
        pollcast_db::run_migrations(&pool).await.expect("migrations");
        pool
    }

    async fn serve(state: AppState) -> SocketAddr {
        let app = pollcast_api::build_router(&state)
            .merge(crate::gateway_router())
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    async fn next_json<S>(socket: &mut S) -> Value
    where
        S: futures_util::Stream<Item = Result<ClientFrame, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        loop {
            let frame = timeout(WAIT, socket.next())
                .await
                .expect("frame in time")
                .expect("open socket")
                .expect("frame");
            if let ClientFrame::Text(text) = frame {
                return serde_json::from_str(text.as_str()).expect("json");
            }
        }
    }

    #[tokio::test]
    async fn control_messages_are_answered() {
        let dir = tempfile::tempdir().unwrap();
        let bus = MemoryBus::new();
        let state = state(file_pool(&dir).await, &bus, "n1");
        let _rx = state.registry.register("c1");

        let reply = handle_client_text(&state, "c1", "{not json").await;
        assert_eq!(reply, ServerMessage::error("Invalid message format"));

        let reply = handle_client_text(
            &state,
            "c1",
            r#"{"type":"subscribe","pollId":"p1","token":"forged"}"#,
        )
        .await;
        assert_eq!(reply, ServerMessage::error("Invalid token"));
        assert!(state.registry.subscriptions_of("c1").is_empty());

        let reply = handle_client_text(&state, "c1", r#"{"type":"subscribe","pollId":"p1"}"#).await;
        assert_eq!(reply, ServerMessage::error("Invalid token"));
        assert!(state.registry.subscriptions_of("c1").is_empty());

        let token = auth::issue_anonymous_token(SECRET, 60).unwrap().token;
        let subscribe = json!({"type": "subscribe", "pollId": "p1", "identityToken": token});
        let reply = handle_client_text(&state, "c1", &subscribe.to_string()).await;
        assert_eq!(reply, ServerMessage::Subscribed { poll_id: "p1".into() });
        assert_eq!(state.registry.subscriptions_of("c1"), vec!["p1"]);

        let reply = handle_client_text(&state, "c1", r#"{"type":"unsubscribe","pollId":"p1"}"#).await;
        assert_eq!(reply, ServerMessage::Unsubscribed { poll_id: "p1".into() });
        assert!(state.registry.subscriptions_of("c1").is_empty());
    }

    #[tokio::test]
    async fn vote_on_one_process_reaches_socket_on_another() {
        let dir = tempfile::tempdir().unwrap();
        let db = file_pool(&dir).await;
        let bus = MemoryBus::new();
        let writer = state(db.clone(), &bus, "writer");
        let reader = state(db, &bus, "reader");
        let _writer_sub = writer.start_update_subscriber().await.unwrap();
        let _reader_sub = reader.start_update_subscriber().await.unwrap();
        let addr = serve(reader.clone()).await;

        let poll = polls::create_poll(
            &writer.db,
            "Tabs or spaces?",
            &["Tabs".to_string(), "Spaces".to_string()],
            Utc::now() + ChronoDuration::hours(1),
            Some("owner"),
        )
        .await
        .unwrap();

        let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .expect("connect");
        socket
            .send(ClientFrame::Text("garbage".to_string().into()))
            .await
            .unwrap();
        assert_eq!(next_json(&mut socket).await["message"], "Invalid message format");

        let token = auth::issue_anonymous_token(SECRET, 60).unwrap().token;
        let subscribe = json!({"type": "subscribe", "pollId": poll.id, "token": token});
        socket
            .send(ClientFrame::Text(subscribe.to_string().into()))
            .await
            .unwrap();
        let ack = next_json(&mut socket).await;
        assert_eq!(ack, json!({"type": "subscribed", "pollId": poll.id}));

        votes::cast_vote_and_publish(&writer, &poll.id, "voter", 0)
            .await
            .unwrap();
        let update = next_json(&mut socket).await;
        assert_eq!(
            update,
            json!({
                "type": "vote_update",
                "pollId": poll.id,
                "data": { "votes": [1, 0], "totalVotes": 1 }
            })
        );

        polls::close_poll(&writer, &poll.id, "owner").await.unwrap();
        let closed = next_json(&mut socket).await;
        assert_eq!(
            closed,
            json!({"type": "poll_closed", "pollId": poll.id, "data": {"closed": true}})
        );

        socket.close(None).await.unwrap();
        let reader_registry = reader.registry.clone();
        let cleaned = timeout(WAIT, async move {
            while reader_registry.connection_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(cleaned.is_ok());
        assert!(reader.registry.cluster_subscribers(&poll.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn shutdown_closes_open_sockets() {
        let dir = tempfile::tempdir().unwrap();
        let bus = MemoryBus::new();
        let state = state(file_pool(&dir).await, &bus, "n1");
        let addr = serve(state.clone()).await;

        let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .expect("connect");
        let registry = state.registry.clone();
        timeout(WAIT, async move {
            while registry.connection_count() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("connection registered");

        state.shutdown.cancel();
        let frame = timeout(WAIT, socket.next()).await.expect("closed in time");
        assert!(matches!(frame, Some(Ok(ClientFrame::Close(_))) | None | Some(Err(_))));
    }
}
