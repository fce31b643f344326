//! WebSocket transport for node channels.

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt, stream::SplitSink};
use gravel_common::{ManagerMessage, NodeMessage};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::session::{ConnectionHandler, Flow, NodeSession};
use crate::state::AppState;

/// Time the writer gets to flush queued frames after the reader stops
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Upgrade to the node channel
pub async fn node_channel(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| serve_channel(socket, state))
}

async fn serve_channel(socket: WebSocket, state: AppState) {
    let (tx, rx) = mpsc::channel(state.config.membership.channel_buffer());
    let (sink, mut stream) = socket.split();
    let mut writer = tokio::spawn(write_frames(sink, rx));

    let mut session = NodeSession::new(state.manager.clone(), tx);
    let mut shutdown = state.shutdown.subscribe();
    let mut writer_done = false;

    loop {
        tokio::select! {
            frame = stream.next() => {
                let message = match frame {
                    Some(Ok(Message::Text(text))) => match NodeMessage::decode(text.as_str()) {
                        Ok(message) => message,
                        Err(e) => {
                            tracing::debug!(error = %e, "Malformed node frame");
                            break;
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    // Pings are answered by the websocket layer
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "Node channel read failed");
                        break;
                    }
                };

                if session.on_message(message).await == Flow::Close {
                    break;
                }
            }
            // Registry dropped the connection (timeout, removal, failed send)
            _ = &mut writer, if !writer_done => {
                writer_done = true;
                break;
            }
            _ = shutdown.recv() => break,
        }
    }

    session.on_close().await;
    drop(session);

    if !writer_done && tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
}

/// Forward outbound messages as text frames, then close the socket
async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<ManagerMessage>,
) {
    while let Some(message) = outbound.recv().await {
        let text = match message.encode() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode manager message");
                continue;
            }
        };
        if sink.send(Message::Text(text.into())).await.is_err() {
            return;
        }
    }

    let _ = sink.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use gravel_common::{DisconnectReason, NodeId, NodeState, TokenPolicy};
    use tokio::net::TcpStream;
    use tokio::sync::broadcast;
    use tokio_tungstenite::{
        MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message as Frame,
    };

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn serve() -> (String, AppState) {
        let mut config = AppConfig::default();
        config.token.policy = TokenPolicy::MultiUse;
        let (shutdown, _) = broadcast::channel(1);
        let state = AppState::new(config, shutdown);
        let app = crate::routes::create_router(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        (format!("ws://{addr}/nodes/ws"), state)
    }

    async fn connect(url: &str) -> Client {
        let (client, _) = connect_async(url).await.unwrap();
        client
    }

    async fn send(client: &mut Client, message: NodeMessage) {
        let text = serde_json::to_string(&message).unwrap();
        client.send(Frame::Text(text.into())).await.unwrap();
    }

    async fn next_message(client: &mut Client) -> ManagerMessage {
        loop {
            match client.next().await {
                Some(Ok(Frame::Text(text))) => return serde_json::from_str(text.as_str()).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("expected a text frame, got {other:?}"),
            }
        }
    }

    /// Drain frames until the server closes the socket
    async fn closed(client: &mut Client) -> bool {
        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(frame) = client.next().await {
                if matches!(frame, Ok(Frame::Close(_)) | Err(_)) {
                    break;
                }
            }
        })
        .await;

        drained.is_ok()
    }

    async fn joined_client(url: &str, state: &AppState) -> (Client, NodeId) {
        let token = state.manager.issue_token(None, None).await;
        let id = state.manager.join("10.0.0.1:1337", &token.value).await.unwrap();

        let mut client = connect(url).await;
        send(&mut client, NodeMessage::Hello { node_id: id.clone() }).await;
        assert!(matches!(
            next_message(&mut client).await,
            ManagerMessage::Welcome { node_id, .. } if node_id == id
        ));

        (client, id)
    }

    #[tokio::test]
    async fn test_registry_drop_closes_socket() {
        let (url, state) = serve().await;
        let (mut client, id) = joined_client(&url, &state).await;

        state.manager.unregister(&id, DisconnectReason::Timeout).await;

        assert!(closed(&mut client).await);
        assert_eq!(state.manager.node(&id).unwrap().state, NodeState::Unreachable);
        assert!(!state.manager.node(&id).unwrap().connected);
    }

    #[tokio::test]
    async fn test_malformed_frame_closes_socket() {
        let (url, _state) = serve().await;
        let mut client = connect(&url).await;

        client.send(Frame::Text("not json".into())).await.unwrap();

        assert!(closed(&mut client).await);
    }

    #[tokio::test]
    async fn test_unknown_node_gets_rejected_frame() {
        let (url, _state) = serve().await;
        let mut client = connect(&url).await;

        send(&mut client, NodeMessage::Hello { node_id: NodeId::from("node-missing") }).await;

        assert!(matches!(
            next_message(&mut client).await,
            ManagerMessage::Rejected { code, .. } if code == "unknown_node"
        ));
        assert!(closed(&mut client).await);
    }

    #[tokio::test]
    async fn test_shutdown_closes_open_sessions() {
        let (url, state) = serve().await;
        let (mut client, id) = joined_client(&url, &state).await;

        state.shutdown.send(()).unwrap();

        assert!(closed(&mut client).await);
        assert_eq!(state.manager.node(&id).unwrap().state, NodeState::Unreachable);
    }
}
