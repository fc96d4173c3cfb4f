//! Session event stream at `/ws/events`

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::server::{ServerContext, SessionEvent};

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(ctx): State<Arc<ServerContext>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, ctx))
}

/// Forward every published [`SessionEvent`] as one JSON text message.
async fn handle_socket(socket: WebSocket, ctx: Arc<ServerContext>) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = ctx.events.subscribe();
    tracing::debug!("Event stream client connected");

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        let Some(text) = encode(&event) else { continue };
                        if sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Event stream client lagged, skipped {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sender.send(Message::Pong(data)).await;
                    }
                    Some(Err(e)) => {
                        tracing::debug!("Event stream receive error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    tracing::debug!("Event stream client disconnected");
}

fn encode(event: &SessionEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::warn!("Failed to encode session event: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_joined_event_json() {
        let text = encode(&SessionEvent::Joined {
            client_id: 7,
            display_name: "ada".into(),
            video: true,
            audio: false,
        })
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "joined");
        assert_eq!(value["display_name"], "ada");
    }
}
