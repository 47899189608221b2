//! Signaling WebSocket
//!
//! One connection is one peer. Text frames carry JSON requests; every request
//! gets exactly one response frame, and notifications for the peer are
//! interleaved on the same socket. Requests of one connection are handled in
//! order.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use confer_sfu::{ClientMessage, Notification, PeerId, ServerMessage, SfuError};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::http::{AppError, AppState};

/// Responses waiting to be written to one socket
const RESPONSE_QUEUE_CAPACITY: usize = 64;

/// Upgrade to a signaling connection
pub async fn websocket_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, AppError> {
    if !state.protocol.is_accepting() {
        return Err(AppError::service_unavailable("media engine is down"));
    }

    let max_message_size = state.max_message_size;
    Ok(ws
        .max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state)))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let peer_id = PeerId::random();
    let (mut ws_sender_sink, mut ws_receiver) = socket.split();

    let (session, mut notifications) = match state.protocol.connect(peer_id.clone()) {
        Ok(connected) => connected,
        Err(e) => {
            warn!(peer_id = %peer_id, error = %e, "Rejecting signaling connection");
            if let Some(text) = encode(&ServerMessage::response(None, &Err(e))) {
                let _ = ws_sender_sink.send(Message::Text(text.into())).await;
            }
            let _ = ws_sender_sink.send(Message::Close(None)).await;
            return;
        }
    };
    info!(peer_id = %peer_id, "Signaling connection established");

    let (response_tx, mut response_rx) = mpsc::channel::<ServerMessage>(RESPONSE_QUEUE_CAPACITY);

    // Spawn task to write responses and notifications -> WebSocket
    let welcome = ServerMessage::from(Notification::Welcome {
        peer_id: peer_id.clone(),
    });
    let writer_peer = peer_id.clone();
    let writer = tokio::spawn(async move {
        let mut next = Some(welcome);
        loop {
            let message = match next.take() {
                Some(message) => message,
                None => tokio::select! {
                    Some(response) = response_rx.recv() => response,
                    Some(notification) = notifications.recv() => ServerMessage::from(notification),
                    else => break,
                },
            };
            let Some(text) = encode(&message) else {
                continue;
            };
            if let Err(e) = ws_sender_sink.send(Message::Text(text.into())).await {
                debug!(peer_id = %writer_peer, error = %e, "Failed to send WebSocket message");
                break;
            }
        }
    });

    while let Some(frame) = ws_receiver.next().await {
        let response = match frame {
            Ok(Message::Text(text)) => {
                let (id, result) = match ClientMessage::parse(text.as_str()) {
                    Ok(message) => (
                        message.id,
                        state.protocol.handle(&peer_id, message.request).await,
                    ),
                    Err(e) => (salvage_id(text.as_str()), Err(e)),
                };
                ServerMessage::response(id, &result)
            }
            Ok(Message::Binary(_)) => ServerMessage::response(
                None,
                &Err(SfuError::InvalidRequest(
                    "binary frames are not supported".to_string(),
                )),
            ),
            Ok(Message::Close(_)) => break,
            // ping/pong are answered by axum
            Ok(_) => continue,
            Err(e) => {
                debug!(peer_id = %peer_id, error = %e, "WebSocket receive error");
                break;
            }
        };
        if response_tx.send(response).await.is_err() {
            break;
        }
    }

    drop(session);
    state.protocol.disconnect(&peer_id).await;
    writer.abort();

    info!(peer_id = %peer_id, "Signaling connection closed");
}

fn encode(message: &ServerMessage) -> Option<String> {
    match serde_json::to_string(message) {
        Ok(text) => Some(text),
        Err(e) => {
            error!(error = %e, "Failed to encode server message");
            None
        }
    }
}

/// Best-effort correlation id of a frame that failed to parse
fn salvage_id(text: &str) -> Option<u64> {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()?
        .get("id")?
        .as_u64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_salvage_id() {
        assert_eq!(salvage_id(r#"{"id": 9, "method": "dance"}"#), Some(9));
        assert_eq!(salvage_id(r#"{"method": "dance"}"#), None);
        assert_eq!(salvage_id("not json"), None);
    }
}
