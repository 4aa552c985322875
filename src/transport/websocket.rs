//! WebSocket Transport for cai-mcp
//!
//! One JSON-RPC message per text frame, answered on the same socket.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tracing::{debug, error, info};

use super::http::{validate_origin, AppState};
use crate::metrics;

/// Handle WebSocket upgrade at /ws endpoint
pub async fn handle_websocket(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Response, StatusCode> {
    validate_origin(&headers)?;
    metrics::record_websocket_connection("requested");

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state)))
}

/// Handle an established WebSocket connection
async fn handle_socket(socket: WebSocket, state: AppState) {
    metrics::record_websocket_connection("established");

    let (mut sender, mut receiver) = socket.split();
    let session_id = uuid::Uuid::new_v4().to_string();
    let tag = &session_id[..8];

    info!("[ws_{}] New WebSocket session", tag);

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                debug!("[ws_{}] Received message: {} bytes", tag, text.len());

                let Some(response) = state.router.handle_message(text.as_bytes()).await else {
                    continue;
                };

                let reply = match serde_json::to_string(&response) {
                    Ok(reply) => reply,
                    Err(e) => {
                        error!("[ws_{}] Failed to encode response: {}", tag, e);
                        continue;
                    }
                };

                if let Err(e) = sender.send(Message::Text(reply)).await {
                    error!("[ws_{}] Failed to send response: {}", tag, e);
                    break;
                }
            }
            Ok(Message::Close(_)) => {
                info!("[ws_{}] Client closed connection", tag);
                break;
            }
            Ok(Message::Ping(data)) => {
                let _ = sender.send(Message::Pong(data)).await;
            }
            Ok(_) => {
                // Binary and pong frames carry nothing for us
            }
            Err(e) => {
                error!("[ws_{}] WebSocket error: {}", tag, e);
                break;
            }
        }
    }

    info!("[ws_{}] WebSocket connection closed", tag);
    metrics::record_websocket_connection("closed");
}
