use axum::{
    extract::{
        State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, error};
use wsrelay::{CloseDetails, Relay};

use crate::AppState;

/// WebSocket upgrade handler
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.relay))
}

/// Drive one peer: socket frames go into the connection, the connection's
/// outbound queue goes to the socket.
async fn handle_socket(socket: WebSocket, relay: Arc<Relay>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (mut conn, mut outbound) = relay.accept();

    if let Err(e) = conn.open().await {
        error!("Failed to open connection {}: {}", conn.id(), e);
        conn.handle_error(&e);
        if let Err(e) = conn.close(CloseDetails::default()).await {
            error!("Failed to close connection {}: {}", conn.id(), e);
        }
        return;
    }

    let mut details = CloseDetails::default();

    loop {
        tokio::select! {
            // Frames queued for this peer by the relay
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = ws_tx.send(Message::Text(frame.text.to_string().into())).await {
                    debug!("Failed to send to {}: {}", conn.id(), e);
                    break;
                }
            }

            // Messages from the client
            msg = ws_rx.next() => {
                let Some(msg) = msg else {
                    debug!("Socket for {} ended without a close frame", conn.id());
                    break;
                };
                match msg {
                    Ok(Message::Text(text)) => {
                        if let Err(e) = conn.handle_message(text.as_str()).await {
                            conn.handle_error(&e);
                        }
                    }
                    Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                        Ok(text) => {
                            if let Err(e) = conn.handle_message(text).await {
                                conn.handle_error(&e);
                            }
                        }
                        Err(_) => debug!("Dropping non-UTF-8 binary frame from {}", conn.id()),
                    },
                    Ok(Message::Ping(data)) => {
                        if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                            error!("Failed to send pong: {}", e);
                            break;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        if let Some(CloseFrame { code, reason }) = frame {
                            details = CloseDetails {
                                code: Some(code),
                                reason: Some(reason.as_str().to_string()).filter(|r| !r.is_empty()),
                            };
                        }
                        debug!("Client {} requested close", conn.id());
                        break;
                    }
                    Ok(Message::Pong(_)) => {}
                    Err(e) => {
                        conn.handle_error(&e);
                        break;
                    }
                }
            }
        }
    }

    if let Err(e) = conn.close(details).await {
        error!("Failed to clean up after {}: {}", conn.id(), e);
    }
}
