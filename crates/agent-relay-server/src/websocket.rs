//! Bridges WebSocket connections onto the relay core.

use std::sync::Arc;

use agent_relay_core::Relay;
use agent_relay_proto::codec;
use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message as WsMessage, WebSocket},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

/// WebSocket upgrade handler for `/ws`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(relay): State<Arc<Relay>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, relay))
}

/// Pump one socket: frames → codec → relay, relay → codec → frames.
///
/// The relay decides when the connection is over; the pump tasks are torn
/// down when `run_connection` returns.
async fn handle_socket(socket: WebSocket, relay: Arc<Relay>) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let text = match codec::encode(&msg) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!("failed to encode message: {e}");
                    continue;
                }
            };
            if sender.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.send(WsMessage::Close(None)).await;
    });

    let recv_task = tokio::spawn(async move {
        while let Some(frame) = receiver.next().await {
            let text = match frame {
                Ok(WsMessage::Text(text)) => text,
                Ok(WsMessage::Binary(data)) => match String::from_utf8(data.to_vec()) {
                    Ok(s) => s.into(),
                    Err(_) => continue,
                },
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!("websocket error: {e}");
                    break;
                }
            };
            if inbound_tx.send(codec::decode(text.as_str())).is_err() {
                break;
            }
        }
    });

    relay.run_connection(outbound_tx, inbound_rx).await;

    send_task.abort();
    recv_task.abort();
}
