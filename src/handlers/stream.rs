//! Lifecycle stream handler
//!
//! WebSocket endpoint delivering every threat/action status transition as
//! it happens. Subscribers start at the live edge: there is no replay of
//! history, and a subscriber that falls behind receives an explicit `gap`
//! frame instead of stalling the pipeline.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;

use crate::stream::LifecycleUpdate;
use crate::AppState;

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamFrame {
    Update(LifecycleUpdate),
    /// Delivery gap: this subscriber was too slow and `skipped` updates
    /// were dropped for it.
    Gap {
        skipped: u64,
    },
}

pub async fn subscribe(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| stream_updates(socket, state))
}

async fn stream_updates(mut socket: WebSocket, state: AppState) {
    let mut rx = state.broadcaster.subscribe();
    tracing::debug!(
        subscribers = state.broadcaster.subscriber_count(),
        "stream subscriber connected"
    );

    loop {
        tokio::select! {
            update = rx.recv() => {
                let frame = match update {
                    Ok(update) => StreamFrame::Update(update),
                    Err(RecvError::Lagged(skipped)) => StreamFrame::Gap { skipped },
                    Err(RecvError::Closed) => break,
                };
                let Ok(text) = serde_json::to_string(&frame) else { break };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Pings are answered by the protocol layer; anything
                    // else a client sends is ignored.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    tracing::debug!("stream subscriber disconnected");
}
