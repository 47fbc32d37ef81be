//! Event ingestion and the observer WebSocket.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};

use flowgate_supervisor::{Ingest, Observer};
use flowgate_types::Event;

use crate::AppState;

/// `POST /stream/event`. Unknown categories are acknowledged, not rejected.
pub async fn ingest_event(State(state): State<AppState>, Json(event): Json<Event>) -> Json<Value> {
    match state.supervisor.bus().ingest(event) {
        Ingest::Accepted => Json(json!({"ok": true})),
        Ingest::Ignored => Json(json!({"ignored": true})),
    }
}

/// `GET /ws/stream`.
pub async fn ws_stream(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let observer = state.supervisor.bus().subscribe();
    ws.on_upgrade(move |socket| forward_events(socket, observer))
}

async fn forward_events(socket: WebSocket, mut observer: Observer) {
    tracing::info!("Observer connected");
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = observer.next() => {
                let Some(event) = event else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to encode event");
                        continue;
                    }
                };
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = sender.close().await;
    tracing::info!("Observer disconnected");
}
