//! WebSocket subscription channel.
//!
//! A session opens `/ws`, then sends subscribe/unsubscribe messages for
//! shipment topics. The server forwards the typed event union; when a
//! session falls behind its broadcast buffer, the dropped count surfaces
//! as a `lagged` event so the client refetches the snapshot.

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::handlers::ApiState;
use crate::types::{EntityId, ShipmentEvent};

/// Client-to-server control messages.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
enum ClientMessage {
    Subscribe { shipment_id: EntityId },
    Unsubscribe { shipment_id: EntityId },
}

/// Server acknowledgments (events themselves are `ShipmentEvent`).
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
enum ControlMessage {
    Connected { message: String },
    Subscribed { shipment_id: EntityId },
    Unsubscribed { shipment_id: EntityId },
    Error { message: String },
}

/// GET /ws
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session(socket, state))
}

async fn handle_session(socket: WebSocket, state: ApiState) {
    let (mut sink, mut stream) = socket.split();

    // Per-session outbound funnel. Forwarding tasks push here; if the
    // session cannot drain fast enough the broadcast receivers lag, which
    // is exactly the bounded-buffer semantics the contract promises.
    let (out_tx, mut out_rx) = mpsc::channel::<String>(64);

    if let Ok(text) = serde_json::to_string(&ControlMessage::Connected {
        message: "Send {\"type\":\"subscribe\",\"shipment_id\":N} to begin.".to_string(),
    }) {
        if sink.send(Message::Text(text)).await.is_err() {
            return;
        }
    }

    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // One forwarding task per subscribed shipment topic.
    let mut subscriptions: HashMap<EntityId, JoinHandle<()>> = HashMap::new();

    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Subscribe { shipment_id }) => {
                if subscriptions.contains_key(&shipment_id) {
                    continue;
                }
                let mut receiver = state.hub.subscribe(shipment_id);
                let forward_tx = out_tx.clone();
                let task = tokio::spawn(async move {
                    loop {
                        match receiver.recv().await {
                            Ok(event) => {
                                if forward(&forward_tx, &event).await.is_err() {
                                    break;
                                }
                            }
                            Err(RecvError::Lagged(n)) => {
                                debug!(shipment_id, dropped = n, "Subscriber lagged");
                                let marker = ShipmentEvent::Lagged {
                                    shipment_id,
                                    dropped: n,
                                };
                                if forward(&forward_tx, &marker).await.is_err() {
                                    break;
                                }
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }
                });
                subscriptions.insert(shipment_id, task);
                send_control(&out_tx, &ControlMessage::Subscribed { shipment_id }).await;
                info!(shipment_id, "Session subscribed");
            }
            Ok(ClientMessage::Unsubscribe { shipment_id }) => {
                if let Some(task) = subscriptions.remove(&shipment_id) {
                    task.abort();
                    state.hub.reap_idle_topics();
                    send_control(&out_tx, &ControlMessage::Unsubscribed { shipment_id }).await;
                }
            }
            Err(e) => {
                send_control(
                    &out_tx,
                    &ControlMessage::Error {
                        message: format!("unrecognized message: {e}"),
                    },
                )
                .await;
            }
        }
    }

    // Disconnect: tear down every topic subscription and reclaim topics.
    for (_, task) in subscriptions.drain() {
        task.abort();
    }
    writer.abort();
    state.hub.reap_idle_topics();
    debug!("Session closed");
}

async fn forward(
    tx: &mpsc::Sender<String>,
    event: &ShipmentEvent,
) -> Result<(), mpsc::error::SendError<String>> {
    match serde_json::to_string(event) {
        Ok(text) => tx.send(text).await,
        Err(_) => Ok(()),
    }
}

async fn send_control(tx: &mpsc::Sender<String>, message: &ControlMessage) {
    if let Ok(text) = serde_json::to_string(message) {
        let _ = tx.send(text).await;
    }
}
