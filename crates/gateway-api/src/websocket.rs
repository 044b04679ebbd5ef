//! WebSocket push of alarm system changes
//!
//! Clients receive messages of the shape
//! `{"t":"event","e":"changed","r":"alarmsystems","id":"1","state":{...}}`
//! grouping all same-prefix items that still carry a push flag. The push
//! clears the flags; `state/armstate` renders as its panel status string.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use std::sync::Arc;

use alarm_system::{panel_status_to_string, AlarmSystems};
use gateway_core::resource::RSTATE_ARM_STATE;

use crate::ApiState;

/// Builds the pending `changed` messages for all alarm systems and clears
/// the push flags. Called from the tick task after each advance.
pub fn collect_alarm_messages(alarms: &mut AlarmSystems) -> Vec<String> {
    let mut messages = Vec::new();

    for system in &mut alarms.systems {
        let id = system.id_string().to_string();
        let panel = panel_status_to_string(system.ias_ace_panel_status()).to_string();

        for group in ["state", "config", "attr"] {
            let mut map = Map::new();
            let mut pending = false;

            for item in system.resource_mut().items_mut() {
                let suffix = item.suffix();
                let Some(short) = suffix.strip_prefix(group).and_then(|s| s.strip_prefix('/'))
                else {
                    continue;
                };

                if !item.is_public() {
                    continue;
                }

                if item.need_push_set() || item.need_push_change() {
                    pending = true;
                }

                if suffix == RSTATE_ARM_STATE {
                    map.insert(short.replace('/', "_"), Value::String(panel.clone()));
                } else {
                    map.insert(short.replace('/', "_"), item.to_variant());
                }
            }

            if !pending {
                continue;
            }

            // pushed now; clear the flags so the next change pushes again
            for item in system.resource_mut().items_mut() {
                if item.suffix().starts_with(group) {
                    item.clear_need_push();
                }
            }

            let message = json!({
                "t": "event",
                "e": "changed",
                "r": "alarmsystems",
                "id": id,
                group: Value::Object(map),
            });

            if let Ok(text) = serde_json::to_string(&message) {
                messages.push(text);
            }
        }
    }

    messages
}

/// GET /ws: upgrade and stream alarm system changes.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ApiState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<ApiState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.ws_tx.subscribe();

    let send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(text) => {
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("websocket client lagged by {n} messages");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // drain the client side; we don't accept commands over the socket
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    send_task.abort();
}
