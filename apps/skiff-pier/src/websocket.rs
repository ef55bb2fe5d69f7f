use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use serde::Deserialize;
use skiff_protocol::ClientFrame;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::handlers::AppState;
use crate::room::{Outbound, RoomCommand};

/// Distinguishes the sockets of one cid across reconnects, so the
/// room can tell a replaced socket's traffic from its successor's.
static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    cid: Option<String>,
}

pub async fn websocket_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    Path(room_id): Path<String>,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(WebSocketUpgradeRejection::MethodNotGet(_)) => {
            return StatusCode::BAD_REQUEST.into_response()
        }
        // Plain GETs without the upgrade handshake get told to upgrade.
        Err(_) => return StatusCode::UPGRADE_REQUIRED.into_response(),
    };
    let cid = query
        .cid
        .filter(|cid| !cid.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    ws.on_upgrade(move |socket| handle_socket(socket, room_id, cid, state))
}

async fn handle_socket(socket: WebSocket, room_id: String, cid: String, state: AppState) {
    let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();

    // Writer task: serialises room traffic onto the socket. A `Close`
    // ends it; so does the room dropping the sender on removal.
    tokio::spawn(async move {
        while let Some(outbound) = out_rx.recv().await {
            match outbound {
                Outbound::Frame(frame) => {
                    let Ok(json) = serde_json::to_string(&frame) else {
                        continue;
                    };
                    if ws_tx.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let Some(room) = state.registry.connect(&room_id, cid.clone(), conn_id, out_tx).await else {
        warn!(room = %room_id, %cid, "could not register socket with room");
        return;
    };
    counter!("skiff_pier_ws_connections_total").increment(1);
    debug!(room = %room_id, %cid, conn_id, "websocket connected");

    while let Some(message) = ws_rx.next().await {
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                debug!(room = %room_id, %cid, "websocket error: {err}");
                break;
            }
        };
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(frame) => {
                    if !room.send(RoomCommand::Frame {
                        cid: cid.clone(),
                        conn_id,
                        frame,
                    }) {
                        break;
                    }
                }
                Err(err) => {
                    counter!("skiff_pier_frames_dropped_total").increment(1);
                    debug!(room = %room_id, %cid, "unparseable frame: {err}");
                }
            },
            Message::Close(_) => break,
            // Binary signalling is not part of the protocol; pings and
            // pongs are handled by the transport.
            _ => {}
        }
    }

    let _ = room.send(RoomCommand::Disconnect { cid: cid.clone(), conn_id });
    debug!(room = %room_id, %cid, conn_id, "websocket disconnected");
}
