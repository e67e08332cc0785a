use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::AppState;

/// Upgrades `/api/v1/stream/{id}/stream` (spec §4.6). Origin checking
/// happens in the CORS middleware layered ahead of this route; axum's
/// upgrade itself only validates the WebSocket handshake headers.
pub async fn upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
) -> Response {
    let max_frame_bytes = state.settings.websocket.max_frame_bytes;
    ws.max_frame_size(max_frame_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state, stream_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, stream_id: String) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(64);

    let conn_id = state.ws_fanout.register(&stream_id, tx).await;
    let write_timeout = state.ws_fanout.write_timeout();

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if tokio::time::timeout(write_timeout, ws_tx.send(msg))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    // Clients never send metrics on this socket — only pings/close frames
    // matter; any error or close ends the read loop (spec §4.6).
    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(_) => break,
        }
    }

    state.ws_fanout.unregister(&stream_id, conn_id).await;
    writer.abort();
}
