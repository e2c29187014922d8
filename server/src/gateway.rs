//! # Connection Gateway
//!
//! The single accept point for WebSocket traffic. Exactly two paths are
//! routed (anything else is rejected before the upgrade):
//! - the **proxy path**: authorized browser-automation traffic, handed to
//!   the Browser Connection Proxy
//! - the **replay path**: producers and viewers of the replay hub
//!
//! The proxy path requires a bearer token or basic credentials; the replay
//! path is intentionally unauthenticated so viewers can connect without
//! friction. That asymmetry is a product decision, not an oversight.
//!
//! Each accepted socket gets the same lifecycle: split into sink and
//! stream, an outbound task draining a per-connection queue, an inbound
//! loop dispatching frames, and cleanup on disconnect.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use replay_protocol::ReplayMessage;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::state::AppState;

// ─── Upgrade Endpoints ──────────────────────────────────────────

/// Upgrade handler for the browser-proxy path. Authorization is checked
/// against the request headers before the upgrade completes.
pub async fn proxy_ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    if !state.auth.is_request_authorized(&headers) {
        warn!("Rejected unauthorized proxy connection");
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| handle_proxy_connection(socket, state))
        .into_response()
}

/// Upgrade handler for the replay path. No authorization.
pub async fn replay_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_replay_connection(socket, state))
        .into_response()
}

// ─── Proxy Connection Lifecycle ─────────────────────────────────

async fn handle_proxy_connection(socket: WebSocket, state: AppState) {
    let conn_id = Uuid::new_v4().to_string();
    info!("Proxy connection accepted: {}", conn_id);

    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    state.proxy.register_client(&conn_id, tx);

    // Outbound task: drains queued frames onto the socket. A close frame
    // is the last thing it will ever send.
    let outbound = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let is_close = matches!(msg, Message::Close(_));
            if ws_sink.send(msg).await.is_err() {
                break;
            }
            if is_close {
                break;
            }
        }
    });

    // Inbound loop: every data frame goes to the proxy, which forwards,
    // queues, or starts the backend connection as needed.
    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Close(_) => break,
            msg @ (Message::Text(_) | Message::Binary(_)) => {
                state.proxy.handle_frame(&conn_id, msg);
            }
            _ => {}
        }
    }

    debug!("Proxy connection closing: {}", conn_id);
    state.proxy.handle_client_disconnect(&conn_id);
    outbound.abort();
}

// ─── Replay Connection Lifecycle ────────────────────────────────

async fn handle_replay_connection(socket: WebSocket, state: AppState) {
    let conn_id = Uuid::new_v4().to_string();
    info!("Replay connection accepted: {}", conn_id);

    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ReplayMessage>();

    // Registers the socket with the hub (viewer role by default) and
    // immediately pushes the current session and page lists.
    state.hub.register_client(&conn_id, tx);

    let outbound = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(err) => {
                    error!("Serialize error: {}", err);
                    continue;
                }
            };
            if ws_sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Inbound loop: only valid JSON frames matching the protocol reach the
    // hub; everything else is dropped with a warning and never crashes it.
    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Text(text) => match ReplayMessage::parse(text.as_str()) {
                Ok(parsed) => state.hub.handle_message(&conn_id, parsed),
                Err(err) => {
                    warn!("Dropping invalid replay frame from {}: {}", conn_id, err);
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    info!("Replay connection closing: {}", conn_id);
    state.hub.handle_disconnect(&conn_id);
    outbound.abort();
}
