//! # Browser Connection Proxy
//!
//! Presents a stable client-facing WebSocket that is backed, lazily and
//! transparently, by one of several rotating backend browser-automation
//! servers.
//!
//! A client gets no backend connection until its first frame arrives. That
//! frame picks the next backend via round robin and starts the connection;
//! frames sent while the handshake is in flight are queued and flushed in
//! FIFO order once it opens. From then on traffic is forwarded both ways
//! unchanged. Each client keeps its one backend connection for its whole
//! lifetime, so browser-automation sessions stay pinned to one backend.
//!
//! Backend failures (connect error, unexpected handshake response, close)
//! drop the queue and close the client socket with a translated status code;
//! close reasons are capped at the 123-byte close-frame ceiling.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as ClientMessage};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use replay_protocol::truncate_close_reason;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as BackendCloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as BackendMessage};
use tracing::{debug, error, info, warn};

use crate::hub::ConnId;

/// Handshake ceiling for backend connections.
const BACKEND_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Close code sent to clients when the backend side fails.
const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Sender half of a proxy client's outbound socket queue.
pub type ClientFrameTx = mpsc::UnboundedSender<ClientMessage>;

/// Per-client connection record. A client has at most one backend
/// connection over its lifetime; until it opens, frames wait in `queue`.
struct ClientConnection {
    tx: ClientFrameTx,
    backend_tx: Option<mpsc::UnboundedSender<BackendMessage>>,
    is_connecting: bool,
    queue: Vec<BackendMessage>,
}

/// The ordered backend pool plus the round-robin cursor over it.
struct BackendPool {
    servers: Vec<String>,
    cursor: usize,
}

pub struct BrowserProxy {
    clients: DashMap<ConnId, ClientConnection>,
    pool: Mutex<BackendPool>,
}

impl BrowserProxy {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            pool: Mutex::new(BackendPool {
                servers: Vec::new(),
                cursor: 0,
            }),
        }
    }

    // ─── Pool Management ────────────────────────────────────────

    /// Hot-swaps the backend pool (after a backend crash or restart) and
    /// resets the round-robin cursor.
    pub fn set_backend_servers(&self, servers: Vec<String>) {
        let mut pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        pool.servers = servers;
        pool.cursor = 0;
    }

    /// Selects the next backend endpoint, advancing the cursor. N
    /// sequential new clients land on endpoints `i mod M`.
    fn next_backend(&self) -> Option<String> {
        let mut pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        if pool.servers.is_empty() {
            return None;
        }
        let endpoint = pool.servers[pool.cursor].clone();
        pool.cursor = (pool.cursor + 1) % pool.servers.len();
        Some(endpoint)
    }

    pub fn backend_count(&self) -> usize {
        self.pool
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .servers
            .len()
    }

    // ─── Client Lifecycle ───────────────────────────────────────

    /// Registers a new proxy client with no backend connection yet.
    pub fn register_client(&self, conn_id: &str, tx: ClientFrameTx) {
        self.clients.insert(
            conn_id.to_string(),
            ClientConnection {
                tx,
                backend_tx: None,
                is_connecting: false,
                queue: Vec::new(),
            },
        );
        debug!("Browser proxy client connected: {}", conn_id);
    }

    /// Drops the client record and closes its backend connection.
    pub fn handle_client_disconnect(&self, conn_id: &str) {
        if let Some((_, record)) = self.clients.remove(conn_id) {
            if let Some(backend_tx) = record.backend_tx {
                debug!("Closing backend connection after client {} disconnect", conn_id);
                let _ = backend_tx.send(BackendMessage::Close(None));
            }
        }
    }

    // ─── Frame Handling ─────────────────────────────────────────

    /// Routes one client frame toward the backend: forward if connected,
    /// queue if a connection is in flight, otherwise pick a backend and
    /// start connecting with this frame as the first message to deliver.
    pub fn handle_frame(self: &Arc<Self>, conn_id: &str, frame: ClientMessage) {
        let mut frame = match to_backend_frame(frame) {
            Some(frame) => frame,
            None => return,
        };

        let endpoint = {
            let mut record = match self.clients.get_mut(conn_id) {
                Some(record) => record,
                None => {
                    warn!("Frame from unregistered proxy client {}", conn_id);
                    return;
                }
            };

            let mut writer_gone = false;
            if let Some(backend_tx) = record.backend_tx.as_ref() {
                match backend_tx.send(frame) {
                    Ok(()) => return,
                    Err(returned) => {
                        // Backend writer is gone; fall through and let the
                        // close handler race settle the record.
                        frame = returned.0;
                        writer_gone = true;
                    }
                }
            }
            if writer_gone {
                record.backend_tx = None;
            }

            if record.is_connecting {
                record.queue.push(frame);
                return;
            }

            match self.next_backend() {
                Some(endpoint) => {
                    record.is_connecting = true;
                    endpoint
                }
                None => {
                    let _ = record.tx.send(close_message(
                        CLOSE_INTERNAL_ERROR,
                        "Browser server not available",
                    ));
                    return;
                }
            }
        };

        let proxy = Arc::clone(self);
        let conn_id = conn_id.to_string();
        tokio::spawn(async move {
            proxy.connect_backend(conn_id, endpoint, frame).await;
        });
    }

    /// Establishes the one backend connection for a client: handshake,
    /// initial frame, FIFO queue flush, then steady-state mirroring.
    async fn connect_backend(
        self: Arc<Self>,
        conn_id: ConnId,
        endpoint: String,
        initial: BackendMessage,
    ) {
        info!("Connecting client {} to backend {}", conn_id, endpoint);

        let connected =
            match tokio::time::timeout(BACKEND_CONNECT_TIMEOUT, connect_async(&endpoint)).await {
                Ok(Ok((stream, _response))) => stream,
                Ok(Err(WsError::Http(response))) => {
                    error!(
                        "Unexpected handshake response from backend {}: {}",
                        endpoint,
                        response.status()
                    );
                    self.fail_backend_connection(&conn_id, "Browser connection failed");
                    return;
                }
                Ok(Err(err)) => {
                    error!("Backend connection error for {}: {}", endpoint, err);
                    self.fail_backend_connection(&conn_id, "Browser connection error");
                    return;
                }
                Err(_elapsed) => {
                    error!("Backend handshake to {} timed out", endpoint);
                    self.fail_backend_connection(&conn_id, "Browser connection error");
                    return;
                }
            };

        let (mut backend_sink, mut backend_stream) = connected.split();
        let (backend_tx, mut backend_rx) = mpsc::unbounded_channel::<BackendMessage>();

        // Writer task: drains the backend queue onto the socket, stopping
        // after an explicit close frame.
        tokio::spawn(async move {
            while let Some(msg) = backend_rx.recv().await {
                let is_close = matches!(msg, BackendMessage::Close(_));
                if backend_sink.send(msg).await.is_err() {
                    break;
                }
                if is_close {
                    break;
                }
            }
        });

        // Mirror task: backend frames are forwarded to the client
        // unconditionally; a backend close closes the client with the
        // translated code and capped reason.
        {
            let proxy = Arc::clone(&self);
            let conn_id = conn_id.clone();
            tokio::spawn(async move {
                while let Some(item) = backend_stream.next().await {
                    match item {
                        Ok(BackendMessage::Close(frame)) => {
                            proxy.handle_backend_close(&conn_id, frame);
                            return;
                        }
                        Ok(msg) => {
                            if let Some(frame) = to_client_frame(msg) {
                                if !proxy.send_to_client(&conn_id, frame) {
                                    return;
                                }
                            }
                        }
                        Err(err) => {
                            error!("Backend socket error for client {}: {}", conn_id, err);
                            proxy.fail_backend_connection(&conn_id, "Browser connection error");
                            return;
                        }
                    }
                }
                proxy.handle_backend_close(&conn_id, None);
            });
        }

        // Deliver the triggering frame, flush everything queued during the
        // handshake in FIFO order, then hand the writer to the record.
        match self.clients.get_mut(&conn_id) {
            Some(mut record) => {
                record.is_connecting = false;
                let _ = backend_tx.send(initial);
                for queued in record.queue.drain(..) {
                    let _ = backend_tx.send(queued);
                }
                record.backend_tx = Some(backend_tx);
                debug!("Backend connection open for client {}", conn_id);
            }
            None => {
                // Client vanished during the handshake.
                let _ = backend_tx.send(BackendMessage::Close(None));
            }
        }
    }

    // ─── Backend Failure Handling ───────────────────────────────

    /// Resets the client record after a backend-side failure and closes
    /// the client socket with an internal-error status.
    fn fail_backend_connection(&self, conn_id: &str, reason: &str) {
        if let Some(mut record) = self.clients.get_mut(conn_id) {
            record.is_connecting = false;
            record.backend_tx = None;
            record.queue.clear();
            let _ = record.tx.send(close_message(CLOSE_INTERNAL_ERROR, reason));
        }
    }

    /// Relays a backend close to the client, translating the status code
    /// and capping the reason text at the close-frame ceiling.
    fn handle_backend_close(&self, conn_id: &str, frame: Option<BackendCloseFrame>) {
        let (code, reason) = match frame {
            Some(frame) => (u16::from(frame.code), frame.reason.as_str().to_string()),
            None => (CLOSE_INTERNAL_ERROR, "Browser connection closed".to_string()),
        };
        debug!("Backend closed for client {}: {} {}", conn_id, code, reason);

        if let Some(mut record) = self.clients.get_mut(conn_id) {
            record.is_connecting = false;
            record.backend_tx = None;
            record.queue.clear();
            let _ = record.tx.send(close_message(code, &reason));
        }
    }

    fn send_to_client(&self, conn_id: &str, frame: ClientMessage) -> bool {
        match self.clients.get(conn_id) {
            Some(record) => record.tx.send(frame).is_ok(),
            None => false,
        }
    }
}

impl Default for BrowserProxy {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Frame Conversion ────────────────────────────────────────────

/// Client data frames become backend frames; control frames are handled by
/// the socket layers themselves and are not forwarded.
fn to_backend_frame(frame: ClientMessage) -> Option<BackendMessage> {
    match frame {
        ClientMessage::Text(text) => Some(BackendMessage::text(text.as_str())),
        ClientMessage::Binary(data) => Some(BackendMessage::binary(data)),
        _ => None,
    }
}

fn to_client_frame(frame: BackendMessage) -> Option<ClientMessage> {
    match frame {
        BackendMessage::Text(text) => Some(ClientMessage::Text(text.as_str().into())),
        BackendMessage::Binary(data) => Some(ClientMessage::Binary(data)),
        _ => None,
    }
}

fn close_message(code: u16, reason: &str) -> ClientMessage {
    ClientMessage::Close(Some(CloseFrame {
        code,
        reason: truncate_close_reason(reason).into(),
    }))
}
