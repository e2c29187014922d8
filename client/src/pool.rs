//! # Connection Pool
//!
//! Endpoint-keyed reuse of backend connections and replay sockets, with
//! at-most-one-connection-attempt-in-flight semantics.
//!
//! Concurrent callers asking for the same backend endpoint coalesce onto a
//! single shared connect future: the first caller starts it, everyone
//! awaits the same result. The shared future is evicted on completion
//! (success or failure) and on backend-reported disconnect, so a dead
//! endpoint can always be retried.
//!
//! Replay sockets are reused while connecting or open and recreated only
//! once closed or closing; see the socket module for the state machine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt, Shared};
use replay_protocol::ReplayMessage;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::backend::{BackendConnection, BackendConnector};
use crate::error::ClientError;
use crate::socket::{ReplaySocket, SocketState, SOCKET_CLOSE_TIMEOUT};

/// Cloneable error carried inside the shared connect future.
#[derive(Debug, Clone)]
struct PoolError(String);

type ConnectFuture = Shared<BoxFuture<'static, Result<Arc<dyn BackendConnection>, PoolError>>>;

pub struct ConnectionPool {
    connector: Arc<dyn BackendConnector>,
    /// endpoint → live backend connection.
    backends: Mutex<HashMap<String, Arc<dyn BackendConnection>>>,
    /// endpoint → in-flight connect attempt shared by all callers.
    connect_locks: Mutex<HashMap<String, ConnectFuture>>,
    /// endpoint → replay socket.
    replay_sockets: Mutex<HashMap<String, Arc<ReplaySocket>>>,
    /// Streaming control and input commands from every replay socket are
    /// funneled into this channel (the replay manager consumes it).
    control_tx: Mutex<Option<mpsc::UnboundedSender<ReplayMessage>>>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn BackendConnector>) -> Self {
        Self {
            connector,
            backends: Mutex::new(HashMap::new()),
            connect_locks: Mutex::new(HashMap::new()),
            replay_sockets: Mutex::new(HashMap::new()),
            control_tx: Mutex::new(None),
        }
    }

    /// Sets the channel that receives inbound messages from replay
    /// sockets. Applies to sockets created after this call.
    pub fn set_control_sender(&self, tx: mpsc::UnboundedSender<ReplayMessage>) {
        *self.control_tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
    }

    // ─── Backend Connections ────────────────────────────────────

    /// Returns the cached connection for `endpoint` if it is still live;
    /// otherwise joins (or starts) the single connect attempt for it.
    pub async fn get_backend_connection(
        self: &Arc<Self>,
        endpoint: &str,
    ) -> Result<Arc<dyn BackendConnection>, ClientError> {
        {
            let backends = self.backends.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(conn) = backends.get(endpoint) {
                if conn.is_connected() {
                    debug!("Reusing existing backend connection to {}", endpoint);
                    return Ok(Arc::clone(conn));
                }
            }
        }

        let attempt = {
            let mut locks = self.connect_locks.lock().unwrap_or_else(|e| e.into_inner());
            match locks.get(endpoint) {
                Some(attempt) => attempt.clone(),
                None => {
                    let attempt = self.start_connect_attempt(endpoint);
                    locks.insert(endpoint.to_string(), attempt.clone());
                    attempt
                }
            }
        };

        attempt.await.map_err(|err| ClientError::Connect(err.0))
    }

    /// Builds the shared connect future for one endpoint. It stores the
    /// connection and spawns the disconnect monitor on success, and always
    /// evicts its own lock entry when it completes.
    fn start_connect_attempt(self: &Arc<Self>, endpoint: &str) -> ConnectFuture {
        let pool = Arc::clone(self);
        let endpoint = endpoint.to_string();
        async move {
            debug!("Connecting to backend server: {}", endpoint);
            let result = pool.connector.connect(&endpoint).await;
            pool.connect_locks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&endpoint);
            match result {
                Ok(conn) => {
                    pool.backends
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(endpoint.clone(), Arc::clone(&conn));
                    pool.spawn_disconnect_monitor(&endpoint, Arc::clone(&conn));
                    Ok(conn)
                }
                Err(err) => Err(PoolError(err.to_string())),
            }
        }
        .boxed()
        .shared()
    }

    /// Evicts the connection (and any stale lock) once the backend
    /// reports the connection gone.
    fn spawn_disconnect_monitor(self: &Arc<Self>, endpoint: &str, conn: Arc<dyn BackendConnection>) {
        let pool = Arc::clone(self);
        let endpoint = endpoint.to_string();
        tokio::spawn(async move {
            conn.wait_disconnected().await;
            debug!("Backend disconnected: {}", endpoint);
            pool.backends
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&endpoint);
            pool.connect_locks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&endpoint);
        });
    }

    // ─── Replay Sockets ─────────────────────────────────────────

    /// Returns the socket for `endpoint`, reusing it while it is open or
    /// still connecting; a closed or closing socket is replaced.
    pub fn get_replay_socket(self: &Arc<Self>, endpoint: &str) -> Arc<ReplaySocket> {
        let mut sockets = self.replay_sockets.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(socket) = sockets.get(endpoint) {
            match socket.state() {
                SocketState::Connecting | SocketState::Open => {
                    debug!("Reusing existing replay socket: {}", endpoint);
                    return Arc::clone(socket);
                }
                _ => {}
            }
        }

        info!("Creating new replay socket: {}", endpoint);
        let control_tx = self
            .control_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_else(|| mpsc::unbounded_channel().0);
        let socket = ReplaySocket::connect(endpoint, control_tx);
        sockets.insert(endpoint.to_string(), Arc::clone(&socket));

        // Evict the entry once the socket reaches a terminal state, so
        // the next caller gets a fresh connection.
        {
            let pool = Arc::clone(self);
            let endpoint = endpoint.to_string();
            let mut state_rx = socket.subscribe_state();
            let tracked = Arc::clone(&socket);
            tokio::spawn(async move {
                loop {
                    if state_rx.borrow_and_update().is_terminal() {
                        break;
                    }
                    if state_rx.changed().await.is_err() {
                        break;
                    }
                }
                let mut sockets = pool.replay_sockets.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(current) = sockets.get(&endpoint) {
                    if Arc::ptr_eq(current, &tracked) {
                        sockets.remove(&endpoint);
                    }
                }
            });
        }

        socket
    }

    /// Sends after waiting for the socket to leave the connecting state.
    /// Failures are non-fatal to callers by contract.
    pub async fn safe_send(&self, socket: &ReplaySocket, msg: ReplayMessage) -> Result<(), ClientError> {
        socket.safe_send(msg).await
    }

    /// Removes the socket for `endpoint` from tracking and runs its
    /// bounded close handshake. The socket is gone from the pool whatever
    /// the handshake's outcome.
    pub async fn close_replay_socket(&self, endpoint: &str) {
        let socket = self
            .replay_sockets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(endpoint);
        if let Some(socket) = socket {
            socket.close(SOCKET_CLOSE_TIMEOUT).await;
        }
    }
}
