//! # Replay Socket
//!
//! The client's WebSocket connection to a replay hub, modeled as an
//! explicit per-connection state machine:
//!
//! ```text
//! Connecting ──→ Open ──→ Closing ──→ Closed
//!      │                                ▲
//!      └──────────→ Failed              │ (socket error / hub close)
//! ```
//!
//! The state lives in a `watch` channel, so `safe_send` can wait out the
//! connecting phase, `close` can run its bounded handshake, and tests can
//! drive transitions without a live socket. The I/O task (connect, split,
//! outbound drain, inbound parse-and-dispatch) drives the same named
//! transitions.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use replay_protocol::ReplayMessage;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Ceiling for the close handshake: `close` resolves on the terminal
/// transition or after this long, whichever comes first.
pub const SOCKET_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Connecting,
    Open,
    Closing,
    Closed,
    /// The connection attempt itself failed; terminal like `Closed`.
    Failed,
}

impl SocketState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SocketState::Closed | SocketState::Failed)
    }
}

pub struct ReplaySocket {
    endpoint: String,
    out_tx: mpsc::UnboundedSender<ReplayMessage>,
    state_tx: watch::Sender<SocketState>,
}

impl ReplaySocket {
    /// Opens a socket to the replay hub. Inbound protocol frames are
    /// handed to `control_tx` (streaming control and input commands for
    /// the replay manager).
    pub fn connect(
        endpoint: &str,
        control_tx: mpsc::UnboundedSender<ReplayMessage>,
    ) -> Arc<ReplaySocket> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(SocketState::Connecting);
        let socket = Arc::new(ReplaySocket {
            endpoint: endpoint.to_string(),
            out_tx,
            state_tx,
        });
        tokio::spawn(run_io(Arc::clone(&socket), out_rx, control_tx));
        socket
    }

    /// A socket with no I/O task, for driving transitions by hand in
    /// tests. Returns the receiver end of the outbound queue.
    #[cfg(test)]
    pub(crate) fn detached(endpoint: &str) -> (Arc<ReplaySocket>, mpsc::UnboundedReceiver<ReplayMessage>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(SocketState::Connecting);
        (
            Arc::new(ReplaySocket {
                endpoint: endpoint.to_string(),
                out_tx,
                state_tx,
            }),
            out_rx,
        )
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> SocketState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SocketState> {
        self.state_tx.subscribe()
    }

    // ─── Named Transitions ──────────────────────────────────────

    pub(crate) fn mark_open(&self) {
        self.state_tx.send_if_modified(|state| {
            if *state == SocketState::Connecting {
                *state = SocketState::Open;
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn mark_closing(&self) {
        self.state_tx.send_if_modified(|state| {
            if matches!(state, SocketState::Connecting | SocketState::Open) {
                *state = SocketState::Closing;
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn mark_closed(&self) {
        self.state_tx.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = SocketState::Closed;
                true
            }
        });
    }

    pub(crate) fn mark_failed(&self) {
        self.state_tx.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = SocketState::Failed;
                true
            }
        });
    }

    // ─── Sending ────────────────────────────────────────────────

    /// Queues a message once the socket is open. Waits out the connecting
    /// phase; fails if the socket is closing, closed, or never opened.
    /// Callers treat failures here as non-fatal to their own operation.
    pub async fn safe_send(&self, msg: ReplayMessage) -> Result<(), crate::error::ClientError> {
        let mut state_rx = self.state_tx.subscribe();
        loop {
            let state = *state_rx.borrow_and_update();
            match state {
                SocketState::Open => {
                    return self
                        .out_tx
                        .send(msg)
                        .map_err(|_| crate::error::ClientError::SocketClosed);
                }
                SocketState::Connecting => {
                    if state_rx.changed().await.is_err() {
                        return Err(crate::error::ClientError::SocketClosed);
                    }
                }
                SocketState::Closing | SocketState::Closed | SocketState::Failed => {
                    return Err(crate::error::ClientError::SocketClosed);
                }
            }
        }
    }

    // ─── Close Handshake ────────────────────────────────────────

    /// Initiates the close handshake and waits for the terminal state,
    /// bounded by `timeout`. Always returns; a socket that never answers
    /// is abandoned to its I/O task.
    pub async fn close(&self, timeout: Duration) {
        if self.state().is_terminal() {
            return;
        }
        self.mark_closing();

        let mut state_rx = self.state_tx.subscribe();
        let wait_terminal = async {
            loop {
                if state_rx.borrow_and_update().is_terminal() {
                    break;
                }
                if state_rx.changed().await.is_err() {
                    break;
                }
            }
        };
        if tokio::time::timeout(timeout, wait_terminal).await.is_err() {
            debug!("Close handshake for {} hit the {:?} ceiling", self.endpoint, timeout);
        }
    }
}

// ─── I/O Task ───────────────────────────────────────────────────

async fn run_io(
    socket: Arc<ReplaySocket>,
    mut out_rx: mpsc::UnboundedReceiver<ReplayMessage>,
    control_tx: mpsc::UnboundedSender<ReplayMessage>,
) {
    let connected = match connect_async(socket.endpoint()).await {
        Ok((ws, _response)) => ws,
        Err(err) => {
            error!("Replay socket connect failed for {}: {}", socket.endpoint(), err);
            socket.mark_failed();
            return;
        }
    };
    socket.mark_open();
    info!("Replay socket open: {}", socket.endpoint());

    let (mut sink, mut stream) = connected.split();
    let mut state_rx = socket.subscribe_state();

    loop {
        tokio::select! {
            outbound = out_rx.recv() => match outbound {
                Some(msg) => {
                    let text = match serde_json::to_string(&msg) {
                        Ok(text) => text,
                        Err(err) => {
                            error!("Serialize error: {}", err);
                            continue;
                        }
                    };
                    if sink.send(Message::text(text)).await.is_err() {
                        socket.mark_closed();
                        break;
                    }
                }
                None => {
                    // Every handle dropped; shut the connection down.
                    let _ = sink.send(Message::Close(None)).await;
                    socket.mark_closed();
                    break;
                }
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    match ReplayMessage::parse(text.as_str()) {
                        Ok(msg) => {
                            let _ = control_tx.send(msg);
                        }
                        Err(err) => {
                            warn!("Ignoring invalid frame from replay hub: {}", err);
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    socket.mark_closed();
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!("Replay socket error on {}: {}", socket.endpoint(), err);
                    socket.mark_closed();
                    break;
                }
            },
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                if *state_rx.borrow() == SocketState::Closing {
                    // Close handshake: send the close frame and keep
                    // reading until the hub answers or the stream ends.
                    let _ = sink.send(Message::Close(None)).await;
                }
            }
        }
    }
    debug!("Replay socket I/O task finished: {}", socket.endpoint());
}
