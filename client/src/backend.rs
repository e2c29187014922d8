//! # Backend Seams
//!
//! The narrow traits behind which browser automation lives. This library
//! drives capture and input replay through these interfaces; the actual
//! protocol spoken to the browser servers (and everything else about page
//! semantics) is the implementor's concern.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use replay_protocol::MouseButton;

use crate::error::ClientError;
use crate::types::{ProfileRecord, ProxyConfig};

/// Connects to one backend browser server by WebSocket endpoint.
#[async_trait]
pub trait BackendConnector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn BackendConnection>, ClientError>;
}

/// A live connection to a backend browser server.
#[async_trait]
pub trait BackendConnection: Send + Sync {
    /// Whether the underlying connection is still usable. The pool only
    /// reuses connections that report true here.
    fn is_connected(&self) -> bool;

    /// Resolves when the backend reports the connection gone; the pool
    /// evicts the entry (and any stale connect lock) at that point.
    async fn wait_disconnected(&self);

    /// Opens a browser session (context) configured from the profile's
    /// stored state and optional proxy settings.
    async fn open_session(
        &self,
        profile: &ProfileRecord,
        proxy: Option<&ProxyConfig>,
    ) -> Result<Arc<dyn BrowserSession>, ClientError>;
}

/// One launched browser session. Pages arrive as events.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Resolves with the next page opened in this session, or `None` once
    /// the session is gone.
    async fn next_page(&self) -> Option<Arc<dyn PageDriver>>;

    async fn close(&self) -> Result<(), ClientError>;
}

/// The handful of page primitives the replay layer needs: one snapshot
/// call and the five remote-input actions.
#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Captures a JPEG snapshot of the page. Callers bound this with a
    /// hard timeout; a slow or navigating page must not stall the caller.
    async fn screenshot(&self) -> Result<Vec<u8>, ClientError>;

    async fn title(&self) -> Result<String, ClientError>;

    async fn mouse_move(&self, x: f64, y: f64) -> Result<(), ClientError>;

    async fn mouse_click(
        &self,
        x: f64,
        y: f64,
        button: MouseButton,
        click_count: u8,
    ) -> Result<(), ClientError>;

    async fn type_text(&self, text: &str) -> Result<(), ClientError>;

    /// Presses a key or a `Control+Shift+K` style combination.
    async fn press_key(&self, combination: &str) -> Result<(), ClientError>;

    async fn scroll(&self, delta_x: f64, delta_y: f64) -> Result<(), ClientError>;

    fn is_closed(&self) -> bool;

    /// Resolves when the page closes, however that happens.
    async fn wait_closed(&self);
}

/// Ceiling for one snapshot attempt inside the capture loop.
pub const SCREENSHOT_TIMEOUT: Duration = Duration::from_secs(1);
