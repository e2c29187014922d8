//! # Replay Protocol Messages
//!
//! Defines all message types exchanged between producers (automated browser
//! sessions pushing screenshots), viewers (remote watchers) and the replay
//! hub, over JSON text frames on a WebSocket connection. Messages are
//! serialized with serde's internally-tagged representation: each frame is a
//! JSON object whose `"type"` field carries the kebab-case variant name, with
//! camelCase field names.
//!
//! Parsing is strict: a frame whose required fields are missing, whose
//! `button`/`clickCount` values fall outside their closed domains, or whose
//! `type` tag is unknown is a [`ProtocolError`], never a panic. The hub drops
//! such frames with a warning.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Close-frame reason text is capped at 123 bytes: the WebSocket control
/// frame payload ceiling (125 bytes) minus the 2-byte status code.
pub const CLOSE_REASON_MAX_BYTES: usize = 123;

// ─── Protocol Error ──────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame was not valid JSON, or did not match any message shape.
    #[error("malformed replay message: {0}")]
    Malformed(String),
}

// ─── Message Sub-Domains ─────────────────────────────────────────

/// Pointer button for `mouse-click` commands. Closed domain; any other
/// value on the wire is a parse rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

impl MouseButton {
    pub fn as_str(&self) -> &'static str {
        match self {
            MouseButton::Left => "left",
            MouseButton::Right => "right",
            MouseButton::Middle => "middle",
        }
    }
}

/// Click count for `mouse-click` commands: single or double. Serialized as
/// the integer 1 or 2; anything else is rejected at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ClickCount {
    Single,
    Double,
}

impl TryFrom<u8> for ClickCount {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ClickCount::Single),
            2 => Ok(ClickCount::Double),
            other => Err(format!("clickCount must be 1 or 2, got {}", other)),
        }
    }
}

impl From<ClickCount> for u8 {
    fn from(value: ClickCount) -> u8 {
        match value {
            ClickCount::Single => 1,
            ClickCount::Double => 2,
        }
    }
}

/// Modifier flags for `keyboard-press` commands. All flags default to
/// false, so a frame may carry any subset (or omit the object entirely).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyModifiers {
    pub ctrl: bool,
    pub shift: bool,
    pub alt: bool,
    pub meta: bool,
}

impl KeyModifiers {
    /// Builds the `Control+Shift+K`-style combination string the page
    /// keyboard expects, in Control, Shift, Alt, Meta order.
    pub fn combination(&self, key: &str) -> String {
        let mut parts: Vec<&str> = Vec::new();
        if self.ctrl {
            parts.push("Control");
        }
        if self.shift {
            parts.push("Shift");
        }
        if self.alt {
            parts.push("Alt");
        }
        if self.meta {
            parts.push("Meta");
        }
        if parts.is_empty() {
            key.to_string()
        } else {
            format!("{}+{}", parts.join("+"), key)
        }
    }
}

/// Page metadata carried in `pages-updated` broadcasts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub page_id: String,
    pub page_title: String,
}

// ─── Message Union ───────────────────────────────────────────────

/// All messages of the replay protocol, both directions.
///
/// The `#[serde(tag = "type")]` attribute means each variant is serialized
/// as a JSON object with a `"type"` field whose value is the kebab-case
/// variant name. For example, `ReplayMessage::RegisterProfile` serializes to
/// `{"type": "register-profile", "uuid": "..."}`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ReplayMessage {
    // ── Producer → hub ────────────────────────────────────────────

    /// Claims a session id for the sending connection. The most recent
    /// registration for a uuid always wins; the previous producer's
    /// bookkeeping is evicted without closing its socket.
    RegisterProfile { uuid: String },

    /// Fully tears down a session: viewers are notified with
    /// `stream-ended`, cached frames and page registries are dropped.
    UnregisterProfile { uuid: String },

    /// One captured frame for a page, JPEG bytes base64-encoded, with the
    /// pointer position last recorded on that page (if any).
    #[serde(rename_all = "camelCase")]
    Screenshot {
        uuid: String,
        page_id: String,
        page_title: String,
        base64: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mouse_x: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mouse_y: Option<f64>,
    },

    /// Page lifecycle announcement, sent as soon as a page opens
    /// (independent of capture cadence). Also rebroadcast by the hub to
    /// every connected socket as a lightweight notification.
    #[serde(rename_all = "camelCase")]
    PageOpened {
        uuid: String,
        page_id: String,
        page_title: String,
    },

    /// Page teardown announcement; the hub purges the page's cached frame.
    /// Also rebroadcast hub-side.
    #[serde(rename_all = "camelCase")]
    PageClosed { uuid: String, page_id: String },

    // ── Viewer → hub ──────────────────────────────────────────────

    /// Subscribes the sending socket to a session. An empty uuid means
    /// unsubscribe-from-all. Subscribing detaches the viewer from any
    /// previously watched session first.
    Subscribe { uuid: String },

    /// Like `subscribe`, and additionally replays the last cached frame
    /// for the named page immediately so the viewer does not wait a full
    /// capture interval for first paint.
    #[serde(rename_all = "camelCase")]
    SubscribePage { uuid: String, page_id: String },

    // ── Hub → producer (streaming control) ────────────────────────

    /// First viewer arrived: start the capture loops for this session.
    StartStreaming { uuid: String },

    /// Last viewer left: stop the capture loops for this session.
    StopStreaming { uuid: String },

    // ── Input commands (viewer → hub → producer) ──────────────────
    // Relayed verbatim to the session's producer, but only from a socket
    // whose role is viewer and whose subscribed session matches `uuid`.

    #[serde(rename_all = "camelCase")]
    MouseMove {
        uuid: String,
        page_id: String,
        x: f64,
        y: f64,
    },

    #[serde(rename_all = "camelCase")]
    MouseClick {
        uuid: String,
        page_id: String,
        x: f64,
        y: f64,
        button: MouseButton,
        click_count: ClickCount,
    },

    #[serde(rename_all = "camelCase")]
    KeyboardType {
        uuid: String,
        page_id: String,
        text: String,
    },

    #[serde(rename_all = "camelCase")]
    KeyboardPress {
        uuid: String,
        page_id: String,
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        modifiers: Option<KeyModifiers>,
    },

    #[serde(rename_all = "camelCase")]
    Scroll {
        uuid: String,
        page_id: String,
        delta_x: f64,
        delta_y: f64,
    },

    // ── Hub → clients ─────────────────────────────────────────────

    /// The current list of live session ids, broadcast to every socket
    /// whenever a session registers or is torn down.
    ProfilesUpdated { profiles: Vec<String> },

    /// A frame for subscribed viewers. The title and pointer position are
    /// omitted when replaying a cached frame.
    #[serde(rename_all = "camelCase")]
    NewScreenshot {
        uuid: String,
        page_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        page_title: Option<String>,
        base64: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mouse_x: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mouse_y: Option<f64>,
    },

    /// The full page list of one session, broadcast on any page change.
    PagesUpdated { uuid: String, pages: Vec<PageInfo> },

    /// The session's producer unregistered or disconnected.
    StreamEnded { uuid: String },
}

impl ReplayMessage {
    /// Validates and parses one JSON text frame. Unknown `type` tags,
    /// missing required fields, wrong field types and out-of-domain
    /// `button`/`clickCount` values are all rejections.
    pub fn parse(text: &str) -> Result<ReplayMessage, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// True for the five remote-input command variants.
    pub fn is_input_command(&self) -> bool {
        matches!(
            self,
            ReplayMessage::MouseMove { .. }
                | ReplayMessage::MouseClick { .. }
                | ReplayMessage::KeyboardType { .. }
                | ReplayMessage::KeyboardPress { .. }
                | ReplayMessage::Scroll { .. }
        )
    }

    /// The session id this message is about, for every variant that
    /// carries one.
    pub fn uuid(&self) -> Option<&str> {
        match self {
            ReplayMessage::RegisterProfile { uuid }
            | ReplayMessage::UnregisterProfile { uuid }
            | ReplayMessage::Screenshot { uuid, .. }
            | ReplayMessage::PageOpened { uuid, .. }
            | ReplayMessage::PageClosed { uuid, .. }
            | ReplayMessage::Subscribe { uuid }
            | ReplayMessage::SubscribePage { uuid, .. }
            | ReplayMessage::StartStreaming { uuid }
            | ReplayMessage::StopStreaming { uuid }
            | ReplayMessage::MouseMove { uuid, .. }
            | ReplayMessage::MouseClick { uuid, .. }
            | ReplayMessage::KeyboardType { uuid, .. }
            | ReplayMessage::KeyboardPress { uuid, .. }
            | ReplayMessage::Scroll { uuid, .. }
            | ReplayMessage::NewScreenshot { uuid, .. }
            | ReplayMessage::PagesUpdated { uuid, .. }
            | ReplayMessage::StreamEnded { uuid } => Some(uuid),
            ReplayMessage::ProfilesUpdated { .. } => None,
        }
    }
}

// ─── Close Reason Truncation ─────────────────────────────────────

/// Caps a close-frame reason at [`CLOSE_REASON_MAX_BYTES`], cutting on a
/// UTF-8 character boundary. Long reasons are truncated, never rejected.
pub fn truncate_close_reason(reason: &str) -> String {
    if reason.len() <= CLOSE_REASON_MAX_BYTES {
        return reason.to_string();
    }
    let mut end = CLOSE_REASON_MAX_BYTES;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}
