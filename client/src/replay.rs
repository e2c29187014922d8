//! # Session Replay Manager
//!
//! The producer-side counterpart to the replay hub. Per session and page
//! it runs the demand-driven capture loop, relays remote-input commands
//! into page actions, and tears everything down on close.
//!
//! Capture is strictly demand-driven: loops only run between the hub's
//! `start-streaming` and `stop-streaming` signals, and both signals are
//! level-triggered (repeating one on an already-matching state is a
//! no-op). A snapshot that fails or exceeds its timeout is skipped, never
//! retried or queued. Input replay is best-effort end to end: a page mid
//! navigation simply swallows the command.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use replay_protocol::ReplayMessage;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::backend::{PageDriver, SCREENSHOT_TIMEOUT};
use crate::error::ClientError;
use crate::socket::ReplaySocket;

/// Capture cadence for streaming pages.
pub const CAPTURE_FPS: u64 = 10;

/// Everything a capture loop needs about its page.
#[derive(Clone)]
struct PageContext {
    session_id: String,
    driver: Arc<dyn PageDriver>,
    socket: Arc<ReplaySocket>,
}

pub struct ReplayManager {
    /// pageId → last pointer position, annotated onto frames.
    mouse_positions: RwLock<HashMap<String, (f64, f64)>>,
    /// Sessions the hub currently wants streamed.
    streaming_enabled: RwLock<HashSet<String>>,
    /// sessionId → pageId → driver.
    session_pages: RwLock<HashMap<String, HashMap<String, Arc<dyn PageDriver>>>>,
    /// pageId → capture context.
    page_contexts: RwLock<HashMap<String, PageContext>>,
    /// pageId → running capture loop.
    capture_tasks: RwLock<HashMap<String, JoinHandle<()>>>,
}

impl ReplayManager {
    pub fn new() -> Self {
        Self {
            mouse_positions: RwLock::new(HashMap::new()),
            streaming_enabled: RwLock::new(HashSet::new()),
            session_pages: RwLock::new(HashMap::new()),
            page_contexts: RwLock::new(HashMap::new()),
            capture_tasks: RwLock::new(HashMap::new()),
        }
    }

    // ─── Page Registration ──────────────────────────────────────

    /// Starts live replay for a page: tracks it, announces it to the hub
    /// immediately (independent of capture cadence), and begins capturing
    /// only if streaming is already enabled for the session.
    pub async fn enable_live_replay(
        self: &Arc<Self>,
        driver: Arc<dyn PageDriver>,
        page_id: &str,
        session_id: &str,
        socket: Arc<ReplaySocket>,
    ) {
        {
            let mut sessions = self.session_pages.write().await;
            let pages = sessions.entry(session_id.to_string()).or_default();
            // The same page object must not be tracked twice.
            if pages.values().any(|existing| Arc::ptr_eq(existing, &driver)) {
                return;
            }
            pages.insert(page_id.to_string(), Arc::clone(&driver));
        }

        self.page_contexts.write().await.insert(
            page_id.to_string(),
            PageContext {
                session_id: session_id.to_string(),
                driver: Arc::clone(&driver),
                socket: Arc::clone(&socket),
            },
        );

        if let Ok(page_title) = driver.title().await {
            let announced = socket
                .safe_send(ReplayMessage::PageOpened {
                    uuid: session_id.to_string(),
                    page_id: page_id.to_string(),
                    page_title,
                })
                .await;
            if announced.is_err() {
                debug!("Could not announce page {} to the replay hub", page_id);
            }
        }

        if self.streaming_enabled.read().await.contains(session_id) {
            self.start_capture(page_id).await;
        }
    }

    /// Stops the page's capture loop, removes it from tracking, and sends
    /// a best-effort closure notification to the hub.
    pub async fn handle_page_closed(&self, session_id: &str, page_id: &str) {
        self.stop_capture(page_id).await;

        {
            let mut sessions = self.session_pages.write().await;
            if let Some(pages) = sessions.get_mut(session_id) {
                pages.remove(page_id);
                if pages.is_empty() {
                    sessions.remove(session_id);
                }
            }
        }
        self.mouse_positions.write().await.remove(page_id);

        let context = self.page_contexts.write().await.remove(page_id);
        if let Some(context) = context {
            let notified = context
                .socket
                .safe_send(ReplayMessage::PageClosed {
                    uuid: session_id.to_string(),
                    page_id: page_id.to_string(),
                })
                .await;
            if notified.is_err() {
                debug!("Could not notify hub of page {} closing", page_id);
            }
        }
    }

    /// Clears everything for a session: capture loops, page tracking,
    /// pointer positions, streaming flag.
    pub async fn cleanup(&self, session_id: &str) {
        self.streaming_enabled.write().await.remove(session_id);

        let page_ids: Vec<String> = self
            .session_pages
            .write()
            .await
            .remove(session_id)
            .map(|pages| pages.keys().cloned().collect())
            .unwrap_or_default();

        for page_id in &page_ids {
            self.stop_capture(page_id).await;
            self.page_contexts.write().await.remove(page_id);
            self.mouse_positions.write().await.remove(page_id);
        }
    }

    // ─── Streaming Control ──────────────────────────────────────

    /// Handles messages arriving from the hub on the replay socket:
    /// streaming control and forwarded viewer input.
    pub async fn handle_control_message(self: &Arc<Self>, msg: ReplayMessage) {
        match msg {
            ReplayMessage::StartStreaming { uuid } => self.start_streaming(&uuid).await,
            ReplayMessage::StopStreaming { uuid } => self.stop_streaming(&uuid).await,
            msg if msg.is_input_command() => self.execute_input_command(msg).await,
            _ => {}
        }
    }

    async fn start_streaming(self: &Arc<Self>, session_id: &str) {
        self.streaming_enabled
            .write()
            .await
            .insert(session_id.to_string());

        let page_ids: Vec<String> = {
            let sessions = self.session_pages.read().await;
            match sessions.get(session_id) {
                Some(pages) => pages
                    .iter()
                    .filter(|(_, driver)| !driver.is_closed())
                    .map(|(id, _)| id.clone())
                    .collect(),
                None => Vec::new(),
            }
        };
        for page_id in page_ids {
            self.start_capture(&page_id).await;
        }
    }

    async fn stop_streaming(&self, session_id: &str) {
        self.streaming_enabled.write().await.remove(session_id);

        let page_ids: Vec<String> = {
            let sessions = self.session_pages.read().await;
            match sessions.get(session_id) {
                Some(pages) => pages.keys().cloned().collect(),
                None => Vec::new(),
            }
        };
        for page_id in page_ids {
            self.stop_capture(&page_id).await;
        }
    }

    // ─── Capture Loop ───────────────────────────────────────────

    async fn start_capture(self: &Arc<Self>, page_id: &str) {
        let context = match self.page_contexts.read().await.get(page_id) {
            Some(context) => context.clone(),
            None => return,
        };

        let mut tasks = self.capture_tasks.write().await;
        if tasks.contains_key(page_id) {
            // Already streaming; start is level-triggered.
            return;
        }

        let manager = Arc::clone(self);
        let page_id_owned = page_id.to_string();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(1000 / CAPTURE_FPS));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                manager.capture_and_send(&context, &page_id_owned).await;
            }
        });
        tasks.insert(page_id.to_string(), handle);
    }

    async fn stop_capture(&self, page_id: &str) {
        if let Some(handle) = self.capture_tasks.write().await.remove(page_id) {
            handle.abort();
        }
    }

    /// One tick of the capture loop: best-effort bounded-latency snapshot,
    /// annotated with the last recorded pointer position. Any failure
    /// skips the frame.
    async fn capture_and_send(&self, context: &PageContext, page_id: &str) {
        if !self
            .streaming_enabled
            .read()
            .await
            .contains(&context.session_id)
        {
            return;
        }
        if context.driver.is_closed() {
            return;
        }

        let frame = match tokio::time::timeout(SCREENSHOT_TIMEOUT, context.driver.screenshot()).await
        {
            Ok(Ok(bytes)) => bytes,
            _ => return,
        };
        let page_title = match context.driver.title().await {
            Ok(title) => title,
            Err(_) => return,
        };

        let position = self.mouse_positions.read().await.get(page_id).copied();
        let sent = context
            .socket
            .safe_send(ReplayMessage::Screenshot {
                uuid: context.session_id.clone(),
                page_id: page_id.to_string(),
                page_title,
                base64: BASE64.encode(&frame),
                mouse_x: position.map(|p| p.0),
                mouse_y: position.map(|p| p.1),
            })
            .await;
        if sent.is_err() {
            // Streaming is not critical; the next tick tries again.
            debug!("Dropped frame for page {}", page_id);
        }
    }

    // ─── Input Replay ───────────────────────────────────────────

    /// Moves the pointer and records the position for the next frame's
    /// annotation. This wrapper is the one place pointer moves go through.
    pub async fn move_pointer(
        &self,
        page_id: &str,
        driver: &Arc<dyn PageDriver>,
        x: f64,
        y: f64,
    ) -> Result<(), ClientError> {
        self.mouse_positions
            .write()
            .await
            .insert(page_id.to_string(), (x, y));
        driver.mouse_move(x, y).await
    }

    /// Executes one forwarded viewer command against the real page.
    /// Failures (page mid-navigation, races with close) are discarded.
    async fn execute_input_command(&self, msg: ReplayMessage) {
        let outcome = match msg {
            ReplayMessage::MouseMove { uuid, page_id, x, y } => {
                match self.page_driver(&uuid, &page_id).await {
                    Some(driver) => self.move_pointer(&page_id, &driver, x, y).await,
                    None => return,
                }
            }
            ReplayMessage::MouseClick {
                uuid,
                page_id,
                x,
                y,
                button,
                click_count,
            } => match self.page_driver(&uuid, &page_id).await {
                Some(driver) => {
                    let result = driver.mouse_click(x, y, button, click_count.into()).await;
                    if result.is_ok() {
                        self.mouse_positions
                            .write()
                            .await
                            .insert(page_id.clone(), (x, y));
                    }
                    result
                }
                None => return,
            },
            ReplayMessage::KeyboardType { uuid, page_id, text } => {
                match self.page_driver(&uuid, &page_id).await {
                    Some(driver) => driver.type_text(&text).await,
                    None => return,
                }
            }
            ReplayMessage::KeyboardPress {
                uuid,
                page_id,
                key,
                modifiers,
            } => match self.page_driver(&uuid, &page_id).await {
                Some(driver) => {
                    let combination = modifiers.unwrap_or_default().combination(&key);
                    driver.press_key(&combination).await
                }
                None => return,
            },
            ReplayMessage::Scroll {
                uuid,
                page_id,
                delta_x,
                delta_y,
            } => match self.page_driver(&uuid, &page_id).await {
                Some(driver) => driver.scroll(delta_x, delta_y).await,
                None => return,
            },
            _ => return,
        };

        if let Err(err) = outcome {
            debug!("Input replay failed: {}", err);
        }
    }

    async fn page_driver(&self, session_id: &str, page_id: &str) -> Option<Arc<dyn PageDriver>> {
        let sessions = self.session_pages.read().await;
        let pages = match sessions.get(session_id) {
            Some(pages) => pages,
            None => {
                warn!("No pages tracked for session {}", session_id);
                return None;
            }
        };
        match pages.get(page_id) {
            Some(driver) if !driver.is_closed() => Some(Arc::clone(driver)),
            _ => {
                warn!("Page {} not found or closed", page_id);
                None
            }
        }
    }

    pub async fn is_streaming(&self, session_id: &str) -> bool {
        self.streaming_enabled.read().await.contains(session_id)
    }
}

impl Default for ReplayManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use replay_protocol::{ClickCount, KeyModifiers, MouseButton};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::sync::Notify;

    struct FakePage {
        calls: StdMutex<Vec<String>>,
        closed: AtomicBool,
        fail_input: AtomicBool,
        close_notify: Notify,
    }

    impl FakePage {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: StdMutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                fail_input: AtomicBool::new(false),
                close_notify: Notify::new(),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) -> Result<(), ClientError> {
            if self.fail_input.load(Ordering::SeqCst) {
                return Err(ClientError::Backend("page navigating".into()));
            }
            self.calls.lock().unwrap().push(call);
            Ok(())
        }
    }

    #[async_trait]
    impl PageDriver for FakePage {
        async fn screenshot(&self) -> Result<Vec<u8>, ClientError> {
            Ok(vec![0xff, 0xd8, 0xff])
        }

        async fn title(&self) -> Result<String, ClientError> {
            Ok("Fake Page".into())
        }

        async fn mouse_move(&self, x: f64, y: f64) -> Result<(), ClientError> {
            self.record(format!("move:{},{}", x, y))
        }

        async fn mouse_click(
            &self,
            x: f64,
            y: f64,
            button: MouseButton,
            click_count: u8,
        ) -> Result<(), ClientError> {
            self.record(format!("click:{},{},{},{}", x, y, button.as_str(), click_count))
        }

        async fn type_text(&self, text: &str) -> Result<(), ClientError> {
            self.record(format!("type:{}", text))
        }

        async fn press_key(&self, combination: &str) -> Result<(), ClientError> {
            self.record(format!("press:{}", combination))
        }

        async fn scroll(&self, delta_x: f64, delta_y: f64) -> Result<(), ClientError> {
            self.record(format!("scroll:{},{}", delta_x, delta_y))
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        async fn wait_closed(&self) {
            self.close_notify.notified().await;
        }
    }

    async fn setup() -> (
        Arc<ReplayManager>,
        Arc<FakePage>,
        Arc<ReplaySocket>,
        UnboundedReceiver<ReplayMessage>,
    ) {
        let manager = Arc::new(ReplayManager::new());
        let (socket, out_rx) = ReplaySocket::detached("ws://hub/replay");
        socket.mark_open();
        let page = FakePage::new();
        manager
            .enable_live_replay(page.clone(), "p1", "A", Arc::clone(&socket))
            .await;
        (manager, page, socket, out_rx)
    }

    fn drain(rx: &mut UnboundedReceiver<ReplayMessage>) -> Vec<ReplayMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    async fn next_screenshot(rx: &mut UnboundedReceiver<ReplayMessage>) -> ReplayMessage {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for a frame")
                .expect("socket channel closed");
            if matches!(msg, ReplayMessage::Screenshot { .. }) {
                return msg;
            }
        }
    }

    #[tokio::test]
    async fn page_is_announced_immediately_without_streaming() {
        let (_manager, _page, _socket, mut out_rx) = setup().await;
        let msg = out_rx.recv().await.unwrap();
        assert_eq!(
            msg,
            ReplayMessage::PageOpened {
                uuid: "A".into(),
                page_id: "p1".into(),
                page_title: "Fake Page".into(),
            }
        );

        // No viewer asked for frames, so none may be produced.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(drain(&mut out_rx).is_empty());
    }

    #[tokio::test]
    async fn duplicate_page_registration_is_ignored() {
        let (manager, page, socket, mut out_rx) = setup().await;
        manager
            .enable_live_replay(page.clone(), "p1-again", "A", socket)
            .await;

        // Exactly one announcement for the one real page.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let announcements = drain(&mut out_rx)
            .into_iter()
            .filter(|m| matches!(m, ReplayMessage::PageOpened { .. }))
            .count();
        assert_eq!(announcements, 1);
    }

    #[tokio::test]
    async fn streaming_control_is_level_triggered() {
        let (manager, _page, _socket, mut out_rx) = setup().await;
        drain(&mut out_rx);

        manager
            .handle_control_message(ReplayMessage::StartStreaming { uuid: "A".into() })
            .await;
        next_screenshot(&mut out_rx).await;

        // Redundant start changes nothing: still one capture loop.
        manager
            .handle_control_message(ReplayMessage::StartStreaming { uuid: "A".into() })
            .await;
        assert_eq!(manager.capture_tasks.read().await.len(), 1);

        manager
            .handle_control_message(ReplayMessage::StopStreaming { uuid: "A".into() })
            .await;
        assert!(manager.capture_tasks.read().await.is_empty());

        // Redundant stop is harmless, and no frames flow afterwards.
        manager
            .handle_control_message(ReplayMessage::StopStreaming { uuid: "A".into() })
            .await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        drain(&mut out_rx);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(drain(&mut out_rx).is_empty());
    }

    #[tokio::test]
    async fn frames_carry_the_last_pointer_position() {
        let (manager, _page, _socket, mut out_rx) = setup().await;
        drain(&mut out_rx);

        manager
            .handle_control_message(ReplayMessage::StartStreaming { uuid: "A".into() })
            .await;
        manager
            .handle_control_message(ReplayMessage::MouseMove {
                uuid: "A".into(),
                page_id: "p1".into(),
                x: 42.0,
                y: 7.0,
            })
            .await;

        // Frames captured after the move must carry the position.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            assert!(tokio::time::Instant::now() < deadline, "no annotated frame arrived");
            if let ReplayMessage::Screenshot { mouse_x, mouse_y, .. } =
                next_screenshot(&mut out_rx).await
            {
                if mouse_x == Some(42.0) {
                    assert_eq!(mouse_y, Some(7.0));
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn input_commands_drive_the_page() {
        let (manager, page, _socket, _out_rx) = setup().await;

        manager
            .handle_control_message(ReplayMessage::MouseClick {
                uuid: "A".into(),
                page_id: "p1".into(),
                x: 3.0,
                y: 4.0,
                button: MouseButton::Right,
                click_count: ClickCount::Double,
            })
            .await;
        manager
            .handle_control_message(ReplayMessage::KeyboardType {
                uuid: "A".into(),
                page_id: "p1".into(),
                text: "hello".into(),
            })
            .await;
        manager
            .handle_control_message(ReplayMessage::KeyboardPress {
                uuid: "A".into(),
                page_id: "p1".into(),
                key: "Tab".into(),
                modifiers: Some(KeyModifiers { ctrl: true, shift: true, ..Default::default() }),
            })
            .await;
        manager
            .handle_control_message(ReplayMessage::Scroll {
                uuid: "A".into(),
                page_id: "p1".into(),
                delta_x: 0.0,
                delta_y: 120.0,
            })
            .await;

        assert_eq!(
            page.calls(),
            vec![
                "click:3,4,right,2",
                "type:hello",
                "press:Control+Shift+Tab",
                "scroll:0,120",
            ]
        );
    }

    #[tokio::test]
    async fn input_failures_are_swallowed() {
        let (manager, page, _socket, _out_rx) = setup().await;
        page.fail_input.store(true, Ordering::SeqCst);

        // Must not panic or propagate; the page simply records nothing.
        manager
            .handle_control_message(ReplayMessage::KeyboardType {
                uuid: "A".into(),
                page_id: "p1".into(),
                text: "lost".into(),
            })
            .await;
        assert!(page.calls().is_empty());
    }

    #[tokio::test]
    async fn commands_for_unknown_pages_are_dropped() {
        let (manager, page, _socket, _out_rx) = setup().await;
        manager
            .handle_control_message(ReplayMessage::KeyboardType {
                uuid: "A".into(),
                page_id: "nope".into(),
                text: "lost".into(),
            })
            .await;
        manager
            .handle_control_message(ReplayMessage::KeyboardType {
                uuid: "B".into(),
                page_id: "p1".into(),
                text: "lost".into(),
            })
            .await;
        assert!(page.calls().is_empty());
    }

    #[tokio::test]
    async fn page_close_stops_capture_and_notifies_the_hub() {
        let (manager, _page, _socket, mut out_rx) = setup().await;
        drain(&mut out_rx);
        manager
            .handle_control_message(ReplayMessage::StartStreaming { uuid: "A".into() })
            .await;
        next_screenshot(&mut out_rx).await;

        manager.handle_page_closed("A", "p1").await;
        assert!(manager.capture_tasks.read().await.is_empty());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            assert!(tokio::time::Instant::now() < deadline, "no page-closed notification");
            let msg = tokio::time::timeout(Duration::from_secs(5), out_rx.recv())
                .await
                .unwrap()
                .unwrap();
            if msg == (ReplayMessage::PageClosed { uuid: "A".into(), page_id: "p1".into() }) {
                break;
            }
        }
    }

    #[tokio::test]
    async fn cleanup_clears_all_session_state() {
        let (manager, page, socket, mut out_rx) = setup().await;
        let second = FakePage::new();
        manager
            .enable_live_replay(second.clone(), "p2", "A", socket)
            .await;
        drain(&mut out_rx);
        manager
            .handle_control_message(ReplayMessage::StartStreaming { uuid: "A".into() })
            .await;
        assert_eq!(manager.capture_tasks.read().await.len(), 2);

        manager.cleanup("A").await;
        assert!(manager.capture_tasks.read().await.is_empty());
        assert!(manager.session_pages.read().await.is_empty());
        assert!(manager.page_contexts.read().await.is_empty());
        assert!(!manager.is_streaming("A").await);

        // Late control messages for the cleaned session do nothing.
        manager
            .handle_control_message(ReplayMessage::StartStreaming { uuid: "A".into() })
            .await;
        assert!(manager.capture_tasks.read().await.is_empty());
        let _ = page;
    }
}
