//! # Session Facade
//!
//! The top-level client: launches browser sessions on assigned servers,
//! wires new pages into the replay manager, and tears sessions down with
//! independently best-effort cleanup steps. Failing to notify the replay
//! hub never blocks a launch or a teardown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use replay_protocol::ReplayMessage;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::backend::{BackendConnection, BackendConnector, BrowserSession};
use crate::error::ClientError;
use crate::manager::ManagerClient;
use crate::pool::ConnectionPool;
use crate::replay::ReplayManager;
use crate::socket::ReplaySocket;
use crate::types::{ProfileRecord, ProxyConfig};
use crate::usage::DataUsageTracker;
use crate::util::format_proxy_url;

pub struct ReplayClient {
    pool: Arc<ConnectionPool>,
    manager: Arc<ManagerClient>,
    replay: Arc<ReplayManager>,
}

impl ReplayClient {
    /// Builds the client over a backend connector and a manager client.
    /// Must be called inside a tokio runtime; the control pump for
    /// streaming messages is spawned here.
    pub fn new(connector: Arc<dyn BackendConnector>, manager: ManagerClient) -> Self {
        let pool = Arc::new(ConnectionPool::new(connector));
        let replay = Arc::new(ReplayManager::new());

        // Streaming control and forwarded input from every replay socket
        // flow into the replay manager.
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        pool.set_control_sender(control_tx);
        {
            let replay = Arc::clone(&replay);
            tokio::spawn(async move {
                while let Some(msg) = control_rx.recv().await {
                    replay.handle_control_message(msg).await;
                }
            });
        }

        Self {
            pool,
            manager: Arc::new(manager),
            replay,
        }
    }

    // ─── Launching ──────────────────────────────────────────────

    /// Launches a stored browser profile on whatever server the manager
    /// assigns, with its bound proxy credentials.
    pub async fn launch_profile(&self, browser_id: &str) -> Result<SessionHandle, ClientError> {
        let assignment = self.manager.get_server_assignment().await?;
        let backend = self
            .pool
            .get_backend_connection(&assignment.browser_ws_url)
            .await?;
        let socket = self.pool.get_replay_socket(&assignment.replay_ws_url);

        let bundle = self.manager.get_profile(browser_id).await?;
        let proxy = bundle.proxy.as_ref().map(ProxyConfig::from);

        self.launch_instance(
            backend,
            socket,
            &assignment.replay_ws_url,
            bundle.profile,
            proxy,
            false,
        )
        .await
    }

    /// Launches a throwaway session with a generated id, no stored
    /// profile, and no audit trail.
    pub async fn launch_one_time(
        &self,
        proxy_url: Option<&str>,
    ) -> Result<SessionHandle, ClientError> {
        let assignment = self.manager.get_server_assignment().await?;
        let backend = self
            .pool
            .get_backend_connection(&assignment.browser_ws_url)
            .await?;
        let socket = self.pool.get_replay_socket(&assignment.replay_ws_url);

        let browser_id = Uuid::new_v4().to_string();
        let mut profile = ProfileRecord::fresh(&browser_id);
        if let Some(url) = proxy_url {
            profile.data["proxyUrl"] = json!(url);
        }
        let proxy = proxy_url.and_then(format_proxy_url);

        self.launch_instance(
            backend,
            socket,
            &assignment.replay_ws_url,
            profile,
            proxy,
            true,
        )
        .await
    }

    pub(crate) async fn launch_instance(
        &self,
        backend: Arc<dyn BackendConnection>,
        socket: Arc<ReplaySocket>,
        replay_endpoint: &str,
        profile: ProfileRecord,
        proxy: Option<ProxyConfig>,
        skip_audit: bool,
    ) -> Result<SessionHandle, ClientError> {
        let browser_id = profile.browser_id.clone();

        let session = backend.open_session(&profile, proxy.as_ref()).await?;

        // Registering with the replay hub is not critical to the launch.
        let registered = socket
            .safe_send(ReplayMessage::RegisterProfile {
                uuid: browser_id.clone(),
            })
            .await;
        if registered.is_err() {
            debug!("Could not register profile {} with the replay hub", browser_id);
        }

        if !skip_audit {
            let manager = Arc::clone(&self.manager);
            let id = browser_id.clone();
            tokio::spawn(async move {
                manager.log_audit(&id, "openContext", json!({})).await;
            });
        }

        let usage = Arc::new(DataUsageTracker::new(&browser_id));

        // Page pump: every page the session opens gets an id, live replay,
        // and a close watcher of its own.
        {
            let replay = Arc::clone(&self.replay);
            let session = Arc::clone(&session);
            let socket = Arc::clone(&socket);
            let browser_id = browser_id.clone();
            tokio::spawn(async move {
                while let Some(driver) = session.next_page().await {
                    let page_id = Uuid::new_v4().to_string();
                    replay
                        .enable_live_replay(
                            Arc::clone(&driver),
                            &page_id,
                            &browser_id,
                            Arc::clone(&socket),
                        )
                        .await;

                    let replay = Arc::clone(&replay);
                    let browser_id = browser_id.clone();
                    tokio::spawn(async move {
                        driver.wait_closed().await;
                        replay.handle_page_closed(&browser_id, &page_id).await;
                    });
                }
            });
        }

        Ok(SessionHandle {
            browser_id,
            replay_endpoint: replay_endpoint.to_string(),
            session,
            socket,
            usage,
            pool: Arc::clone(&self.pool),
            manager: Arc::clone(&self.manager),
            replay: Arc::clone(&self.replay),
            skip_audit,
            closed: AtomicBool::new(false),
        })
    }

    // ─── Profile Management ─────────────────────────────────────

    /// Creates a stored profile with fresh (empty) state.
    pub async fn create_profile(&self, proxy_id: Option<i64>) -> Result<ProfileRecord, ClientError> {
        let browser_id = Uuid::new_v4().to_string();
        let profile = ProfileRecord::fresh(&browser_id);
        self.manager
            .create_profile(&browser_id, &profile.data, proxy_id)
            .await?;
        Ok(profile)
    }

    pub async fn delete_profile(&self, browser_id: &str) -> Result<(), ClientError> {
        self.manager.delete_profile(browser_id).await
    }

    pub async fn list_profiles(&self) -> Result<Vec<ProfileRecord>, ClientError> {
        self.manager.list_profiles().await
    }
}

// ─── Session Handle ─────────────────────────────────────────────

/// One live browser session. Dropping the handle does not close the
/// session; call [`SessionHandle::close`].
pub struct SessionHandle {
    browser_id: String,
    replay_endpoint: String,
    session: Arc<dyn BrowserSession>,
    socket: Arc<ReplaySocket>,
    usage: Arc<DataUsageTracker>,
    pool: Arc<ConnectionPool>,
    manager: Arc<ManagerClient>,
    replay: Arc<ReplayManager>,
    skip_audit: bool,
    closed: AtomicBool,
}

impl SessionHandle {
    pub fn browser_id(&self) -> &str {
        &self.browser_id
    }

    pub fn usage(&self) -> &Arc<DataUsageTracker> {
        &self.usage
    }

    /// Tears the session down. Every step is independently best-effort:
    /// a failing audit log, usage flush, or hub notification never stops
    /// the steps after it.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if !self.skip_audit {
            self.manager
                .log_audit(&self.browser_id, "closeContext", json!({}))
                .await;
        }

        let record = self.usage.finish();
        self.manager.log_usage(&record).await;

        self.replay.cleanup(&self.browser_id).await;

        let unregistered = self
            .socket
            .safe_send(ReplayMessage::UnregisterProfile {
                uuid: self.browser_id.clone(),
            })
            .await;
        if unregistered.is_err() {
            debug!("Could not unregister profile {} from the replay hub", self.browser_id);
        }

        // Bounded close handshake; the socket leaves the pool regardless
        // of how the handshake ends.
        self.pool.close_replay_socket(&self.replay_endpoint).await;

        if let Err(err) = self.session.close().await {
            debug!("Backend session close failed: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use replay_protocol::MouseButton;
    use std::time::Duration;
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
    use tokio::sync::{Mutex, Notify};

    use crate::backend::PageDriver;

    struct FakeSession {
        pages: Mutex<UnboundedReceiver<Arc<dyn PageDriver>>>,
        close_calls: AtomicBool,
    }

    #[async_trait]
    impl BrowserSession for FakeSession {
        async fn next_page(&self) -> Option<Arc<dyn PageDriver>> {
            self.pages.lock().await.recv().await
        }

        async fn close(&self) -> Result<(), ClientError> {
            self.close_calls.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeBackend {
        session: Mutex<Option<Arc<FakeSession>>>,
    }

    #[async_trait]
    impl BackendConnection for FakeBackend {
        fn is_connected(&self) -> bool {
            true
        }

        async fn wait_disconnected(&self) {
            futures::future::pending::<()>().await;
        }

        async fn open_session(
            &self,
            _profile: &ProfileRecord,
            _proxy: Option<&ProxyConfig>,
        ) -> Result<Arc<dyn BrowserSession>, ClientError> {
            let session = self
                .session
                .lock()
                .await
                .take()
                .ok_or_else(|| ClientError::Backend("no session".into()))?;
            Ok(session)
        }
    }

    struct NeverConnector;

    #[async_trait]
    impl BackendConnector for NeverConnector {
        async fn connect(
            &self,
            _endpoint: &str,
        ) -> Result<Arc<dyn BackendConnection>, ClientError> {
            Err(ClientError::Connect("unused in this test".into()))
        }
    }

    struct QuietPage {
        closed: Notify,
    }

    #[async_trait]
    impl PageDriver for QuietPage {
        async fn screenshot(&self) -> Result<Vec<u8>, ClientError> {
            Ok(vec![1])
        }
        async fn title(&self) -> Result<String, ClientError> {
            Ok("Quiet".into())
        }
        async fn mouse_move(&self, _x: f64, _y: f64) -> Result<(), ClientError> {
            Ok(())
        }
        async fn mouse_click(
            &self,
            _x: f64,
            _y: f64,
            _button: MouseButton,
            _click_count: u8,
        ) -> Result<(), ClientError> {
            Ok(())
        }
        async fn type_text(&self, _text: &str) -> Result<(), ClientError> {
            Ok(())
        }
        async fn press_key(&self, _combination: &str) -> Result<(), ClientError> {
            Ok(())
        }
        async fn scroll(&self, _dx: f64, _dy: f64) -> Result<(), ClientError> {
            Ok(())
        }
        fn is_closed(&self) -> bool {
            false
        }
        async fn wait_closed(&self) {
            self.closed.notified().await;
        }
    }

    fn fixtures() -> (
        ReplayClient,
        Arc<FakeBackend>,
        Arc<FakeSession>,
        UnboundedSender<Arc<dyn PageDriver>>,
    ) {
        // The manager URL points nowhere reachable; log sinks must swallow
        // their own failures during close.
        let client = ReplayClient::new(
            Arc::new(NeverConnector),
            ManagerClient::new(Some("http://127.0.0.1:1".into())),
        );
        let (page_tx, page_rx) = mpsc::unbounded_channel();
        let session = Arc::new(FakeSession {
            pages: Mutex::new(page_rx),
            close_calls: AtomicBool::new(false),
        });
        let backend = Arc::new(FakeBackend {
            session: Mutex::new(Some(Arc::clone(&session))),
        });
        (client, backend, session, page_tx)
    }

    async fn wait_for(
        rx: &mut UnboundedReceiver<ReplayMessage>,
        expected: ReplayMessage,
    ) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            assert!(
                tokio::time::Instant::now() < deadline,
                "did not receive {:?}",
                expected
            );
            let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if msg == expected {
                return;
            }
        }
    }

    #[tokio::test]
    async fn launch_registers_and_pages_are_wired_into_replay() {
        let (client, backend, _session, page_tx) = fixtures();
        let (socket, mut hub_rx) = ReplaySocket::detached("ws://hub/replay");
        socket.mark_open();

        let handle = client
            .launch_instance(
                backend,
                socket,
                "ws://hub/replay",
                ProfileRecord::fresh("session-1"),
                None,
                true,
            )
            .await
            .unwrap();
        assert_eq!(handle.browser_id(), "session-1");

        wait_for(&mut hub_rx, ReplayMessage::RegisterProfile { uuid: "session-1".into() }).await;

        // A page opening in the session is announced to the hub.
        let page = Arc::new(QuietPage { closed: Notify::new() });
        page_tx.send(page.clone()).unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            assert!(tokio::time::Instant::now() < deadline, "page never announced");
            let msg = tokio::time::timeout(Duration::from_secs(5), hub_rx.recv())
                .await
                .unwrap()
                .unwrap();
            if let ReplayMessage::PageOpened { uuid, page_title, .. } = msg {
                assert_eq!(uuid, "session-1");
                assert_eq!(page_title, "Quiet");
                break;
            }
        }
    }

    #[tokio::test]
    async fn close_runs_every_cleanup_step_and_is_idempotent() {
        let (client, backend, session, _page_tx) = fixtures();
        let (socket, mut hub_rx) = ReplaySocket::detached("ws://hub/replay");
        socket.mark_open();

        let handle = client
            .launch_instance(
                backend,
                socket,
                "ws://hub/replay",
                ProfileRecord::fresh("session-1"),
                None,
                true,
            )
            .await
            .unwrap();
        wait_for(&mut hub_rx, ReplayMessage::RegisterProfile { uuid: "session-1".into() }).await;

        handle.close().await;

        // The hub was told, and the backend session was closed, despite
        // the unreachable manager.
        wait_for(&mut hub_rx, ReplayMessage::UnregisterProfile { uuid: "session-1".into() }).await;
        assert!(session.close_calls.load(Ordering::SeqCst));

        // A second close is a no-op.
        handle.close().await;
    }
}
