//! # Replay Hub
//!
//! The pub/sub core of the replay layer. Single source of truth for:
//! - which sessions (profiles) are live and which connection produces each
//! - which pages each session has, and the last cached frame per page
//! - which viewers are watching which session
//!
//! Every registry is keyed by connection id and owned by the hub instance;
//! connections talk to their sockets through per-connection
//! [`mpsc::UnboundedSender`] queues, so all hub methods are synchronous and
//! never await while holding a registry entry.
//!
//! Streaming is demand-driven: the first viewer of a session triggers a
//! `start-streaming` signal to its producer, the last viewer leaving
//! triggers `stop-streaming`. Sessions are removed only by an explicit
//! `unregister-profile` or by their producer socket disconnecting; page
//! churn and viewer churn never remove a session, and there are no idle
//! cleanup timers (they would race a reconnecting producer).

use std::collections::{BTreeMap, HashSet};

use dashmap::DashMap;
use replay_protocol::{PageInfo, ReplayMessage};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Connection id assigned by the gateway, one per accepted socket.
pub type ConnId = String;

/// Sender half of a connection's outbound queue. The gateway's outbound
/// task drains it and serializes each message onto the socket.
pub type ClientTx = mpsc::UnboundedSender<ReplayMessage>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRole {
    /// Pushes screenshots and page lifecycle events for its sessions.
    Producer,
    /// Watches (and may remote-control) at most one session at a time.
    Viewer,
}

/// One record per socket accepted on the replay path.
#[derive(Debug, Clone)]
struct ClientRecord {
    tx: ClientTx,
    role: ClientRole,
    /// For a viewer: the session it is subscribed to, if any.
    /// For a producer: the session it registered most recently.
    uuid: Option<String>,
}

pub struct ReplayHub {
    /// All replay-path connections, keyed by connection id.
    clients: DashMap<ConnId, ClientRecord>,

    /// uuid → connection id of the authoritative producer. Exactly one
    /// producer per session; the most recent registration wins.
    active_profiles: DashMap<String, ConnId>,

    /// Producer connection id → the set of uuids it registered. One
    /// physical connection may register several sessions.
    conn_profiles: DashMap<ConnId, HashSet<String>>,

    /// uuid → page registry, ordered by page id.
    profile_pages: DashMap<String, BTreeMap<String, PageInfo>>,

    /// pageId → last frame (base64), replayed to late-joining viewers.
    last_screenshots: DashMap<String, String>,

    /// uuid → connection ids of the viewers currently watching it.
    profile_viewers: DashMap<String, HashSet<ConnId>>,
}

impl ReplayHub {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            active_profiles: DashMap::new(),
            conn_profiles: DashMap::new(),
            profile_pages: DashMap::new(),
            last_screenshots: DashMap::new(),
            profile_viewers: DashMap::new(),
        }
    }

    // ─── Connection Lifecycle ───────────────────────────────────

    /// Registers a freshly accepted replay connection, defaulting to the
    /// viewer role, and sends it the current session list plus the page
    /// list of every active session.
    pub fn register_client(&self, conn_id: &str, tx: ClientTx) {
        self.clients.insert(
            conn_id.to_string(),
            ClientRecord {
                tx: tx.clone(),
                role: ClientRole::Viewer,
                uuid: None,
            },
        );
        debug!("Replay client connected: {}", conn_id);

        let _ = tx.send(ReplayMessage::ProfilesUpdated {
            profiles: self.active_profile_ids(),
        });

        for entry in self.profile_pages.iter() {
            if !entry.value().is_empty() {
                let _ = tx.send(ReplayMessage::PagesUpdated {
                    uuid: entry.key().clone(),
                    pages: entry.value().values().cloned().collect(),
                });
            }
        }
    }

    /// Cleans up after a socket goes away. A producer's disconnect tears
    /// down every session it had registered; a viewer's disconnect runs
    /// the same last-viewer bookkeeping as an explicit unsubscribe.
    pub fn handle_disconnect(&self, conn_id: &str) {
        let record = self.clients.remove(conn_id).map(|(_, r)| r);

        if let Some((_, uuids)) = self.conn_profiles.remove(conn_id) {
            if !uuids.is_empty() {
                info!(
                    "Producer {} disconnected, cleaning up {} profile(s)",
                    conn_id,
                    uuids.len()
                );
            }
            for uuid in uuids {
                self.cleanup_profile(&uuid);
            }
        }

        if let Some(record) = record {
            if record.role == ClientRole::Viewer {
                if let Some(uuid) = record.uuid {
                    self.remove_viewer(&uuid, conn_id);
                    debug!("Viewer {} disconnected from {}", conn_id, uuid);
                }
            }
        }
    }

    // ─── Message Dispatch ───────────────────────────────────────

    /// Routes one validated inbound message to its handler. Variants that
    /// only ever flow outward are dropped with a warning.
    pub fn handle_message(&self, conn_id: &str, msg: ReplayMessage) {
        match msg {
            ReplayMessage::RegisterProfile { uuid } => self.handle_register_profile(conn_id, &uuid),
            ReplayMessage::UnregisterProfile { uuid } => {
                self.handle_unregister_profile(conn_id, &uuid)
            }
            ReplayMessage::Screenshot {
                uuid,
                page_id,
                page_title,
                base64,
                mouse_x,
                mouse_y,
            } => self.handle_screenshot(&uuid, &page_id, page_title, base64, mouse_x, mouse_y),
            ReplayMessage::Subscribe { uuid } => self.handle_subscribe(conn_id, &uuid),
            ReplayMessage::SubscribePage { uuid, page_id } => {
                self.handle_subscribe_page(conn_id, &uuid, &page_id)
            }
            ReplayMessage::PageOpened {
                uuid,
                page_id,
                page_title,
            } => self.handle_page_opened(&uuid, &page_id, page_title),
            ReplayMessage::PageClosed { uuid, page_id } => {
                self.handle_page_closed(&uuid, &page_id)
            }
            msg if msg.is_input_command() => self.handle_input_command(conn_id, msg),
            other => {
                warn!("Dropping message not valid inbound at the hub: {:?}", other);
            }
        }
    }

    // ─── Producer Operations ────────────────────────────────────

    fn handle_register_profile(&self, conn_id: &str, uuid: &str) {
        // If this profile is already owned by a different connection, evict
        // the old registration's bookkeeping. The old socket is not closed;
        // the most recent registration simply wins.
        let previous = self.active_profiles.get(uuid).map(|c| c.value().clone());
        if let Some(old_conn) = previous {
            if old_conn != conn_id {
                info!(
                    "Profile {} re-registering on {}, evicting old registration on {}",
                    uuid, conn_id, old_conn
                );
                let drained = {
                    if let Some(mut set) = self.conn_profiles.get_mut(&old_conn) {
                        set.remove(uuid);
                        set.is_empty()
                    } else {
                        false
                    }
                };
                if drained {
                    self.conn_profiles.remove(&old_conn);
                }
            }
        }

        if let Some(mut record) = self.clients.get_mut(conn_id) {
            record.role = ClientRole::Producer;
            record.uuid = Some(uuid.to_string());
        }
        self.active_profiles
            .insert(uuid.to_string(), conn_id.to_string());
        self.conn_profiles
            .entry(conn_id.to_string())
            .or_default()
            .insert(uuid.to_string());

        info!("Profile registered: {} (conn={})", uuid, conn_id);
        self.broadcast_all(ReplayMessage::ProfilesUpdated {
            profiles: self.active_profile_ids(),
        });
    }

    fn handle_unregister_profile(&self, conn_id: &str, uuid: &str) {
        info!("Profile unregistered: {}", uuid);
        let drained = {
            if let Some(mut set) = self.conn_profiles.get_mut(conn_id) {
                set.remove(uuid);
                set.is_empty()
            } else {
                false
            }
        };
        if drained {
            self.conn_profiles.remove(conn_id);
        }
        self.cleanup_profile(uuid);
    }

    fn handle_screenshot(
        &self,
        uuid: &str,
        page_id: &str,
        page_title: String,
        base64: String,
        mouse_x: Option<f64>,
        mouse_y: Option<f64>,
    ) {
        // Frames for sessions without an active producer are dropped.
        if !self.active_profiles.contains_key(uuid) {
            return;
        }

        let (is_new_page, pages) = {
            let mut pages = self.profile_pages.entry(uuid.to_string()).or_default();
            let is_new = !pages.contains_key(page_id);
            pages.insert(
                page_id.to_string(),
                PageInfo {
                    page_id: page_id.to_string(),
                    page_title: page_title.clone(),
                },
            );
            (is_new, pages.values().cloned().collect::<Vec<_>>())
        };

        self.last_screenshots
            .insert(page_id.to_string(), base64.clone());

        // First sighting of a page is announced cheaply to everyone.
        if is_new_page {
            self.broadcast_all(ReplayMessage::PageOpened {
                uuid: uuid.to_string(),
                page_id: page_id.to_string(),
                page_title: page_title.clone(),
            });
        }

        // The heavy payload goes only to viewers of this session.
        self.broadcast_to_profile(
            uuid,
            ReplayMessage::NewScreenshot {
                uuid: uuid.to_string(),
                page_id: page_id.to_string(),
                page_title: Some(page_title),
                base64,
                mouse_x,
                mouse_y,
            },
        );

        self.broadcast_all(ReplayMessage::PagesUpdated {
            uuid: uuid.to_string(),
            pages,
        });
    }

    fn handle_page_opened(&self, uuid: &str, page_id: &str, page_title: String) {
        if !self.active_profiles.contains_key(uuid) {
            return;
        }

        let pages = {
            let mut pages = self.profile_pages.entry(uuid.to_string()).or_default();
            pages.insert(
                page_id.to_string(),
                PageInfo {
                    page_id: page_id.to_string(),
                    page_title: page_title.clone(),
                },
            );
            pages.values().cloned().collect::<Vec<_>>()
        };

        info!("Page opened: {} ({}) in profile {}", page_id, page_title, uuid);

        self.broadcast_all(ReplayMessage::PageOpened {
            uuid: uuid.to_string(),
            page_id: page_id.to_string(),
            page_title,
        });
        self.broadcast_all(ReplayMessage::PagesUpdated {
            uuid: uuid.to_string(),
            pages,
        });
    }

    fn handle_page_closed(&self, uuid: &str, page_id: &str) {
        if !self.active_profiles.contains_key(uuid) {
            return;
        }
        let pages = match self.profile_pages.get_mut(uuid) {
            Some(mut pages) => {
                pages.remove(page_id);
                pages.values().cloned().collect::<Vec<_>>()
            }
            None => return,
        };

        self.last_screenshots.remove(page_id);

        info!("Page closed: {} in profile {}", page_id, uuid);

        // Updated page list first (possibly empty) to keep watchers in sync,
        // then the specific closure notification.
        self.broadcast_all(ReplayMessage::PagesUpdated {
            uuid: uuid.to_string(),
            pages,
        });
        self.broadcast_all(ReplayMessage::PageClosed {
            uuid: uuid.to_string(),
            page_id: page_id.to_string(),
        });
    }

    // ─── Viewer Operations ──────────────────────────────────────

    fn handle_subscribe(&self, conn_id: &str, uuid: &str) {
        self.detach_previous_subscription(conn_id, uuid);

        // An empty uuid unsubscribes from everything.
        if uuid.is_empty() {
            if let Some(mut record) = self.clients.get_mut(conn_id) {
                record.role = ClientRole::Viewer;
                record.uuid = None;
            }
            return;
        }

        if let Some(mut record) = self.clients.get_mut(conn_id) {
            record.role = ClientRole::Viewer;
            record.uuid = Some(uuid.to_string());
        }
        self.add_viewer(uuid, conn_id);

        // Catch the new viewer up on the session's pages.
        let pages = self
            .profile_pages
            .get(uuid)
            .map(|pages| pages.values().cloned().collect::<Vec<_>>());
        if let Some(pages) = pages {
            self.send_to(
                conn_id,
                ReplayMessage::PagesUpdated {
                    uuid: uuid.to_string(),
                    pages,
                },
            );
        }
    }

    fn handle_subscribe_page(&self, conn_id: &str, uuid: &str, page_id: &str) {
        self.detach_previous_subscription(conn_id, uuid);

        if let Some(mut record) = self.clients.get_mut(conn_id) {
            record.role = ClientRole::Viewer;
            record.uuid = Some(uuid.to_string());
        }
        debug!("Viewer {} subscribed to page {} in profile {}", conn_id, page_id, uuid);
        self.add_viewer(uuid, conn_id);

        // Replay the last cached frame so the viewer does not wait a full
        // capture interval for first paint.
        let cached = self.last_screenshots.get(page_id).map(|s| s.value().clone());
        if let Some(base64) = cached {
            self.send_to(
                conn_id,
                ReplayMessage::NewScreenshot {
                    uuid: uuid.to_string(),
                    page_id: page_id.to_string(),
                    page_title: None,
                    base64,
                    mouse_x: None,
                    mouse_y: None,
                },
            );
        }
    }

    /// If the connection was watching a different session, detach it from
    /// that session's viewer set first (running last-viewer bookkeeping).
    fn detach_previous_subscription(&self, conn_id: &str, new_uuid: &str) {
        let old_uuid = self.clients.get(conn_id).and_then(|record| {
            if record.role == ClientRole::Viewer {
                record.uuid.clone().filter(|u| u != new_uuid)
            } else {
                None
            }
        });
        if let Some(old) = old_uuid {
            self.remove_viewer(&old, conn_id);
            debug!("Viewer {} unsubscribed from {} (switching to {})", conn_id, old, new_uuid);
        }
    }

    // ─── Input Command Relay ────────────────────────────────────

    /// Forwards a remote-input command to the session's producer, but only
    /// when the sender is a viewer subscribed to exactly that session.
    /// Anything else is silently discarded; this is the authorization
    /// boundary for remote control.
    fn handle_input_command(&self, conn_id: &str, msg: ReplayMessage) {
        let uuid = match msg.uuid() {
            Some(uuid) => uuid.to_string(),
            None => return,
        };

        let authorized = self
            .clients
            .get(conn_id)
            .map(|record| {
                record.role == ClientRole::Viewer && record.uuid.as_deref() == Some(uuid.as_str())
            })
            .unwrap_or(false);
        if !authorized {
            return;
        }

        self.signal_producer(&uuid, msg);
    }

    // ─── Viewer Accounting ──────────────────────────────────────

    /// Adds a viewer to a session. The first viewer triggers a single
    /// `start-streaming` signal to the producer.
    fn add_viewer(&self, uuid: &str, conn_id: &str) {
        let is_first = {
            let mut viewers = self.profile_viewers.entry(uuid.to_string()).or_default();
            let was_empty = viewers.is_empty();
            viewers.insert(conn_id.to_string());
            was_empty
        };

        if is_first && self.active_profiles.contains_key(uuid) {
            self.signal_producer(
                uuid,
                ReplayMessage::StartStreaming {
                    uuid: uuid.to_string(),
                },
            );
            info!("Started streaming for profile {} (first viewer)", uuid);
        }
    }

    /// Removes a viewer from a session. The last viewer leaving triggers a
    /// single `stop-streaming` signal to the producer.
    fn remove_viewer(&self, uuid: &str, conn_id: &str) {
        let now_empty = {
            match self.profile_viewers.get_mut(uuid) {
                Some(mut viewers) => {
                    viewers.remove(conn_id);
                    viewers.is_empty()
                }
                None => return,
            }
        };

        if now_empty {
            self.profile_viewers.remove(uuid);
            if self.active_profiles.contains_key(uuid) {
                self.signal_producer(
                    uuid,
                    ReplayMessage::StopStreaming {
                        uuid: uuid.to_string(),
                    },
                );
                info!("Stopped streaming for profile {} (no viewers)", uuid);
            }
        }
    }

    // ─── Cleanup ────────────────────────────────────────────────

    /// Tears a session down completely: producer mapping, page registry,
    /// cached frames. Viewers are told the stream ended and everyone gets
    /// the updated session list.
    fn cleanup_profile(&self, uuid: &str) {
        debug!("Cleaning up profile {}", uuid);

        self.active_profiles.remove(uuid);

        if let Some((_, pages)) = self.profile_pages.remove(uuid) {
            for page in pages.values() {
                self.last_screenshots.remove(&page.page_id);
            }
        }

        self.broadcast_all(ReplayMessage::StreamEnded {
            uuid: uuid.to_string(),
        });
        self.broadcast_all(ReplayMessage::ProfilesUpdated {
            profiles: self.active_profile_ids(),
        });
    }

    // ─── Broadcast Helpers ──────────────────────────────────────

    /// Sends a message to every connected replay socket.
    fn broadcast_all(&self, msg: ReplayMessage) {
        for entry in self.clients.iter() {
            let _ = entry.value().tx.send(msg.clone());
        }
    }

    /// Sends a message only to viewers currently subscribed to `uuid`.
    /// Screenshot bytes never reach sockets that are not watching.
    fn broadcast_to_profile(&self, uuid: &str, msg: ReplayMessage) {
        let mut sent = 0usize;
        for entry in self.clients.iter() {
            let record = entry.value();
            if record.role == ClientRole::Viewer && record.uuid.as_deref() == Some(uuid) {
                let _ = record.tx.send(msg.clone());
                sent += 1;
            }
        }
        if sent == 0 {
            if let ReplayMessage::NewScreenshot { .. } = msg {
                debug!("No viewers subscribed to profile {} for screenshot", uuid);
            }
        }
    }

    fn send_to(&self, conn_id: &str, msg: ReplayMessage) {
        if let Some(record) = self.clients.get(conn_id) {
            let _ = record.tx.send(msg);
        }
    }

    fn signal_producer(&self, uuid: &str, msg: ReplayMessage) {
        let producer = self.active_profiles.get(uuid).map(|c| c.value().clone());
        if let Some(conn_id) = producer {
            self.send_to(&conn_id, msg);
        }
    }

    // ─── Introspection ──────────────────────────────────────────

    pub fn active_profile_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active_profiles.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn total_pages(&self) -> usize {
        self.profile_pages.iter().map(|e| e.value().len()).sum()
    }

    pub fn viewer_count(&self, uuid: &str) -> usize {
        self.profile_viewers.get(uuid).map(|v| v.len()).unwrap_or(0)
    }
}

impl Default for ReplayHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn connect(hub: &ReplayHub, name: &str) -> (String, UnboundedReceiver<ReplayMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        hub.register_client(name, tx);
        (name.to_string(), rx)
    }

    fn drain(rx: &mut UnboundedReceiver<ReplayMessage>) -> Vec<ReplayMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn screenshot(uuid: &str, page_id: &str, data: &str) -> ReplayMessage {
        ReplayMessage::Screenshot {
            uuid: uuid.into(),
            page_id: page_id.into(),
            page_title: "Example".into(),
            base64: data.into(),
            mouse_x: Some(10.0),
            mouse_y: Some(20.0),
        }
    }

    fn mouse_move(uuid: &str, page_id: &str) -> ReplayMessage {
        ReplayMessage::MouseMove {
            uuid: uuid.into(),
            page_id: page_id.into(),
            x: 5.0,
            y: 6.0,
        }
    }

    #[test]
    fn new_connection_receives_current_state() {
        let hub = ReplayHub::new();
        let (producer, _prx) = connect(&hub, "producer");
        hub.handle_message(&producer, ReplayMessage::RegisterProfile { uuid: "A".into() });
        hub.handle_message(&producer, screenshot("A", "p1", "Zm8="));

        let (_late, mut rx) = connect(&hub, "late-viewer");
        let msgs = drain(&mut rx);
        assert!(msgs.iter().any(|m| matches!(
            m,
            ReplayMessage::ProfilesUpdated { profiles } if profiles == &vec!["A".to_string()]
        )));
        assert!(msgs.iter().any(|m| matches!(
            m,
            ReplayMessage::PagesUpdated { uuid, pages } if uuid == "A" && pages.len() == 1
        )));
    }

    #[test]
    fn last_register_wins() {
        let hub = ReplayHub::new();
        let (first, mut first_rx) = connect(&hub, "first");
        let (second, mut second_rx) = connect(&hub, "second");
        let (viewer, _vrx) = connect(&hub, "viewer");

        hub.handle_message(&first, ReplayMessage::RegisterProfile { uuid: "A".into() });
        hub.handle_message(&second, ReplayMessage::RegisterProfile { uuid: "A".into() });
        hub.handle_message(&viewer, ReplayMessage::Subscribe { uuid: "A".into() });

        drain(&mut first_rx);
        drain(&mut second_rx);

        // Input commands land on the most recent registrant only.
        hub.handle_message(&viewer, mouse_move("A", "p1"));
        assert!(drain(&mut first_rx).is_empty());
        assert_eq!(drain(&mut second_rx), vec![mouse_move("A", "p1")]);
    }

    #[test]
    fn takeover_leaves_old_connections_other_sessions_intact() {
        let hub = ReplayHub::new();
        let (old, _orx) = connect(&hub, "old");
        let (new, _nrx) = connect(&hub, "new");
        let (_watch, mut wrx) = connect(&hub, "watch");

        hub.handle_message(&old, ReplayMessage::RegisterProfile { uuid: "A".into() });
        hub.handle_message(&old, ReplayMessage::RegisterProfile { uuid: "B".into() });
        hub.handle_message(&new, ReplayMessage::RegisterProfile { uuid: "A".into() });

        assert_eq!(hub.active_profile_ids(), vec!["A".to_string(), "B".to_string()]);

        // Old producer going away must only tear down the session it still
        // owns (B), not the one that was taken over (A).
        drain(&mut wrx);
        hub.handle_disconnect(&old);
        assert_eq!(hub.active_profile_ids(), vec!["A".to_string()]);
        let msgs = drain(&mut wrx);
        assert!(msgs.contains(&ReplayMessage::StreamEnded { uuid: "B".into() }));
        assert!(!msgs.contains(&ReplayMessage::StreamEnded { uuid: "A".into() }));
    }

    #[test]
    fn viewer_accounting_signals_exactly_once() {
        let hub = ReplayHub::new();
        let (producer, mut prx) = connect(&hub, "producer");
        let (v1, _rx1) = connect(&hub, "v1");
        let (v2, _rx2) = connect(&hub, "v2");

        hub.handle_message(&producer, ReplayMessage::RegisterProfile { uuid: "A".into() });
        drain(&mut prx);

        hub.handle_message(&v1, ReplayMessage::Subscribe { uuid: "A".into() });
        assert_eq!(
            drain(&mut prx),
            vec![ReplayMessage::StartStreaming { uuid: "A".into() }]
        );

        // Second viewer: no further signal.
        hub.handle_message(&v2, ReplayMessage::Subscribe { uuid: "A".into() });
        assert!(drain(&mut prx).is_empty());

        // First viewer leaves: still one watching, no signal.
        hub.handle_message(&v1, ReplayMessage::Subscribe { uuid: String::new() });
        assert!(drain(&mut prx).is_empty());

        // Last viewer disconnects: exactly one stop signal.
        hub.handle_disconnect(&v2);
        assert_eq!(
            drain(&mut prx),
            vec![ReplayMessage::StopStreaming { uuid: "A".into() }]
        );
    }

    #[test]
    fn session_with_no_viewers_never_sees_start_streaming() {
        let hub = ReplayHub::new();
        let (producer, mut prx) = connect(&hub, "producer");
        hub.handle_message(&producer, ReplayMessage::RegisterProfile { uuid: "A".into() });
        hub.handle_message(&producer, screenshot("A", "p1", "Zm8="));
        hub.handle_message(
            &producer,
            ReplayMessage::PageClosed { uuid: "A".into(), page_id: "p1".into() },
        );

        assert!(!drain(&mut prx)
            .iter()
            .any(|m| matches!(m, ReplayMessage::StartStreaming { .. })));
    }

    #[test]
    fn screenshots_reach_only_subscribed_viewers() {
        let hub = ReplayHub::new();
        let (producer, _prx) = connect(&hub, "producer");
        let (watching, mut watching_rx) = connect(&hub, "watching");
        let (elsewhere, mut elsewhere_rx) = connect(&hub, "elsewhere");
        let (idle, mut idle_rx) = connect(&hub, "idle");

        hub.handle_message(&producer, ReplayMessage::RegisterProfile { uuid: "A".into() });
        hub.handle_message(&producer, ReplayMessage::RegisterProfile { uuid: "B".into() });
        hub.handle_message(&watching, ReplayMessage::Subscribe { uuid: "A".into() });
        hub.handle_message(&elsewhere, ReplayMessage::Subscribe { uuid: "B".into() });
        drain(&mut watching_rx);
        drain(&mut elsewhere_rx);
        drain(&mut idle_rx);

        hub.handle_message(&producer, screenshot("A", "p1", "aGVhdnk="));

        assert!(drain(&mut watching_rx)
            .iter()
            .any(|m| matches!(m, ReplayMessage::NewScreenshot { uuid, .. } if uuid == "A")));
        assert!(!drain(&mut elsewhere_rx)
            .iter()
            .any(|m| matches!(m, ReplayMessage::NewScreenshot { .. })));
        assert!(!drain(&mut idle_rx)
            .iter()
            .any(|m| matches!(m, ReplayMessage::NewScreenshot { .. })));
    }

    #[test]
    fn first_screenshot_announces_page_to_everyone() {
        let hub = ReplayHub::new();
        let (producer, _prx) = connect(&hub, "producer");
        let (_idle, mut idle_rx) = connect(&hub, "idle");

        hub.handle_message(&producer, ReplayMessage::RegisterProfile { uuid: "A".into() });
        drain(&mut idle_rx);

        hub.handle_message(&producer, screenshot("A", "p1", "Zm8="));
        let msgs = drain(&mut idle_rx);
        assert!(msgs.iter().any(|m| matches!(
            m,
            ReplayMessage::PageOpened { page_id, .. } if page_id == "p1"
        )));

        // Second frame for a known page: list update only, no re-announce.
        hub.handle_message(&producer, screenshot("A", "p1", "YmFy"));
        assert!(!drain(&mut idle_rx)
            .iter()
            .any(|m| matches!(m, ReplayMessage::PageOpened { .. })));
    }

    #[test]
    fn screenshots_for_unregistered_sessions_are_dropped() {
        let hub = ReplayHub::new();
        let (producer, _prx) = connect(&hub, "producer");
        let (_idle, mut idle_rx) = connect(&hub, "idle");
        drain(&mut idle_rx);

        hub.handle_message(&producer, screenshot("ghost", "p1", "Zm8="));
        assert!(drain(&mut idle_rx).is_empty());
        assert_eq!(hub.total_pages(), 0);
    }

    #[test]
    fn subscribe_page_replays_cached_frame_immediately() {
        let hub = ReplayHub::new();
        let (producer, _prx) = connect(&hub, "producer");
        hub.handle_message(&producer, ReplayMessage::RegisterProfile { uuid: "A".into() });
        hub.handle_message(&producer, screenshot("A", "p1", "Y2FjaGVk"));

        let (viewer, mut vrx) = connect(&hub, "viewer");
        drain(&mut vrx);
        hub.handle_message(
            &viewer,
            ReplayMessage::SubscribePage { uuid: "A".into(), page_id: "p1".into() },
        );

        let msgs = drain(&mut vrx);
        assert!(msgs.iter().any(|m| matches!(
            m,
            ReplayMessage::NewScreenshot { page_id, base64, page_title, .. }
                if page_id == "p1" && base64 == "Y2FjaGVk" && page_title.is_none()
        )));
    }

    #[test]
    fn page_close_purges_cached_frame() {
        let hub = ReplayHub::new();
        let (producer, _prx) = connect(&hub, "producer");
        hub.handle_message(&producer, ReplayMessage::RegisterProfile { uuid: "A".into() });
        hub.handle_message(&producer, screenshot("A", "p1", "Y2FjaGVk"));
        hub.handle_message(
            &producer,
            ReplayMessage::PageClosed { uuid: "A".into(), page_id: "p1".into() },
        );

        let (viewer, mut vrx) = connect(&hub, "viewer");
        drain(&mut vrx);
        hub.handle_message(
            &viewer,
            ReplayMessage::SubscribePage { uuid: "A".into(), page_id: "p1".into() },
        );
        assert!(!drain(&mut vrx)
            .iter()
            .any(|m| matches!(m, ReplayMessage::NewScreenshot { .. })));
    }

    #[test]
    fn page_churn_never_removes_the_session() {
        let hub = ReplayHub::new();
        let (producer, _prx) = connect(&hub, "producer");
        hub.handle_message(&producer, ReplayMessage::RegisterProfile { uuid: "A".into() });
        hub.handle_message(&producer, screenshot("A", "p1", "Zm8="));
        hub.handle_message(
            &producer,
            ReplayMessage::PageClosed { uuid: "A".into(), page_id: "p1".into() },
        );

        assert_eq!(hub.active_profile_ids(), vec!["A".to_string()]);

        hub.handle_message(&producer, ReplayMessage::UnregisterProfile { uuid: "A".into() });
        assert!(hub.active_profile_ids().is_empty());
    }

    #[test]
    fn input_commands_require_matching_viewer_subscription() {
        let hub = ReplayHub::new();
        let (producer, mut prx) = connect(&hub, "producer");
        let (other_viewer, _orx) = connect(&hub, "other-viewer");
        let (viewer, _vrx) = connect(&hub, "viewer");

        hub.handle_message(&producer, ReplayMessage::RegisterProfile { uuid: "A".into() });
        hub.handle_message(&producer, ReplayMessage::RegisterProfile { uuid: "B".into() });
        hub.handle_message(&other_viewer, ReplayMessage::Subscribe { uuid: "B".into() });
        hub.handle_message(&viewer, ReplayMessage::Subscribe { uuid: "A".into() });
        drain(&mut prx);

        // Viewer of B may not drive A.
        hub.handle_message(&other_viewer, mouse_move("A", "p1"));
        assert!(drain(&mut prx).is_empty());

        // A producer connection may not inject input either.
        hub.handle_message(&producer, mouse_move("A", "p1"));
        assert!(drain(&mut prx).is_empty());

        // The subscribed viewer's command is forwarded verbatim.
        let cmd = ReplayMessage::KeyboardPress {
            uuid: "A".into(),
            page_id: "p1".into(),
            key: "Enter".into(),
            modifiers: Some(replay_protocol::KeyModifiers { ctrl: true, ..Default::default() }),
        };
        hub.handle_message(&viewer, cmd.clone());
        assert_eq!(drain(&mut prx), vec![cmd]);
    }

    #[test]
    fn producer_disconnect_ends_all_its_sessions() {
        let hub = ReplayHub::new();
        let (producer, _prx) = connect(&hub, "producer");
        let (viewer, mut vrx) = connect(&hub, "viewer");

        hub.handle_message(&producer, ReplayMessage::RegisterProfile { uuid: "A".into() });
        hub.handle_message(&producer, ReplayMessage::RegisterProfile { uuid: "B".into() });
        hub.handle_message(&producer, screenshot("A", "p1", "Zm8="));
        hub.handle_message(&viewer, ReplayMessage::Subscribe { uuid: "A".into() });
        drain(&mut vrx);

        hub.handle_disconnect(&producer);

        let msgs = drain(&mut vrx);
        assert!(msgs.contains(&ReplayMessage::StreamEnded { uuid: "A".into() }));
        assert!(msgs.contains(&ReplayMessage::StreamEnded { uuid: "B".into() }));
        assert!(hub.active_profile_ids().is_empty());
        assert_eq!(hub.total_pages(), 0);
    }

    #[test]
    fn lifecycle_scenario_register_watch_disconnect_reregister() {
        let hub = ReplayHub::new();
        let (producer, mut prx) = connect(&hub, "producer");
        hub.handle_message(&producer, ReplayMessage::RegisterProfile { uuid: "A".into() });
        hub.handle_message(&producer, screenshot("A", "p1", "Zm8="));

        let (viewer, _vrx) = connect(&hub, "viewer");
        hub.handle_message(&viewer, ReplayMessage::Subscribe { uuid: "A".into() });
        drain(&mut prx);

        hub.handle_disconnect(&viewer);
        assert_eq!(
            drain(&mut prx),
            vec![ReplayMessage::StopStreaming { uuid: "A".into() }]
        );

        hub.handle_disconnect(&producer);
        assert!(hub.active_profile_ids().is_empty());

        // A fresh registration is a brand-new session with no stale pages.
        let (reborn, _rrx) = connect(&hub, "reborn");
        hub.handle_message(&reborn, ReplayMessage::RegisterProfile { uuid: "A".into() });
        assert_eq!(hub.active_profile_ids(), vec!["A".to_string()]);
        assert_eq!(hub.total_pages(), 0);
        assert_eq!(hub.viewer_count("A"), 0);
    }
}
