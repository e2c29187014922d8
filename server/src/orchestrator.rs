//! # Backend Pool Orchestrator
//!
//! Launches and supervises the pool of backend browser-automation servers
//! that the Browser Connection Proxy load-balances across. Backend process
//! setup (binary download, fingerprint configuration) is an external
//! concern hidden behind the [`BackendLauncher`] trait; the orchestrator
//! only cares about endpoints and exit events.
//!
//! Recovery is crash-only: a backend that closes unexpectedly is removed
//! from the live pool immediately and a replacement is launched after a
//! short delay, up to a bounded number of attempts. Exceeding the cap is a
//! loudly logged terminal condition that requires operator intervention;
//! a successful restart resets the counter.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::proxy::BrowserProxy;

/// Delay before a crashed backend is relaunched, to avoid rapid loops.
const RESTART_DELAY: Duration = Duration::from_secs(2);

// ─── External Seams ─────────────────────────────────────────────

/// Launches one backend browser-automation server.
#[async_trait]
pub trait BackendLauncher: Send + Sync + 'static {
    async fn launch(&self) -> anyhow::Result<Box<dyn BackendHandle>>;
}

/// A running backend: its reachable endpoint plus its exit event.
#[async_trait]
pub trait BackendHandle: Send + 'static {
    fn endpoint(&self) -> &str;
    /// Resolves when the backend process is gone, however it died.
    async fn wait_closed(&mut self);
    async fn shutdown(&mut self);
}

// ─── Orchestrator ───────────────────────────────────────────────

pub struct BackendOrchestrator {
    launcher: Arc<dyn BackendLauncher>,
    proxy: Arc<BrowserProxy>,
    pool_size: usize,
    max_restart_attempts: u32,
    restart_delay: Duration,
    restart_attempts: AtomicU32,
    shutting_down: AtomicBool,
    endpoints: Mutex<Vec<String>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl BackendOrchestrator {
    pub fn new(launcher: Arc<dyn BackendLauncher>, proxy: Arc<BrowserProxy>, config: &Config) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            launcher,
            proxy,
            pool_size: config.backend_pool_size,
            max_restart_attempts: config.max_restart_attempts,
            restart_delay: RESTART_DELAY,
            restart_attempts: AtomicU32::new(0),
            shutting_down: AtomicBool::new(false),
            endpoints: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    #[cfg(test)]
    fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    /// Launches the full pool and publishes it to the proxy. Any launch
    /// failure here is fatal; a half-started pool is not useful.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        info!("Launching {} backend browser server(s)...", self.pool_size);
        for i in 0..self.pool_size {
            let handle = self
                .launcher
                .launch()
                .await
                .with_context(|| format!("failed to launch backend server {}", i + 1))?;
            info!(
                "Backend server {}/{} started: {}",
                i + 1,
                self.pool_size,
                handle.endpoint()
            );
            self.adopt_backend(handle);
        }
        Ok(())
    }

    /// Stops supervision and shuts every live backend down.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }

    pub fn live_endpoints(&self) -> Vec<String> {
        self.endpoints.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Adds a backend to the live pool and spawns its exit monitor.
    fn adopt_backend(self: &Arc<Self>, mut handle: Box<dyn BackendHandle>) {
        let endpoint = handle.endpoint().to_string();
        {
            let mut endpoints = self.endpoints.lock().unwrap_or_else(|e| e.into_inner());
            endpoints.push(endpoint.clone());
        }
        self.publish_pool();

        let orchestrator = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = handle.wait_closed() => {
                    orchestrator.handle_backend_crash(endpoint).await;
                }
                _ = shutdown_rx.recv() => {
                    handle.shutdown().await;
                }
            }
        });
    }

    /// Removes the crashed backend from the pool and attempts a bounded
    /// restart.
    async fn handle_backend_crash(self: &Arc<Self>, endpoint: String) {
        if self.shutting_down.load(Ordering::SeqCst) {
            info!("Shutting down, skipping restart of {}", endpoint);
            return;
        }

        error!("Backend server closed unexpectedly: {}", endpoint);
        {
            let mut endpoints = self.endpoints.lock().unwrap_or_else(|e| e.into_inner());
            endpoints.retain(|e| e != &endpoint);
        }
        self.publish_pool();

        let attempts = self.restart_attempts.load(Ordering::SeqCst);
        if attempts >= self.max_restart_attempts {
            error!(
                "Max restart attempts ({}) reached. Manual intervention required.",
                self.max_restart_attempts
            );
            return;
        }
        self.restart_attempts.fetch_add(1, Ordering::SeqCst);
        info!(
            "Attempting to restart backend server (attempt {}/{})...",
            attempts + 1,
            self.max_restart_attempts
        );

        tokio::time::sleep(self.restart_delay).await;

        match self.launcher.launch().await {
            Ok(handle) => {
                info!("Backend server restarted: {}", handle.endpoint());
                self.restart_attempts.store(0, Ordering::SeqCst);
                self.adopt_backend(handle);
            }
            Err(err) => {
                // The next crash retries while still under the cap.
                error!("Failed to restart backend server: {}", err);
            }
        }
    }

    fn publish_pool(&self) {
        self.proxy.set_backend_servers(self.live_endpoints());
    }
}

// ─── Process Launcher ───────────────────────────────────────────

/// Launches backends as local child processes. Each backend gets its own
/// port counted up from the configured base; its WebSocket endpoint is
/// derived from that port.
pub struct ProcessBackendLauncher {
    command: String,
    next_port: AtomicU16,
}

impl ProcessBackendLauncher {
    pub fn new(config: &Config) -> Self {
        Self {
            command: config.backend_command.clone(),
            next_port: AtomicU16::new(config.backend_base_port),
        }
    }
}

#[async_trait]
impl BackendLauncher for ProcessBackendLauncher {
    async fn launch(&self) -> anyhow::Result<Box<dyn BackendHandle>> {
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);
        let mut parts = self.command.split_whitespace();
        let program = parts.next().context("backend command is empty")?;

        let child = Command::new(program)
            .args(parts)
            .arg("--port")
            .arg(port.to_string())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn backend command '{}'", self.command))?;

        Ok(Box::new(ProcessBackendHandle {
            endpoint: format!("ws://127.0.0.1:{}", port),
            child,
        }))
    }
}

struct ProcessBackendHandle {
    endpoint: String,
    child: tokio::process::Child,
}

#[async_trait]
impl BackendHandle for ProcessBackendHandle {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn wait_closed(&mut self) {
        match self.child.wait().await {
            Ok(status) => warn!("Backend process exited with {}", status),
            Err(err) => warn!("Backend process wait failed: {}", err),
        }
    }

    async fn shutdown(&mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}
