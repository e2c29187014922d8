//! # Server State
//!
//! Holds the shared application state for the replay server:
//! - the **Replay Hub** (session pub/sub and viewer accounting)
//! - the **Browser Connection Proxy** (backend multiplexing)
//! - the **Auth Manager** (proxy-path authorization)
//! - the loaded configuration
//!
//! The state is cloned into each request handler; the components inside
//! are `Arc`-shared and own their concurrent registries themselves.

use std::sync::Arc;

use crate::auth::AuthManager;
use crate::config::Config;
use crate::hub::ReplayHub;
use crate::proxy::BrowserProxy;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<ReplayHub>,
    pub proxy: Arc<BrowserProxy>,
    pub auth: Arc<AuthManager>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let auth = AuthManager::new(&config);
        Self {
            hub: Arc::new(ReplayHub::new()),
            proxy: Arc::new(BrowserProxy::new()),
            auth: Arc::new(auth),
            config: Arc::new(config),
        }
    }
}
