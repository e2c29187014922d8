//! Shared data types for the replay client: manager API records, proxy
//! configuration, and usage accounting records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Server assignment handed out by the fleet manager: where to open the
/// browser connection and where to push replay traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerAssignment {
    pub server_ip: String,
    pub browser_ws_url: String,
    pub replay_ws_url: String,
}

/// One stored browser profile. The `data` payload (storage state,
/// fingerprint seeds) is opaque to this layer; the profile store owns its
/// schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub browser_id: String,
    pub data: serde_json::Value,
}

impl ProfileRecord {
    /// A fresh profile with empty storage state and a random font spacing
    /// seed, as created for brand-new or one-time sessions.
    pub fn fresh(browser_id: &str) -> Self {
        Self {
            browser_id: browser_id.to_string(),
            data: json!({
                "fontSpacingSeed": rand::random::<u32>() % 100_000_000,
                "storageState": {
                    "cookies": [],
                    "origins": [],
                },
            }),
        }
    }
}

/// Proxy credentials as stored by the manager, by numeric id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyCredentials {
    pub entry: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

/// A profile plus the proxy credentials bound to it, as returned by the
/// manager's profile lookup.
#[derive(Debug, Clone, Deserialize)]
pub struct ProfileBundle {
    pub profile: ProfileRecord,
    #[serde(default)]
    pub proxy: Option<ProxyCredentials>,
}

/// Proxy settings in the shape a browser context consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyConfig {
    pub server: String,
    pub username: String,
    pub password: String,
}

impl From<&ProxyCredentials> for ProxyConfig {
    fn from(creds: &ProxyCredentials) -> Self {
        Self {
            server: format!("{}:{}", creds.entry, creds.port),
            username: creds.username.clone(),
            password: creds.password.clone(),
        }
    }
}

/// Aggregated network usage for one session, posted to the manager when
/// the session closes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub browser_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub bytes: u64,
}
