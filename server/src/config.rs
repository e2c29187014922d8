//! # Server Configuration
//!
//! Env-driven configuration with defaults suitable for local development.
//! All knobs of the replay server live here: bind address, the two fixed
//! WebSocket paths, authentication material, and the backend pool shape.

use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    /// Bind host, default `0.0.0.0`.
    pub host: String,
    /// Bind port, default 9000.
    pub port: u16,
    /// Path for authenticated browser-proxy traffic.
    pub proxy_path: String,
    /// Path for unauthenticated replay traffic.
    pub replay_path: String,
    /// Bearer tokens accepted on the proxy path.
    pub auth_tokens: Vec<String>,
    /// Optional basic-auth user/password pair for the proxy path.
    pub basic_auth: Option<(String, String)>,
    /// Disables proxy-path authentication entirely (local development).
    pub skip_auth: bool,
    /// Number of backend browser servers to launch.
    pub backend_pool_size: usize,
    /// Command used to launch one backend browser server.
    pub backend_command: String,
    /// First port handed to launched backends; subsequent backends count up.
    pub backend_base_port: u16,
    /// Restart attempts allowed before giving up on crashed backends.
    pub max_restart_attempts: u32,
}

impl Config {
    pub fn from_env() -> Self {
        let auth_tokens: Vec<String> = env::var("REPLAY_API_TOKENS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let basic_auth = match (env::var("REPLAY_BASIC_USER").ok(), env::var("REPLAY_BASIC_PASS").ok()) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => Some((user, pass)),
            _ => None,
        };

        Self {
            host: env::var("REPLAY_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env::var("REPLAY_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(9000),
            proxy_path: env::var("REPLAY_PROXY_PATH").unwrap_or_else(|_| "/browser".into()),
            replay_path: env::var("REPLAY_REPLAY_PATH").unwrap_or_else(|_| "/replay".into()),
            auth_tokens,
            basic_auth,
            skip_auth: env::var("REPLAY_SKIP_AUTH")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            backend_pool_size: env::var("REPLAY_BACKEND_POOL_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            backend_command: env::var("REPLAY_BACKEND_COMMAND")
                .unwrap_or_else(|_| "browser-server".into()),
            backend_base_port: env::var("REPLAY_BACKEND_BASE_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(9222),
            max_restart_attempts: env::var("REPLAY_MAX_RESTART_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
        }
    }
}
