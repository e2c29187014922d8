//! # Gateway Authorization
//!
//! Authorization for the browser-proxy path: a bearer token checked
//! against a configured allow-list, or HTTP basic credentials. The replay
//! path never goes through this; viewers connect unauthenticated by
//! design (see the gateway module).

use axum::http::HeaderMap;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::{info, warn};

use crate::config::Config;

#[derive(Debug, PartialEq, Eq)]
pub struct BasicCredentials {
    pub user: String,
    pub pass: String,
}

pub struct AuthManager {
    auth_tokens: Vec<String>,
    basic_auth: Option<(String, String)>,
    skip_auth: bool,
}

impl AuthManager {
    pub fn new(config: &Config) -> Self {
        Self {
            auth_tokens: config.auth_tokens.clone(),
            basic_auth: config.basic_auth.clone(),
            skip_auth: config.skip_auth,
        }
    }

    /// Parses an `Authorization: Basic ...` header value.
    pub fn parse_basic_auth(header: &str) -> Option<BasicCredentials> {
        let encoded = header.strip_prefix("Basic ").or_else(|| header.strip_prefix("basic "))?;
        let decoded = BASE64.decode(encoded.trim()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, pass) = decoded.split_once(':')?;
        Some(BasicCredentials {
            user: user.to_string(),
            pass: pass.to_string(),
        })
    }

    /// Validates an `Authorization: Bearer ...` header value against the
    /// configured token allow-list.
    fn validate_bearer_token(&self, header: &str) -> bool {
        let token = match header.strip_prefix("Bearer ").or_else(|| header.strip_prefix("bearer ")) {
            Some(token) => token.trim(),
            None => return false,
        };
        !token.is_empty() && self.auth_tokens.iter().any(|t| t == token)
    }

    /// Whether a proxy-path upgrade request is authorized.
    pub fn is_request_authorized(&self, headers: &HeaderMap) -> bool {
        if self.skip_auth {
            return true;
        }

        let header = match headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
        {
            Some(header) => header,
            None => return false,
        };

        if !self.auth_tokens.is_empty() && self.validate_bearer_token(header) {
            return true;
        }

        if let Some((user, pass)) = &self.basic_auth {
            if let Some(credentials) = Self::parse_basic_auth(header) {
                if &credentials.user == user && &credentials.pass == pass {
                    return true;
                }
            }
        }

        false
    }

    /// Logs the authentication configuration once at startup.
    pub fn log_auth_status(&self) {
        if self.skip_auth {
            warn!("Authentication disabled (local mode)");
        } else if !self.auth_tokens.is_empty() {
            info!("Bearer token authentication configured ({} token(s))", self.auth_tokens.len());
        } else if self.basic_auth.is_some() {
            info!("Basic authentication configured");
        } else {
            warn!("No authentication configured! Set REPLAY_API_TOKENS.");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::AUTHORIZATION;

    fn manager(tokens: Vec<&str>, basic: Option<(&str, &str)>) -> AuthManager {
        AuthManager {
            auth_tokens: tokens.into_iter().map(String::from).collect(),
            basic_auth: basic.map(|(u, p)| (u.to_string(), p.to_string())),
            skip_auth: false,
        }
    }

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, value.parse().unwrap());
        headers
    }

    #[test]
    fn bearer_token_must_be_on_the_allow_list() {
        let auth = manager(vec!["secret-token"], None);
        assert!(auth.is_request_authorized(&headers_with("Bearer secret-token")));
        assert!(!auth.is_request_authorized(&headers_with("Bearer wrong")));
        assert!(!auth.is_request_authorized(&headers_with("Bearer ")));
        assert!(!auth.is_request_authorized(&HeaderMap::new()));
    }

    #[test]
    fn basic_credentials_accepted_when_configured() {
        let auth = manager(vec![], Some(("ops", "hunter2")));
        let encoded = BASE64.encode("ops:hunter2");
        assert!(auth.is_request_authorized(&headers_with(&format!("Basic {}", encoded))));

        let wrong = BASE64.encode("ops:wrong");
        assert!(!auth.is_request_authorized(&headers_with(&format!("Basic {}", wrong))));
    }

    #[test]
    fn parse_basic_auth_handles_colons_in_password() {
        let encoded = BASE64.encode("user:pa:ss");
        let creds = AuthManager::parse_basic_auth(&format!("Basic {}", encoded)).unwrap();
        assert_eq!(
            creds,
            BasicCredentials { user: "user".into(), pass: "pa:ss".into() }
        );

        assert!(AuthManager::parse_basic_auth("Basic not-base64!!").is_none());
        assert!(AuthManager::parse_basic_auth("Bearer abc").is_none());
    }

    #[test]
    fn skip_auth_allows_everything() {
        let mut auth = manager(vec![], None);
        auth.skip_auth = true;
        assert!(auth.is_request_authorized(&HeaderMap::new()));
    }
}
