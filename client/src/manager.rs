//! # Manager API Client
//!
//! Thin HTTP client for the fleet manager: server assignment, profile
//! CRUD, storage-state upload, and the fire-and-forget audit/usage log
//! sinks. Only the assignment and profile lookups surface errors to the
//! caller; the log sinks and storage upload swallow theirs by contract.

use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::{debug, error};

use crate::error::ClientError;
use crate::types::{ProfileBundle, ProfileRecord, ServerAssignment, UsageRecord};

const DEFAULT_MANAGER_URL: &str = "http://127.0.0.1:8080";

pub struct ManagerClient {
    base_url: String,
    http: reqwest::Client,
}

impl ManagerClient {
    /// Uses the given base URL, falling back to `REPLAY_MANAGER_URL` and
    /// then the local default.
    pub fn new(manager_url: Option<String>) -> Self {
        let base_url = manager_url
            .or_else(|| std::env::var("REPLAY_MANAGER_URL").ok())
            .unwrap_or_else(|| DEFAULT_MANAGER_URL.to_string());
        Self {
            base_url,
            http: reqwest::Client::new(),
        }
    }

    /// Asks the manager which server this client should use.
    pub async fn get_server_assignment(&self) -> Result<ServerAssignment, ClientError> {
        let assignment: ServerAssignment = self
            .http
            .get(format!("{}/api/assign-server", self.base_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        debug!("Assigned to server {}", assignment.server_ip);
        Ok(assignment)
    }

    pub async fn list_profiles(&self) -> Result<Vec<ProfileRecord>, ClientError> {
        Ok(self
            .http
            .get(format!("{}/api/profiles", self.base_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    /// Fetches one profile together with its bound proxy credentials.
    pub async fn get_profile(&self, browser_id: &str) -> Result<ProfileBundle, ClientError> {
        let response = self
            .http
            .get(format!("{}/api/profiles/{}", self.base_url, browser_id))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(ClientError::ProfileNotFound(browser_id.to_string()));
        }
        Ok(response.error_for_status()?.json().await?)
    }

    pub async fn create_profile(
        &self,
        browser_id: &str,
        profile_data: &Value,
        proxy_id: Option<i64>,
    ) -> Result<(), ClientError> {
        self.http
            .post(format!("{}/api/profiles", self.base_url))
            .json(&json!({
                "browserId": browser_id,
                "profileData": profile_data,
                "proxyId": proxy_id,
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn update_profile(
        &self,
        browser_id: &str,
        profile_data: &Value,
        proxy_id: Option<i64>,
    ) -> Result<(), ClientError> {
        self.http
            .patch(format!("{}/api/profiles/{}", self.base_url, browser_id))
            .json(&json!({
                "profileData": profile_data,
                "proxyId": proxy_id,
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn delete_profile(&self, browser_id: &str) -> Result<(), ClientError> {
        self.http
            .delete(format!("{}/api/profiles/{}", self.base_url, browser_id))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Uploads the latest storage state for a profile. Storage saves run
    /// on a timer; a failed upload is logged and dropped.
    pub async fn update_storage(&self, browser_id: &str, storage: &Value) {
        let result = self
            .http
            .post(format!("{}/api/profiles/{}/storage", self.base_url, browser_id))
            .json(storage)
            .send()
            .await
            .and_then(|r| r.error_for_status());
        if let Err(err) = result {
            debug!("Failed to update storage for {}: {}", browser_id, err);
        }
    }

    /// Fire-and-forget action audit record.
    pub async fn log_audit(&self, browser_id: &str, action_type: &str, metadata: Value) {
        let result = self
            .http
            .post(format!("{}/api/audit", self.base_url))
            .json(&json!({
                "browserId": browser_id,
                "actionType": action_type,
                "metadata": metadata,
            }))
            .send()
            .await
            .and_then(|r| r.error_for_status());
        if let Err(err) = result {
            error!("Failed to log action audit for {}: {}", browser_id, err);
        }
    }

    /// Fire-and-forget data usage record.
    pub async fn log_usage(&self, record: &UsageRecord) {
        let result = self
            .http
            .post(format!("{}/api/usage", self.base_url))
            .json(record)
            .send()
            .await
            .and_then(|r| r.error_for_status());
        if let Err(err) = result {
            error!("Failed to log usage for {}: {}", record.browser_id, err);
        }
    }
}
