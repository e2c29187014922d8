//! # REST API Endpoints
//!
//! Small HTTP surface next to the WebSocket paths: a health probe and a
//! listing of the sessions currently live on this server. Used by
//! dashboards and the fleet manager to discover what is running here.

use crate::state::AppState;
use axum::{extract::State, Json};
use serde::Serialize;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
}

/// `GET /healthz` — liveness probe.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "replay-server",
    })
}

/// One live session on this server.
#[derive(Serialize)]
pub struct ProfileListItem {
    pub uuid: String,
    pub viewers: usize,
}

/// `GET /api/profiles` — the sessions currently registered with the hub,
/// with their live viewer counts.
pub async fn list_profiles(State(state): State<AppState>) -> Json<Vec<ProfileListItem>> {
    let profiles = state
        .hub
        .active_profile_ids()
        .into_iter()
        .map(|uuid| {
            let viewers = state.hub.viewer_count(&uuid);
            ProfileListItem { uuid, viewers }
        })
        .collect();
    Json(profiles)
}
