//! HTTP surface over `backend::cluster::ClusterRegistry`. Grounded on
//! `cluster_manager.py`'s status/health endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::routes::auth_session::RequireSession;
use crate::state::AppState;

/// `GET /api/fleet/cluster/status` — full node list plus counts.
pub async fn status(State(state): State<AppState>, _session: RequireSession) -> Json<serde_json::Value> {
    Json(state.cluster.cluster_status())
}

/// `GET /api/fleet/cluster/health` — public, unauthenticated so external
/// load balancers and peer heartbeat probes can hit it without
/// credentials. Returns `200` when healthy, `503` otherwise.
pub async fn health(State(state): State<AppState>) -> Response {
    let diagnostic = state.cluster.health_check(true);
    let healthy = diagnostic.get("overall").and_then(|v| v.as_str()) != Some("critical");
    let status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    let body = json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "node_id": state.cluster.node_id,
    });
    (status, Json(body)).into_response()
}

/// `GET /api/fleet/cluster/nodes`
pub async fn nodes(State(state): State<AppState>, _session: RequireSession) -> Json<Vec<crate::cluster::ClusterNode>> {
    Json(state.cluster.active_nodes())
}

/// `GET /api/fleet/cluster/health-check` — structured diagnostic: backend
/// reachability, per-node health, and a synthetic overall status.
pub async fn health_check(State(state): State<AppState>, _session: RequireSession) -> Json<serde_json::Value> {
    // The data store is an in-process Mutex; reachability of this handler
    // at all implies it is responsive.
    Json(state.cluster.health_check(true))
}
