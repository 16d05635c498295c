//! Agent ingest endpoints: reports, command polling/acknowledgment, and
//! widget log collection. Grounded on `agent_routes.py`.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use fleet_core::crypto;
use fleet_core::wire::{CommandAck, HealthCheck, HealthStatus};
use serde_json::json;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

fn check_api_key(state: &AppState, headers: &HeaderMap) -> AppResult<()> {
    let provided = headers.get("X-API-Key").and_then(|v| v.to_str().ok());
    if state.auth.check_api_key(provided) {
        Ok(())
    } else {
        Err(AppError::Unauthorized)
    }
}

/// `POST /api/fleet/report`
pub async fn report(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> AppResult<Json<serde_json::Value>> {
    check_api_key(&state, &headers)?;

    let encrypted = body.get("encrypted").and_then(|v| v.as_bool()).unwrap_or(false);
    let mut data = body.clone();
    let mut e2ee_verified = false;

    if encrypted {
        match state.encryption_key.get() {
            Some(key) => {
                let envelope: crypto::Envelope =
                    serde_json::from_value(body.clone()).map_err(|_| AppError::DecryptionFailed)?;
                data = crypto::decrypt_payload(&key, &envelope).map_err(|_| AppError::DecryptionFailed)?;
                e2ee_verified = true;
            }
            None => return Err(AppError::EncryptionNotConfigured),
        }
    }

    let machine_id = data
        .get("machine_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::BadRequest("Missing machine_id".to_string()))?
        .to_string();

    let mut machine_info = data.get("machine_info").cloned().unwrap_or(json!({}));
    if let Some(obj) = machine_info.as_object_mut() {
        obj.insert("e2ee_enabled".into(), json!(e2ee_verified));
    }
    let metrics = data.get("metrics").cloned().unwrap_or(json!({}));

    state.store.update_machine(&machine_id, machine_info, metrics);

    let mut db_key_stored = false;
    if e2ee_verified {
        if let Some(agent_db_key) = data.get("agent_db_key").and_then(|v| v.as_str()) {
            state.store.store_agent_db_key(&machine_id, agent_db_key);
            db_key_stored = true;
        }
    }

    Ok(Json(json!({
        "status": "ok",
        "e2ee_verified": e2ee_verified,
        "db_key_stored": db_key_stored,
    })))
}

/// `GET /api/fleet/commands/{machine_id}`
pub async fn get_commands(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(machine_id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    check_api_key(&state, &headers)?;
    Ok(Json(json!({"commands": state.store.get_pending_commands(&machine_id)})))
}

/// `POST /api/fleet/command/{machine_id}/ack`
pub async fn ack_command(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(machine_id): Path<String>,
    Json(ack): Json<CommandAck>,
) -> AppResult<Json<serde_json::Value>> {
    check_api_key(&state, &headers)?;
    let result = ack.detail.clone().map(|d| json!({"detail": d}));
    let acknowledged = state.store.acknowledge_command(&machine_id, &ack.command_id, ack.success, result);
    Ok(Json(json!({"status": "ok", "acknowledged": acknowledged})))
}

/// `POST /api/fleet/widget-logs`
pub async fn widget_logs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> AppResult<Json<serde_json::Value>> {
    check_api_key(&state, &headers)?;

    let machine_id = body
        .get("machine_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::BadRequest("Missing machine_id".to_string()))?
        .to_string();

    let logs: Vec<serde_json::Value> = body
        .get("logs")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    let mut export_count = 0;
    for log in &logs {
        if log.get("is_export").and_then(|v| v.as_bool()).unwrap_or(false) {
            if let Some(data) = log.get("data") {
                state.store.store_export_log(&machine_id, data.clone());
                export_count += 1;
            }
        }
    }
    state.store.store_widget_logs(&machine_id, logs.clone());

    Ok(Json(json!({
        "status": "ok",
        "logs_received": logs.len(),
        "exported": export_count,
    })))
}

/// `POST /api/fleet/health-check/{machine_id}` — records the result of a
/// server-initiated reachability probe. Server-to-device checks are
/// supplementary to agent-reported metrics, so status defaults to
/// "critical" unless the caller supplies agent health data showing
/// otherwise.
pub async fn record_health_check(
    State(state): State<AppState>,
    Path(machine_id): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> AppResult<Json<serde_json::Value>> {
    let status = match body.get("status").and_then(|v| v.as_str()) {
        Some("healthy") | Some("reachable") => HealthStatus::Healthy,
        Some("degraded") | Some("timeout") => HealthStatus::Degraded,
        _ => HealthStatus::Critical,
    };
    let health_check = HealthCheck::new(status, body);
    state.store.update_health_check(&machine_id, health_check);
    Ok(Json(json!({"status": "ok"})))
}

pub fn new_command_id() -> String {
    Uuid::new_v4().to_string()
}
