//! Machine detail routes, including the two decrypt routes for E2EE-stored
//! export logs. Grounded on `agent_routes.py`'s machine lookup (machine_id
//! first, then serial-number fallback via `get_machine_by_identifier`) and
//! `e2ee_routes.py`'s decrypt handlers.

use axum::extract::{Path, Query, State};
use axum::Json;
use fleet_core::crypto;
use fleet_core::wire::QueuedCommand;
use serde::Deserialize;
use serde_json::json;

use crate::error::{AppError, AppResult};
use crate::routes::auth_session::RequireSession;
use crate::state::AppState;

fn find_machine(state: &AppState, identifier: &str) -> AppResult<crate::store::MachineRecord> {
    state
        .store
        .get_machine_by_identifier(identifier)
        .ok_or_else(|| AppError::NotFound(format!("Machine '{identifier}' not found")))
}

/// `GET /machine/{id}` — machine detail, resolved by machine_id or serial.
pub async fn detail(
    State(state): State<AppState>,
    _session: RequireSession,
    Path(identifier): Path<String>,
) -> AppResult<Json<crate::store::MachineRecord>> {
    Ok(Json(find_machine(&state, &identifier)?))
}

#[derive(Deserialize)]
pub struct ExportLogQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

/// `GET /api/fleet/machine/{id}/export-logs`
pub async fn export_logs(
    State(state): State<AppState>,
    _session: RequireSession,
    Path(identifier): Path<String>,
    Query(q): Query<ExportLogQuery>,
) -> AppResult<Json<Vec<crate::store::ExportLogEntry>>> {
    let machine = find_machine(&state, &identifier)?;
    Ok(Json(state.store.get_export_logs(Some(&machine.machine_id), q.limit)))
}

/// `POST /api/fleet/machine/{id}/stop` — administratively silences a
/// machine's derived status until it next reports in.
pub async fn stop(
    State(state): State<AppState>,
    _session: RequireSession,
    Path(identifier): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let machine = find_machine(&state, &identifier)?;
    state.store.set_machine_stopped(&machine.machine_id);
    Ok(Json(json!({"success": true, "status": "stopped"})))
}

/// `GET /api/fleet/recent-commands/{id}` — most recently queued commands
/// for a machine, regardless of delivery/ack state.
pub async fn recent_commands(
    State(state): State<AppState>,
    _session: RequireSession,
    Path(identifier): Path<String>,
    Query(q): Query<ExportLogQuery>,
) -> AppResult<Json<Vec<QueuedCommand>>> {
    let machine = find_machine(&state, &identifier)?;
    Ok(Json(state.store.get_recent_commands(&machine.machine_id, q.limit)))
}

/// `GET /api/fleet/machine/{id}/widget-logs`
pub async fn widget_logs(
    State(state): State<AppState>,
    _session: RequireSession,
    Path(identifier): Path<String>,
    Query(q): Query<ExportLogQuery>,
) -> AppResult<Json<Vec<serde_json::Value>>> {
    let machine = find_machine(&state, &identifier)?;
    Ok(Json(state.store.get_widget_logs(&machine.machine_id, q.limit)))
}

/// `POST /api/fleet/machine/{id}/decrypt` — decrypts an export-log payload
/// using the machine's stored per-agent DB key, falling back to the
/// server-wide envelope key.
pub async fn decrypt(
    State(state): State<AppState>,
    _session: RequireSession,
    Path(identifier): Path<String>,
    Json(envelope): Json<crypto::Envelope>,
) -> AppResult<Json<serde_json::Value>> {
    let machine = find_machine(&state, &identifier)?;

    let key = state
        .store
        .get_agent_db_key(&machine.machine_id)
        .or_else(|| state.encryption_key.get())
        .ok_or(AppError::EncryptionNotConfigured)?;

    let plaintext = crypto::decrypt_payload(&key, &envelope).map_err(|_| AppError::DecryptionFailed)?;
    Ok(Json(json!({"success": true, "data": plaintext})))
}

/// `POST /api/fleet/machine/{id}/decrypt-export` — decrypts a specific
/// stored export-log entry by its position, rather than an ad-hoc envelope
/// supplied in the request body.
pub async fn decrypt_export(
    State(state): State<AppState>,
    _session: RequireSession,
    Path(identifier): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> AppResult<Json<serde_json::Value>> {
    let machine = find_machine(&state, &identifier)?;

    let index = body.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
    let logs = state.store.get_export_logs(Some(&machine.machine_id), index + 1);
    let entry = logs
        .into_iter()
        .nth(index)
        .ok_or_else(|| AppError::NotFound("Export log entry not found".to_string()))?;

    if !entry.encrypted {
        return Ok(Json(json!({"success": true, "data": entry.data})));
    }

    let key = state
        .store
        .get_agent_db_key(&machine.machine_id)
        .or_else(|| state.encryption_key.get())
        .ok_or(AppError::EncryptionNotConfigured)?;

    let envelope: crypto::Envelope = serde_json::from_value(entry.data).map_err(|_| AppError::DecryptionFailed)?;
    let plaintext = crypto::decrypt_payload(&key, &envelope).map_err(|_| AppError::DecryptionFailed)?;
    Ok(Json(json!({"success": true, "data": plaintext})))
}
