//! End-to-end encryption key lifecycle: generate, regenerate, rotate, and
//! inspect rotation status. Grounded on `e2ee_routes.py`.

use axum::extract::State;
use axum::Json;
use fleet_core::crypto;
use fleet_core::wire::{Command, QueuedCommand};
use serde::Deserialize;
use serde_json::json;

use crate::error::{AppError, AppResult};
use crate::routes::agent::new_command_id;
use crate::routes::auth_session::RequireSession;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct PasswordBody {
    password: Option<String>,
}

fn verify_admin_password(state: &AppState, username: &str, password: Option<&str>) -> AppResult<()> {
    let password = password.ok_or_else(|| AppError::BadRequest("Password is required".to_string()))?;
    state
        .credentials
        .authenticate(username, password, None)
        .map_err(|_| AppError::BadRequest("Incorrect password".to_string()))?;
    Ok(())
}

/// Persists `key` as the live envelope key and, when a password was
/// supplied, writes it to the encrypted-at-rest config file so it survives
/// a restart. The password has already been verified by the caller.
fn persist_encryption_key(state: &AppState, key: &str, password: &str) {
    state.encryption_key.set(Some(key.to_string()));
    let mut cfg = (*state.config).clone();
    cfg.encryption_key = Some(key.to_string());
    if let Err(e) = cfg.save_encrypted(password) {
        tracing::warn!(error = %e, "e2ee_key_persist_failed");
    }
}

/// `POST /api/fleet/verify-and-get-encryption-key`
pub async fn verify_and_get_encryption_key(
    State(state): State<AppState>,
    session: RequireSession,
    Json(body): Json<PasswordBody>,
) -> Json<serde_json::Value> {
    if verify_admin_password(&state, &session.username, body.password.as_deref()).is_err() {
        return Json(json!({"success": false, "message": "Incorrect password"}));
    }
    match state.encryption_key.get() {
        Some(key) => Json(json!({"success": true, "encryption_key": key})),
        None => Json(json!({"success": false, "message": "No encryption key configured"})),
    }
}

/// `POST /api/fleet/generate-encryption-key`
pub async fn generate_encryption_key(
    State(state): State<AppState>,
    session: RequireSession,
    Json(body): Json<PasswordBody>,
) -> AppResult<Json<serde_json::Value>> {
    let password = body.password.clone();
    verify_admin_password(&state, &session.username, password.as_deref())?;
    let key = crypto::generate_envelope_key();
    persist_encryption_key(&state, &key, &password.unwrap());
    tracing::info!(username = %session.username, "e2ee_key_generated");
    Ok(Json(json!({"success": true, "encryption_key": key})))
}

/// `POST /api/fleet/regenerate-encryption-key`
pub async fn regenerate_encryption_key(
    State(state): State<AppState>,
    session: RequireSession,
    Json(body): Json<PasswordBody>,
) -> AppResult<Json<serde_json::Value>> {
    let password = body.password.clone();
    verify_admin_password(&state, &session.username, password.as_deref())?;
    let key = crypto::generate_envelope_key();
    persist_encryption_key(&state, &key, &password.unwrap());
    tracing::info!(username = %session.username, "e2ee_key_regenerated");
    Ok(Json(json!({"success": true, "encryption_key": key})))
}

/// `POST /api/fleet/rotate-encryption-key` — encrypts the new key under
/// the old one and enqueues a rotation command per machine so in-flight
/// agents on the old key can still decrypt their own rotation notice.
pub async fn rotate_encryption_key(
    State(state): State<AppState>,
    session: RequireSession,
    Json(body): Json<PasswordBody>,
) -> AppResult<Json<serde_json::Value>> {
    let password = body.password.clone();
    verify_admin_password(&state, &session.username, password.as_deref())?;

    let Some(old_key) = state.encryption_key.get() else {
        return Ok(Json(
            json!({"success": false, "message": "E2EE is not currently enabled. Generate a key first."}),
        ));
    };

    let new_key = crypto::generate_envelope_key();
    let envelope = crypto::encrypt_payload(&old_key, &json!({"new_key": new_key}))?;
    persist_encryption_key(&state, &new_key, &password.unwrap());

    let machines = state.store.get_all_machines();
    let mut queued_count = 0;
    for machine in &machines {
        let command = QueuedCommand {
            id: new_command_id(),
            machine_id: machine.machine_id.clone(),
            command: Command::RotateEncryptionKey { envelope: envelope.clone() },
            created_at: chrono::Utc::now(),
            status: fleet_core::wire::CommandStatus::Pending,
            executed_at: None,
            result: None,
        };
        state.store.enqueue_command(&machine.machine_id, command);
        queued_count += 1;
    }

    tracing::info!(username = %session.username, queued_count, "e2ee_key_rotation_initiated");

    Ok(Json(json!({
        "success": true,
        "encryption_key": new_key,
        "agents_queued": queued_count,
        "message": format!("Key rotation queued for {queued_count} agent(s). Agents will update on next poll."),
    })))
}

/// `GET /api/fleet/key-rotation-status`
pub async fn key_rotation_status(State(state): State<AppState>, _session: RequireSession) -> Json<serde_json::Value> {
    let machines = state.store.get_all_machines();
    let rotations: Vec<serde_json::Value> = machines
        .iter()
        .map(|m| {
            let pending = state
                .store
                .get_recent_commands(&m.machine_id, 20)
                .iter()
                .any(|c| {
                    matches!(c.command, Command::RotateEncryptionKey { .. })
                        && matches!(
                            c.status,
                            fleet_core::wire::CommandStatus::Pending | fleet_core::wire::CommandStatus::Delivered
                        )
                });
            json!({"machine_id": m.machine_id, "rotation_pending": pending})
        })
        .collect();
    Json(json!({"success": true, "rotations": rotations}))
}

/// `GET /api/fleet/e2ee-status`
pub async fn e2ee_status(State(state): State<AppState>, _session: RequireSession) -> Json<serde_json::Value> {
    Json(json!({"enabled": state.encryption_key.get().is_some()}))
}
