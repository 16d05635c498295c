//! Administrative routes: user management and TLS certificate inspection.
//! Grounded on `fleet_user_manager.py`'s CLI operations exposed over HTTP,
//! and `admin_routes.py`'s cert-status/info/update endpoints.
//!
//! The E2EE-family routes this module's table documents
//! (`verify-and-get-encryption-key`, `regenerate-encryption-key`,
//! `e2ee-status`) are implemented once in `crate::routes::e2ee` and
//! re-exported here so both documented paths resolve to the same handler.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::error::{AppError, AppResult};
use crate::routes::auth_session::{RequireAdmin, RequireSession};
use crate::state::AppState;

pub use crate::routes::e2ee::{e2ee_status, regenerate_encryption_key, verify_and_get_encryption_key};

#[derive(Deserialize)]
pub struct CreateUserBody {
    username: String,
    password: String,
    role: String,
}

/// `POST /api/fleet/users` (admin only)
pub async fn create_user(
    State(state): State<AppState>,
    _admin: RequireAdmin,
    Json(body): Json<CreateUserBody>,
) -> AppResult<Json<serde_json::Value>> {
    state
        .credentials
        .create_user(&body.username, &body.password, &body.role)
        .map_err(AppError::BadRequest)?;
    Ok(Json(json!({"success": true})))
}

/// `GET /api/fleet/users` (admin only)
pub async fn list_users(
    State(state): State<AppState>,
    _admin: RequireAdmin,
) -> Json<Vec<crate::credentials::UserRecord>> {
    Json(state.credentials.list_users())
}

#[derive(Deserialize)]
pub struct ChangePasswordBody {
    old_password: String,
    new_password: String,
}

/// `POST /api/fleet/users/change-password`
pub async fn change_password(
    State(state): State<AppState>,
    session: RequireSession,
    Json(body): Json<ChangePasswordBody>,
) -> AppResult<Json<serde_json::Value>> {
    state
        .credentials
        .change_password(&session.username, &body.old_password, &body.new_password)
        .map_err(AppError::BadRequest)?;
    Ok(Json(json!({"success": true})))
}

#[derive(Deserialize)]
pub struct ForceUpdateBody {
    username: String,
    new_password: String,
}

/// `POST /api/fleet/users/force-password-update` (admin only)
pub async fn force_password_update(
    State(state): State<AppState>,
    _admin: RequireAdmin,
    Json(body): Json<ForceUpdateBody>,
) -> AppResult<Json<serde_json::Value>> {
    state
        .credentials
        .force_password_update(&body.username, &body.new_password)
        .map_err(AppError::BadRequest)?;
    Ok(Json(json!({"success": true})))
}

#[derive(Deserialize)]
pub struct DeleteUserBody {
    username: String,
}

/// `POST /api/fleet/users/delete` (admin only)
pub async fn delete_user(
    State(state): State<AppState>,
    _admin: RequireAdmin,
    Json(body): Json<DeleteUserBody>,
) -> AppResult<Json<serde_json::Value>> {
    state.credentials.delete_user(&body.username).map_err(AppError::BadRequest)?;
    Ok(Json(json!({"success": true})))
}

/// `GET /api/fleet/cert-status` — reports whether a TLS cert/key pair is
/// present in the configured cert directory.
pub async fn cert_status(State(state): State<AppState>, _admin: RequireAdmin) -> Json<serde_json::Value> {
    let present = state
        .config
        .cert_dir
        .as_ref()
        .map(|dir| dir.join("cert.pem").exists() && dir.join("key.pem").exists())
        .unwrap_or(false);
    Json(json!({"tls_enabled": state.config.use_tls, "cert_present": present}))
}

/// `GET /api/fleet/cert-info`
pub async fn cert_info(State(state): State<AppState>, _admin: RequireAdmin) -> AppResult<Json<serde_json::Value>> {
    let dir = state
        .config
        .cert_dir
        .as_ref()
        .ok_or_else(|| AppError::NotFound("No certificate directory configured".to_string()))?;
    let cert_path = dir.join("cert.pem");
    let metadata = std::fs::metadata(&cert_path).map_err(|_| AppError::NotFound("Certificate not found".to_string()))?;
    Ok(Json(json!({
        "path": cert_path.display().to_string(),
        "size_bytes": metadata.len(),
    })))
}

#[derive(Deserialize)]
pub struct CertUpdateBody {
    cert_pem: String,
    key_pem: String,
}

/// `POST /api/fleet/cert-update` (admin only) — writes a new certificate
/// and key to the configured cert directory; takes effect on next restart
/// since the TLS listener is bound once at startup.
pub async fn cert_update(
    State(state): State<AppState>,
    _admin: RequireAdmin,
    Json(body): Json<CertUpdateBody>,
) -> AppResult<Json<serde_json::Value>> {
    let dir = state
        .config
        .cert_dir
        .as_ref()
        .ok_or(AppError::BadRequest("No certificate directory configured".to_string()))?;
    std::fs::create_dir_all(dir).map_err(|e| AppError::Internal(e.to_string()))?;
    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    std::fs::write(&cert_path, &body.cert_pem).map_err(|e| AppError::Internal(e.to_string()))?;
    std::fs::write(&key_path, &body.key_pem).map_err(|e| AppError::Internal(e.to_string()))?;
    crate::config::restrict_to_owner(&key_path).map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(Json(json!({"success": true, "message": "Certificate updated. Restart the server to apply."})))
}
