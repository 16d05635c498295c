//! Minimal server-rendered UI surface: login, dashboard shell, settings,
//! and password-reset pages. A full templating system is out of scope
//! (see workspace root spec notes); pages are a thin HTML shell that
//! fetches `/api/fleet/*` via JS, mirroring `dashboard_routes.py`'s
//! session/CSRF cookie handling.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::header;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::{Form, Json};
use serde::Deserialize;
use serde_json::json;

use crate::auth::SESSION_COOKIE_NAME;
use crate::error::{AppError, AppResult};
use crate::routes::auth_session::{read_cookie, RequirePageSession, RequireSession};
use crate::security::SecurityHeaders;
use crate::state::AppState;

fn page(title: &str, body: &str) -> Html<String> {
    Html(format!(
        "<!doctype html><html><head><meta charset=\"utf-8\"><title>{title}</title></head><body>{body}</body></html>"
    ))
}

/// `GET /`
pub async fn index(req: axum::extract::Request) -> Response {
    let (parts, _) = req.into_parts();
    if read_cookie(&parts, SESSION_COOKIE_NAME).is_some() {
        Redirect::to("/dashboard").into_response()
    } else {
        Redirect::to("/login").into_response()
    }
}

/// `GET /login`
pub async fn login_page(State(state): State<AppState>) -> Html<String> {
    let csrf = state.auth.generate_csrf_token();
    page(
        "Sign in",
        &format!(
            "<form method=\"post\" action=\"/login\">\
             <input type=\"hidden\" name=\"csrf_token\" value=\"{csrf}\">\
             <input name=\"username\" placeholder=\"username\">\
             <input name=\"password\" type=\"password\" placeholder=\"password\">\
             <button type=\"submit\">Sign in</button></form>"
        ),
    )
}

#[derive(Deserialize)]
pub struct LoginForm {
    username: String,
    password: String,
    csrf_token: String,
}

/// `POST /login`
pub async fn login_submit(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Form(form): Form<LoginForm>,
) -> AppResult<Response> {
    if !state.auth.validate_csrf_token(&form.csrf_token) {
        return Err(AppError::Forbidden("Invalid or expired CSRF token".to_string()));
    }

    let ip = connect_info.map(|ConnectInfo(addr)| addr.ip().to_string());
    let role = state
        .credentials
        .authenticate(&form.username, &form.password, ip.as_deref())
        .map_err(|e| {
            if e.starts_with("Account locked") {
                AppError::Forbidden(e)
            } else {
                AppError::BadRequest(e)
            }
        })?;

    let token = state.auth.create_session(&form.username, &role);
    let flags = SecurityHeaders { use_ssl: state.use_ssl }.secure_cookie_flags();
    let cookie = format!("{SESSION_COOKIE_NAME}={token}; Path=/; {flags}");

    let mut response = Redirect::to("/dashboard").into_response();
    response.headers_mut().insert(header::SET_COOKIE, cookie.parse().unwrap());
    Ok(response)
}

/// `GET /logout`
pub async fn logout(State(state): State<AppState>, req: axum::extract::Request) -> Response {
    let (parts, _) = req.into_parts();
    if let Some(token) = read_cookie(&parts, SESSION_COOKIE_NAME) {
        state.auth.destroy_session(&token);
    }
    let mut response = Redirect::to("/login").into_response();
    let expired = format!("{SESSION_COOKIE_NAME}=; Path=/; Max-Age=0");
    response.headers_mut().insert(header::SET_COOKIE, expired.parse().unwrap());
    response
}

/// `GET /dashboard`
pub async fn dashboard_page(_session: RequirePageSession) -> Html<String> {
    page("Fleet Dashboard", "<div id=\"app\">Loading fleet summary&hellip;</div>")
}

/// `GET /settings`
pub async fn settings_page(_session: RequirePageSession) -> Html<String> {
    page("Settings", "<div id=\"app\">Settings</div>")
}

#[derive(Deserialize)]
pub struct ResetRequestForm {
    username: String,
}

/// `GET /password-reset`
pub async fn password_reset_page() -> Html<String> {
    page(
        "Reset password",
        "<form method=\"post\" action=\"/password-reset\">\
         <input name=\"username\" placeholder=\"username\">\
         <button type=\"submit\">Request reset</button></form>",
    )
}

/// `POST /password-reset` — issues a reset token. Always responds with a
/// generic message regardless of whether the username exists, so the
/// endpoint cannot be used to enumerate accounts.
pub async fn password_reset_submit(
    State(state): State<AppState>,
    Form(form): Form<ResetRequestForm>,
) -> Json<serde_json::Value> {
    if let Ok(token) = state.credentials.generate_reset_token(&form.username) {
        tracing::info!(username = %form.username, "password_reset_token_issued");
        let _ = token;
    }
    Json(json!({"message": "If that account exists, a reset link has been issued."}))
}

#[derive(Deserialize)]
pub struct ResetSubmitForm {
    token: String,
    new_password: String,
}

/// `GET /reset-password`
pub async fn reset_password_page() -> Html<String> {
    page(
        "Choose a new password",
        "<form method=\"post\" action=\"/reset-password\">\
         <input name=\"token\" placeholder=\"reset token\">\
         <input name=\"new_password\" type=\"password\" placeholder=\"new password\">\
         <button type=\"submit\">Reset</button></form>",
    )
}

/// `POST /reset-password`
pub async fn reset_password_submit(
    State(state): State<AppState>,
    Form(form): Form<ResetSubmitForm>,
) -> AppResult<Json<serde_json::Value>> {
    state
        .credentials
        .reset_password_with_token(&form.token, &form.new_password)
        .map_err(AppError::BadRequest)?;
    Ok(Json(json!({"success": true})))
}

/// `GET /machine/{id}`
pub async fn machine_page(_session: RequirePageSession, Path(id): Path<String>) -> Html<String> {
    page(&format!("Machine {id}"), &format!("<div id=\"app\" data-machine=\"{id}\"></div>"))
}

/// `GET /machine/{id}/dashboard`
pub async fn machine_dashboard_page(_session: RequirePageSession, Path(id): Path<String>) -> Html<String> {
    page(
        &format!("Machine {id} dashboard"),
        &format!("<div id=\"app\" data-machine=\"{id}\" data-view=\"dashboard\"></div>"),
    )
}

/// `GET /api/fleet/current-user`
pub async fn current_user(session: RequireSession) -> Json<serde_json::Value> {
    Json(json!({"username": session.username, "role": session.role}))
}

/// `GET /api/fleet/users/check-password-update`
pub async fn check_password_update(
    State(state): State<AppState>,
    session: RequireSession,
) -> Json<serde_json::Value> {
    let needs_update = state.credentials.check_password_needs_update(&session.username);
    Json(json!({"needs_password_update": needs_update}))
}
