//! An axum extractor that requires a valid dashboard session cookie.

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Redirect, Response};

use crate::auth::SESSION_COOKIE_NAME;
use crate::error::AppError;
use crate::state::AppState;

/// Extracts a named cookie's value from the raw `Cookie` header without
/// pulling in a dedicated cookie-jar crate.
pub fn read_cookie(parts: &Parts, name: &str) -> Option<String> {
    let header = parts.headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    header.split(';').find_map(|pair| {
        let pair = pair.trim();
        let (k, v) = pair.split_once('=')?;
        (k == name).then(|| v.to_string())
    })
}

pub struct RequireSession {
    pub username: String,
    pub role: String,
}

#[async_trait]
impl FromRequestParts<AppState> for RequireSession {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = read_cookie(parts, SESSION_COOKIE_NAME).ok_or(AppError::Unauthorized)?;
        let (username, role) = state.auth.validate_session(&token).ok_or(AppError::Unauthorized)?;
        Ok(RequireSession { username, role })
    }
}

/// Rejection for [`RequirePageSession`]: an unauthenticated HTML page
/// request gets sent to the login page rather than a bare 401, since
/// there's a browser on the other end rather than an API client.
pub struct RedirectToLogin;

impl IntoResponse for RedirectToLogin {
    fn into_response(self) -> Response {
        Redirect::to("/login").into_response()
    }
}

/// Same as [`RequireSession`] but for HTML page handlers: a missing or
/// invalid session redirects to `/login` instead of returning JSON 401.
pub struct RequirePageSession {
    pub username: String,
    pub role: String,
}

#[async_trait]
impl FromRequestParts<AppState> for RequirePageSession {
    type Rejection = RedirectToLogin;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = read_cookie(parts, SESSION_COOKIE_NAME).ok_or(RedirectToLogin)?;
        let (username, role) = state.auth.validate_session(&token).ok_or(RedirectToLogin)?;
        Ok(RequirePageSession { username, role })
    }
}

/// Same as [`RequireSession`] but also requires the `admin` role.
pub struct RequireAdmin(pub RequireSession);

#[async_trait]
impl FromRequestParts<AppState> for RequireAdmin {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let session = RequireSession::from_request_parts(parts, state).await?;
        if session.role != "admin" {
            return Err(AppError::Forbidden("Admin role required".to_string()));
        }
        Ok(RequireAdmin(session))
    }
}
