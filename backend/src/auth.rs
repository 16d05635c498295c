//! Session, CSRF, and API-key authentication.
//!
//! Grounded on `dashboard_auth.py`'s session/CSRF lifecycle (token
//! generation, sliding expiry, single-use CSRF tokens), adapted to this
//! server's cookie name and in-process storage.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::RngCore;

pub const SESSION_COOKIE_NAME: &str = "fleet_session";
const SESSION_MAX_AGE_MINUTES: i64 = 480;
const CSRF_TOKEN_TTL_MINUTES: i64 = 10;

fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[derive(Clone)]
struct Session {
    username: String,
    role: String,
    last_used: DateTime<Utc>,
}

pub struct AuthManager {
    api_key: Option<String>,
    sessions: DashMap<String, Session>,
    csrf_tokens: DashMap<String, DateTime<Utc>>,
}

impl AuthManager {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key,
            sessions: DashMap::new(),
            csrf_tokens: DashMap::new(),
        }
    }

    /// Agent-facing check: `X-API-Key` header must match the configured
    /// key. When no key is configured, all requests pass (auth disabled).
    pub fn check_api_key(&self, provided: Option<&str>) -> bool {
        match &self.api_key {
            None => true,
            Some(expected) => provided.map(|p| p == expected).unwrap_or(false),
        }
    }

    pub fn create_session(&self, username: &str, role: &str) -> String {
        let token = random_token();
        self.sessions.insert(
            token.clone(),
            Session {
                username: username.to_string(),
                role: role.to_string(),
                last_used: Utc::now(),
            },
        );
        token
    }

    /// Validates the session and refreshes its sliding expiry. Returns
    /// `(username, role)` on success.
    pub fn validate_session(&self, token: &str) -> Option<(String, String)> {
        let mut entry = self.sessions.get_mut(token)?;
        let age = Utc::now() - entry.last_used;
        if age > Duration::minutes(SESSION_MAX_AGE_MINUTES) {
            drop(entry);
            self.sessions.remove(token);
            return None;
        }
        entry.last_used = Utc::now();
        Some((entry.username.clone(), entry.role.clone()))
    }

    pub fn destroy_session(&self, token: &str) {
        self.sessions.remove(token);
    }

    pub fn generate_csrf_token(&self) -> String {
        self.prune_csrf_tokens();
        let token = random_token();
        self.csrf_tokens.insert(token.clone(), Utc::now());
        token
    }

    /// Single-use: a valid token is consumed on success.
    pub fn validate_csrf_token(&self, token: &str) -> bool {
        match self.csrf_tokens.remove(token) {
            Some((_, issued_at)) => Utc::now() - issued_at <= Duration::minutes(CSRF_TOKEN_TTL_MINUTES),
            None => false,
        }
    }

    fn prune_csrf_tokens(&self) {
        let cutoff = Utc::now() - Duration::minutes(CSRF_TOKEN_TTL_MINUTES);
        self.csrf_tokens.retain(|_, issued_at| *issued_at > cutoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_disabled_allows_all() {
        let auth = AuthManager::new(None);
        assert!(auth.check_api_key(None));
    }

    #[test]
    fn api_key_enabled_requires_match() {
        let auth = AuthManager::new(Some("secret".into()));
        assert!(!auth.check_api_key(None));
        assert!(!auth.check_api_key(Some("wrong")));
        assert!(auth.check_api_key(Some("secret")));
    }

    #[test]
    fn session_round_trip() {
        let auth = AuthManager::new(None);
        let token = auth.create_session("alice", "admin");
        let (user, role) = auth.validate_session(&token).unwrap();
        assert_eq!(user, "alice");
        assert_eq!(role, "admin");
    }

    #[test]
    fn destroyed_session_is_invalid() {
        let auth = AuthManager::new(None);
        let token = auth.create_session("alice", "admin");
        auth.destroy_session(&token);
        assert!(auth.validate_session(&token).is_none());
    }

    #[test]
    fn csrf_token_is_single_use() {
        let auth = AuthManager::new(None);
        let token = auth.generate_csrf_token();
        assert!(auth.validate_csrf_token(&token));
        assert!(!auth.validate_csrf_token(&token));
    }

    #[test]
    fn unknown_csrf_token_rejected() {
        let auth = AuthManager::new(None);
        assert!(!auth.validate_csrf_token("not-a-real-token"));
    }
}
