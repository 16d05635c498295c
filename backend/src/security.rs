//! Security headers middleware and a sliding-window per-IP rate limiter.
//!
//! Grounded on `security_headers.py`: same CSP directive string (with a
//! nonce substituted for inline scripts/styles when one is provided), the
//! same HSTS/cookie-flag behavior, and the same rate-limiter cleanup
//! thresholds (`MAX_TRACKED_IPS`, periodic + emergency sweeps).

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use dashmap::DashMap;
use rand::RngCore;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

const MAX_TRACKED_IPS: usize = 10_000;

fn now_secs() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

pub fn generate_csp_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub struct SecurityHeaders {
    pub use_ssl: bool,
}

impl SecurityHeaders {
    pub fn csp(&self, nonce: &str) -> String {
        format!(
            "default-src 'self'; \
             script-src 'self' 'nonce-{nonce}'; \
             style-src 'self' 'nonce-{nonce}'; \
             img-src 'self' data:; \
             font-src 'self'; \
             connect-src 'self' wss: ws:; \
             frame-ancestors 'none'; \
             base-uri 'self'; \
             form-action 'self'"
        )
    }

    pub fn secure_cookie_flags(&self) -> &'static str {
        if self.use_ssl {
            "HttpOnly; SameSite=Strict; Secure"
        } else {
            "HttpOnly; SameSite=Strict"
        }
    }
}

/// Middleware: attaches a fresh CSP nonce per request (stashed in
/// extensions for handlers that render inline `<script>`/`<style>` tags)
/// and sets the fixed security headers on the outgoing response.
pub async fn security_headers_layer(use_ssl: bool, mut req: Request<Body>, next: Next) -> Response {
    let nonce = generate_csp_nonce();
    req.extensions_mut().insert(CspNonce(nonce.clone()));

    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    let sec = SecurityHeaders { use_ssl };

    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    headers.insert("X-XSS-Protection", HeaderValue::from_static("1; mode=block"));
    headers.insert("Referrer-Policy", HeaderValue::from_static("no-referrer-when-downgrade"));
    if let Ok(v) = HeaderValue::from_str(&sec.csp(&nonce)) {
        headers.insert("Content-Security-Policy", v);
    }
    if use_ssl {
        headers.insert(
            "Strict-Transport-Security",
            HeaderValue::from_static("max-age=31536000; includeSubDomains"),
        );
    }
    response
}

#[derive(Clone)]
pub struct CspNonce(pub String);

struct IpWindow {
    timestamps: Vec<i64>,
}

pub struct RateLimiter {
    max_requests: usize,
    window_seconds: i64,
    requests: DashMap<String, IpWindow>,
    last_cleanup: AtomicI64,
    cleanup_interval: i64,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window_seconds: i64) -> Self {
        Self {
            max_requests,
            window_seconds,
            requests: DashMap::new(),
            last_cleanup: AtomicI64::new(0),
            cleanup_interval: (window_seconds * 2).max(120),
        }
    }

    pub fn is_allowed(&self, ip: &str) -> bool {
        let now = now_secs();
        let window_start = now - self.window_seconds;

        if now - self.last_cleanup.load(Ordering::Relaxed) > self.cleanup_interval {
            self.cleanup(window_start);
            self.last_cleanup.store(now, Ordering::Relaxed);
        }
        if self.requests.len() > MAX_TRACKED_IPS {
            self.cleanup(window_start);
            self.last_cleanup.store(now, Ordering::Relaxed);
        }

        let mut entry = self.requests.entry(ip.to_string()).or_insert_with(|| IpWindow { timestamps: Vec::new() });
        entry.timestamps.retain(|&ts| ts > window_start);

        if entry.timestamps.len() >= self.max_requests {
            tracing::warn!(ip, count = entry.timestamps.len(), "rate_limit_exceeded");
            return false;
        }

        entry.timestamps.push(now);
        true
    }

    fn cleanup(&self, window_start: i64) {
        self.requests.retain(|_, w| {
            w.timestamps.retain(|&ts| ts > window_start);
            !w.timestamps.is_empty()
        });
    }
}

/// Middleware: rejects with `429` once the connecting IP exceeds
/// `max_requests` within the sliding window. Applied globally ahead of
/// routing so login/reset brute-force attempts are throttled at the IP
/// level, in addition to the per-credential lockout in `credentials.rs`.
pub async fn rate_limit_layer(
    State(limiter): State<Arc<RateLimiter>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if limiter.is_allowed(&addr.ip().to_string()) {
        next.run(req).await
    } else {
        (StatusCode::TOO_MANY_REQUESTS, Json(json!({"error": "Too many requests"}))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_requests_under_the_limit() {
        let limiter = RateLimiter::new(3, 60);
        assert!(limiter.is_allowed("1.2.3.4"));
        assert!(limiter.is_allowed("1.2.3.4"));
        assert!(limiter.is_allowed("1.2.3.4"));
    }

    #[test]
    fn blocks_requests_over_the_limit() {
        let limiter = RateLimiter::new(2, 60);
        assert!(limiter.is_allowed("1.2.3.4"));
        assert!(limiter.is_allowed("1.2.3.4"));
        assert!(!limiter.is_allowed("1.2.3.4"));
    }

    #[test]
    fn tracks_ips_independently() {
        let limiter = RateLimiter::new(1, 60);
        assert!(limiter.is_allowed("1.1.1.1"));
        assert!(limiter.is_allowed("2.2.2.2"));
    }

    #[test]
    fn csp_embeds_nonce_instead_of_unsafe_inline() {
        let sec = SecurityHeaders { use_ssl: true };
        let csp = sec.csp("abc123");
        assert!(csp.contains("'nonce-abc123'"));
        assert!(!csp.contains("unsafe-inline"));
    }

    #[test]
    fn cookie_flags_add_secure_only_with_ssl() {
        assert!(SecurityHeaders { use_ssl: true }.secure_cookie_flags().contains("Secure"));
        assert!(!SecurityHeaders { use_ssl: false }.secure_cookie_flags().contains("Secure"));
    }
}
