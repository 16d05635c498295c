mod auth;
mod cluster;
mod config;
mod credentials;
mod error;
mod routes;
mod security;
mod state;
mod store;

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use auth::AuthManager;
use cluster::{ClusterRegistry, FileBackend};
use config::Config;
use credentials::CredentialStore;
use security::RateLimiter;
use state::{AppState, EncryptionKeyCell};
use store::FleetDataStore;

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Fleet telemetry and control-plane server.
#[derive(Parser, Debug)]
#[command(name = "fleet-server", version)]
struct Cli {
    /// Bind host. Overrides the config file and `FLEET_SERVER_HOST`.
    #[arg(long)]
    host: Option<String>,

    /// Bind port. Overrides the config file and `FLEET_SERVER_PORT`.
    #[arg(long)]
    port: Option<u16>,

    /// Path to a JSON config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory containing cert.pem/key.pem for TLS.
    #[arg(long)]
    cert_dir: Option<PathBuf>,

    /// Disable TLS and serve plain HTTP.
    #[arg(long)]
    no_tls: bool,
}

fn build_router(state: AppState) -> Router {
    Router::new()
        // Agent ingest
        .route("/api/fleet/report", post(routes::agent::report))
        .route("/api/fleet/commands/:machine_id", get(routes::agent::get_commands))
        .route("/api/fleet/command/:machine_id/ack", post(routes::agent::ack_command))
        .route("/api/fleet/widget-logs", post(routes::agent::widget_logs))
        .route("/api/fleet/health-check/:machine_id", post(routes::agent::record_health_check))
        // Dashboard reads
        .route("/api/fleet/summary", get(routes::dashboard::summary))
        .route("/api/fleet/machines", get(routes::dashboard::machines))
        .route("/api/fleet/agents", get(routes::dashboard::agents))
        .route("/api/fleet/server-resources", get(routes::dashboard::server_resources))
        .route("/api/fleet/history/:id", get(routes::dashboard::machine_history))
        .route("/api/fleet/storage", get(routes::dashboard::storage))
        // Machine detail
        .route("/api/fleet/machine/:id", get(routes::machine::detail))
        .route("/api/fleet/machine/:id/export-logs", get(routes::machine::export_logs))
        .route("/api/fleet/machine/:id/widget-logs", get(routes::machine::widget_logs))
        .route("/api/fleet/machine/:id/decrypt", post(routes::machine::decrypt))
        .route("/api/fleet/machine/:id/decrypt-export", post(routes::machine::decrypt_export))
        .route("/api/fleet/machine/:id/stop", post(routes::machine::stop))
        .route("/api/fleet/recent-commands/:id", get(routes::machine::recent_commands))
        // Cluster
        .route("/api/fleet/cluster/status", get(routes::cluster::status))
        .route("/api/fleet/cluster/health", get(routes::cluster::health))
        .route("/api/fleet/cluster/nodes", get(routes::cluster::nodes))
        .route("/api/fleet/cluster/health-check", get(routes::cluster::health_check))
        // Analysis
        .route("/api/fleet/speedtest/summary", get(routes::analysis::speedtest_summary))
        .route("/api/fleet/speedtest/machine/:id", get(routes::analysis::speedtest_machine))
        .route("/api/fleet/speedtest/comparison", get(routes::analysis::speedtest_comparison))
        .route("/api/fleet/speedtest/anomalies", get(routes::analysis::speedtest_anomalies))
        .route("/api/fleet/speedtest/recent", get(routes::analysis::speedtest_recent))
        .route("/api/fleet/speedtest/recent20", get(routes::analysis::speedtest_recent20))
        .route("/api/fleet/speedtest/subnet", get(routes::analysis::speedtest_subnet))
        .route("/api/fleet/network-analysis", get(routes::analysis::network_analysis))
        .route("/api/fleet/network-analysis/:id", get(routes::analysis::network_analysis_machine))
        .route("/api/fleet/widget-logs/all", get(routes::analysis::widget_logs))
        // Admin
        .route("/api/fleet/users", get(routes::admin::list_users).post(routes::admin::create_user))
        .route("/api/fleet/users/change-password", post(routes::admin::change_password))
        .route("/api/fleet/users/force-password-update", post(routes::admin::force_password_update))
        .route("/api/fleet/users/delete", post(routes::admin::delete_user))
        .route("/api/fleet/cert-status", get(routes::admin::cert_status))
        .route("/api/fleet/cert-info", get(routes::admin::cert_info))
        .route("/api/fleet/cert-update", post(routes::admin::cert_update))
        // E2EE
        .route("/api/fleet/verify-and-get-encryption-key", post(routes::e2ee::verify_and_get_encryption_key))
        .route("/api/fleet/generate-encryption-key", post(routes::e2ee::generate_encryption_key))
        .route("/api/fleet/regenerate-encryption-key", post(routes::e2ee::regenerate_encryption_key))
        .route("/api/fleet/rotate-encryption-key", post(routes::e2ee::rotate_encryption_key))
        .route("/api/fleet/key-rotation-status", get(routes::e2ee::key_rotation_status))
        .route("/api/fleet/e2ee-status", get(routes::e2ee::e2ee_status))
        // UI pages
        .route("/", get(routes::ui::index))
        .route("/login", get(routes::ui::login_page).post(routes::ui::login_submit))
        .route("/logout", get(routes::ui::logout))
        .route("/dashboard", get(routes::ui::dashboard_page))
        .route("/settings", get(routes::ui::settings_page))
        .route("/password-reset", get(routes::ui::password_reset_page).post(routes::ui::password_reset_submit))
        .route("/reset-password", get(routes::ui::reset_password_page).post(routes::ui::reset_password_submit))
        .route("/machine/:id", get(routes::ui::machine_page))
        .route("/machine/:id/dashboard", get(routes::ui::machine_dashboard_page))
        .route("/api/fleet/current-user", get(routes::ui::current_user))
        .route("/api/fleet/users/check-password-update", get(routes::ui::check_password_update))
        .fallback(not_found)
        .with_state(state)
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(serde_json::json!({"error": "Not found"})))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "fleet_server=info,tower_http=info".into()))
        .json()
        .init();

    let cli = Cli::parse();

    let mut cfg = match Config::load(cli.config.as_ref()) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(2);
        }
    };
    if let Some(host) = cli.host {
        cfg.host = host;
    }
    if let Some(port) = cli.port {
        cfg.port = port;
    }
    if let Some(dir) = cli.cert_dir.clone() {
        cfg.cert_dir = Some(dir);
    }
    if cli.no_tls {
        cfg.use_tls = false;
    }
    let cfg = Arc::new(cfg);

    let data_dir = config::data_dir();
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        error!(error = %e, "failed to create data directory");
        std::process::exit(2);
    }

    let credentials = match CredentialStore::open(&data_dir.join("users.db")) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!(error = %e, "failed to open credential store");
            std::process::exit(2);
        }
    };

    let store = Arc::new(FleetDataStore::new(Some(Box::new(|machine_id, _info, dashboard_url| {
        info!(machine_id, dashboard_url, "agent_onboarded");
    }))));

    let cluster_backend = Arc::new(FileBackend::new(data_dir.join("cluster-nodes.json")));
    let node_id = uuid::Uuid::new_v4().to_string();
    let cluster = match ClusterRegistry::new(
        node_id,
        cfg.host.clone(),
        cfg.port,
        cluster_backend,
        cfg.cluster_secret.as_deref(),
    ) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!(error = %e, "failed to start cluster registry");
            std::process::exit(2);
        }
    };

    let auth = Arc::new(AuthManager::new(cfg.api_key.clone()));
    let rate_limiter = Arc::new(RateLimiter::new(cfg.rate_limit_max_requests, cfg.rate_limit_window_seconds));
    let encryption_key = Arc::new(EncryptionKeyCell::new(cfg.encryption_key.clone()));

    let app_state = AppState {
        config: cfg.clone(),
        store,
        credentials,
        auth,
        cluster: cluster.clone(),
        rate_limiter,
        encryption_key,
        use_ssl: cfg.use_tls,
    };

    {
        let cluster = cluster.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(cluster::HEARTBEAT_INTERVAL_SECONDS));
            loop {
                ticker.tick().await;
                if let Err(e) = cluster.heartbeat() {
                    tracing::warn!(error = %e, "cluster_heartbeat_failed");
                }
            }
        });
    }

    let use_ssl = app_state.use_ssl;
    let rate_limiter = app_state.rate_limiter.clone();
    let app = build_router(app_state)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(axum::middleware::from_fn(move |req, next| {
            security::security_headers_layer(use_ssl, req, next)
        }))
        .layer(axum::middleware::from_fn_with_state(rate_limiter, security::rate_limit_layer))
        .layer(
            ServiceBuilder::new()
                .layer(CatchPanicLayer::new())
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new()),
        );

    let addr = SocketAddr::new(cfg.host.parse().unwrap_or_else(|_| "0.0.0.0".parse().unwrap()), cfg.port);
    info!(%addr, tls = cfg.use_tls, "fleet-server starting");

    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown signal received");
    };

    let result = if cfg.use_tls {
        let cert_dir = cfg.cert_dir.clone().unwrap_or_else(|| config::data_dir().join("certs"));
        let tls_config = match axum_server::tls_rustls::RustlsConfig::from_pem_file(
            cert_dir.join("cert.pem"),
            cert_dir.join("key.pem"),
        )
        .await
        {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, cert_dir = %cert_dir.display(), "failed to load TLS certificate");
                std::process::exit(2);
            }
        };
        axum_server::bind_rustls(addr, tls_config)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await
    } else {
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(error = %e, %addr, "failed to bind");
                std::process::exit(1);
            }
        };
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown)
            .await
    };

    if let Err(e) = result {
        error!(error = %e, "server exited with error");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod integration_tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use fleet_core::crypto;
    use fleet_core::wire::Command;
    use tower::ServiceExt;

    fn temp_db_path(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("fleet-server-itest-{name}-{}.db", std::process::id()));
        let _ = std::fs::remove_file(&p);
        p
    }

    fn test_state(api_key: Option<&str>, encryption_key: Option<&str>) -> AppState {
        let cfg = Arc::new(Config {
            api_key: api_key.map(str::to_string),
            encryption_key: encryption_key.map(str::to_string),
            ..Config::default()
        });
        let credentials = Arc::new(CredentialStore::open(&temp_db_path("state")).unwrap());
        let store = Arc::new(FleetDataStore::new(None));
        let cluster_backend: Arc<dyn cluster::ClusterBackend> = Arc::new(cluster::InMemoryBackend::default());
        let cluster = Arc::new(
            ClusterRegistry::new("test-node".to_string(), "127.0.0.1".to_string(), 8443, cluster_backend, None)
                .unwrap(),
        );
        let auth = Arc::new(AuthManager::new(cfg.api_key.clone()));
        let rate_limiter = Arc::new(RateLimiter::new(100_000, 60));
        let encryption_key = Arc::new(EncryptionKeyCell::new(cfg.encryption_key.clone()));

        AppState {
            config: cfg,
            store,
            credentials,
            auth,
            cluster,
            rate_limiter,
            encryption_key,
            use_ssl: false,
        }
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn json_post(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    /// Minimal `application/x-www-form-urlencoded` escaping, sufficient for
    /// the ASCII test fixtures below (usernames, passwords, tokens).
    fn urlencode(raw: &str) -> String {
        let mut out = String::with_capacity(raw.len());
        for b in raw.bytes() {
            match b {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
                b' ' => out.push('+'),
                _ => out.push_str(&format!("%{b:02X}")),
            }
        }
        out
    }

    /// Browsers submit plain HTML `<form>` posts as
    /// `application/x-www-form-urlencoded`, not JSON.
    fn form_post(uri: &str, fields: &[(&str, &str)]) -> Request<Body> {
        let body = fields
            .iter()
            .map(|(k, v)| format!("{}={}", urlencode(k), urlencode(v)))
            .collect::<Vec<_>>()
            .join("&");
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from(body))
            .unwrap()
    }

    /// Report round-trip with E2EE on: an encrypted report decrypts, tags
    /// the machine as verified, and the machine shows up online with its
    /// reported metrics on the next authenticated read.
    #[tokio::test]
    async fn s1_report_round_trip_with_e2ee() {
        let key = crypto::generate_envelope_key();
        let state = test_state(Some("agent-key"), Some(&key));
        let app = build_router(state.clone());

        let payload = serde_json::json!({
            "machine_id": "hostA",
            "machine_info": {"hostname": "hostA", "os": "Linux"},
            "metrics": {"cpu": {"percent": 42}, "memory": {"percent": 30}, "disk": {"percent": 10}, "uptime_seconds": 60},
        });
        let envelope = crypto::encrypt_payload(&key, &payload).unwrap();

        let response = app
            .clone()
            .oneshot({
                let mut req = json_post("/api/fleet/report", serde_json::to_value(&envelope).unwrap());
                req.headers_mut().insert("X-API-Key", "agent-key".parse().unwrap());
                req
            })
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let report_body = body_json(response).await;
        assert_eq!(report_body["status"], "ok");
        assert_eq!(report_body["e2ee_verified"], true);
        assert_eq!(report_body["db_key_stored"], false);

        let token = state.auth.create_session("tester", "admin");
        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/api/fleet/machines")
                    .header("Cookie", format!("fleet_session={token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let machines = body_json(response).await;
        let machine =
            machines.as_array().unwrap().iter().find(|m| m["machine_id"] == "hostA").expect("hostA reported");
        assert_eq!(machine["status"], "online");
        assert_eq!(machine["latest_metrics"]["cpu"]["percent"], 42);
    }

    /// A report claiming `encrypted: true` without a server-side key
    /// configured is rejected rather than silently accepted as plaintext.
    #[tokio::test]
    async fn report_without_configured_key_is_rejected() {
        let state = test_state(Some("agent-key"), None);
        let app = build_router(state);
        let body = serde_json::json!({"encrypted": true, "version": "1", "nonce": "x", "ciphertext": "y"});

        let response = app
            .oneshot({
                let mut req = json_post("/api/fleet/report", body);
                req.headers_mut().insert("X-API-Key", "agent-key".parse().unwrap());
                req
            })
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    /// Repeated failed logins lock the account; the locked response still
    /// carries a remaining-time message rather than a generic failure.
    #[tokio::test]
    async fn s2_credential_lockout_after_repeated_failures() {
        let state = test_state(None, None);
        state.credentials.create_user("bob", "BobPassword123!", "viewer").unwrap();
        let app = build_router(state.clone());

        for _ in 0..5 {
            let csrf = state.auth.generate_csrf_token();
            let fields = [("username", "bob"), ("password", "wrong"), ("csrf_token", csrf.as_str())];
            let response = app.clone().oneshot(form_post("/login", &fields)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }

        let csrf = state.auth.generate_csrf_token();
        let fields = [("username", "bob"), ("password", "BobPassword123!"), ("csrf_token", csrf.as_str())];
        let response = app.oneshot(form_post("/login", &fields)).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let payload = body_json(response).await;
        let message = payload["error"].as_str().unwrap_or_default().to_lowercase();
        assert!(message.contains("locked"), "expected lockout message, got: {message}");
    }

    /// Key rotation persists the new key as the live envelope key and
    /// queues a rotation command per connected machine, encrypted under
    /// the old key so in-flight agents can still read it.
    #[tokio::test]
    async fn s3_key_rotation_updates_live_key_and_queues_commands() {
        let old_key = crypto::generate_envelope_key();
        let state = test_state(Some("agent-key"), Some(&old_key));
        state.credentials.create_user("admin1", "AdminPass123!", "admin").unwrap();
        state.store.update_machine("agentA", serde_json::json!({}), serde_json::json!({}));
        state.store.update_machine("agentB", serde_json::json!({}), serde_json::json!({}));

        let app = build_router(state.clone());
        let token = state.auth.create_session("admin1", "admin");

        let response = app
            .oneshot({
                let mut req =
                    json_post("/api/fleet/rotate-encryption-key", serde_json::json!({"password": "AdminPass123!"}));
                req.headers_mut().insert("Cookie", format!("fleet_session={token}").parse().unwrap());
                req
            })
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let payload = body_json(response).await;
        assert_eq!(payload["success"], true);
        assert_eq!(payload["agents_queued"], 2);

        let new_key = payload["encryption_key"].as_str().unwrap().to_string();
        assert_ne!(new_key, old_key);
        assert_eq!(state.encryption_key.get(), Some(new_key.clone()));

        let pending = state.store.get_pending_commands("agentA");
        assert_eq!(pending.len(), 1);
        match &pending[0].command {
            Command::RotateEncryptionKey { envelope } => {
                let decrypted = crypto::decrypt_payload(&old_key, envelope).unwrap();
                assert_eq!(decrypted["new_key"], new_key);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    /// History stays capped at the configured size and returns entries in
    /// timestamp-ascending order, oldest evicted first.
    #[tokio::test]
    async fn s4_history_cap_keeps_newest_entries_in_order() {
        let state = test_state(None, None);
        for pct in [10, 20, 30, 40, 50] {
            state.store.update_machine(
                "mX",
                serde_json::json!({}),
                serde_json::json!({"cpu": {"percent": pct}}),
            );
        }
        let history = state.store.get_machine_history("mX", 3);
        assert_eq!(history.len(), 3);
        let percents: Vec<i64> =
            history.iter().map(|h| h["metrics"]["cpu"]["percent"].as_i64().unwrap()).collect();
        assert_eq!(percents, vec![30, 40, 50]);
    }

    /// The public cluster health endpoint requires no session.
    #[tokio::test]
    async fn cluster_health_is_unauthenticated() {
        let state = test_state(None, None);
        let app = build_router(state);
        let response = app
            .oneshot(Request::builder().uri("/api/fleet/cluster/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    /// Dashboard pages redirect unauthenticated browsers to `/login`
    /// instead of returning a bare JSON 401.
    #[tokio::test]
    async fn dashboard_page_redirects_when_unauthenticated() {
        let state = test_state(None, None);
        let app = build_router(state);
        let response = app
            .oneshot(Request::builder().uri("/dashboard").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        let location = response.headers().get("location").and_then(|v| v.to_str().ok());
        assert_eq!(location, Some("/login"));
    }
}
