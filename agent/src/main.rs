mod commands;
mod sampler;

use clap::Parser;
use fleet_core::wire::{CommandAck, MachineInfo, QueuedCommand};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

const REPORT_INTERVAL_SECONDS: u64 = 10;
const COMMAND_POLL_INTERVAL_SECONDS: u64 = 30;
const MAX_RETRIES: u32 = 3;
const CONSECUTIVE_FAILURE_ALERT_THRESHOLD: u32 = 5;

/// Fleet agent: reports local system metrics and executes whitelisted
/// remote commands.
#[derive(Parser, Debug)]
#[command(name = "fleet-agent", version)]
struct Cli {
    /// Central server base URL, e.g. https://fleet.example.com:8443
    #[arg(long, env = "FLEET_SERVER_URL")]
    server_url: Option<String>,

    /// This machine's identifier. Defaults to the local hostname.
    #[arg(long, env = "FLEET_MACHINE_ID")]
    machine_id: Option<String>,

    /// API key for fleet server authentication.
    #[arg(long, env = "FLEET_API_KEY")]
    api_key: Option<String>,

    /// Shared E2EE payload encryption key.
    #[arg(long, env = "FLEET_ENCRYPTION_KEY")]
    encryption_key: Option<String>,

    /// Report interval in seconds.
    #[arg(long, default_value_t = REPORT_INTERVAL_SECONDS)]
    interval: u64,
}

#[derive(Serialize)]
struct ReportPayload {
    machine_id: String,
    machine_info: MachineInfo,
    metrics: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    agent_db_key: Option<String>,
}

#[derive(Deserialize, Default)]
struct ReportResponse {
    #[serde(default)]
    e2ee_verified: bool,
    #[serde(default)]
    db_key_stored: bool,
}

#[derive(Deserialize, Default)]
struct CommandsResponse {
    #[serde(default)]
    commands: Vec<QueuedCommand>,
}

struct Agent {
    client: reqwest::Client,
    server_url: Option<String>,
    machine_id: String,
    api_key: Option<String>,
    encryption_key: std::sync::Mutex<Option<String>>,
    machine_info: MachineInfo,
    sampler: std::sync::Mutex<sampler::Sampler>,
    db_key_shared: std::sync::atomic::AtomicBool,
    consecutive_failures: std::sync::atomic::AtomicU32,
}

impl Agent {
    fn fleet_mode(&self) -> bool {
        self.server_url.is_some() && self.api_key.is_some()
    }

    fn headers(&self) -> reqwest::header::HeaderMap {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(key) = &self.api_key {
            if let Ok(v) = reqwest::header::HeaderValue::from_str(key) {
                headers.insert("X-API-Key", v);
            }
        }
        headers
    }

    async fn send_report_once(&self, metrics: &serde_json::Value) -> bool {
        let Some(server_url) = &self.server_url else { return false };

        let encryption_key = self.encryption_key.lock().unwrap().clone();
        let agent_db_key = if encryption_key.is_some() && !self.db_key_shared.load(std::sync::atomic::Ordering::Relaxed) {
            None // no local agent database in this crate; key sharing is a no-op until one exists
        } else {
            None
        };

        let payload = ReportPayload {
            machine_id: self.machine_id.clone(),
            machine_info: self.machine_info.clone(),
            metrics: metrics.clone(),
            agent_db_key,
        };

        let body = match &encryption_key {
            Some(key) => match fleet_core::crypto::encrypt_payload(key, &json!(payload)) {
                Ok(envelope) => json!(envelope),
                Err(e) => {
                    error!(error = %e, "failed to encrypt report payload");
                    return false;
                }
            },
            None => json!(payload),
        };

        let result = self
            .client
            .post(format!("{server_url}/api/fleet/report"))
            .headers(self.headers())
            .json(&body)
            .timeout(Duration::from_secs(10))
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                self.consecutive_failures.store(0, std::sync::atomic::Ordering::Relaxed);
                if let Ok(parsed) = response.json::<ReportResponse>().await {
                    if parsed.e2ee_verified {
                        info!("server confirmed E2EE decryption");
                    }
                    if parsed.db_key_stored {
                        self.db_key_shared.store(true, std::sync::atomic::Ordering::Relaxed);
                    }
                }
                info!(server_url, "report sent successfully");
                true
            }
            Ok(response) => {
                warn!(status = %response.status(), "server rejected report");
                false
            }
            Err(e) => {
                warn!(error = %e, "error sending report");
                false
            }
        }
    }

    async fn send_report_with_retry(&self, metrics: &serde_json::Value) -> bool {
        for attempt in 0..=MAX_RETRIES {
            if self.send_report_once(metrics).await {
                if attempt > 0 {
                    info!(attempt, "report succeeded after retry");
                }
                return true;
            }
            if attempt < MAX_RETRIES {
                let wait = Duration::from_secs_f64(2f64.powi(attempt as i32) + rand::random::<f64>());
                info!(attempt = attempt + 1, max_retries = MAX_RETRIES, wait_secs = wait.as_secs_f64(), "retrying report");
                tokio::time::sleep(wait).await;
            }
        }

        let failures = self.consecutive_failures.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
        if failures >= CONSECUTIVE_FAILURE_ALERT_THRESHOLD {
            error!(failures, "server unreachable: consecutive report failures");
        } else {
            warn!("report failed after {MAX_RETRIES} retries");
        }
        false
    }

    async fn report_loop(&self, interval: Duration) {
        info!(interval_secs = interval.as_secs(), "agent reporting loop started");
        loop {
            let metrics = self.sampler.lock().unwrap().collect();
            self.send_report_with_retry(&metrics).await;
            tokio::time::sleep(interval).await;
        }
    }

    async fn poll_commands(&self) {
        if !self.fleet_mode() {
            return;
        }
        let Some(server_url) = &self.server_url else { return };

        let response = self
            .client
            .get(format!("{server_url}/api/fleet/commands/{}", self.machine_id))
            .headers(self.headers())
            .timeout(Duration::from_secs(5))
            .send()
            .await;

        let Ok(response) = response else {
            return;
        };
        if !response.status().is_success() {
            return;
        }
        let Ok(parsed) = response.json::<CommandsResponse>().await else {
            return;
        };

        for queued in parsed.commands {
            info!(command_id = %queued.id, "executing command");
            let current_key = self.encryption_key.lock().unwrap().clone();
            let (outcome, new_key) = commands::execute(&queued.command, &current_key);
            if let Some(new_key) = new_key {
                *self.encryption_key.lock().unwrap() = Some(new_key);
            }

            let restart_requested = outcome.restart_requested;
            let ack = CommandAck {
                command_id: queued.id.clone(),
                success: outcome.success,
                detail: Some(outcome.detail),
            };
            let ack_result = self
                .client
                .post(format!("{server_url}/api/fleet/command/{}/ack", self.machine_id))
                .headers(self.headers())
                .json(&ack)
                .timeout(Duration::from_secs(5))
                .send()
                .await;
            match ack_result {
                Ok(r) if r.status().is_success() => info!(command_id = %queued.id, "command acknowledged"),
                _ => warn!(command_id = %queued.id, "failed to acknowledge command"),
            }

            if restart_requested {
                info!("agent_exiting_for_restart");
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    std::process::exit(0);
                });
            }
        }
    }

    async fn command_loop(&self, interval: Duration) {
        info!(interval_secs = interval.as_secs(), "command polling loop started");
        loop {
            self.poll_commands().await;
            tokio::time::sleep(interval).await;
        }
    }
}

fn machine_info() -> MachineInfo {
    MachineInfo {
        hostname: Some(hostname()),
        serial_number: None,
        os_version: Some(format!("{} {}", std::env::consts::OS, std::env::consts::ARCH)),
        agent_version: Some(env!("CARGO_PKG_VERSION").to_string()),
        e2ee_enabled: false,
        extra: Default::default(),
    }
}

fn hostname() -> String {
    sysinfo_hostname().unwrap_or_else(|| "unknown-host".to_string())
}

fn sysinfo_hostname() -> Option<String> {
    use sysinfo::SystemExt;
    sysinfo::System::new().host_name()
}

fn lock_file_path() -> PathBuf {
    directories::UserDirs::new()
        .map(|d| d.home_dir().join(".atlas-agent.lock"))
        .unwrap_or_else(|| PathBuf::from("/tmp/.atlas-agent.lock"))
}

/// Best-effort single-instance guard: refuses to start if another agent
/// process already holds the lock file with a live PID.
fn acquire_singleton_lock() -> std::io::Result<std::fs::File> {
    let path = lock_file_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if let Ok(contents) = std::fs::read_to_string(&path) {
        if let Ok(pid) = contents.trim().parse::<u32>() {
            use sysinfo::{PidExt, SystemExt};
            let mut system = sysinfo::System::new();
            system.refresh_processes();
            if system.process(sysinfo::Pid::from_u32(pid)).is_some() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("another fleet-agent instance is already running (PID {pid})"),
                ));
            }
        }
    }

    let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(&path)?;
    write!(file, "{}", std::process::id())?;
    Ok(file)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "fleet_agent=info".into()))
        .json()
        .init();

    let cli = Cli::parse();

    let _lock = match acquire_singleton_lock() {
        Ok(f) => f,
        Err(e) => {
            error!(error = %e, "failed to acquire singleton lock");
            std::process::exit(1);
        }
    };

    let machine_id = cli.machine_id.clone().unwrap_or_else(hostname);
    if cli.server_url.is_none() || cli.api_key.is_none() {
        info!("running in standalone mode (no server_url/api_key configured)");
    }

    let agent = Agent {
        client: reqwest::Client::new(),
        server_url: cli.server_url.clone(),
        machine_id,
        api_key: cli.api_key.clone(),
        encryption_key: std::sync::Mutex::new(cli.encryption_key.clone()),
        machine_info: machine_info(),
        sampler: std::sync::Mutex::new(sampler::Sampler::new()),
        db_key_shared: std::sync::atomic::AtomicBool::new(false),
        consecutive_failures: std::sync::atomic::AtomicU32::new(0),
    };
    let agent = std::sync::Arc::new(agent);

    let report_interval = Duration::from_secs(cli.interval.max(1));
    let command_interval = Duration::from_secs(COMMAND_POLL_INTERVAL_SECONDS);

    let report_agent = agent.clone();
    let report_handle = tokio::spawn(async move { report_agent.report_loop(report_interval).await });

    let command_agent = agent.clone();
    let command_handle = tokio::spawn(async move { command_agent.command_loop(command_interval).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        _ = report_handle => {}
        _ = command_handle => {}
    }
}
