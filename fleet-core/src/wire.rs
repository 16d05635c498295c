//! Wire-format types shared between `fleet-server` and `fleet-agent`.
//!
//! `machine_info` and `metrics` are treated as largely opaque JSON by the
//! server (it stores and forwards them, never interprets individual
//! fields) so they're modeled here as a typed envelope around a
//! `serde_json::Map` rather than an exhaustive struct. A handful of fields
//! the server *does* read (`e2ee_enabled`, `serial_number`) get real
//! struct fields so callers don't have to juggle raw JSON for them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The body of `POST /api/fleet/report`, before any E2EE unwrapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentReport {
    /// Present when `encrypted` is true; the plaintext fields below are
    /// then absent and must be recovered via `crypto::decrypt_payload`.
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub ciphertext: Option<String>,
    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub machine_id: Option<String>,
    #[serde(default)]
    pub machine_info: MachineInfo,
    #[serde(default)]
    pub metrics: Metrics,
    /// Agent's local credential-store encryption key, forwarded to the
    /// server only when the payload decrypted successfully.
    #[serde(default)]
    pub agent_db_key: Option<String>,
}

/// Static identity/posture fields reported once per sample by the agent.
/// `extra` carries whatever additional keys a given platform sampler adds;
/// the server never inspects them, only stores and re-serves them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineInfo {
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub os_version: Option<String>,
    #[serde(default)]
    pub agent_version: Option<String>,
    /// Set by the server after decrypting (or failing to decrypt) the
    /// payload; never trusted from the agent's own report.
    #[serde(default)]
    pub e2ee_enabled: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Point-in-time metric sample. Like `MachineInfo`, most of this is opaque
/// to the server; `extra` holds whatever sub-objects
/// (`battery`, `network_quality`, ...) the sampling platform produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metrics {
    #[serde(default)]
    pub cpu_percent: Option<f64>,
    #[serde(default)]
    pub memory_percent: Option<f64>,
    #[serde(default)]
    pub load_average: Option<[f64; 3]>,
    #[serde(default)]
    pub uptime_seconds: Option<u64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A single health-check result for a machine, as reported or derived.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub agent_version: Option<String>,
    #[serde(default)]
    pub uptime_seconds: Option<u64>,
    #[serde(default)]
    pub agent_responsive: bool,
    pub checked_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

/// A command queued for an agent to pick up and execute. Dispatch is an
/// explicit tagged enum rather than a name string plus dynamic lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    KillProcess { pid: u32 },
    RestartAgent,
    ClearDnsCache,
    RotateEncryptionKey { envelope: crate::crypto::Envelope },
    /// A command name the receiving side doesn't recognize. Agents built
    /// against an older wire contract acknowledge and ignore these rather
    /// than erroring, so the server can roll out new command kinds without
    /// every agent being updated in lockstep.
    #[serde(other)]
    Unknown,
}

/// Lifecycle state of a [`QueuedCommand`]. A poll transitions `Pending` to
/// `Delivered`; an ack transitions `Delivered` to `Completed`/`Failed`; a
/// sweep past the expiry grace period transitions any undelivered or
/// unacknowledged command to `Expired`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Delivered,
    Completed,
    Failed,
    Expired,
}

/// A command as it sits in the server's queue, with bookkeeping the agent
/// never sees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedCommand {
    pub id: String,
    pub machine_id: String,
    #[serde(flatten)]
    pub command: Command,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default = "default_command_status")]
    pub status: CommandStatus,
    #[serde(default)]
    pub executed_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
}

fn default_command_status() -> CommandStatus {
    CommandStatus::Pending
}

/// Body of `POST /api/fleet/command/{machine_id}/ack`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandAck {
    pub command_id: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub detail: Option<String>,
}

/// A single widget log entry forwarded via `POST /api/fleet/widget-logs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WidgetLogEntry {
    pub widget: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub is_export: bool,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Body of `POST /api/fleet/widget-logs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WidgetLogsReport {
    pub machine_id: String,
    #[serde(default)]
    pub logs: Vec<WidgetLogEntry>,
}
