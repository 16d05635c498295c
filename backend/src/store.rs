//! In-memory fleet data store: machine records, metric history, command
//! queues, network-test rings, widget/export logs, and fleet-wide
//! summaries.

use chrono::{DateTime, Utc};
use fleet_core::wire::{CommandStatus, HealthCheck, HealthStatus, QueuedCommand};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

const HISTORY_CAP: usize = 1000;
const NETWORK_TEST_CAP: usize = 100;
const WIDGET_LOG_CAP: usize = 500;
const ONLINE_SECONDS: i64 = 30;
const OFFLINE_SECONDS: i64 = 60;
const ALERT_THRESHOLD: f64 = 90.0;
/// Commands still `Pending` or `Delivered` after this long are swept to
/// `Expired` on the next poll for their machine, per the `StaleCommand`
/// grace-period behavior.
const COMMAND_EXPIRY_SECONDS: i64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    Online,
    Warning,
    Offline,
    /// Administratively silenced: set via [`FleetDataStore::set_machine_stopped`]
    /// and held until the machine reports in again, overriding the
    /// age-derived status in the meantime.
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineRecord {
    pub machine_id: String,
    pub info: serde_json::Value,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub status: MachineStatus,
    pub latest_metrics: serde_json::Value,
    #[serde(default)]
    pub health_check: Option<HealthCheck>,
}

#[derive(Debug, Clone, Serialize)]
struct HistoryEntry {
    timestamp: DateTime<Utc>,
    metrics: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportLogEntry {
    pub machine_id: String,
    pub timestamp: String,
    pub local_user: String,
    pub export_type: String,
    pub format: String,
    pub encrypted: bool,
    pub mode: String,
    pub filename: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct FleetAlert {
    pub machine_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub severity: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FleetSummary {
    pub total_machines: usize,
    pub online: usize,
    pub warning: usize,
    pub offline: usize,
    pub stopped: usize,
    pub avg_cpu: f64,
    pub avg_memory: f64,
    pub avg_disk: f64,
    pub alerts: Vec<FleetAlert>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    machines: HashMap<String, MachineRecord>,
    history: HashMap<String, VecDeque<HistoryEntry>>,
    agent_db_keys: HashMap<String, String>,
    export_logs: Vec<ExportLogEntry>,
    widget_logs: HashMap<String, VecDeque<serde_json::Value>>,
    commands: HashMap<String, VecDeque<QueuedCommand>>,
    network_tests: HashMap<String, HashMap<String, VecDeque<serde_json::Value>>>,
}

pub type OnNewAgent = Box<dyn Fn(&str, &serde_json::Value, &str) + Send + Sync>;

pub struct FleetDataStore {
    inner: Mutex<Inner>,
    on_new_agent: Option<OnNewAgent>,
}

fn metric_percent(metrics: &serde_json::Value, section: &str) -> f64 {
    metrics
        .get(section)
        .and_then(|s| s.get("percent"))
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0)
}

impl FleetDataStore {
    pub fn new(on_new_agent: Option<OnNewAgent>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            on_new_agent,
        }
    }

    /// Update (or create) a machine record and append to its metric
    /// history. Fires `on_new_agent` outside the lock on first contact.
    pub fn update_machine(&self, machine_id: &str, info: serde_json::Value, metrics: serde_json::Value) {
        let now = Utc::now();
        let mut is_new = false;
        let mut dashboard_info = None;

        {
            let mut inner = self.inner.lock().unwrap();
            match inner.machines.get_mut(machine_id) {
                Some(record) => {
                    record.last_seen = now;
                    record.status = MachineStatus::Online;
                    record.latest_metrics = metrics.clone();
                    if let (Some(existing), Some(incoming)) =
                        (record.info.as_object_mut(), info.as_object())
                    {
                        for (k, v) in incoming {
                            existing.insert(k.clone(), v.clone());
                        }
                    }
                }
                None => {
                    is_new = true;
                    inner.machines.insert(
                        machine_id.to_string(),
                        MachineRecord {
                            machine_id: machine_id.to_string(),
                            info: info.clone(),
                            first_seen: now,
                            last_seen: now,
                            status: MachineStatus::Online,
                            latest_metrics: metrics.clone(),
                            health_check: None,
                        },
                    );
                }
            }

            let history = inner
                .history
                .entry(machine_id.to_string())
                .or_insert_with(|| VecDeque::with_capacity(HISTORY_CAP));
            if history.len() >= HISTORY_CAP {
                history.pop_front();
            }
            history.push_back(HistoryEntry { timestamp: now, metrics });

            if is_new {
                let serial = info
                    .get("serial_number")
                    .and_then(|v| v.as_str())
                    .unwrap_or(machine_id)
                    .to_string();
                let dashboard_url = format!("/machine/{serial}/dashboard");
                dashboard_info = Some((info.clone(), dashboard_url));
            }
        }

        if is_new {
            let (info, dashboard_url) = dashboard_info.unwrap();
            tracing::info!(machine_id, dashboard_url = %dashboard_url, "new_agent_registered");
            if let Some(cb) = &self.on_new_agent {
                cb(machine_id, &info, &dashboard_url);
            }
        }
    }

    pub fn store_agent_db_key(&self, machine_id: &str, key_b64: &str) {
        self.inner
            .lock()
            .unwrap()
            .agent_db_keys
            .insert(machine_id.to_string(), key_b64.to_string());
    }

    pub fn get_agent_db_key(&self, machine_id: &str) -> Option<String> {
        self.inner.lock().unwrap().agent_db_keys.get(machine_id).cloned()
    }

    pub fn store_export_log(&self, machine_id: &str, log_data: serde_json::Value) {
        let entry = ExportLogEntry {
            machine_id: machine_id.to_string(),
            timestamp: log_data
                .get("timestamp")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| Utc::now().to_rfc3339()),
            local_user: log_data.get("local_user").and_then(|v| v.as_str()).unwrap_or("unknown").into(),
            export_type: log_data.get("export_type").and_then(|v| v.as_str()).unwrap_or("unknown").into(),
            format: log_data.get("format").and_then(|v| v.as_str()).unwrap_or("unknown").into(),
            encrypted: log_data.get("encrypted").and_then(|v| v.as_bool()).unwrap_or(false),
            mode: log_data.get("mode").and_then(|v| v.as_str()).unwrap_or("none").into(),
            filename: log_data.get("filename").and_then(|v| v.as_str()).unwrap_or("").into(),
            data: log_data,
        };
        self.inner.lock().unwrap().export_logs.push(entry);
    }

    pub fn get_export_logs(&self, machine_id: Option<&str>, limit: usize) -> Vec<ExportLogEntry> {
        let inner = self.inner.lock().unwrap();
        let mut logs: Vec<ExportLogEntry> = inner
            .export_logs
            .iter()
            .filter(|l| machine_id.map(|m| l.machine_id == m).unwrap_or(true))
            .cloned()
            .collect();
        logs.reverse();
        logs.truncate(limit);
        logs
    }

    pub fn store_widget_logs(&self, machine_id: &str, logs: Vec<serde_json::Value>) {
        let mut inner = self.inner.lock().unwrap();
        let ring = inner
            .widget_logs
            .entry(machine_id.to_string())
            .or_insert_with(|| VecDeque::with_capacity(WIDGET_LOG_CAP));
        for log in logs {
            if ring.len() >= WIDGET_LOG_CAP {
                ring.pop_front();
            }
            ring.push_back(log);
        }
    }

    pub fn get_widget_logs(&self, machine_id: &str, limit: usize) -> Vec<serde_json::Value> {
        let inner = self.inner.lock().unwrap();
        inner
            .widget_logs
            .get(machine_id)
            .map(|ring| {
                let len = ring.len();
                ring.iter().skip(len.saturating_sub(limit)).cloned().collect()
            })
            .unwrap_or_default()
    }

    fn resolve_status(record: &MachineRecord, now: DateTime<Utc>) -> MachineStatus {
        if record.status == MachineStatus::Stopped {
            return MachineStatus::Stopped;
        }
        let age = (now - record.last_seen).num_seconds();
        if age > OFFLINE_SECONDS {
            MachineStatus::Offline
        } else if age > ONLINE_SECONDS {
            MachineStatus::Warning
        } else {
            MachineStatus::Online
        }
    }

    /// Administratively mark a machine as stopped, overriding the
    /// age-derived status until it next reports in.
    pub fn set_machine_stopped(&self, machine_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.machines.get_mut(machine_id) {
            Some(record) => {
                record.status = MachineStatus::Stopped;
                true
            }
            None => false,
        }
    }

    pub fn get_machine(&self, machine_id: &str) -> Option<MachineRecord> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let record = inner.machines.get_mut(machine_id)?;
        record.status = Self::resolve_status(record, now);
        Some(record.clone())
    }

    /// Resolve a machine by `machine_id` first, falling back to a scan of
    /// `info.serial_number` across all machines.
    pub fn get_machine_by_identifier(&self, identifier: &str) -> Option<MachineRecord> {
        if let Some(m) = self.get_machine(identifier) {
            return Some(m);
        }
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let found_id = inner.machines.values().find_map(|m| {
            let serial = m.info.get("serial_number").and_then(|v| v.as_str());
            (serial == Some(identifier)).then(|| m.machine_id.clone())
        })?;
        let record = inner.machines.get_mut(&found_id)?;
        record.status = Self::resolve_status(record, now);
        Some(record.clone())
    }

    pub fn get_all_machines(&self) -> Vec<MachineRecord> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        for record in inner.machines.values_mut() {
            record.status = Self::resolve_status(record, now);
        }
        inner.machines.values().cloned().collect()
    }

    pub fn get_registered_agents(&self) -> Vec<serde_json::Value> {
        let machines = self.get_all_machines();
        machines
            .iter()
            .map(|m| {
                let serial = m
                    .info
                    .get("serial_number")
                    .and_then(|v| v.as_str())
                    .unwrap_or(&m.machine_id);
                let computer_name = m
                    .info
                    .get("computer_name")
                    .and_then(|v| v.as_str())
                    .or_else(|| m.info.get("hostname").and_then(|v| v.as_str()))
                    .unwrap_or(&m.machine_id);
                serde_json::json!({
                    "machine_id": m.machine_id,
                    "serial_number": serial,
                    "computer_name": computer_name,
                    "local_ip": m.info.get("local_ip").and_then(|v| v.as_str()).unwrap_or("unknown"),
                    "dashboard_url": format!("/machine/{serial}/dashboard"),
                    "first_seen": m.first_seen,
                    "last_seen": m.last_seen,
                    "status": m.status,
                })
            })
            .collect()
    }

    pub fn get_machine_history(&self, machine_id: &str, limit: usize) -> Vec<serde_json::Value> {
        let inner = self.inner.lock().unwrap();
        inner
            .history
            .get(machine_id)
            .map(|h| {
                let len = h.len();
                h.iter()
                    .skip(len.saturating_sub(limit))
                    .map(|e| serde_json::json!({"timestamp": e.timestamp, "metrics": e.metrics}))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get_fleet_summary(&self) -> FleetSummary {
        let machines = self.get_all_machines();
        let total = machines.len();
        let online_machines: Vec<&MachineRecord> = machines
            .iter()
            .filter(|m| m.status == MachineStatus::Online)
            .collect();
        let online = online_machines.len();
        let warning = machines.iter().filter(|m| m.status == MachineStatus::Warning).count();
        let offline = machines.iter().filter(|m| m.status == MachineStatus::Offline).count();
        let stopped = machines.iter().filter(|m| m.status == MachineStatus::Stopped).count();

        let (avg_cpu, avg_memory, avg_disk) = if online > 0 {
            let n = online as f64;
            (
                online_machines.iter().map(|m| metric_percent(&m.latest_metrics, "cpu")).sum::<f64>() / n,
                online_machines.iter().map(|m| metric_percent(&m.latest_metrics, "memory")).sum::<f64>() / n,
                online_machines.iter().map(|m| metric_percent(&m.latest_metrics, "disk")).sum::<f64>() / n,
            )
        } else {
            (0.0, 0.0, 0.0)
        };

        let mut alerts = Vec::new();
        for m in &online_machines {
            for (kind, section) in [("cpu", "cpu"), ("memory", "memory"), ("disk", "disk")] {
                let value = metric_percent(&m.latest_metrics, section);
                if value > ALERT_THRESHOLD {
                    alerts.push(FleetAlert {
                        machine_id: m.machine_id.clone(),
                        kind: kind.to_string(),
                        severity: "critical".to_string(),
                        message: format!("{} usage at {:.1}%", kind.to_uppercase(), value),
                    });
                }
            }
        }

        FleetSummary {
            total_machines: total,
            online,
            warning,
            offline,
            stopped,
            avg_cpu,
            avg_memory,
            avg_disk,
            alerts,
            timestamp: Utc::now(),
        }
    }

    pub fn update_health_check(&self, machine_id: &str, health_check: HealthCheck) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.machines.get_mut(machine_id) {
            record.health_check = Some(health_check);
        }
    }

    pub fn store_network_test_metrics(&self, machine_id: &str, test_type: &str, mut metrics: serde_json::Value) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.machines.contains_key(machine_id) {
            tracing::warn!(machine_id, "network_test_for_unknown_machine");
            return;
        }
        if let Some(obj) = metrics.as_object_mut() {
            obj.insert("timestamp".into(), serde_json::json!(Utc::now()));
            obj.insert("machine_id".into(), serde_json::json!(machine_id));
        }
        let by_type = inner.network_tests.entry(machine_id.to_string()).or_default();
        let ring = by_type
            .entry(test_type.to_string())
            .or_insert_with(|| VecDeque::with_capacity(NETWORK_TEST_CAP));
        if ring.len() >= NETWORK_TEST_CAP {
            ring.pop_front();
        }
        ring.push_back(metrics);
    }

    pub fn get_network_test_metrics(
        &self,
        machine_id: &str,
        test_type: Option<&str>,
        limit: usize,
    ) -> HashMap<String, Vec<serde_json::Value>> {
        let inner = self.inner.lock().unwrap();
        let mut result = HashMap::new();
        if let Some(by_type) = inner.network_tests.get(machine_id) {
            let types: Vec<&str> = match test_type {
                Some(t) => vec![t],
                None => by_type.keys().map(String::as_str).collect(),
            };
            for t in types {
                if let Some(ring) = by_type.get(t) {
                    let len = ring.len();
                    result.insert(
                        t.to_string(),
                        ring.iter().skip(len.saturating_sub(limit)).cloned().collect(),
                    );
                }
            }
        }
        result
    }

    /// Fleet-wide network test aggregation over the last `hours`.
    pub fn get_fleet_network_test_summary(&self, test_type: Option<&str>, hours: i64) -> serde_json::Value {
        let inner = self.inner.lock().unwrap();
        let cutoff = Utc::now() - chrono::Duration::hours(hours);
        let test_types: Vec<&str> = match test_type {
            Some(t) => vec![t],
            None => vec!["udp_quality", "connection_rate", "throughput", "mos"],
        };

        let mut total_tests = 0usize;
        let mut machines_tested = 0usize;
        let mut by_machine = serde_json::Map::new();
        let mut aggregated: HashMap<&str, Vec<f64>> = HashMap::new();

        for (machine_id, by_type) in inner.network_tests.iter() {
            let mut machine_has_tests = false;
            let mut machine_entry = serde_json::Map::new();

            for &t_type in &test_types {
                let Some(ring) = by_type.get(t_type) else { continue };
                let recent: Vec<&serde_json::Value> = ring
                    .iter()
                    .filter(|t| {
                        t.get("timestamp")
                            .and_then(|v| v.as_str())
                            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                            .map(|dt| dt.with_timezone(&Utc) > cutoff)
                            .unwrap_or(false)
                    })
                    .collect();

                if recent.is_empty() {
                    continue;
                }
                machine_has_tests = true;
                total_tests += recent.len();

                machine_entry.insert(
                    t_type.to_string(),
                    serde_json::json!({"count": recent.len(), "latest": recent.last()}),
                );

                let field = match t_type {
                    "mos" => "mos_score",
                    "udp_quality" => "quality_score",
                    "throughput" => "download_mbps",
                    "connection_rate" => "cps",
                    _ => continue,
                };
                let values = aggregated.entry(t_type).or_default();
                values.extend(recent.iter().filter_map(|t| t.get(field).and_then(|v| v.as_f64())));
            }

            if machine_has_tests {
                machines_tested += 1;
                by_machine.insert(machine_id.clone(), serde_json::Value::Object(machine_entry));
            }
        }

        let mut agg_json = serde_json::Map::new();
        for (t_type, values) in aggregated {
            if values.is_empty() {
                continue;
            }
            let count = values.len();
            let avg = values.iter().sum::<f64>() / count as f64;
            let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            agg_json.insert(
                t_type.to_string(),
                serde_json::json!({"count": count, "avg": avg, "min": min, "max": max}),
            );
        }

        serde_json::json!({
            "total_tests": total_tests,
            "machines_tested": machines_tested,
            "by_machine": by_machine,
            "aggregated": agg_json,
            "time_window_hours": hours,
            "timestamp": Utc::now(),
        })
    }

    pub fn enqueue_command(&self, machine_id: &str, command: QueuedCommand) {
        self.inner
            .lock()
            .unwrap()
            .commands
            .entry(machine_id.to_string())
            .or_default()
            .push_back(command);
    }

    /// Atomically marks every `Pending` command for a machine as
    /// `Delivered` and returns exactly those (the ones just delivered by
    /// this poll), so a single poll never redelivers a command a prior
    /// poll already handed out. Also sweeps commands stuck `Pending` or
    /// `Delivered` past [`COMMAND_EXPIRY_SECONDS`] to `Expired` first.
    pub fn get_pending_commands(&self, machine_id: &str) -> Vec<QueuedCommand> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let Some(queue) = inner.commands.get_mut(machine_id) else {
            return Vec::new();
        };

        for cmd in queue.iter_mut() {
            if matches!(cmd.status, CommandStatus::Pending | CommandStatus::Delivered)
                && (now - cmd.created_at).num_seconds() > COMMAND_EXPIRY_SECONDS
            {
                cmd.status = CommandStatus::Expired;
            }
        }

        let mut delivered = Vec::new();
        for cmd in queue.iter_mut() {
            if cmd.status == CommandStatus::Pending {
                cmd.status = CommandStatus::Delivered;
                delivered.push(cmd.clone());
            }
        }
        delivered
    }

    /// Most recent commands queued for a machine, newest first, regardless
    /// of delivery/ack state.
    pub fn get_recent_commands(&self, machine_id: &str, limit: usize) -> Vec<QueuedCommand> {
        let inner = self.inner.lock().unwrap();
        inner
            .commands
            .get(machine_id)
            .map(|q| q.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Transitions a `Delivered` command to `Completed`/`Failed` based on
    /// the agent's outcome. Acks for a command this store has no record of
    /// (already expired, or a different server instance's queue) are
    /// still accepted and logged rather than rejected, per the
    /// `StaleCommand` behavior.
    pub fn acknowledge_command(
        &self,
        machine_id: &str,
        command_id: &str,
        success: bool,
        result: Option<serde_json::Value>,
    ) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if let Some(queue) = inner.commands.get_mut(machine_id) {
            if let Some(cmd) = queue.iter_mut().find(|c| c.id == command_id) {
                cmd.status = if success { CommandStatus::Completed } else { CommandStatus::Failed };
                cmd.executed_at = Some(Utc::now());
                cmd.result = result;
                return true;
            }
        }
        tracing::warn!(machine_id, command_id, "ack_for_unknown_command");
        false
    }
}

impl HealthCheck {
    pub fn new(status: HealthStatus, data: serde_json::Value) -> Self {
        let agent_version = data.get("agent_version").and_then(|v| v.as_str()).map(str::to_string);
        let uptime_seconds = data.get("uptime_seconds").and_then(|v| v.as_u64());
        let agent_responsive = data.get("responsive").and_then(|v| v.as_bool()).unwrap_or(true);
        Self {
            status,
            data,
            agent_version,
            uptime_seconds,
            agent_responsive,
            checked_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_machine_fires_callback_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let calls = std::sync::Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let store = FleetDataStore::new(Some(Box::new(move |_, _, _| {
            calls2.fetch_add(1, Ordering::SeqCst);
        })));
        store.update_machine("m1", serde_json::json!({}), serde_json::json!({}));
        store.update_machine("m1", serde_json::json!({}), serde_json::json!({}));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fleet_summary_averages_only_online_machines() {
        let store = FleetDataStore::new(None);
        store.update_machine(
            "m1",
            serde_json::json!({}),
            serde_json::json!({"cpu": {"percent": 50.0}}),
        );
        let summary = store.get_fleet_summary();
        assert_eq!(summary.online, 1);
        assert!((summary.avg_cpu - 50.0).abs() < 0.01);
    }

    #[test]
    fn fleet_summary_zero_safe_with_no_online_machines() {
        let store = FleetDataStore::new(None);
        let summary = store.get_fleet_summary();
        assert_eq!(summary.total_machines, 0);
        assert_eq!(summary.avg_cpu, 0.0);
    }

    #[test]
    fn alert_raised_above_ninety_percent() {
        let store = FleetDataStore::new(None);
        store.update_machine(
            "m1",
            serde_json::json!({}),
            serde_json::json!({"cpu": {"percent": 95.0}}),
        );
        let summary = store.get_fleet_summary();
        assert_eq!(summary.alerts.len(), 1);
        assert_eq!(summary.alerts[0].kind, "cpu");
    }

    #[test]
    fn machine_lookup_falls_back_to_serial_number() {
        let store = FleetDataStore::new(None);
        store.update_machine(
            "internal-id-1",
            serde_json::json!({"serial_number": "SN123"}),
            serde_json::json!({}),
        );
        assert!(store.get_machine_by_identifier("SN123").is_some());
    }

    #[test]
    fn history_is_capacity_bounded() {
        let store = FleetDataStore::new(None);
        for i in 0..(HISTORY_CAP + 10) {
            store.update_machine("m1", serde_json::json!({}), serde_json::json!({"n": i}));
        }
        assert_eq!(store.get_machine_history("m1", HISTORY_CAP + 10).len(), HISTORY_CAP);
    }

    #[test]
    fn recent_commands_are_newest_first() {
        use fleet_core::wire::{Command, CommandStatus, QueuedCommand};

        let store = FleetDataStore::new(None);
        store.update_machine("m1", serde_json::json!({}), serde_json::json!({}));
        for i in 0..3 {
            store.enqueue_command(
                "m1",
                QueuedCommand {
                    id: format!("cmd-{i}"),
                    machine_id: "m1".to_string(),
                    command: Command::RestartAgent,
                    created_at: Utc::now(),
                    status: CommandStatus::Pending,
                    executed_at: None,
                    result: None,
                },
            );
        }
        let recent = store.get_recent_commands("m1", 2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, "cmd-2");
        assert_eq!(recent[1].id, "cmd-1");
    }

    #[test]
    fn command_lifecycle_delivers_once_then_acks_to_completed() {
        use fleet_core::wire::{Command, CommandStatus, QueuedCommand};

        let store = FleetDataStore::new(None);
        store.update_machine("m1", serde_json::json!({}), serde_json::json!({}));
        store.enqueue_command(
            "m1",
            QueuedCommand {
                id: "cmd-1".to_string(),
                machine_id: "m1".to_string(),
                command: Command::RestartAgent,
                created_at: Utc::now(),
                status: CommandStatus::Pending,
                executed_at: None,
                result: None,
            },
        );

        let first_poll = store.get_pending_commands("m1");
        assert_eq!(first_poll.len(), 1);
        assert_eq!(first_poll[0].status, CommandStatus::Delivered);

        // A second poll before the ack must not redeliver the same command.
        assert!(store.get_pending_commands("m1").is_empty());

        assert!(store.acknowledge_command("m1", "cmd-1", true, Some(serde_json::json!({"pid": 1}))));
        let recent = store.get_recent_commands("m1", 1);
        assert_eq!(recent[0].status, CommandStatus::Completed);
        assert!(recent[0].executed_at.is_some());
    }

    #[test]
    fn ack_for_unknown_command_is_accepted_but_has_no_effect() {
        let store = FleetDataStore::new(None);
        store.update_machine("m1", serde_json::json!({}), serde_json::json!({}));
        assert!(!store.acknowledge_command("m1", "ghost-cmd", true, None));
    }

    #[test]
    fn stopped_status_overrides_age_until_next_report() {
        let store = FleetDataStore::new(None);
        store.update_machine("m1", serde_json::json!({}), serde_json::json!({}));
        assert!(store.set_machine_stopped("m1"));
        assert_eq!(store.get_machine("m1").unwrap().status, MachineStatus::Stopped);

        let summary = store.get_fleet_summary();
        assert_eq!(summary.stopped, 1);
        assert_eq!(summary.online, 0);

        store.update_machine("m1", serde_json::json!({}), serde_json::json!({}));
        assert_eq!(store.get_machine("m1").unwrap().status, MachineStatus::Online);
    }

    #[test]
    fn set_machine_stopped_is_false_for_unknown_machine() {
        let store = FleetDataStore::new(None);
        assert!(!store.set_machine_stopped("ghost"));
    }
}
