//! Network and speedtest analysis reads. Grounded on `data_store.py`'s
//! network-test storage/aggregation and the speedtest-aggregator read
//! surface referenced from `agent_routes.py`'s widget-logs handler.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::error::{AppError, AppResult};
use crate::routes::auth_session::RequireSession;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct HoursQuery {
    #[serde(default = "default_hours")]
    hours: i64,
}

fn default_hours() -> i64 {
    24
}

/// `GET /api/fleet/speedtest/summary`
pub async fn speedtest_summary(
    State(state): State<AppState>,
    _session: RequireSession,
    Query(q): Query<HoursQuery>,
) -> Json<serde_json::Value> {
    Json(state.store.get_fleet_network_test_summary(Some("throughput"), q.hours))
}

/// `GET /api/fleet/speedtest/machine/{id}`
pub async fn speedtest_machine(
    State(state): State<AppState>,
    _session: RequireSession,
    Path(machine_id): Path<String>,
) -> Json<serde_json::Value> {
    let results = state.store.get_network_test_metrics(&machine_id, Some("throughput"), 50);
    Json(json!({"machine_id": machine_id, "results": results}))
}

/// `GET /api/fleet/speedtest/comparison`
pub async fn speedtest_comparison(
    State(state): State<AppState>,
    _session: RequireSession,
) -> Json<serde_json::Value> {
    let machines = state.store.get_all_machines();
    let rows: Vec<serde_json::Value> = machines
        .iter()
        .map(|m| {
            let results = state.store.get_network_test_metrics(&m.machine_id, Some("throughput"), 1);
            json!({
                "machine_id": m.machine_id,
                "latest": results.get("throughput").and_then(|v| v.last()),
            })
        })
        .collect();
    Json(json!({"machines": rows}))
}

/// `GET /api/fleet/speedtest/anomalies` — machines whose latest download
/// throughput is far below the fleet average.
pub async fn speedtest_anomalies(
    State(state): State<AppState>,
    _session: RequireSession,
) -> Json<serde_json::Value> {
    let summary = state.store.get_fleet_network_test_summary(Some("throughput"), 24);
    let avg = summary
        .get("aggregated")
        .and_then(|a| a.get("throughput"))
        .and_then(|t| t.get("avg"))
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0);

    let mut anomalies = Vec::new();
    if avg > 0.0 {
        for m in state.store.get_all_machines() {
            let results = state.store.get_network_test_metrics(&m.machine_id, Some("throughput"), 1);
            if let Some(latest) = results.get("throughput").and_then(|v| v.last()) {
                if let Some(mbps) = latest.get("download_mbps").and_then(|v| v.as_f64()) {
                    if mbps < avg * 0.5 {
                        anomalies.push(json!({
                            "machine_id": m.machine_id,
                            "download_mbps": mbps,
                            "fleet_avg_mbps": avg,
                        }));
                    }
                }
            }
        }
    }
    Json(json!({"anomalies": anomalies, "fleet_avg_mbps": avg}))
}

#[derive(Deserialize)]
pub struct RecentQuery {
    #[serde(default = "default_recent_limit")]
    limit: usize,
}

fn default_recent_limit() -> usize {
    10
}

/// `GET /api/fleet/speedtest/recent`
pub async fn speedtest_recent(
    State(state): State<AppState>,
    _session: RequireSession,
    Query(q): Query<RecentQuery>,
) -> Json<serde_json::Value> {
    recent_for_all(&state, q.limit)
}

/// `GET /api/fleet/speedtest/recent20` — fixed-size convenience alias.
pub async fn speedtest_recent20(State(state): State<AppState>, _session: RequireSession) -> Json<serde_json::Value> {
    recent_for_all(&state, 20)
}

fn recent_for_all(state: &AppState, limit: usize) -> Json<serde_json::Value> {
    let machines = state.store.get_all_machines();
    let mut entries = Vec::new();
    for m in &machines {
        let results = state.store.get_network_test_metrics(&m.machine_id, Some("throughput"), limit);
        if let Some(tests) = results.get("throughput") {
            for t in tests {
                entries.push(json!({"machine_id": m.machine_id, "test": t}));
            }
        }
    }
    Json(json!({"tests": entries}))
}

/// `GET /api/fleet/speedtest/subnet` — groups the latest per-machine
/// throughput result by the /24 derived from `local_ip`.
pub async fn speedtest_subnet(State(state): State<AppState>, _session: RequireSession) -> Json<serde_json::Value> {
    let machines = state.store.get_all_machines();
    let mut by_subnet: std::collections::HashMap<String, Vec<serde_json::Value>> = std::collections::HashMap::new();

    for m in &machines {
        let local_ip = m.info.get("local_ip").and_then(|v| v.as_str()).unwrap_or("unknown");
        let subnet = local_ip
            .rsplit_once('.')
            .map(|(prefix, _)| format!("{prefix}.0/24"))
            .unwrap_or_else(|| "unknown".to_string());

        let results = state.store.get_network_test_metrics(&m.machine_id, Some("throughput"), 1);
        if let Some(latest) = results.get("throughput").and_then(|v| v.last()) {
            by_subnet.entry(subnet).or_default().push(json!({
                "machine_id": m.machine_id,
                "test": latest,
            }));
        }
    }
    Json(json!({"subnets": by_subnet}))
}

/// `GET /api/fleet/network-analysis`
pub async fn network_analysis(
    State(state): State<AppState>,
    _session: RequireSession,
    Query(q): Query<HoursQuery>,
) -> Json<serde_json::Value> {
    Json(state.store.get_fleet_network_test_summary(None, q.hours))
}

/// `GET /api/fleet/network-analysis/{id}`
pub async fn network_analysis_machine(
    State(state): State<AppState>,
    _session: RequireSession,
    Path(machine_id): Path<String>,
    Query(q): Query<RecentQuery>,
) -> AppResult<Json<serde_json::Value>> {
    if state.store.get_machine(&machine_id).is_none() {
        return Err(AppError::NotFound(format!("Machine '{machine_id}' not found")));
    }
    let results = state.store.get_network_test_metrics(&machine_id, None, q.limit.max(50));
    Ok(Json(json!({"machine_id": machine_id, "results": results})))
}

/// `GET /api/fleet/widget-logs` — fleet-wide widget log read, distinct from
/// the per-machine route in `routes::machine`.
pub async fn widget_logs(
    State(state): State<AppState>,
    _session: RequireSession,
    Query(q): Query<RecentQuery>,
) -> Json<serde_json::Value> {
    let machines = state.store.get_all_machines();
    let mut by_machine = serde_json::Map::new();
    for m in &machines {
        let logs = state.store.get_widget_logs(&m.machine_id, q.limit);
        if !logs.is_empty() {
            by_machine.insert(m.machine_id.clone(), json!(logs));
        }
    }
    Json(json!({"machines": by_machine}))
}
