//! Fleet-wide dashboard reads: summary, machine list, per-machine history,
//! and the `/storage` aggregate view. Grounded on `data_store.py`'s
//! summary/history methods and `dashboard_routes.py`'s read endpoints.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::routes::auth_session::RequireSession;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    limit: usize,
}

fn default_history_limit() -> usize {
    100
}

/// `GET /api/fleet/summary`
pub async fn summary(State(state): State<AppState>, _session: RequireSession) -> Json<serde_json::Value> {
    Json(json!(state.store.get_fleet_summary()))
}

/// `GET /api/fleet/machines` — full machine records, status freshly
/// recomputed from `now - last_seen`.
pub async fn machines(
    State(state): State<AppState>,
    _session: RequireSession,
) -> Json<Vec<crate::store::MachineRecord>> {
    Json(state.store.get_all_machines())
}

/// `GET /api/fleet/agents` — lighter-weight registration summary, one
/// entry per machine, for listing/navigation views.
pub async fn agents(State(state): State<AppState>, _session: RequireSession) -> Json<Vec<serde_json::Value>> {
    Json(state.store.get_registered_agents())
}

/// `GET /api/fleet/server-resources` — the fleet server's own host
/// resource usage, sampled fresh on each call.
pub async fn server_resources(_session: RequireSession) -> Json<serde_json::Value> {
    use sysinfo::{CpuExt, DiskExt, System, SystemExt};

    let mut system = System::new();
    system.refresh_cpu();
    system.refresh_memory();
    system.refresh_disks_list();
    system.refresh_disks();

    let cpu_percent = if system.cpus().is_empty() {
        0.0
    } else {
        let total: f32 = system.cpus().iter().map(|c| c.cpu_usage()).sum();
        (total / system.cpus().len() as f32) as f64
    };

    let total_mem = system.total_memory().max(1);
    let used_mem = system.used_memory();

    let (disk_total, disk_used) = system
        .disks()
        .iter()
        .map(|d| (d.total_space(), d.total_space().saturating_sub(d.available_space())))
        .fold((0u64, 0u64), |(t, u), (dt, du)| (t + dt, u + du));
    let disk_percent = if disk_total == 0 { 0.0 } else { (disk_used as f64 / disk_total as f64) * 100.0 };

    Json(json!({
        "cpu": {"percent": cpu_percent},
        "memory": {"percent": (used_mem as f64 / total_mem as f64) * 100.0, "total_bytes": total_mem, "used_bytes": used_mem},
        "disk": {"percent": disk_percent, "total_bytes": disk_total, "used_bytes": disk_used},
        "uptime_seconds": system.uptime(),
    }))
}

/// `GET /api/fleet/machine/{id}/history`
pub async fn machine_history(
    State(state): State<AppState>,
    _session: RequireSession,
    Path(machine_id): Path<String>,
    Query(q): Query<HistoryQuery>,
) -> Json<Vec<serde_json::Value>> {
    Json(state.store.get_machine_history(&machine_id, q.limit))
}

/// `GET /api/fleet/storage` — aggregate disk-usage view across the fleet,
/// derived from each machine's latest reported metrics.
pub async fn storage(State(state): State<AppState>, _session: RequireSession) -> Json<serde_json::Value> {
    let machines = state.store.get_all_machines();
    let entries: Vec<serde_json::Value> = machines
        .iter()
        .map(|m| {
            json!({
                "machine_id": m.machine_id,
                "status": m.status,
                "disk": m.latest_metrics.get("disk").cloned().unwrap_or(json!(null)),
            })
        })
        .collect();
    Json(json!({"machines": entries}))
}
