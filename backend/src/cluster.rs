//! Cluster node registry: signed heartbeats, staleness-based health, and a
//! pluggable shared-state backend so multiple server processes can see
//! each other.

use dashmap::DashMap;
use fleet_core::crypto::ClusterSecurity;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

const NODE_TIMEOUT_SECONDS: i64 = 30;
pub const HEARTBEAT_INTERVAL_SECONDS: u64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterNode {
    pub node_id: String,
    pub hostname: String,
    pub port: u16,
    pub last_heartbeat: i64,
    pub status: String,
}

impl ClusterNode {
    fn age_seconds(&self, now: i64) -> i64 {
        now - self.last_heartbeat
    }

    pub fn node_status(&self, now: i64) -> &'static str {
        let age = self.age_seconds(now);
        if age < 15 {
            "healthy"
        } else if age < 30 {
            "degraded"
        } else {
            "offline"
        }
    }

    fn to_record(&self) -> serde_json::Map<String, serde_json::Value> {
        let value = serde_json::to_value(self).expect("ClusterNode always serializes");
        match value {
            serde_json::Value::Object(map) => map,
            _ => unreachable!("ClusterNode serializes to an object"),
        }
    }

    fn from_record(record: &serde_json::Map<String, serde_json::Value>) -> Option<Self> {
        serde_json::from_value(serde_json::Value::Object(record.clone())).ok()
    }
}

/// Storage for the cluster's shared node map, carrying signed JSON records
/// rather than typed `ClusterNode`s so tampering can be detected on load.
/// The file backend persists a snapshot so independently-started server
/// processes converge; the in-memory backend is for tests and
/// single-process deployments.
pub trait ClusterBackend: Send + Sync {
    fn save(&self, records: &[serde_json::Map<String, serde_json::Value>]) -> anyhow::Result<()>;
    fn load(&self) -> anyhow::Result<Vec<serde_json::Map<String, serde_json::Value>>>;
}

pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl ClusterBackend for FileBackend {
    fn save(&self, records: &[serde_json::Map<String, serde_json::Value>]) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(records)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    fn load(&self) -> anyhow::Result<Vec<serde_json::Map<String, serde_json::Value>>> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => Ok(serde_json::from_str(&contents).unwrap_or_default()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Default)]
pub struct InMemoryBackend {
    snapshot: std::sync::Mutex<Vec<serde_json::Map<String, serde_json::Value>>>,
}

impl ClusterBackend for InMemoryBackend {
    fn save(&self, records: &[serde_json::Map<String, serde_json::Value>]) -> anyhow::Result<()> {
        *self.snapshot.lock().unwrap() = records.to_vec();
        Ok(())
    }

    fn load(&self) -> anyhow::Result<Vec<serde_json::Map<String, serde_json::Value>>> {
        Ok(self.snapshot.lock().unwrap().clone())
    }
}

pub struct ClusterRegistry {
    pub node_id: String,
    hostname: String,
    port: u16,
    nodes: DashMap<String, ClusterNode>,
    backend: Arc<dyn ClusterBackend>,
    security: Option<ClusterSecurity>,
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

impl ClusterRegistry {
    pub fn new(
        node_id: String,
        hostname: String,
        port: u16,
        backend: Arc<dyn ClusterBackend>,
        cluster_secret: Option<&str>,
    ) -> anyhow::Result<Self> {
        let security = match cluster_secret {
            Some(secret) if !secret.is_empty() => Some(
                ClusterSecurity::new(secret)
                    .map_err(|e| anyhow::anyhow!("invalid cluster secret: {e}"))?,
            ),
            _ => None,
        };

        let registry = Self {
            node_id,
            hostname,
            port,
            nodes: DashMap::new(),
            backend,
            security,
        };
        registry.register_self();
        Ok(registry)
    }

    fn register_self(&self) {
        let now = now_unix();
        self.nodes.insert(
            self.node_id.clone(),
            ClusterNode {
                node_id: self.node_id.clone(),
                hostname: self.hostname.clone(),
                port: self.port,
                last_heartbeat: now,
                status: "active".to_string(),
            },
        );
        let _ = self.save();
    }

    /// Sign (when a cluster secret is configured) and persist the current
    /// node map. Unsigned deployments write plain records, matching the
    /// trust-all posture `heartbeat`/`active_nodes` use when `security` is
    /// `None`.
    fn save(&self) -> anyhow::Result<()> {
        let now = now_unix();
        let records: Vec<serde_json::Map<String, serde_json::Value>> = self
            .nodes
            .iter()
            .map(|e| {
                let record = e.value().to_record();
                match &self.security {
                    Some(sec) => sec.sign_record(&record, now),
                    None => record,
                }
            })
            .collect();
        self.backend.save(&records)
    }

    /// Refresh this node's own heartbeat and merge in whatever other nodes
    /// are visible in the shared backend, after verifying each record's
    /// signature and timestamp freshness. Records that fail verification
    /// are dropped and never mutate the node map.
    pub fn heartbeat(&self) -> anyhow::Result<()> {
        let now = now_unix();
        if let Some(mut entry) = self.nodes.get_mut(&self.node_id) {
            entry.last_heartbeat = now;
            entry.status = "active".to_string();
        }

        for record in self.backend.load()? {
            let Some(node) = ClusterNode::from_record(&record) else {
                tracing::warn!("cluster_record_unparseable");
                continue;
            };
            if node.node_id == self.node_id {
                continue;
            }
            if let Some(sec) = &self.security {
                if let Err(reason) = sec.verify_record(&record, ClusterSecurity::NODE_RECORD_MAX_AGE_SECONDS, now) {
                    tracing::warn!(node_id = %node.node_id, reason = %reason, "cluster_record_rejected");
                    continue;
                }
            }
            self.nodes.insert(node.node_id.clone(), node);
        }

        self.save()
    }

    /// Nodes seen within `NODE_TIMEOUT_SECONDS`.
    pub fn active_nodes(&self) -> Vec<ClusterNode> {
        let now = now_unix();
        self.nodes
            .iter()
            .filter(|e| e.age_seconds(now) < NODE_TIMEOUT_SECONDS)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn all_nodes(&self) -> Vec<ClusterNode> {
        self.nodes.iter().map(|e| e.value().clone()).collect()
    }

    pub fn cluster_status(&self) -> serde_json::Value {
        let active = self.active_nodes();
        serde_json::json!({
            "node_id": self.node_id,
            "enabled": self.security.is_some(),
            "active_nodes": active.len(),
            "total_nodes": self.nodes.len(),
            "nodes": active,
        })
    }

    /// Overall cluster health, combining active node count with whether
    /// this node's own backend (the data store) is responsive.
    pub fn health_check(&self, backend_healthy: bool) -> serde_json::Value {
        let now = now_unix();
        let healthy_nodes = self
            .nodes
            .iter()
            .filter(|e| e.node_status(now) == "healthy")
            .count();

        let overall = if healthy_nodes >= 2 && backend_healthy {
            "healthy"
        } else if healthy_nodes >= 1 && backend_healthy {
            "degraded"
        } else {
            "critical"
        };

        let nodes: Vec<_> = self
            .nodes
            .iter()
            .map(|e| {
                serde_json::json!({
                    "node_id": e.node_id,
                    "status": e.node_status(now),
                    "last_heartbeat_age_seconds": e.age_seconds(now),
                })
            })
            .collect();

        serde_json::json!({
            "overall": overall,
            "backend_healthy": backend_healthy,
            "healthy_nodes": healthy_nodes,
            "nodes": nodes,
        })
    }

    pub fn sign_heartbeat(&self) -> Option<serde_json::Map<String, serde_json::Value>> {
        self.security
            .as_ref()
            .map(|s| s.sign_heartbeat(&self.node_id, now_unix()))
    }

    pub fn verify_heartbeat(&self, payload: &serde_json::Map<String, serde_json::Value>) -> Result<(), String> {
        match &self.security {
            None => Ok(()),
            Some(s) => s.verify_record(payload, ClusterSecurity::HEARTBEAT_MAX_AGE_SECONDS, now_unix()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ClusterRegistry {
        ClusterRegistry::new(
            "node-1".into(),
            "localhost".into(),
            9000,
            Arc::new(InMemoryBackend::default()),
            None,
        )
        .unwrap()
    }

    #[test]
    fn self_registration_is_active() {
        let r = registry();
        assert_eq!(r.active_nodes().len(), 1);
    }

    #[test]
    fn health_check_critical_with_one_node_no_backend() {
        let r = registry();
        let h = r.health_check(false);
        assert_eq!(h["overall"], "critical");
    }

    #[test]
    fn health_check_degraded_with_one_healthy_node() {
        let r = registry();
        let h = r.health_check(true);
        assert_eq!(h["overall"], "degraded");
    }

    #[test]
    fn second_node_joins_via_shared_backend_when_secured() {
        let backend = Arc::new(InMemoryBackend::default());
        let secret = fleet_core::crypto::generate_cluster_secret();

        let n1 = ClusterRegistry::new("node-1".into(), "host-a".into(), 9000, backend.clone(), Some(&secret)).unwrap();
        let n2 = ClusterRegistry::new("node-2".into(), "host-b".into(), 9001, backend.clone(), Some(&secret)).unwrap();

        n1.heartbeat().unwrap();
        n2.heartbeat().unwrap();
        n1.heartbeat().unwrap();

        assert_eq!(n1.active_nodes().len(), 2);
    }

    #[test]
    fn tampered_node_record_is_rejected_on_load() {
        let backend = Arc::new(InMemoryBackend::default());
        let secret = fleet_core::crypto::generate_cluster_secret();

        let n1 = ClusterRegistry::new("node-1".into(), "host-a".into(), 9000, backend.clone(), Some(&secret)).unwrap();
        let n2 = ClusterRegistry::new("node-2".into(), "host-b".into(), 9001, backend.clone(), Some(&secret)).unwrap();
        n2.heartbeat().unwrap();

        // Flip a byte in node-2's persisted hostname after signing.
        let mut records = backend.load().unwrap();
        for record in records.iter_mut() {
            if record.get("node_id").and_then(|v| v.as_str()) == Some("node-2") {
                record.insert("hostname".into(), serde_json::json!("host-tampered"));
            }
        }
        backend.save(&records).unwrap();

        n1.heartbeat().unwrap();
        let active = n1.active_nodes();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].node_id, "node-1");
    }

    #[test]
    fn unsigned_records_pass_through_when_cluster_security_disabled() {
        let backend = Arc::new(InMemoryBackend::default());
        let n1 = ClusterRegistry::new("node-1".into(), "host-a".into(), 9000, backend.clone(), None).unwrap();
        let n2 = ClusterRegistry::new("node-2".into(), "host-b".into(), 9001, backend.clone(), None).unwrap();
        n2.heartbeat().unwrap();
        n1.heartbeat().unwrap();
        assert_eq!(n1.active_nodes().len(), 2);
    }

    #[test]
    fn node_status_thresholds() {
        let now = 1_700_000_000;
        let mut n = ClusterNode {
            node_id: "x".into(),
            hostname: "h".into(),
            port: 1,
            last_heartbeat: now - 10,
            status: "active".into(),
        };
        assert_eq!(n.node_status(now), "healthy");
        n.last_heartbeat = now - 20;
        assert_eq!(n.node_status(now), "degraded");
        n.last_heartbeat = now - 40;
        assert_eq!(n.node_status(now), "offline");
    }
}
