//! Portable metric sampling via `sysinfo`. The original agent's samplers
//! (`power_monitor.py`, `wifi_widget.py`, `ping_widget.py`, osquery
//! shell-outs) are OS-specific and out of scope; this collects the subset
//! achievable from safe, portable Rust — the `sysinfo`-based equivalent of
//! the original's `psutil` sampling.

use serde_json::json;
use sysinfo::{CpuExt, DiskExt, System, SystemExt};

pub struct Sampler {
    system: System,
}

impl Sampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        system.refresh_disks_list();
        Self { system }
    }

    /// Collect a metrics snapshot matching the `cpu.percent` / `memory.percent`
    /// / `disk.percent` shape the server's fleet summary reads.
    pub fn collect(&mut self) -> serde_json::Value {
        self.system.refresh_cpu();
        self.system.refresh_memory();
        self.system.refresh_disks();

        let cpu_percent = if self.system.cpus().is_empty() {
            0.0
        } else {
            let total: f32 = self.system.cpus().iter().map(|c| c.cpu_usage()).sum();
            (total / self.system.cpus().len() as f32) as f64
        };

        let total_mem = self.system.total_memory().max(1);
        let used_mem = self.system.used_memory();
        let memory_percent = (used_mem as f64 / total_mem as f64) * 100.0;

        let (disk_total, disk_used) = self
            .system
            .disks()
            .iter()
            .map(|d| (d.total_space(), d.total_space().saturating_sub(d.available_space())))
            .fold((0u64, 0u64), |(t, u), (dt, du)| (t + dt, u + du));
        let disk_percent = if disk_total == 0 {
            0.0
        } else {
            (disk_used as f64 / disk_total as f64) * 100.0
        };

        let load_average = self.system.load_average();
        let uptime_seconds = self.system.uptime();

        json!({
            "cpu": {"percent": cpu_percent},
            "memory": {"percent": memory_percent, "total_bytes": total_mem, "used_bytes": used_mem},
            "disk": {"percent": disk_percent, "total_bytes": disk_total, "used_bytes": disk_used},
            "load_average": [load_average.one, load_average.five, load_average.fifteen],
            "uptime_seconds": uptime_seconds,
        })
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new()
    }
}
