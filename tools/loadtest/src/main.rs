// =============================================================================
// Fleet Load Test Tool
// =============================================================================
// Generates synthetic agent reports (optionally E2EE-encrypted) and posts
// them to the fleet server's ingest endpoint at a configurable rate.
// =============================================================================

use clap::Parser;
use rand::Rng;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "fleet-loadtest")]
#[command(about = "Load test tool for the fleet server's report endpoint")]
struct Args {
    /// Server base URL
    #[arg(long, default_value = "http://localhost:8443")]
    url: String,

    /// Reports per second
    #[arg(long, default_value_t = 100)]
    rate: u32,

    /// Duration in seconds
    #[arg(long, default_value_t = 30)]
    duration: u64,

    /// Number of distinct simulated machines
    #[arg(long, default_value_t = 20)]
    machines: usize,

    /// API key to send as X-API-Key
    #[arg(long)]
    api_key: Option<String>,

    /// Shared E2EE encryption key; when set, reports are encrypted
    #[arg(long)]
    encryption_key: Option<String>,
}

struct Counters {
    sent: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    rate_limited: AtomicU64,
    network_error: AtomicU64,
    latency_sum_us: AtomicU64,
}

impl Counters {
    fn new() -> Self {
        Self {
            sent: AtomicU64::new(0),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            network_error: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
        }
    }
}

fn build_report(machine_id: &str, rng: &mut impl Rng) -> serde_json::Value {
    json!({
        "machine_id": machine_id,
        "machine_info": {
            "hostname": machine_id,
            "serial_number": format!("SN-{machine_id}"),
            "os_version": "macOS 14.0",
            "agent_version": env!("CARGO_PKG_VERSION"),
        },
        "metrics": {
            "cpu": {"percent": rng.gen_range(0.0..100.0)},
            "memory": {"percent": rng.gen_range(0.0..100.0)},
            "disk": {"percent": rng.gen_range(0.0..100.0)},
            "load_average": [rng.gen_range(0.0..4.0), rng.gen_range(0.0..4.0), rng.gen_range(0.0..4.0)],
            "uptime_seconds": rng.gen_range(0..864_000u64),
        },
    })
}

fn build_body(report: &serde_json::Value, encryption_key: &Option<String>) -> serde_json::Value {
    match encryption_key {
        Some(key) => match fleet_core::crypto::encrypt_payload(key, report) {
            Ok(envelope) => json!(envelope),
            Err(_) => report.clone(),
        },
        None => report.clone(),
    }
}

fn main() {
    let args = Args::parse();

    println!("=== Fleet Load Test ===");
    println!("Target:     {}/api/fleet/report", args.url);
    println!("Rate:       {} reports/s", args.rate);
    println!("Duration:   {}s", args.duration);
    println!("Machines:   {}", args.machines);
    println!("Encrypted:  {}", args.encryption_key.is_some());
    println!();

    let machine_ids: Vec<String> = (0..args.machines).map(|_| Uuid::new_v4().to_string()).collect();

    let health_url = format!("{}/api/fleet/cluster/health", args.url);
    match reqwest::blocking::get(&health_url) {
        Ok(r) if r.status().is_success() => println!("Server health: OK"),
        Ok(r) => {
            eprintln!("Server health check failed: {}", r.status());
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Cannot reach server: {e}");
            std::process::exit(1);
        }
    }

    let counters = Arc::new(Counters::new());
    let report_url = format!("{}/api/fleet/report", args.url);

    let interval = Duration::from_micros(1_000_000 / args.rate.max(1) as u64);
    let deadline = Instant::now() + Duration::from_secs(args.duration);

    println!("\nSending...\n");
    let start = Instant::now();

    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap();

    let mut rng = rand::thread_rng();
    let mut tick = 0u64;

    while Instant::now() < deadline {
        let machine_id = &machine_ids[(tick as usize) % machine_ids.len()];
        let mut report = build_report(machine_id, &mut rng);
        if let Some(obj) = report.as_object_mut() {
            obj.insert("encrypted".into(), json!(args.encryption_key.is_some()));
        }
        let body = build_body(&report, &args.encryption_key);

        let req_start = Instant::now();
        counters.sent.fetch_add(1, Ordering::Relaxed);

        let mut request = client.post(&report_url).json(&body);
        if let Some(key) = &args.api_key {
            request = request.header("X-API-Key", key);
        }

        match request.send() {
            Ok(resp) => {
                let lat = req_start.elapsed().as_micros() as u64;
                counters.latency_sum_us.fetch_add(lat, Ordering::Relaxed);

                match resp.status().as_u16() {
                    200 => {
                        counters.accepted.fetch_add(1, Ordering::Relaxed);
                    }
                    429 => {
                        counters.rate_limited.fetch_add(1, Ordering::Relaxed);
                    }
                    other => {
                        counters.rejected.fetch_add(1, Ordering::Relaxed);
                        if tick < 5 {
                            eprintln!("Unexpected status: {other}");
                        }
                    }
                }
            }
            Err(_) => {
                counters.network_error.fetch_add(1, Ordering::Relaxed);
            }
        }

        tick += 1;

        if tick % 500 == 0 {
            let elapsed = start.elapsed().as_secs_f64();
            let sent = counters.sent.load(Ordering::Relaxed);
            println!(
                "  [{:.1}s] sent={} accepted={} rejected={} rate_limited={} err={} ({:.0} req/s)",
                elapsed,
                sent,
                counters.accepted.load(Ordering::Relaxed),
                counters.rejected.load(Ordering::Relaxed),
                counters.rate_limited.load(Ordering::Relaxed),
                counters.network_error.load(Ordering::Relaxed),
                sent as f64 / elapsed,
            );
        }

        let target = Duration::from_micros(tick * interval.as_micros() as u64);
        let actual = start.elapsed();
        if actual < target {
            std::thread::sleep(target - actual);
        }
    }

    let elapsed = start.elapsed();
    let sent = counters.sent.load(Ordering::Relaxed);
    let accepted = counters.accepted.load(Ordering::Relaxed);
    let avg_lat = if sent > 0 {
        counters.latency_sum_us.load(Ordering::Relaxed) / sent
    } else {
        0
    };

    println!("\n=== Results ===");
    println!("Duration:     {:.2}s", elapsed.as_secs_f64());
    println!("Total sent:   {sent}");
    println!("Accepted:     {} ({:.1}%)", accepted, accepted as f64 / sent.max(1) as f64 * 100.0);
    println!("Rejected:     {}", counters.rejected.load(Ordering::Relaxed));
    println!("Rate limited: {}", counters.rate_limited.load(Ordering::Relaxed));
    println!("Net errors:   {}", counters.network_error.load(Ordering::Relaxed));
    println!("Avg latency:  {avg_lat} us");
    println!("Throughput:   {:.1} req/s", sent as f64 / elapsed.as_secs_f64());
}
