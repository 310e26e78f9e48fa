//! Best-effort host metrics sampling and process identity.

use crate::protocol::HostMetrics;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use sysinfo::{Disks, System};

pub fn hostname() -> String {
    System::host_name().unwrap_or_else(|| "unknown".to_string())
}

static AGENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// `hostname:pid-seq`, unique per process and per in-process instance.
pub fn next_agent_id() -> String {
    let seq = AGENT_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{}:{}-{}", hostname(), std::process::id(), seq)
}

/// CPU utilization is a delta between two consecutive samples, so the
/// sampler has to live as long as the agent.
pub struct HostSampler {
    sys: System,
}

impl HostSampler {
    pub fn new() -> Self {
        let mut sys = System::new();
        // Prime the CPU counters so the first real sample has a delta.
        sys.refresh_cpu_usage();
        Self { sys }
    }

    pub fn sample(&mut self, time: DateTime<Utc>) -> HostMetrics {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();

        let cpu = self.sys.global_cpu_usage();

        let total_mem = self.sys.total_memory();
        let mem = if total_mem > 0 {
            self.sys.used_memory() as f32 / total_mem as f32 * 100.0
        } else {
            0.0
        };

        HostMetrics {
            cpu,
            mem,
            disk: disk_usage_percent(),
            time,
        }
    }
}

impl Default for HostSampler {
    fn default() -> Self {
        Self::new()
    }
}

fn disk_usage_percent() -> f32 {
    let disks = Disks::new_with_refreshed_list();
    let (mut total, mut available) = (0u64, 0u64);
    for disk in disks.list() {
        total += disk.total_space();
        available += disk.available_space();
    }
    if total == 0 {
        return 0.0;
    }
    (total - available) as f32 / total as f32 * 100.0
}
