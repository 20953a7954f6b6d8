//! Periodic usage log line: session counts plus host and process figures.
//!
//! Host figures come from `/proc` and are simply omitted on platforms
//! without it.

use crate::core::status::StatusProjector;
use crate::utils::sos::SignalOfStop;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

/// Host load and memory at one instant.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct HostUsage {
    /// One-minute load average.
    pub load_1m: Option<f64>,
    /// Share of physical memory in use, 0 to 100.
    pub memory_used_pct: Option<f64>,
    /// Resident set size of this process.
    pub rss_bytes: Option<u64>,
}

impl HostUsage {
    pub fn sample() -> Self {
        let read = |path: &str| std::fs::read_to_string(path).ok();
        Self {
            load_1m: read("/proc/loadavg").as_deref().and_then(parse_loadavg),
            memory_used_pct: read("/proc/meminfo").as_deref().and_then(parse_meminfo),
            rss_bytes: read("/proc/self/status").as_deref().and_then(parse_rss),
        }
    }
}

fn parse_loadavg(text: &str) -> Option<f64> {
    text.split_whitespace().next()?.parse().ok()
}

/// Value of a `Key:   1234 kB` line, in bytes.
fn kib_field(text: &str, key: &str) -> Option<u64> {
    let line = text.lines().find(|l| l.split(':').next() == Some(key))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

fn parse_meminfo(text: &str) -> Option<f64> {
    let total = kib_field(text, "MemTotal")?;
    let available = kib_field(text, "MemAvailable").or_else(|| kib_field(text, "MemFree"))?;
    if total == 0 {
        return None;
    }
    Some(total.saturating_sub(available) as f64 / total as f64 * 100.0)
}

fn parse_rss(text: &str) -> Option<u64> {
    kib_field(text, "VmRSS")
}

/// Log usage every `period` until `sos` fires. The first line is written
/// one period after start.
pub fn spawn(projector: Arc<StatusProjector>, period: Duration, sos: SignalOfStop) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + period;
        let mut ticker = tokio::time::interval_at(start, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        while sos.run_until(ticker.tick()).await.is_some() {
            let summary = projector.summary();
            let host = HostUsage::sample();
            info!(
                event = "usage",
                active = summary.active,
                paused = summary.paused,
                live = summary.live,
                downloaded = summary.downloaded,
                uploaded = summary.uploaded,
                load_1m = host.load_1m,
                memory_used_pct = host.memory_used_pct.map(|p| (p * 100.0).round() / 100.0),
                rss_bytes = host.rss_bytes,
                "Seeding usage"
            );
        }
        info!(event = "telemetry_stopped", "Telemetry stopped");
    })
}
