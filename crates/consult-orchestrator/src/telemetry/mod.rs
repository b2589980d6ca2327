use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub mod logging;

fn env_truthy(var: &str) -> Option<bool> {
    std::env::var(var).map(|v| v != "0" && !v.is_empty()).ok()
}

static PERF_ENABLED: Lazy<bool> = Lazy::new(|| env_truthy("CONSULT_PERF").unwrap_or(false));

static STATS: Lazy<Mutex<HashMap<&'static str, PerfStat>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

const REPORT_EVERY: u64 = 50;

#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct PerfStat {
    pub total_ns: u128,
    pub max_ns: u128,
    pub count: u64,
}

impl PerfStat {
    fn record(&mut self, duration: Duration) {
        let nanos = duration.as_nanos();
        self.count += 1;
        self.total_ns += nanos;
        self.max_ns = self.max_ns.max(nanos);
    }

    pub fn average(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        let avg = self.total_ns / self.count as u128;
        Duration::from_nanos(u64::try_from(avg).unwrap_or(u64::MAX))
    }
}

pub fn enabled() -> bool {
    *PERF_ENABLED
}

pub fn record_duration(label: &'static str, duration: Duration) {
    if !enabled() {
        return;
    }
    let mut stats = STATS.lock();
    let entry = stats.entry(label).or_default();
    entry.record(duration);
    if entry.count % REPORT_EVERY == 0 {
        report(label, entry);
    }
}

fn report(label: &'static str, stat: &PerfStat) {
    let avg_ms = stat.average().as_secs_f64() * 1_000.0;
    let max_ms = stat.max_ns as f64 / 1_000_000.0;
    tracing::debug!(
        target = "consult::perf",
        label,
        count = stat.count,
        avg_ms,
        max_ms,
        "perf stats"
    );
}

/// Records the lifetime of the guard under `label` when `CONSULT_PERF` is set.
pub struct PerfGuard {
    label: &'static str,
    start: Instant,
}

impl PerfGuard {
    pub fn new(label: &'static str) -> Option<Self> {
        if !enabled() {
            return None;
        }
        Some(Self {
            label,
            start: Instant::now(),
        })
    }
}

impl Drop for PerfGuard {
    fn drop(&mut self) {
        record_duration(self.label, self.start.elapsed());
    }
}
