// Host load and judge counters
//
// `HostLoad` is reported in every ping response. `JudgeMetrics` counts what
// happened to submissions over the life of the process.

use std::sync::atomic::{AtomicU64, Ordering};

/// Load figures sent to the server
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostLoad {
    /// 1-minute load average divided by the CPU count, -1 when unknown
    pub load: f64,
    pub cpu_count: usize,
}

impl HostLoad {
    pub fn sample() -> Self {
        let cpu_count = cpu_count();
        Self {
            load: load_average().map_or(-1.0, |load| load / cpu_count as f64),
            cpu_count,
        }
    }
}

pub fn cpu_count() -> usize {
    num_cpus::get().max(1)
}

fn load_average() -> Option<f64> {
    let mut loads = [0f64; 3];
    // SAFETY: the buffer holds the 3 samples requested
    let filled = unsafe { libc::getloadavg(loads.as_mut_ptr(), 3) };
    if filled >= 1 {
        return Some(loads[0]);
    }
    let raw = std::fs::read_to_string("/proc/loadavg").ok()?;
    raw.split_whitespace().next()?.parse().ok()
}

/// Counter metric (monotonically increasing)
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct JudgeMetrics {
    pub submissions_accepted: Counter,
    pub submissions_rejected_busy: Counter,
    pub submissions_terminated: Counter,
    pub internal_errors: Counter,
    pub workers_force_killed: Counter,
}

impl JudgeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// One-line summary for the shutdown log
    pub fn summary(&self) -> String {
        format!(
            "accepted={} rejected_busy={} terminated={} internal_errors={} force_killed={}",
            self.submissions_accepted.get(),
            self.submissions_rejected_busy.get(),
            self.submissions_terminated.get(),
            self.internal_errors.get(),
            self.workers_force_killed.get(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_load_is_normalised() {
        let load = HostLoad::sample();
        assert!(load.cpu_count >= 1);
        assert!(load.load == -1.0 || load.load >= 0.0);
    }

    #[test]
    fn test_summary_reflects_counters() {
        let metrics = JudgeMetrics::new();
        metrics.submissions_accepted.inc();
        metrics.submissions_accepted.inc();
        metrics.workers_force_killed.inc();
        let summary = metrics.summary();
        assert!(summary.contains("accepted=2"));
        assert!(summary.contains("force_killed=1"));
    }
}
