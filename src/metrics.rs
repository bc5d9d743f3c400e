use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Shared counters for one engine instance.
///
/// `process_total` is incremented once per consumed record and may be restored
/// from the daily-stats provider on start, so the QPS computation has to
/// tolerate the counter moving backwards (restart, rebase): a decrease clamps
/// the published QPS to 0 and rebases the baseline.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub process_total: AtomicU64,
    pub process_qps: AtomicU64,
    last_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub process_total: u64,
    pub process_qps: u64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        EngineMetrics::default()
    }

    pub fn incr_total(&self) {
        self.process_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Restore the accumulator from an external source (daily stats).
    pub fn restore_total(&self, total: u64) {
        self.process_total.store(total, Ordering::Relaxed);
        self.last_total.store(total, Ordering::Relaxed);
    }

    /// Recompute QPS from the delta since the previous tick. Called once per
    /// tick interval by the metrics loop; the interval is one second, so the
    /// delta is the rate.
    pub fn tick_qps(&self) -> u64 {
        let current = self.process_total.load(Ordering::Relaxed);
        let previous = self.last_total.swap(current, Ordering::Relaxed);
        let qps = current.saturating_sub(previous);
        self.process_qps.store(qps, Ordering::Relaxed);
        qps
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            process_total: self.process_total.load(Ordering::Relaxed),
            process_qps: self.process_qps.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qps_is_delta_between_ticks() {
        let metrics = EngineMetrics::new();
        for _ in 0..5 {
            metrics.incr_total();
        }
        assert_eq!(metrics.tick_qps(), 5);
        for _ in 0..3 {
            metrics.incr_total();
        }
        assert_eq!(metrics.tick_qps(), 3);
        assert_eq!(metrics.snapshot().process_qps, 3);
    }

    #[test]
    fn qps_clamps_on_counter_reset() {
        let metrics = EngineMetrics::new();
        for _ in 0..10 {
            metrics.incr_total();
        }
        assert_eq!(metrics.tick_qps(), 10);

        // Simulated restart: the accumulator jumps backwards.
        metrics.process_total.store(2, Ordering::Relaxed);
        assert_eq!(metrics.tick_qps(), 0);

        // Rebased: the next delta counts from the lower value.
        for _ in 0..4 {
            metrics.incr_total();
        }
        assert_eq!(metrics.tick_qps(), 4);
    }

    #[test]
    fn restore_sets_baseline() {
        let metrics = EngineMetrics::new();
        metrics.restore_total(1_000);
        assert_eq!(metrics.tick_qps(), 0);
        metrics.incr_total();
        assert_eq!(metrics.tick_qps(), 1);
    }
}
