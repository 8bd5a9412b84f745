use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Coordinator activity counters
#[derive(Debug, Default)]
pub struct FleetMetrics {
    pub registrations: AtomicU64,
    pub heartbeats: AtomicU64,
    pub tasks_enqueued: AtomicU64,
    pub tasks_claimed: AtomicU64,
    pub tasks_completed: AtomicU64,
    pub tasks_reclaimed: AtomicU64,
    pub tasks_abandoned: AtomicU64,
    pub alerts_published: AtomicU64,
    pub alerts_deduplicated: AtomicU64,
    pub conflicts: AtomicU64,
}

impl FleetMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_registration(&self) {
        self.registrations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_heartbeat(&self) {
        self.heartbeats.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_enqueue(&self) {
        self.tasks_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_claim(&self) {
        self.tasks_claimed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completion(&self) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reclaim(&self, count: u64) {
        self.tasks_reclaimed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_abandoned(&self, count: u64) {
        if count > 0 {
            self.tasks_abandoned.fetch_add(count, Ordering::Relaxed);
            warn!(count, "Tasks abandoned after exhausting retries");
        }
    }

    pub fn record_alert(&self, deduplicated: bool) {
        if deduplicated {
            self.alerts_deduplicated.fetch_add(1, Ordering::Relaxed);
        } else {
            self.alerts_published.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> FleetStats {
        FleetStats {
            registrations: self.registrations.load(Ordering::Relaxed),
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
            tasks_enqueued: self.tasks_enqueued.load(Ordering::Relaxed),
            tasks_claimed: self.tasks_claimed.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_reclaimed: self.tasks_reclaimed.load(Ordering::Relaxed),
            tasks_abandoned: self.tasks_abandoned.load(Ordering::Relaxed),
            alerts_published: self.alerts_published.load(Ordering::Relaxed),
            alerts_deduplicated: self.alerts_deduplicated.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            "Coordinator metrics: registrations={}, heartbeats={}, enqueued={}, claimed={}, completed={}, reclaimed={}, abandoned={}, alerts={}, deduplicated={}, conflicts={}",
            stats.registrations,
            stats.heartbeats,
            stats.tasks_enqueued,
            stats.tasks_claimed,
            stats.tasks_completed,
            stats.tasks_reclaimed,
            stats.tasks_abandoned,
            stats.alerts_published,
            stats.alerts_deduplicated,
            stats.conflicts
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetStats {
    pub registrations: u64,
    pub heartbeats: u64,
    pub tasks_enqueued: u64,
    pub tasks_claimed: u64,
    pub tasks_completed: u64,
    pub tasks_reclaimed: u64,
    pub tasks_abandoned: u64,
    pub alerts_published: u64,
    pub alerts_deduplicated: u64,
    pub conflicts: u64,
}

/// Wall-clock duration of one coordinator or retention pass, logged on finish
pub struct OperationTimer {
    operation: &'static str,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    pub fn finish(self) -> Duration {
        let elapsed = self.start.elapsed();
        debug!(
            operation = self.operation,
            duration_ms = elapsed.as_millis() as u64,
            "Operation finished"
        );
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = FleetMetrics::new();
        metrics.record_claim();
        metrics.record_claim();
        metrics.record_alert(false);
        metrics.record_alert(true);
        metrics.record_reclaim(3);
        metrics.record_abandoned(0);

        let stats = metrics.get_stats();
        assert_eq!(stats.tasks_claimed, 2);
        assert_eq!(stats.alerts_published, 1);
        assert_eq!(stats.alerts_deduplicated, 1);
        assert_eq!(stats.tasks_reclaimed, 3);
        assert_eq!(stats.tasks_abandoned, 0);
    }

    #[test]
    fn test_timer_reports_elapsed_time() {
        let timer = OperationTimer::new("sweep");
        std::thread::sleep(Duration::from_millis(5));
        assert!(timer.finish() >= Duration::from_millis(5));
    }
}
