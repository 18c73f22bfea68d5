use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Coordination store usage metrics
#[derive(Debug, Default)]
pub struct StoreMetrics {
    pub operations: AtomicU64,
    pub retries: AtomicU64,
    pub failures: AtomicU64,
    pub claim_conflicts: AtomicU64,
    pub lock_conflicts: AtomicU64,
}

impl StoreMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_operation(&self) {
        self.operations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retries(&self, count: u32) {
        if count > 0 {
            self.retries.fetch_add(u64::from(count), Ordering::Relaxed);
        }
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_claim_conflict(&self) {
        self.claim_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_conflict(&self) {
        self.lock_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> StoreStats {
        StoreStats {
            operations: self.operations.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            claim_conflicts: self.claim_conflicts.load(Ordering::Relaxed),
            lock_conflicts: self.lock_conflicts.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            operations = stats.operations,
            retries = stats.retries,
            failures = stats.failures,
            claim_conflicts = stats.claim_conflicts,
            lock_conflicts = stats.lock_conflicts,
            "Coordination store metrics"
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub operations: u64,
    pub retries: u64,
    pub failures: u64,
    pub claim_conflicts: u64,
    pub lock_conflicts: u64,
}

/// Global metrics instance
static STORE_METRICS: std::sync::LazyLock<StoreMetrics> = std::sync::LazyLock::new(StoreMetrics::new);

pub fn store_metrics() -> &'static StoreMetrics {
    &STORE_METRICS
}

/// Time a facade operation and log its duration when dropped.
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
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        debug!(
            operation = self.operation,
            duration_ms = self.start.elapsed().as_millis() as u64,
            "Operation completed"
        );
    }
}

#[macro_export]
macro_rules! time_operation {
    ($operation:expr) => {
        let _timer = $crate::observability::OperationTimer::new($operation);
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = StoreMetrics::new();
        metrics.record_operation();
        metrics.record_operation();
        metrics.record_retries(1);
        metrics.record_claim_conflict();

        let stats = metrics.get_stats();
        assert_eq!(stats.operations, 2);
        assert_eq!(stats.retries, 1);
        assert_eq!(stats.failures, 0);
        assert_eq!(stats.claim_conflicts, 1);
        assert_eq!(stats.lock_conflicts, 0);
    }
}
