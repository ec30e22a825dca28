use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use store::PendingStats;

#[derive(Debug, Default)]
struct InnerMetrics {
    scheduling_passes: AtomicU64,
    jobs_created: AtomicU64,
    jobs_claimed: AtomicU64,
    jobs_aborted: AtomicU64,
    pending_jobs: AtomicI64,
    pickup_lag_seconds: AtomicU64,
    pickup_wait_seconds: AtomicU64,
    available_workers: AtomicI64,
    ssl_persist_failures: AtomicU64,
    tracked_upload_hits: AtomicU64,
    tracked_upload_misses: AtomicU64,
}

/// Cheap shared counters the router tasks bump as they go; no functional
/// effect on scheduling.
#[derive(Debug, Clone, Default)]
pub struct SchedulerMetrics {
    inner: Arc<InnerMetrics>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    pub scheduling_passes: u64,
    pub jobs_created: u64,
    pub jobs_claimed: u64,
    pub jobs_aborted: u64,
    pub pending_jobs: i64,
    pub pickup_lag_seconds: u64,
    pub pickup_wait_seconds: u64,
    pub available_workers: i64,
    pub ssl_persist_failures: u64,
    pub tracked_upload_hits: u64,
    pub tracked_upload_misses: u64,
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_scheduling_pass(&self) {
        self.inner.scheduling_passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_jobs_created(&self, count: u64) {
        self.inner.jobs_created.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_jobs_claimed(&self, count: u64) {
        self.inner.jobs_claimed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_job_aborted(&self) {
        self.inner.jobs_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ssl_persist_failure(&self) {
        self.inner
            .ssl_persist_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pending(&self, stats: PendingStats, available_workers: usize) {
        self.inner
            .pending_jobs
            .store(stats.pending_jobs, Ordering::Relaxed);
        self.inner
            .pickup_lag_seconds
            .store(stats.pickup_lag_seconds.max(0.0) as u64, Ordering::Relaxed);
        self.inner
            .pickup_wait_seconds
            .store(stats.pickup_wait_seconds.max(0.0) as u64, Ordering::Relaxed);
        self.inner
            .available_workers
            .store(available_workers as i64, Ordering::Relaxed);
    }

    pub fn record_tracked_upload(&self, uploaded: bool) {
        if uploaded {
            self.inner.tracked_upload_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner
                .tracked_upload_misses
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            scheduling_passes: self.inner.scheduling_passes.load(Ordering::Relaxed),
            jobs_created: self.inner.jobs_created.load(Ordering::Relaxed),
            jobs_claimed: self.inner.jobs_claimed.load(Ordering::Relaxed),
            jobs_aborted: self.inner.jobs_aborted.load(Ordering::Relaxed),
            pending_jobs: self.inner.pending_jobs.load(Ordering::Relaxed),
            pickup_lag_seconds: self.inner.pickup_lag_seconds.load(Ordering::Relaxed),
            pickup_wait_seconds: self.inner.pickup_wait_seconds.load(Ordering::Relaxed),
            available_workers: self.inner.available_workers.load(Ordering::Relaxed),
            ssl_persist_failures: self.inner.ssl_persist_failures.load(Ordering::Relaxed),
            tracked_upload_hits: self.inner.tracked_upload_hits.load(Ordering::Relaxed),
            tracked_upload_misses: self.inner.tracked_upload_misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = SchedulerMetrics::new();
        metrics.record_jobs_created(3);
        metrics.record_jobs_created(2);
        metrics.record_job_aborted();
        metrics.record_pending(
            PendingStats {
                pending_jobs: 7,
                pickup_lag_seconds: 12.9,
                pickup_wait_seconds: 40.2,
            },
            5,
        );

        let snap = metrics.snapshot();
        assert_eq!(snap.jobs_created, 5);
        assert_eq!(snap.jobs_aborted, 1);
        assert_eq!(snap.pending_jobs, 7);
        assert_eq!(snap.pickup_lag_seconds, 12);
        assert_eq!(snap.available_workers, 5);
    }
}
