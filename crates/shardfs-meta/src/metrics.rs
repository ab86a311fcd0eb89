//! Rename coordinator metrics.
//!
//! Tracks outcomes of rename runs for monitoring.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::ErrorKind;

/// Point-in-time copy of the rename counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RenameMetricsSnapshot {
    /// Runs started.
    pub attempts: u64,
    /// Runs whose commit succeeded.
    pub committed: u64,
    /// Runs that finished without touching any partition.
    pub noops: u64,
    /// Aborts with `NotExist`.
    pub aborted_not_exist: u64,
    /// Aborts with `NotEmpty`.
    pub aborted_not_empty: u64,
    /// Aborts with `Conflict`.
    pub aborted_conflict: u64,
    /// Aborts with any other error.
    pub aborted_internal: u64,
    /// Post-commit side effects that failed.
    pub post_commit_warnings: u64,
    /// Source prepares dropped after a failed destination prepare.
    pub compensations: u64,
    /// Total run duration in microseconds.
    pub total_duration_us: u64,
    /// Longest run in microseconds.
    pub max_duration_us: u64,
}

impl RenameMetricsSnapshot {
    /// Sum of all aborts.
    pub fn aborted(&self) -> u64 {
        self.aborted_not_exist + self.aborted_not_empty + self.aborted_conflict + self.aborted_internal
    }
}

/// Counters shared by every rename run of a client.
#[derive(Default)]
pub struct RenameMetrics {
    attempts: AtomicU64,
    committed: AtomicU64,
    noops: AtomicU64,
    aborted_not_exist: AtomicU64,
    aborted_not_empty: AtomicU64,
    aborted_conflict: AtomicU64,
    aborted_internal: AtomicU64,
    post_commit_warnings: AtomicU64,
    compensations: AtomicU64,
    total_duration_us: AtomicU64,
    max_duration_us: AtomicU64,
}

impl RenameMetrics {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts a started run.
    pub fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a committed run and its post-commit warnings.
    pub fn record_committed(&self, warnings: usize) {
        self.committed.fetch_add(1, Ordering::Relaxed);
        self.post_commit_warnings
            .fetch_add(warnings as u64, Ordering::Relaxed);
    }

    /// Counts a run that had nothing to do.
    pub fn record_noop(&self) {
        self.noops.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts an aborted run.
    pub fn record_abort(&self, kind: ErrorKind) {
        let counter = match kind {
            ErrorKind::NotExist => &self.aborted_not_exist,
            ErrorKind::NotEmpty => &self.aborted_not_empty,
            ErrorKind::Conflict => &self.aborted_conflict,
            ErrorKind::Internal => &self.aborted_internal,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a dropped source prepare.
    pub fn record_compensation(&self) {
        self.compensations.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the duration of one run.
    pub fn record_duration_us(&self, duration_us: u64) {
        self.total_duration_us
            .fetch_add(duration_us, Ordering::Relaxed);
        self.max_duration_us
            .fetch_max(duration_us, Ordering::Relaxed);
    }

    /// Copies the current counters.
    pub fn snapshot(&self) -> RenameMetricsSnapshot {
        RenameMetricsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            noops: self.noops.load(Ordering::Relaxed),
            aborted_not_exist: self.aborted_not_exist.load(Ordering::Relaxed),
            aborted_not_empty: self.aborted_not_empty.load(Ordering::Relaxed),
            aborted_conflict: self.aborted_conflict.load(Ordering::Relaxed),
            aborted_internal: self.aborted_internal.load(Ordering::Relaxed),
            post_commit_warnings: self.post_commit_warnings.load(Ordering::Relaxed),
            compensations: self.compensations.load(Ordering::Relaxed),
            total_duration_us: self.total_duration_us.load(Ordering::Relaxed),
            max_duration_us: self.max_duration_us.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_by_outcome() {
        let metrics = RenameMetrics::new();
        metrics.record_attempt();
        metrics.record_attempt();
        metrics.record_attempt();
        metrics.record_committed(2);
        metrics.record_abort(ErrorKind::NotEmpty);
        metrics.record_abort(ErrorKind::Internal);

        let snap = metrics.snapshot();
        assert_eq!(snap.attempts, 3);
        assert_eq!(snap.committed, 1);
        assert_eq!(snap.post_commit_warnings, 2);
        assert_eq!(snap.aborted_not_empty, 1);
        assert_eq!(snap.aborted_internal, 1);
        assert_eq!(snap.aborted(), 2);
    }

    #[test]
    fn test_duration_tracking() {
        let metrics = RenameMetrics::new();
        metrics.record_duration_us(100);
        metrics.record_duration_us(300);
        metrics.record_duration_us(200);

        let snap = metrics.snapshot();
        assert_eq!(snap.total_duration_us, 600);
        assert_eq!(snap.max_duration_us, 300);
    }
}
