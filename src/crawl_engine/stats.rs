//! Run statistics.
//!
//! Workers keep plain local counters and fold them into the shared
//! [`RunStats`] atomics at a coarse interval, so the hot path never touches
//! shared cache lines per job.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Shared, monotonically increasing counters for one batch run.
#[derive(Debug, Default)]
pub struct RunStats {
    pub jobs_executed: AtomicU64,
    pub successes: AtomicU64,
    pub records_extracted: AtomicU64,
    pub retries: AtomicU64,
    pub permanent_failures: AtomicU64,
    pub excluded: AtomicU64,
    pub session_faults: AtomicU64,
}

impl RunStats {
    pub fn absorb(&self, local: &mut WorkerStats) {
        self.jobs_executed
            .fetch_add(local.jobs_executed, Ordering::Relaxed);
        self.successes.fetch_add(local.successes, Ordering::Relaxed);
        self.records_extracted
            .fetch_add(local.records_extracted, Ordering::Relaxed);
        self.retries.fetch_add(local.retries, Ordering::Relaxed);
        self.permanent_failures
            .fetch_add(local.permanent_failures, Ordering::Relaxed);
        self.excluded.fetch_add(local.excluded, Ordering::Relaxed);
        self.session_faults
            .fetch_add(local.session_faults, Ordering::Relaxed);
        *local = WorkerStats::default();
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            jobs_executed: self.jobs_executed.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            records_extracted: self.records_extracted.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            permanent_failures: self.permanent_failures.load(Ordering::Relaxed),
            excluded: self.excluded.load(Ordering::Relaxed),
            session_faults: self.session_faults.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub jobs_executed: u64,
    pub successes: u64,
    pub records_extracted: u64,
    pub retries: u64,
    pub permanent_failures: u64,
    pub excluded: u64,
    pub session_faults: u64,
}

/// Per-worker counters, absorbed into [`RunStats`] every
/// [`WorkerStats::ABSORB_EVERY`] jobs and at worker exit.
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkerStats {
    pub jobs_executed: u64,
    pub successes: u64,
    pub records_extracted: u64,
    pub retries: u64,
    pub permanent_failures: u64,
    pub excluded: u64,
    pub session_faults: u64,
}

impl WorkerStats {
    pub const ABSORB_EVERY: u64 = 16;

    #[must_use]
    pub fn due_for_absorb(&self) -> bool {
        self.jobs_executed >= Self::ABSORB_EVERY
    }
}

/// Wall-clock throughput helper for end-of-run reporting.
pub struct RunTimer {
    started: Instant,
}

impl RunTimer {
    #[must_use]
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    #[must_use]
    pub fn jobs_per_second(&self, jobs: u64) -> f64 {
        let secs = self.started.elapsed().as_secs_f64();
        if secs > 0.0 { jobs as f64 / secs } else { 0.0 }
    }

    #[must_use]
    pub fn elapsed_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absorb_folds_and_resets_local_counters() {
        let shared = RunStats::default();
        let mut local = WorkerStats {
            jobs_executed: 16,
            successes: 10,
            records_extracted: 57,
            retries: 4,
            permanent_failures: 1,
            excluded: 1,
            session_faults: 0,
        };
        shared.absorb(&mut local);
        assert_eq!(local.jobs_executed, 0);
        let snap = shared.snapshot();
        assert_eq!(snap.jobs_executed, 16);
        assert_eq!(snap.records_extracted, 57);

        local.jobs_executed = 2;
        local.successes = 2;
        shared.absorb(&mut local);
        assert_eq!(shared.snapshot().jobs_executed, 18);
        assert_eq!(shared.snapshot().successes, 12);
    }

    #[test]
    fn absorb_interval_trigger() {
        let mut local = WorkerStats::default();
        assert!(!local.due_for_absorb());
        local.jobs_executed = WorkerStats::ABSORB_EVERY;
        assert!(local.due_for_absorb());
    }
}
