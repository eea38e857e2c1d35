//! Retry classification: folds a [`JobOutcome`] into the job's variant-cursor
//! state machine and decides requeue vs terminal.
//!
//! The classifier also owns the completed-id set, which makes job completion
//! idempotent: a second terminal outcome for the same [`JobId`] (possible
//! after a resume race or a duplicated requeue) is dropped instead of being
//! double-counted or double-written.

use dashmap::DashSet;
use log::debug;

use super::job::{FailureKind, Job, JobId, JobOutcome, PoiRecord};

/// What the worker should do with a job after classification.
#[derive(Debug)]
pub enum Classification {
    /// Terminal success: hand records to the result buffer.
    Success { records: Vec<PoiRecord> },
    /// Put the job back on the retry lane with its updated cursor/attempts.
    Requeue(Job),
    /// Terminal failure: record it and move on.
    Permanent {
        job: Job,
        reason: String,
        /// Excluded-category pages are permanent-empty, not errors.
        excluded: bool,
    },
    /// The job already reached a terminal outcome under another execution.
    Duplicate,
}

pub struct RetryClassifier {
    max_attempts: u32,
    completed: DashSet<JobId>,
}

impl RetryClassifier {
    /// `completed` seeds the idempotence set from a loaded checkpoint.
    #[must_use]
    pub fn new(max_attempts: u32, completed: impl IntoIterator<Item = JobId>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            completed: completed.into_iter().collect(),
        }
    }

    /// True when the job already has a terminal outcome.
    #[must_use]
    pub fn is_completed(&self, id: JobId) -> bool {
        self.completed.contains(&id)
    }

    #[must_use]
    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    pub fn classify(&self, mut job: Job, outcome: JobOutcome) -> Classification {
        match outcome {
            JobOutcome::Success { records, .. } => {
                if !self.completed.insert(job.id) {
                    debug!("job {:016x}: duplicate terminal success dropped", job.id);
                    return Classification::Duplicate;
                }
                Classification::Success { records }
            }
            JobOutcome::Permanent { reason, excluded } => {
                if !self.completed.insert(job.id) {
                    return Classification::Duplicate;
                }
                Classification::Permanent {
                    job,
                    reason,
                    excluded,
                }
            }
            JobOutcome::Retryable { kind, reason } => {
                if self.completed.contains(&job.id) {
                    return Classification::Duplicate;
                }
                match kind {
                    // Not the job's fault: requeue as-is, attempt budget
                    // untouched. The session gets recycled by the worker.
                    FailureKind::SessionFatal => {
                        debug!(
                            "job {:016x}: session fault ({reason}), requeue without charge",
                            job.id
                        );
                        Classification::Requeue(job)
                    }
                    FailureKind::Transient => {
                        job.attempts += 1;
                        if job.attempts >= self.max_attempts {
                            self.terminal_failure(
                                job,
                                format!("transient failures exhausted attempts: {reason}"),
                            )
                        } else {
                            Classification::Requeue(job)
                        }
                    }
                    FailureKind::InvalidVariant => {
                        job.attempts += 1;
                        if !job.advance_variant() {
                            return self.terminal_failure(
                                job,
                                format!("all address variants rejected: {reason}"),
                            );
                        }
                        if job.attempts >= self.max_attempts {
                            self.terminal_failure(
                                job,
                                format!("attempt budget exhausted: {reason}"),
                            )
                        } else {
                            Classification::Requeue(job)
                        }
                    }
                }
            }
        }
    }

    fn terminal_failure(&self, job: Job, reason: String) -> Classification {
        if !self.completed.insert(job.id) {
            return Classification::Duplicate;
        }
        Classification::Permanent {
            job,
            reason,
            excluded: false,
        }
    }
}
