//! Worker loop: acquire a session, take a job, execute it under a hard
//! timeout, classify the outcome, hand terminal results to the collector.
//!
//! Workers are symmetric and stateless across jobs apart from local stat
//! counters. A worker never dies because a job failed: job-level errors are
//! classified, session-level errors recycle the session, and only a dead
//! pool slot or a dead collector ends the loop.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, warn};
use tokio::sync::mpsc;

use super::classifier::{Classification, RetryClassifier};
use super::job::{FailureKind, Job, JobId, JobOutcome, PoiRecord};
use super::queue::{Lane, TaskQueue};
use super::stats::{RunStats, WorkerStats};
use crate::extract::{ExtractionResult, NavigationError, PageFetcher, SessionProvider};
use crate::session_pool::SessionHealth;

/// Terminal outcome shipped from workers to the collector task, which owns
/// the result buffer.
#[derive(Debug)]
pub enum TerminalEvent {
    Success {
        job_id: JobId,
        records: Vec<PoiRecord>,
    },
    Failure {
        job_id: JobId,
        reason: String,
        excluded: bool,
        variants_tried: Vec<String>,
    },
}

pub struct WorkerContext<P, F> {
    pub worker_id: usize,
    pub queue: Arc<TaskQueue>,
    pub classifier: Arc<RetryClassifier>,
    pub provider: Arc<P>,
    pub fetcher: Arc<F>,
    pub stats: Arc<RunStats>,
    pub events: mpsc::Sender<TerminalEvent>,
    /// Hard ceiling on one job execution, enforced with `tokio::time::timeout`.
    pub job_timeout: Duration,
    /// Whether the excluded-category check wins over a missing place heading.
    pub excluded_category_first: bool,
}

pub async fn run_worker<P, F>(ctx: WorkerContext<P, F>)
where
    P: SessionProvider,
    F: PageFetcher<P::Session>,
{
    let mut local = WorkerStats::default();
    loop {
        let mut session = match ctx.provider.acquire().await {
            Ok(s) => s,
            Err(e) => {
                // Dead slot or pool shutdown: this worker retires, the rest
                // keep draining the queue.
                warn!("worker {}: no session available, exiting: {e:#}", ctx.worker_id);
                break;
            }
        };

        let Some(job) = ctx.queue.dequeue().await else {
            ctx.provider.release(session, SessionHealth::Live).await;
            break;
        };

        if ctx.classifier.is_completed(job.id) {
            debug!("worker {}: job {:016x} already completed", ctx.worker_id, job.id);
            ctx.queue.task_done();
            ctx.provider.release(session, SessionHealth::Live).await;
            continue;
        }

        let mut health = SessionHealth::Live;
        let variant = job.current_variant().unwrap_or_default().to_string();
        let outcome = match tokio::time::timeout(
            ctx.job_timeout,
            ctx.fetcher.fetch(&mut session, &variant),
        )
        .await
        {
            // The fetch future was dropped mid-protocol; the session may
            // have a page leaked, so mark it suspect.
            Err(_) => {
                health = SessionHealth::Degraded;
                JobOutcome::Retryable {
                    kind: FailureKind::Transient,
                    reason: format!("job exceeded {:?} hard timeout", ctx.job_timeout),
                }
            }
            Ok(Ok(extraction)) => fold_extraction(&job, extraction, ctx.excluded_category_first),
            Ok(Err(NavigationError::Timeout(m))) => JobOutcome::Retryable {
                kind: FailureKind::Transient,
                reason: m,
            },
            Ok(Err(NavigationError::Transport(m))) => JobOutcome::Retryable {
                kind: FailureKind::Transient,
                reason: m,
            },
            Ok(Err(NavigationError::SessionFatal(m))) => {
                health = SessionHealth::Dead;
                JobOutcome::Retryable {
                    kind: FailureKind::SessionFatal,
                    reason: m,
                }
            }
        };

        local.jobs_executed += 1;
        let job_id = job.id;
        let collector_alive = match ctx.classifier.classify(job, outcome) {
            Classification::Success { records } => {
                local.successes += 1;
                local.records_extracted += records.len() as u64;
                send_terminal(&ctx.events, TerminalEvent::Success { job_id, records }).await
            }
            Classification::Requeue(requeued) => {
                if matches!(health, SessionHealth::Dead) {
                    local.session_faults += 1;
                } else {
                    local.retries += 1;
                }
                ctx.queue.enqueue(requeued, Lane::Retry).await;
                true
            }
            Classification::Permanent {
                job,
                reason,
                excluded,
            } => {
                if excluded {
                    local.excluded += 1;
                } else {
                    local.permanent_failures += 1;
                }
                send_terminal(
                    &ctx.events,
                    TerminalEvent::Failure {
                        job_id: job.id,
                        reason,
                        excluded,
                        variants_tried: job.variants_tried(),
                    },
                )
                .await
            }
            Classification::Duplicate => true,
        };
        ctx.queue.task_done();
        ctx.provider.release(session, health).await;

        if local.due_for_absorb() {
            ctx.stats.absorb(&mut local);
        }
        if !collector_alive {
            // Collector gone means the sink went fatal; stop producing.
            error!("worker {}: collector closed, halting queue", ctx.worker_id);
            ctx.queue.halt();
            break;
        }
    }
    ctx.stats.absorb(&mut local);
    debug!("worker {} exited", ctx.worker_id);
}

fn fold_extraction(job: &Job, extraction: ExtractionResult, excluded_first: bool) -> JobOutcome {
    let excluded = || JobOutcome::Permanent {
        reason: "excluded category page".to_string(),
        excluded: true,
    };
    let invalid = || JobOutcome::Retryable {
        kind: FailureKind::InvalidVariant,
        reason: "page did not resolve to a place".to_string(),
    };
    if excluded_first {
        if extraction.is_excluded_category {
            return excluded();
        }
        if !extraction.is_valid_entity {
            return invalid();
        }
    } else {
        if !extraction.is_valid_entity {
            return invalid();
        }
        if extraction.is_excluded_category {
            return excluded();
        }
    }

    let mut records = extraction.records;
    for record in &mut records {
        record.building_name = extraction.entity_name.clone();
        record.source_job_id = job.id;
    }
    JobOutcome::Success {
        records,
        variant_index: job.cursor,
    }
}

async fn send_terminal(tx: &mpsc::Sender<TerminalEvent>, event: TerminalEvent) -> bool {
    tx.send(event).await.is_ok()
}
