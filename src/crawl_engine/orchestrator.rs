//! Run lifecycle: wire the queue, workers, classifier, collector and
//! checkpoints together for one batch, and run batches sequentially.
//!
//! The orchestrator is generic over the session provider and page fetcher so
//! the whole engine runs under test with scripted collaborators and no
//! browser. One collector task owns the result buffer; workers only ship
//! terminal events over a channel, which keeps every disk write on a single
//! task and the flush-before-checkpoint ordering trivial to maintain.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use log::{info, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::checkpoint::{CheckpointManager, CheckpointRecord};
use super::classifier::RetryClassifier;
use super::job::Job;
use super::queue::{Lane, TaskQueue};
use super::result_buffer::{FlushPolicy, ResultBuffer};
use super::stats::{RunStats, RunTimer, StatsSnapshot};
use super::worker::{TerminalEvent, WorkerContext, run_worker};
use crate::config::CrawlerConfig;
use crate::extract::{PageFetcher, SessionProvider};
use crate::input::{self, LoadedBatch};
use crate::sink::{CsvSink, OutputSink, Warning, WarningLog};

#[derive(Debug)]
pub struct BatchSummary {
    pub batch_id: String,
    pub total_jobs: usize,
    /// Jobs skipped because a checkpoint already marked them complete.
    pub skipped_completed: usize,
    pub stats: StatsSnapshot,
    pub success_count: u64,
    pub failure_count: u64,
    pub excluded_count: u64,
    /// True when every job reached a terminal outcome and the checkpoint was
    /// finalized.
    pub finished: bool,
    /// True when the run was stopped by the operator.
    pub halted: bool,
    pub elapsed_secs: u64,
    pub jobs_per_second: f64,
    pub output: String,
}

pub struct Orchestrator<P, F> {
    config: CrawlerConfig,
    provider: Arc<P>,
    fetcher: Arc<F>,
    checkpoints: Arc<CheckpointManager>,
    active_queue: Mutex<Option<Arc<TaskQueue>>>,
    stop_requested: AtomicBool,
}

impl<P, F> Orchestrator<P, F>
where
    P: SessionProvider,
    F: PageFetcher<P::Session>,
{
    pub fn new(config: CrawlerConfig, provider: Arc<P>, fetcher: Arc<F>) -> Result<Self> {
        let checkpoints = Arc::new(CheckpointManager::new(&config.progress_dir)?);
        Ok(Self {
            config,
            provider,
            fetcher,
            checkpoints,
            active_queue: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Operator stop: the active batch stops dequeuing, in-flight jobs finish
    /// and are flushed, queued jobs are left for the next resume.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        if let Some(queue) = self.active_queue.lock().as_ref() {
            queue.halt();
        }
        info!("stop requested, draining in-flight jobs");
    }

    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Load a CSV and run it with the standard CSV sink and warning log.
    pub async fn run_file(&self, path: &Path) -> Result<BatchSummary> {
        let batch = input::load_batch(path)?;
        let sink = CsvSink::create(
            self.config
                .output_dir
                .join(format!("{}.csv", batch.batch_id)),
        )?;
        self.run_batch(batch, sink).await
    }

    /// Run several input files sequentially, each with its own checkpoint and
    /// output. Stops between batches when a stop was requested.
    pub async fn run_files(&self, paths: &[impl AsRef<Path>]) -> Result<Vec<BatchSummary>> {
        let mut summaries = Vec::with_capacity(paths.len());
        for path in paths {
            if self.stop_requested() {
                break;
            }
            summaries.push(self.run_file(path.as_ref()).await?);
        }
        Ok(summaries)
    }

    pub async fn run_batch<S: OutputSink>(
        &self,
        batch: LoadedBatch,
        sink: S,
    ) -> Result<BatchSummary> {
        let LoadedBatch {
            batch_id,
            jobs,
            anomalies,
            ..
        } = batch;
        let total = jobs.len();
        let timer = RunTimer::start();

        let record = self.load_or_new_record(&batch_id, &sink)?;
        let completed = record.completed_set();
        let pending: Vec<Job> = jobs
            .into_iter()
            .filter(|j| !completed.contains(&j.id))
            .collect();
        let skipped = total - pending.len();
        if skipped > 0 {
            info!("batch {batch_id}: {skipped}/{total} jobs already completed, resuming rest");
        }

        let warnings = Arc::new(WarningLog::create(
            self.config
                .warning_dir
                .join(format!("{batch_id}_warnings.csv")),
        )?);
        for (job_id, detail) in anomalies {
            warnings.push(Warning::new(job_id, "input_anomaly", detail));
        }

        if pending.is_empty() {
            if total > 0 {
                self.checkpoints.finalize(&batch_id)?;
            }
            let output = record.output_path.clone();
            return Ok(BatchSummary {
                batch_id,
                total_jobs: total,
                skipped_completed: skipped,
                stats: RunStats::default().snapshot(),
                success_count: record.success_count,
                failure_count: record.failure_count,
                excluded_count: record.excluded_count,
                finished: true,
                halted: false,
                elapsed_secs: timer.elapsed_secs(),
                jobs_per_second: 0.0,
                output,
            });
        }

        let queue = Arc::new(TaskQueue::new(self.config.effective_queue_capacity()));
        if self.stop_requested() {
            queue.halt();
        }
        *self.active_queue.lock() = Some(Arc::clone(&queue));

        let classifier = Arc::new(RetryClassifier::new(
            self.config.max_attempts,
            completed.iter().copied(),
        ));
        let stats = Arc::new(RunStats::default());
        let (events_tx, events_rx) = mpsc::channel::<TerminalEvent>(256);

        let buffer = ResultBuffer::new(
            sink,
            Arc::clone(&self.checkpoints),
            record,
            FlushPolicy {
                max_records: self.config.flush_max_records,
                max_age: self.config.flush_max_age,
                max_sink_failures: self.config.max_sink_failures,
            },
        );
        let collector = tokio::spawn(collect_events(events_rx, buffer, Arc::clone(&warnings)));

        let worker_count = self.config.effective_workers().min(pending.len());
        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            workers.push(tokio::spawn(run_worker(WorkerContext {
                worker_id,
                queue: Arc::clone(&queue),
                classifier: Arc::clone(&classifier),
                provider: Arc::clone(&self.provider),
                fetcher: Arc::clone(&self.fetcher),
                stats: Arc::clone(&stats),
                events: events_tx.clone(),
                job_timeout: self.config.job_timeout,
                excluded_category_first: self.config.excluded_category_first,
            })));
        }
        drop(events_tx);

        // Feed from a separate task: the bounded queue still applies
        // backpressure, but a feeder parked on a full queue cannot wedge this
        // function if every worker dies under it.
        let feeder = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                for job in pending {
                    queue.enqueue(job, Lane::Primary).await;
                }
                queue.close();
            })
        };

        for worker in workers {
            if let Err(e) = worker.await {
                warn!("batch {batch_id}: worker task panicked: {e}");
            }
        }
        // Workers only exit on a drained or halted queue. Jobs left behind at
        // this point mean every session slot died; halt so the feeder
        // unblocks and the stranded jobs stay un-checkpointed for resume.
        let stranded =
            !self.stop_requested() && (!feeder.is_finished() || !queue.is_empty());
        if stranded {
            queue.halt();
        }
        if let Err(e) = feeder.await {
            warn!("batch {batch_id}: feeder task panicked: {e}");
        }
        let record = collector
            .await
            .context("collector task panicked")?
            .context("persisting results")?;

        *self.active_queue.lock() = None;
        let halted = queue.is_halted();
        let finished = !halted && record.completed_len() >= total;
        if finished {
            self.checkpoints.finalize(&batch_id)?;
        }
        if let Err(e) = warnings.flush() {
            warn!("batch {batch_id}: warning log flush failed: {e:#}");
        }
        if stranded {
            return Err(anyhow!(
                "batch {batch_id}: all workers exited with {} jobs unfinished; \
                 no live sessions remain",
                total - record.completed_len()
            ));
        }

        let stats = stats.snapshot();
        let summary = BatchSummary {
            total_jobs: total,
            skipped_completed: skipped,
            success_count: record.success_count,
            failure_count: record.failure_count,
            excluded_count: record.excluded_count,
            finished,
            halted,
            elapsed_secs: timer.elapsed_secs(),
            jobs_per_second: timer.jobs_per_second(stats.jobs_executed),
            output: record.output_path,
            stats,
            batch_id,
        };
        info!(
            "batch {}: {} done, {} failed, {} excluded in {}s ({:.2} jobs/s){}",
            summary.batch_id,
            summary.success_count,
            summary.failure_count,
            summary.excluded_count,
            summary.elapsed_secs,
            summary.jobs_per_second,
            if summary.halted { " [stopped]" } else { "" },
        );
        Ok(summary)
    }

    /// Resume from an existing checkpoint when allowed and still valid;
    /// otherwise start a fresh record.
    fn load_or_new_record<S: OutputSink>(
        &self,
        batch_id: &str,
        sink: &S,
    ) -> Result<CheckpointRecord> {
        if !self.config.resume {
            return Ok(CheckpointRecord::new(batch_id, sink.locator()));
        }
        match self.checkpoints.load(batch_id)? {
            Some(record) => {
                if record.completed_len() > 0 && !sink.exists() {
                    warn!(
                        "batch {batch_id}: checkpoint names completed jobs but output {} \
                         is gone, restarting batch",
                        record.output_path
                    );
                    return Ok(CheckpointRecord::new(batch_id, sink.locator()));
                }
                Ok(record)
            }
            None => Ok(CheckpointRecord::new(batch_id, sink.locator())),
        }
    }
}

/// Single consumer of terminal events; owns the result buffer and therefore
/// all output and checkpoint writes for the batch.
async fn collect_events<S: OutputSink>(
    mut events: mpsc::Receiver<TerminalEvent>,
    mut buffer: ResultBuffer<S>,
    warnings: Arc<WarningLog>,
) -> Result<CheckpointRecord> {
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(TerminalEvent::Success { job_id, records }) => {
                        buffer.add_success(job_id, records);
                    }
                    Some(TerminalEvent::Failure { job_id, reason, excluded, variants_tried }) => {
                        if !excluded {
                            warnings.push(Warning::new(
                                job_id,
                                "permanent_failure",
                                format!(
                                    "{reason} (variants tried: {})",
                                    variants_tried.join(" | ")
                                ),
                            ));
                        }
                        buffer.add_failure(job_id, excluded);
                    }
                    None => break,
                }
                if buffer.due() {
                    buffer.flush().await?;
                }
            }
            _ = ticker.tick() => {
                if buffer.due() {
                    buffer.flush().await?;
                }
            }
        }
    }
    buffer.finish().await
}
