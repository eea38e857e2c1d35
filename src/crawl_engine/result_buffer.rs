//! Buffered durable writes with flush-then-checkpoint ordering.
//!
//! Terminal outcomes accumulate here and hit disk in batches, triggered by
//! size or age. A flush appends the deduplicated records to the sink first
//! and only then marks the contributing jobs completed in the checkpoint, so
//! a crash between the two re-runs jobs instead of losing their output.
//!
//! A failed sink append retains both the records and the pending completion
//! marks for the next attempt; repeated consecutive failures escalate to a
//! run-fatal error because continuing would only grow the unflushed window.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, warn};

use super::checkpoint::{CheckpointManager, CheckpointRecord};
use super::job::{JobId, PoiRecord};
use crate::sink::OutputSink;

#[derive(Debug, Clone)]
pub struct FlushPolicy {
    /// Flush when this many records are buffered.
    pub max_records: usize,
    /// Flush when the oldest buffered outcome is this old.
    pub max_age: Duration,
    /// Consecutive sink failures tolerated before the run aborts.
    pub max_sink_failures: u32,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            max_records: 25,
            max_age: Duration::from_secs(8),
            max_sink_failures: 5,
        }
    }
}

/// How a pending job completed; folded into checkpoint counters at flush.
#[derive(Debug, Clone, Copy)]
enum Completion {
    Success,
    Failure,
    Excluded,
}

pub struct ResultBuffer<S> {
    sink: S,
    checkpoints: Arc<CheckpointManager>,
    record: CheckpointRecord,
    policy: FlushPolicy,
    buffered: Vec<PoiRecord>,
    pending: Vec<(JobId, Completion)>,
    last_flush: Instant,
    consecutive_failures: u32,
}

impl<S: OutputSink> ResultBuffer<S> {
    pub fn new(
        sink: S,
        checkpoints: Arc<CheckpointManager>,
        record: CheckpointRecord,
        policy: FlushPolicy,
    ) -> Self {
        Self {
            sink,
            checkpoints,
            record,
            policy,
            buffered: Vec::new(),
            pending: Vec::new(),
            last_flush: Instant::now(),
            consecutive_failures: 0,
        }
    }

    pub fn add_success(&mut self, job_id: JobId, records: Vec<PoiRecord>) {
        self.buffered.extend(records);
        self.pending.push((job_id, Completion::Success));
    }

    pub fn add_failure(&mut self, job_id: JobId, excluded: bool) {
        let completion = if excluded {
            Completion::Excluded
        } else {
            Completion::Failure
        };
        self.pending.push((job_id, completion));
    }

    #[must_use]
    pub fn due(&self) -> bool {
        if self.pending.is_empty() && self.buffered.is_empty() {
            return false;
        }
        self.buffered.len() >= self.policy.max_records
            || self.last_flush.elapsed() >= self.policy.max_age
    }

    /// Flush buffered records and checkpoint the pending completions.
    ///
    /// Returns `Err` only for run-fatal conditions: the sink failing
    /// [`FlushPolicy::max_sink_failures`] times in a row, or the checkpoint
    /// itself being unwritable.
    pub async fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() && self.buffered.is_empty() {
            self.last_flush = Instant::now();
            return Ok(());
        }

        let deduped = dedup_keep_first(&self.buffered);
        match self.sink.append(&deduped).await {
            Ok(()) => {
                debug!(
                    "batch {}: flushed {} records ({} pre-dedup), {} completions",
                    self.record.batch_id,
                    deduped.len(),
                    self.buffered.len(),
                    self.pending.len()
                );
                self.buffered.clear();
                self.consecutive_failures = 0;
                for (id, completion) in self.pending.drain(..) {
                    match completion {
                        Completion::Success => self.record.success_count += 1,
                        Completion::Failure => self.record.failure_count += 1,
                        Completion::Excluded => self.record.excluded_count += 1,
                    }
                    self.record
                        .completed_job_ids
                        .push(format!("{id:016x}"));
                }
                self.record.updated_at = Utc::now();
            }
            Err(e) => {
                self.consecutive_failures += 1;
                warn!(
                    "batch {}: sink append failed ({}/{}): {e:#}",
                    self.record.batch_id, self.consecutive_failures, self.policy.max_sink_failures
                );
                if self.consecutive_failures >= self.policy.max_sink_failures {
                    return Err(e.context(format!(
                        "sink failed {} consecutive flushes, aborting run",
                        self.consecutive_failures
                    )));
                }
                // Records and completion marks stay buffered for the retry;
                // the checkpoint below carries an unchanged completed set.
                self.record.updated_at = Utc::now();
            }
        }

        self.checkpoints
            .store(&self.record)
            .context("persisting checkpoint")?;
        self.last_flush = Instant::now();
        Ok(())
    }

    /// Final flush; hands the checkpoint record back to the orchestrator.
    pub async fn finish(mut self) -> Result<CheckpointRecord> {
        self.flush().await?;
        if !self.buffered.is_empty() || !self.pending.is_empty() {
            // A tolerated sink failure on the very last flush still loses
            // nothing: the jobs stay un-checkpointed and re-run on resume.
            warn!(
                "batch {}: {} records and {} completions left unflushed",
                self.record.batch_id,
                self.buffered.len(),
                self.pending.len()
            );
        }
        Ok(self.record)
    }

    #[must_use]
    pub fn record(&self) -> &CheckpointRecord {
        &self.record
    }
}

fn dedup_keep_first(records: &[PoiRecord]) -> Vec<PoiRecord> {
    let mut seen: HashSet<(String, String, String)> = HashSet::with_capacity(records.len());
    let mut out = Vec::with_capacity(records.len());
    for record in records {
        let (name, address, building) = record.dedup_key();
        if seen.insert((name.to_string(), address.to_string(), building.to_string())) {
            out.push(record.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tempfile::tempdir;

    use super::*;

    #[derive(Default)]
    struct MemorySink {
        rows: Mutex<Vec<PoiRecord>>,
        fail: AtomicBool,
        appends: AtomicUsize,
    }

    #[async_trait]
    impl OutputSink for Arc<MemorySink> {
        async fn append(&self, records: &[PoiRecord]) -> Result<()> {
            self.appends.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("disk full");
            }
            self.rows.lock().extend_from_slice(records);
            Ok(())
        }

        fn locator(&self) -> String {
            "memory".into()
        }

        fn exists(&self) -> bool {
            !self.rows.lock().is_empty()
        }
    }

    fn record(name: &str, address: &str) -> PoiRecord {
        PoiRecord {
            name: name.into(),
            rating: None,
            category: String::new(),
            address: address.into(),
            comment_count: 0,
            building_name: "Tower".into(),
            latitude: None,
            longitude: None,
            source_job_id: 1,
        }
    }

    fn buffer(
        sink: Arc<MemorySink>,
        dir: &std::path::Path,
        policy: FlushPolicy,
    ) -> ResultBuffer<Arc<MemorySink>> {
        let checkpoints = Arc::new(CheckpointManager::new(dir).expect("manager"));
        let record = CheckpointRecord::new("batch", "memory");
        ResultBuffer::new(sink, checkpoints, record, policy)
    }

    #[tokio::test]
    async fn size_trigger_and_checkpoint_after_append() {
        let dir = tempdir().expect("tempdir");
        let sink = Arc::new(MemorySink::default());
        let mut buf = buffer(
            Arc::clone(&sink),
            dir.path(),
            FlushPolicy {
                max_records: 2,
                ..FlushPolicy::default()
            },
        );

        buf.add_success(10, vec![record("A", "addr1")]);
        assert!(!buf.due());
        buf.add_success(11, vec![record("B", "addr2")]);
        assert!(buf.due());

        buf.flush().await.expect("flush");
        assert_eq!(sink.rows.lock().len(), 2);
        assert_eq!(buf.record().completed_len(), 2);
        assert_eq!(buf.record().success_count, 2);

        let checkpoints = CheckpointManager::new(dir.path()).expect("manager");
        let stored = checkpoints.load("batch").expect("load").expect("present");
        assert!(stored.completed_set().contains(&10));
        assert!(stored.completed_set().contains(&11));
    }

    #[tokio::test]
    async fn dedup_keeps_first_within_flush() {
        let dir = tempdir().expect("tempdir");
        let sink = Arc::new(MemorySink::default());
        let mut buf = buffer(Arc::clone(&sink), dir.path(), FlushPolicy::default());

        let mut first = record("Cafe", "addr");
        first.rating = Some(4.0);
        let mut dupe = record("Cafe", "addr");
        dupe.rating = Some(1.0);
        buf.add_success(1, vec![first, dupe, record("Other", "addr")]);
        buf.flush().await.expect("flush");

        let rows = sink.rows.lock();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].rating, Some(4.0), "first occurrence wins");
    }

    #[tokio::test]
    async fn sink_failure_retains_everything_and_checkpoints_nothing() {
        let dir = tempdir().expect("tempdir");
        let sink = Arc::new(MemorySink::default());
        let mut buf = buffer(Arc::clone(&sink), dir.path(), FlushPolicy::default());

        buf.add_success(5, vec![record("A", "a")]);
        sink.fail.store(true, Ordering::SeqCst);
        buf.flush().await.expect("tolerated failure");
        assert_eq!(buf.record().completed_len(), 0);

        sink.fail.store(false, Ordering::SeqCst);
        buf.flush().await.expect("retry succeeds");
        assert_eq!(sink.rows.lock().len(), 1);
        assert_eq!(buf.record().completed_len(), 1);
        assert_eq!(buf.record().success_count, 1);
    }

    #[tokio::test]
    async fn repeated_sink_failures_become_fatal() {
        let dir = tempdir().expect("tempdir");
        let sink = Arc::new(MemorySink::default());
        let mut buf = buffer(
            Arc::clone(&sink),
            dir.path(),
            FlushPolicy {
                max_sink_failures: 2,
                ..FlushPolicy::default()
            },
        );

        buf.add_success(5, vec![record("A", "a")]);
        sink.fail.store(true, Ordering::SeqCst);
        buf.flush().await.expect("first failure tolerated");
        let err = buf.flush().await.expect_err("second failure is fatal");
        assert!(err.to_string().contains("consecutive"), "{err:#}");
    }

    #[tokio::test]
    async fn failures_and_exclusions_count_separately() {
        let dir = tempdir().expect("tempdir");
        let sink = Arc::new(MemorySink::default());
        let mut buf = buffer(Arc::clone(&sink), dir.path(), FlushPolicy::default());

        buf.add_failure(1, false);
        buf.add_failure(2, true);
        let record = buf.finish().await.expect("finish");
        assert_eq!(record.failure_count, 1);
        assert_eq!(record.excluded_count, 1);
        assert_eq!(record.completed_len(), 2);
        // No records were buffered, so the sink saw no append worth counting.
        assert!(sink.rows.lock().is_empty());
    }
}
