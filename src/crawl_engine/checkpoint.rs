//! Batch checkpointing: one JSON file per input batch under the progress
//! directory, written atomically (temp file then rename) so a crash mid-write
//! leaves the previous checkpoint intact.
//!
//! A checkpoint only ever names *completed* jobs. Anything not in the set is
//! re-attempted on resume, which together with idempotent append-only output
//! gives at-least-once execution with at-most-once recorded completion.

use std::collections::HashSet;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::job::JobId;

/// Persistent progress record for one batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub batch_id: String,
    /// Completed job ids, hex-encoded for human inspection of the JSON.
    pub completed_job_ids: Vec<String>,
    pub success_count: u64,
    pub failure_count: u64,
    pub excluded_count: u64,
    pub output_path: String,
    pub updated_at: DateTime<Utc>,
}

impl CheckpointRecord {
    #[must_use]
    pub fn new(batch_id: impl Into<String>, output_path: impl Into<String>) -> Self {
        Self {
            batch_id: batch_id.into(),
            completed_job_ids: Vec::new(),
            success_count: 0,
            failure_count: 0,
            excluded_count: 0,
            output_path: output_path.into(),
            updated_at: Utc::now(),
        }
    }

    /// Decode the completed set. Malformed entries are dropped with a warning
    /// rather than poisoning the whole resume.
    #[must_use]
    pub fn completed_set(&self) -> HashSet<JobId> {
        self.completed_job_ids
            .iter()
            .filter_map(|s| match JobId::from_str_radix(s, 16) {
                Ok(id) => Some(id),
                Err(_) => {
                    warn!("checkpoint {}: unparseable job id {s:?}", self.batch_id);
                    None
                }
            })
            .collect()
    }

    pub fn mark_completed(&mut self, ids: impl IntoIterator<Item = JobId>) {
        for id in ids {
            self.completed_job_ids.push(format!("{id:016x}"));
        }
        self.updated_at = Utc::now();
    }

    #[must_use]
    pub fn completed_len(&self) -> usize {
        self.completed_job_ids.len()
    }
}

/// Loads, stores and finalizes checkpoint files for batches.
pub struct CheckpointManager {
    progress_dir: PathBuf,
}

impl CheckpointManager {
    pub fn new(progress_dir: impl Into<PathBuf>) -> Result<Self> {
        let progress_dir = progress_dir.into();
        fs::create_dir_all(&progress_dir).with_context(|| {
            format!("creating progress directory {}", progress_dir.display())
        })?;
        Ok(Self { progress_dir })
    }

    #[must_use]
    pub fn path_for(&self, batch_id: &str) -> PathBuf {
        self.progress_dir.join(format!("{batch_id}_progress.json"))
    }

    /// Load the checkpoint for a batch, if one exists. A corrupt file is a
    /// hard error: silently restarting would duplicate large output files.
    pub fn load(&self, batch_id: &str) -> Result<Option<CheckpointRecord>> {
        let path = self.path_for(batch_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("reading checkpoint {}", path.display()))?;
        let record: CheckpointRecord = serde_json::from_str(&raw)
            .with_context(|| format!("parsing checkpoint {}", path.display()))?;
        info!(
            "batch {batch_id}: resuming from checkpoint with {} completed jobs",
            record.completed_len()
        );
        Ok(Some(record))
    }

    /// Atomically persist the record: write a sibling temp file, flush, then
    /// rename over the target.
    pub fn store(&self, record: &CheckpointRecord) -> Result<()> {
        let path = self.path_for(&record.batch_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(record).context("serializing checkpoint")?;
        {
            let mut file = fs::File::create(&tmp)
                .with_context(|| format!("creating {}", tmp.display()))?;
            file.write_all(json.as_bytes())
                .with_context(|| format!("writing {}", tmp.display()))?;
            file.sync_all()
                .with_context(|| format!("syncing {}", tmp.display()))?;
        }
        fs::rename(&tmp, &path)
            .with_context(|| format!("renaming {} into place", tmp.display()))?;
        debug!(
            "batch {}: checkpoint stored ({} completed)",
            record.batch_id,
            record.completed_len()
        );
        Ok(())
    }

    /// Remove the checkpoint once the batch is fully complete.
    pub fn finalize(&self, batch_id: &str) -> Result<()> {
        let path = self.path_for(batch_id);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("removing {}", path.display()))?;
            info!("batch {batch_id}: complete, checkpoint removed");
        }
        Ok(())
    }

    /// Batches with an unfinished checkpoint, for `--status`.
    pub fn pending_batches(&self) -> Result<Vec<CheckpointRecord>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.progress_dir)
            .with_context(|| format!("listing {}", self.progress_dir.display()))?
        {
            let path = entry.context("reading progress directory entry")?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(batch_id) = name.strip_suffix("_progress.json") else {
                continue;
            };
            match self.load(batch_id) {
                Ok(Some(record)) => out.push(record),
                Ok(None) => {}
                Err(err) => warn!("skipping unreadable checkpoint {name}: {err:#}"),
            }
        }
        out.sort_by(|a, b| a.batch_id.cmp(&b.batch_id));
        Ok(out)
    }

    /// Delete all checkpoints, for `--clean-progress`. Returns how many were
    /// removed.
    pub fn clean(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.progress_dir)
            .with_context(|| format!("listing {}", self.progress_dir.display()))?
        {
            let path = entry.context("reading progress directory entry")?.path();
            let is_checkpoint = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with("_progress.json"));
            if is_checkpoint {
                fs::remove_file(&path)
                    .with_context(|| format!("removing {}", path.display()))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    #[must_use]
    pub fn progress_dir(&self) -> &Path {
        &self.progress_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn store_load_roundtrip() {
        let dir = tempdir().expect("tempdir");
        let mgr = CheckpointManager::new(dir.path()).expect("manager");

        let mut record = CheckpointRecord::new("shibuya", "output/shibuya.csv");
        record.mark_completed([1u64, 0xdead_beef, u64::MAX]);
        record.success_count = 2;
        record.failure_count = 1;
        mgr.store(&record).expect("store");

        let loaded = mgr.load("shibuya").expect("load").expect("present");
        assert_eq!(loaded.batch_id, "shibuya");
        assert_eq!(loaded.success_count, 2);
        let set = loaded.completed_set();
        assert!(set.contains(&1));
        assert!(set.contains(&0xdead_beef));
        assert!(set.contains(&u64::MAX));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn missing_checkpoint_is_none() {
        let dir = tempdir().expect("tempdir");
        let mgr = CheckpointManager::new(dir.path()).expect("manager");
        assert!(mgr.load("nowhere").expect("load").is_none());
    }

    #[test]
    fn corrupt_checkpoint_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let mgr = CheckpointManager::new(dir.path()).expect("manager");
        fs::write(mgr.path_for("bad"), b"{not json").expect("write");
        assert!(mgr.load("bad").is_err());
    }

    #[test]
    fn finalize_removes_file_and_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let mgr = CheckpointManager::new(dir.path()).expect("manager");
        mgr.store(&CheckpointRecord::new("minato", "out.csv"))
            .expect("store");
        assert!(mgr.path_for("minato").exists());
        mgr.finalize("minato").expect("finalize");
        assert!(!mgr.path_for("minato").exists());
        mgr.finalize("minato").expect("second finalize is a no-op");
    }

    #[test]
    fn pending_batches_lists_and_clean_removes() {
        let dir = tempdir().expect("tempdir");
        let mgr = CheckpointManager::new(dir.path()).expect("manager");
        mgr.store(&CheckpointRecord::new("b", "b.csv")).expect("store");
        mgr.store(&CheckpointRecord::new("a", "a.csv")).expect("store");

        let pending = mgr.pending_batches().expect("pending");
        let ids: Vec<&str> = pending.iter().map(|r| r.batch_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        assert_eq!(mgr.clean().expect("clean"), 2);
        assert!(mgr.pending_batches().expect("pending").is_empty());
    }
}
