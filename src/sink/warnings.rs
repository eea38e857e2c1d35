//! Durable warning log.
//!
//! Permanent job failures and data anomalies are worth keeping after the run:
//! they are the input for fixing source addresses. Warnings are buffered and
//! appended to a per-batch CSV in chunks so a hot failure path does not turn
//! into per-row file opens.

use std::fs::OpenOptions;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::warn;
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct Warning {
    pub timestamp: DateTime<Utc>,
    pub job_id: String,
    pub kind: String,
    pub detail: String,
}

impl Warning {
    #[must_use]
    pub fn new(job_id: u64, kind: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            job_id: format!("{job_id:016x}"),
            kind: kind.into(),
            detail: detail.into(),
        }
    }
}

pub struct WarningLog {
    path: PathBuf,
    buffer: Mutex<Vec<Warning>>,
    flush_every: usize,
}

impl WarningLog {
    const DEFAULT_FLUSH_EVERY: usize = 50;

    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating warning dir {}", parent.display()))?;
        }
        Ok(Self {
            path,
            buffer: Mutex::new(Vec::new()),
            flush_every: Self::DEFAULT_FLUSH_EVERY,
        })
    }

    /// Record a warning; flushes to disk when the buffer fills. A failed
    /// flush is itself only logged — warnings never fail the run.
    pub fn push(&self, warning: Warning) {
        let due = {
            let mut buf = self.buffer.lock();
            buf.push(warning);
            buf.len() >= self.flush_every
        };
        if due && let Err(e) = self.flush() {
            warn!("warning log flush failed: {e:#}");
        }
    }

    pub fn flush(&self) -> Result<()> {
        let drained: Vec<Warning> = {
            let mut buf = self.buffer.lock();
            std::mem::take(&mut *buf)
        };
        if drained.is_empty() {
            return Ok(());
        }
        let write_headers = !self.path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(write_headers)
            .from_writer(file);
        for warning in &drained {
            writer.serialize(warning).context("writing warning row")?;
        }
        writer
            .flush()
            .with_context(|| format!("flushing {}", self.path.display()))?;
        Ok(())
    }

    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }
}

impl Drop for WarningLog {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!("warning log final flush failed: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn flush_on_demand_writes_all_buffered() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("warnings.csv");
        let log = WarningLog::create(&path).expect("log");
        log.push(Warning::new(1, "permanent_failure", "all variants rejected"));
        log.push(Warning::new(2, "permanent_failure", "attempts exhausted"));
        assert_eq!(log.buffered(), 2);

        log.flush().expect("flush");
        assert_eq!(log.buffered(), 0);
        let raw = std::fs::read_to_string(&path).expect("read");
        assert_eq!(raw.lines().count(), 3, "header plus two rows");
        assert!(raw.contains("0000000000000001"));
    }

    #[test]
    fn drop_flushes_remaining() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("warnings.csv");
        {
            let log = WarningLog::create(&path).expect("log");
            log.push(Warning::new(7, "anomaly", "odd address format"));
        }
        let raw = std::fs::read_to_string(&path).expect("read");
        assert!(raw.contains("anomaly"));
    }
}
