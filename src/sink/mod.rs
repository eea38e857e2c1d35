//! Durable output: append-only CSV sink for POI records plus a batched
//! warning log for permanent failures and data anomalies.

mod warnings;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;

use crate::crawl_engine::job::PoiRecord;

pub use warnings::{Warning, WarningLog};

/// Destination for flushed records. Appends must be atomic enough that a
/// failed call leaves previously appended rows intact; callers retain the
/// failed rows and retry.
#[async_trait]
pub trait OutputSink: Send + Sync + 'static {
    async fn append(&self, records: &[PoiRecord]) -> Result<()>;

    /// Identifier stored in checkpoints so a resume can verify the output
    /// still exists.
    fn locator(&self) -> String;

    fn exists(&self) -> bool;
}

/// CSV row shape, kept separate from [`PoiRecord`] so the on-disk column set
/// stays stable if the in-memory record grows.
#[derive(Serialize)]
struct CsvRow<'a> {
    name: &'a str,
    rating: Option<f32>,
    category: &'a str,
    address: &'a str,
    comment_count: u32,
    building_name: &'a str,
    latitude: Option<f64>,
    longitude: Option<f64>,
    source_job_id: String,
}

impl<'a> From<&'a PoiRecord> for CsvRow<'a> {
    fn from(r: &'a PoiRecord) -> Self {
        Self {
            name: &r.name,
            rating: r.rating,
            category: &r.category,
            address: &r.address,
            comment_count: r.comment_count,
            building_name: &r.building_name,
            latitude: r.latitude,
            longitude: r.longitude,
            source_job_id: format!("{:016x}", r.source_job_id),
        }
    }
}

/// Append-only CSV writer. Each append opens, writes and flushes the file so
/// a crash between flushes never loses acknowledged rows.
pub struct CsvSink {
    path: PathBuf,
}

impl CsvSink {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating output dir {}", parent.display()))?;
        }
        Ok(Self { path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append_sync(&self, records: &[PoiRecord]) -> Result<()> {
        let write_headers = !self.path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(write_headers)
            .from_writer(file);
        for record in records {
            writer
                .serialize(CsvRow::from(record))
                .with_context(|| format!("writing row to {}", self.path.display()))?;
        }
        writer
            .flush()
            .with_context(|| format!("flushing {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl OutputSink for CsvSink {
    async fn append(&self, records: &[PoiRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.append_sync(records)
    }

    fn locator(&self) -> String {
        self.path.display().to_string()
    }

    fn exists(&self) -> bool {
        self.path.exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(name: &str) -> PoiRecord {
        PoiRecord {
            name: name.to_string(),
            rating: Some(4.2),
            category: "Cafe".into(),
            address: "1-2-3 Ebisu".into(),
            comment_count: 12,
            building_name: "Ebisu Tower".into(),
            latitude: Some(35.64),
            longitude: Some(139.71),
            source_job_id: 0xabcd,
        }
    }

    #[tokio::test]
    async fn appends_accumulate_with_one_header() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("out.csv");
        let sink = CsvSink::create(&path).expect("sink");
        assert!(!sink.exists());

        sink.append(&[record("A"), record("B")]).await.expect("first");
        sink.append(&[record("C")]).await.expect("second");

        let raw = std::fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 4, "header plus three rows: {raw}");
        assert!(lines[0].starts_with("name,rating,category,address"));
        assert!(lines[3].starts_with("C,"));
        assert!(sink.exists());
    }

    #[tokio::test]
    async fn empty_append_is_a_no_op() {
        let dir = tempdir().expect("tempdir");
        let sink = CsvSink::create(dir.path().join("out.csv")).expect("sink");
        sink.append(&[]).await.expect("empty append");
        assert!(!sink.exists());
    }
}
