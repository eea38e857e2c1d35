//! Input loading: address CSV files → job batches.
//!
//! A row carries up to three spellings of the same address, in priority
//! order: `FormattedAddress` (romanized, geocoder-friendly), `Address`
//! (original language) and `ConvertedAddress` (mechanically transliterated).
//! Blank cells are collapsed so the variant cursor never lands on an empty
//! string. The batch id is the file stem, which also names the checkpoint
//! and output files.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use log::{debug, info};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::crawl_engine::job::{Job, JobId};

const VARIANT_COLUMNS: [&str; 3] = ["FormattedAddress", "Address", "ConvertedAddress"];

/// Shorthand chōme addresses ("3-chome-1-2+Foo") geocode poorly; flag them
/// so the source data can be fixed.
static CHOME_SHORTHAND_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\d+-ch[ōo]me-\d+-\d+\+\w+")
        .unwrap_or_else(|e| panic!("chome shorthand regex: {e}"))
});

#[derive(Debug)]
pub struct LoadedBatch {
    pub batch_id: String,
    pub jobs: Vec<Job>,
    /// Suspicious-but-usable rows, reported to the warning log.
    pub anomalies: Vec<(JobId, String)>,
    /// Rows skipped because every variant cell was blank.
    pub skipped_blank: usize,
}

/// Load one CSV into a job batch.
pub fn load_batch(path: &Path) -> Result<LoadedBatch> {
    let batch_id = path
        .file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("input path {} has no usable file stem", path.display()))?;

    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("opening input {}", path.display()))?;
    let headers = reader
        .headers()
        .with_context(|| format!("reading headers of {}", path.display()))?
        .clone();

    let column_indexes: Vec<usize> = VARIANT_COLUMNS
        .iter()
        .filter_map(|name| headers.iter().position(|h| h.trim() == *name))
        .collect();
    if column_indexes.is_empty() {
        return Err(anyhow!(
            "{}: none of the address columns {:?} present (headers: {:?})",
            path.display(),
            VARIANT_COLUMNS,
            headers
        ));
    }

    let mut jobs = Vec::new();
    let mut anomalies = Vec::new();
    let mut skipped_blank = 0usize;
    for (row_index, row) in reader.records().enumerate() {
        let row = row.with_context(|| {
            format!("reading row {} of {}", row_index + 2, path.display())
        })?;
        let variants: Vec<String> = column_indexes
            .iter()
            .filter_map(|&i| row.get(i))
            .map(str::to_string)
            .collect();
        let Some(job) = Job::new(batch_id.clone(), variants) else {
            skipped_blank += 1;
            continue;
        };
        for variant in &job.variants {
            if CHOME_SHORTHAND_RE.is_match(variant) {
                anomalies.push((job.id, format!("chome shorthand address: {variant}")));
                break;
            }
        }
        jobs.push(job);
    }

    info!(
        "batch {batch_id}: loaded {} jobs from {} ({} blank rows skipped, {} anomalies)",
        jobs.len(),
        path.display(),
        skipped_blank,
        anomalies.len()
    );
    debug!("batch {batch_id}: variant columns at indexes {column_indexes:?}");
    Ok(LoadedBatch {
        batch_id,
        jobs,
        anomalies,
        skipped_blank,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use tempfile::tempdir;

    use super::*;

    fn write_csv(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).expect("create csv");
        file.write_all(content.as_bytes()).expect("write csv");
        path
    }

    #[test]
    fn loads_variants_in_priority_order_collapsing_gaps() {
        let dir = tempdir().expect("tempdir");
        let path = write_csv(
            dir.path(),
            "shibuya.csv",
            "Name,FormattedAddress,Address,ConvertedAddress\n\
             A,1-2-3 Ebisu,渋谷区恵比寿1-2-3,Ebisu 1-2-3\n\
             B,,目黒区下目黒4-5,\n\
             C,,,\n",
        );
        let batch = load_batch(&path).expect("load");
        assert_eq!(batch.batch_id, "shibuya");
        assert_eq!(batch.jobs.len(), 2);
        assert_eq!(batch.skipped_blank, 1);

        let first = &batch.jobs[0];
        assert_eq!(
            first.variants,
            vec!["1-2-3 Ebisu", "渋谷区恵比寿1-2-3", "Ebisu 1-2-3"]
        );
        let second = &batch.jobs[1];
        assert_eq!(second.variants, vec!["目黒区下目黒4-5"]);
        assert_eq!(second.cursor, 0);
    }

    #[test]
    fn job_ids_are_distinct_and_stable() {
        let dir = tempdir().expect("tempdir");
        let path = write_csv(
            dir.path(),
            "meguro.csv",
            "FormattedAddress\nrow one\nrow two\n",
        );
        let a = load_batch(&path).expect("load");
        let b = load_batch(&path).expect("load again");
        assert_eq!(a.jobs[0].id, b.jobs[0].id);
        assert_ne!(a.jobs[0].id, a.jobs[1].id);
    }

    #[test]
    fn missing_address_columns_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let path = write_csv(dir.path(), "bad.csv", "Name,City\nA,Tokyo\n");
        assert!(load_batch(&path).is_err());
    }

    #[test]
    fn chome_shorthand_is_flagged_not_dropped() {
        let dir = tempdir().expect("tempdir");
        let path = write_csv(
            dir.path(),
            "setagaya.csv",
            "FormattedAddress\n3-chome-1-2+Setagaya\nnormal address\n",
        );
        let batch = load_batch(&path).expect("load");
        assert_eq!(batch.jobs.len(), 2);
        assert_eq!(batch.anomalies.len(), 1);
        assert_eq!(batch.anomalies[0].0, batch.jobs[0].id);
    }
}
