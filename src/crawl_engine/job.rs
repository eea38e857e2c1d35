//! Core job types for the crawl orchestration engine.
//!
//! A [`Job`] maps one input address (with ordered fallback variants) to zero or
//! more [`PoiRecord`]s. Jobs are immutable except for the variant cursor and
//! attempt counter, which the retry classifier advances.

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

/// Stable job identifier: xxh3 of the source batch id plus the full variant
/// list. Resume depends on this hash being identical across runs for the same
/// input row.
pub type JobId = u64;

/// Compute the [`JobId`] for an input row.
#[must_use]
pub fn job_id(batch_id: &str, variants: &[String]) -> JobId {
    let mut buf = String::with_capacity(batch_id.len() + 32);
    buf.push_str(batch_id);
    for v in variants {
        buf.push('\u{1f}');
        buf.push_str(v);
    }
    xxh3_64(buf.as_bytes())
}

/// One unit of work: an address with its fallback variants.
///
/// `variants` is ordered by priority (formatted address first, then the
/// original-language address, then a converted form). The cursor points at the
/// variant currently being tried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Batch (input file) this job originated from.
    pub batch_id: String,
    /// Address variants in priority order. Never empty.
    pub variants: Vec<String>,
    /// Index of the variant currently being tried.
    #[serde(default)]
    pub cursor: usize,
    /// Number of execute attempts so far (session-fatal requeues excluded).
    #[serde(default)]
    pub attempts: u32,
}

impl Job {
    /// Build a job from an input row. Returns `None` when no usable variant
    /// exists (blank row).
    #[must_use]
    pub fn new(batch_id: impl Into<String>, variants: Vec<String>) -> Option<Self> {
        let variants: Vec<String> = variants
            .into_iter()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect();
        if variants.is_empty() {
            return None;
        }
        let batch_id = batch_id.into();
        let id = job_id(&batch_id, &variants);
        Some(Self {
            id,
            batch_id,
            variants,
            cursor: 0,
            attempts: 0,
        })
    }

    /// The variant the next execution should use.
    #[must_use]
    pub fn current_variant(&self) -> Option<&str> {
        self.variants.get(self.cursor).map(String::as_str)
    }

    /// Advance to the next fallback variant. Returns false when exhausted.
    pub fn advance_variant(&mut self) -> bool {
        if self.cursor + 1 < self.variants.len() {
            self.cursor += 1;
            true
        } else {
            false
        }
    }

    /// Variants tried so far, for permanent-failure logging.
    #[must_use]
    pub fn variants_tried(&self) -> Vec<String> {
        self.variants[..=self.cursor.min(self.variants.len() - 1)].to_vec()
    }
}

/// Categorizes a retryable failure for the classifier.
///
/// Different kinds take different paths through the retry state machine:
/// - `Transient` retries the same variant (bounded attempts)
/// - `InvalidVariant` advances to the next fallback variant
/// - `SessionFatal` requeues without charging the job's attempt budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Timeout or transport error; the same variant may work next time.
    Transient,
    /// The page did not resolve to the expected entity (no place heading).
    InvalidVariant,
    /// The underlying browser session is unusable; not the job's fault.
    SessionFatal,
}

/// Outcome of one dequeue-execute cycle. Folded into counters and retry
/// decisions, never persisted directly.
#[derive(Debug)]
pub enum JobOutcome {
    Success {
        records: Vec<PoiRecord>,
        variant_index: usize,
    },
    Retryable {
        kind: FailureKind,
        reason: String,
    },
    Permanent {
        reason: String,
        /// True for excluded-category pages (lodging listings): permanent
        /// with an empty result, not an error statistically.
        excluded: bool,
    },
}

/// One extracted point of interest. Immutable once produced; owned by the
/// result buffer until flushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoiRecord {
    pub name: String,
    pub rating: Option<f32>,
    pub category: String,
    pub address: String,
    pub comment_count: u32,
    /// Name of the building/place the POI list was extracted from.
    pub building_name: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub source_job_id: JobId,
}

impl PoiRecord {
    /// Key used for batch-local deduplication within one flush window.
    #[must_use]
    pub fn dedup_key(&self) -> (&str, &str, &str) {
        (&self.name, &self.address, &self.building_name)
    }
}
