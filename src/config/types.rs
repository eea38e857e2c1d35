//! Configuration for crawl runs.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Complete configuration for a crawl run.
///
/// Constructed through [`crate::config::CrawlerConfigBuilder`] or one of the
/// presets. Zero on the sizing fields means "derive": worker count from the
/// CPU tier, session ceiling and queue depth from the worker count.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    /// Concurrent worker tasks. 0 = auto-size from the CPU count.
    pub workers: usize,
    /// Browser session ceiling. 0 = derive from the worker count.
    pub max_sessions: usize,
    /// Session floor for adaptive scaling.
    pub min_sessions: usize,
    /// Recycle a session after this many jobs.
    pub recycle_after_jobs: u32,
    /// Consecutive launch failures before a pool slot is retired.
    pub launch_retry_limit: u32,
    pub headless: bool,

    /// Bounded queue depth. 0 = derive from the worker count.
    pub queue_capacity: usize,
    /// Attempt budget per job (session faults excluded).
    pub max_attempts: u32,
    /// Hard per-job execution ceiling.
    pub job_timeout: Duration,
    /// How long the fetcher waits for the place heading to render.
    pub render_timeout: Duration,

    pub flush_max_records: usize,
    pub flush_max_age: Duration,
    /// Consecutive sink failures tolerated before aborting the run.
    pub max_sink_failures: u32,

    pub progress_dir: PathBuf,
    pub output_dir: PathBuf,
    pub warning_dir: PathBuf,
    /// Resume from checkpoints when present.
    pub resume: bool,

    /// Enable the resource scheduler.
    pub adaptive: bool,
    pub sample_interval: Duration,
    pub high_water: f32,
    pub low_water: f32,

    /// Whether the excluded-category check wins over a missing heading.
    pub excluded_category_first: bool,
    /// Category header texts identifying excluded (lodging) pages.
    pub excluded_category_labels: Vec<String>,
    /// Place page URL prefix; the encoded address is appended.
    pub base_url: String,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            max_sessions: 0,
            min_sessions: 2,
            recycle_after_jobs: 40,
            launch_retry_limit: 3,
            headless: true,

            queue_capacity: 0,
            max_attempts: 3,
            job_timeout: Duration::from_secs(40),
            render_timeout: Duration::from_secs(15),

            flush_max_records: 25,
            flush_max_age: Duration::from_secs(8),
            max_sink_failures: 5,

            progress_dir: PathBuf::from("progress"),
            output_dir: PathBuf::from("output"),
            warning_dir: PathBuf::from("warnings"),
            resume: true,

            adaptive: false,
            sample_interval: Duration::from_secs(5),
            high_water: 0.85,
            low_water: 0.60,

            excluded_category_first: true,
            excluded_category_labels: vec!["酒店".to_string(), "ホテル".to_string()],
            base_url: "https://www.google.com/maps/place".to_string(),
        }
    }
}

impl CrawlerConfig {
    /// Throughput-oriented preset: shorter timeouts, fewer retries, larger
    /// flush windows.
    #[must_use]
    pub fn fast() -> Self {
        Self {
            max_attempts: 2,
            job_timeout: Duration::from_secs(25),
            render_timeout: Duration::from_secs(10),
            flush_max_records: 50,
            ..Self::default()
        }
    }

    /// Reliability-oriented preset: generous timeouts, eager flushes,
    /// adaptive scaling on.
    #[must_use]
    pub fn stable() -> Self {
        Self {
            max_attempts: 4,
            job_timeout: Duration::from_secs(60),
            render_timeout: Duration::from_secs(25),
            flush_max_records: 10,
            flush_max_age: Duration::from_secs(4),
            recycle_after_jobs: 25,
            adaptive: true,
            ..Self::default()
        }
    }

    /// Single worker, visible browser, per-record flushes. For watching the
    /// crawl misbehave.
    #[must_use]
    pub fn debug() -> Self {
        Self {
            workers: 1,
            max_sessions: 1,
            min_sessions: 1,
            headless: false,
            flush_max_records: 1,
            ..Self::default()
        }
    }

    /// Worker count from the CPU tier when not set explicitly.
    #[must_use]
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        let cores = num_cpus::get();
        if cores >= 12 {
            (cores * 4).min(48)
        } else if cores >= 8 {
            (cores * 3).min(36)
        } else {
            (cores * 2).min(24)
        }
    }

    /// Session ceiling derived from the worker count when not set: half the
    /// workers, clamped to [8, 20]. Chrome instances cost far more than
    /// worker tasks, so workers share sessions through queue pressure.
    #[must_use]
    pub fn effective_max_sessions(&self) -> usize {
        if self.max_sessions > 0 {
            return self.max_sessions;
        }
        (self.effective_workers() / 2).clamp(8, 20)
    }

    #[must_use]
    pub fn effective_queue_capacity(&self) -> usize {
        if self.queue_capacity > 0 {
            return self.queue_capacity;
        }
        self.effective_workers() * 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_sizing_wins_over_derivation() {
        let config = CrawlerConfig {
            workers: 6,
            max_sessions: 3,
            queue_capacity: 11,
            ..CrawlerConfig::default()
        };
        assert_eq!(config.effective_workers(), 6);
        assert_eq!(config.effective_max_sessions(), 3);
        assert_eq!(config.effective_queue_capacity(), 11);
    }

    #[test]
    fn derived_sessions_track_workers_within_clamp() {
        let config = CrawlerConfig {
            workers: 40,
            ..CrawlerConfig::default()
        };
        assert_eq!(config.effective_max_sessions(), 20);

        let small = CrawlerConfig {
            workers: 4,
            ..CrawlerConfig::default()
        };
        assert_eq!(small.effective_max_sessions(), 8);
    }

    #[test]
    fn debug_preset_is_single_session() {
        let config = CrawlerConfig::debug();
        assert_eq!(config.effective_workers(), 1);
        assert_eq!(config.effective_max_sessions(), 1);
        assert!(!config.headless);
    }
}
