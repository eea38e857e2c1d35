//! Fluent builder for [`CrawlerConfig`] with validation at build time.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, anyhow};
use url::Url;

use super::types::CrawlerConfig;

#[derive(Debug, Default)]
pub struct CrawlerConfigBuilder {
    config: CrawlerConfig,
}

impl CrawlerConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a preset instead of the defaults.
    #[must_use]
    pub fn from_preset(preset: CrawlerConfig) -> Self {
        Self { config: preset }
    }

    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    #[must_use]
    pub fn max_sessions(mut self, max: usize) -> Self {
        self.config.max_sessions = max;
        self
    }

    #[must_use]
    pub fn min_sessions(mut self, min: usize) -> Self {
        self.config.min_sessions = min;
        self
    }

    #[must_use]
    pub fn recycle_after_jobs(mut self, jobs: u32) -> Self {
        self.config.recycle_after_jobs = jobs;
        self
    }

    #[must_use]
    pub fn headless(mut self, headless: bool) -> Self {
        self.config.headless = headless;
        self
    }

    #[must_use]
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    #[must_use]
    pub fn job_timeout(mut self, timeout: Duration) -> Self {
        self.config.job_timeout = timeout;
        self
    }

    #[must_use]
    pub fn render_timeout(mut self, timeout: Duration) -> Self {
        self.config.render_timeout = timeout;
        self
    }

    #[must_use]
    pub fn flush_max_records(mut self, records: usize) -> Self {
        self.config.flush_max_records = records;
        self
    }

    #[must_use]
    pub fn flush_max_age(mut self, age: Duration) -> Self {
        self.config.flush_max_age = age;
        self
    }

    #[must_use]
    pub fn progress_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.progress_dir = dir.into();
        self
    }

    #[must_use]
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    #[must_use]
    pub fn warning_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.warning_dir = dir.into();
        self
    }

    #[must_use]
    pub fn resume(mut self, resume: bool) -> Self {
        self.config.resume = resume;
        self
    }

    #[must_use]
    pub fn adaptive(mut self, adaptive: bool) -> Self {
        self.config.adaptive = adaptive;
        self
    }

    #[must_use]
    pub fn water_marks(mut self, low: f32, high: f32) -> Self {
        self.config.low_water = low;
        self.config.high_water = high;
        self
    }

    #[must_use]
    pub fn excluded_category_first(mut self, first: bool) -> Self {
        self.config.excluded_category_first = first;
        self
    }

    #[must_use]
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = url.into();
        self
    }

    pub fn build(self) -> Result<CrawlerConfig> {
        let config = self.config;
        if config.max_attempts == 0 {
            return Err(anyhow!("max_attempts must be at least 1"));
        }
        if config.flush_max_records == 0 {
            return Err(anyhow!("flush_max_records must be at least 1"));
        }
        if config.max_sessions > 0 && config.min_sessions > config.max_sessions {
            return Err(anyhow!(
                "min_sessions ({}) exceeds max_sessions ({})",
                config.min_sessions,
                config.max_sessions
            ));
        }
        if !(0.0..=1.0).contains(&config.low_water)
            || !(0.0..=1.0).contains(&config.high_water)
            || config.low_water >= config.high_water
        {
            return Err(anyhow!(
                "water marks must satisfy 0 <= low < high <= 1 (got {} / {})",
                config.low_water,
                config.high_water
            ));
        }
        if config.job_timeout.is_zero() {
            return Err(anyhow!("job_timeout must be positive"));
        }
        if config.render_timeout >= config.job_timeout {
            return Err(anyhow!(
                "render_timeout must be shorter than job_timeout, or every slow page \
                 costs the full job budget"
            ));
        }
        Url::parse(&config.base_url)
            .map_err(|e| anyhow!("base_url {:?} is not a valid URL: {e}", config.base_url))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build_cleanly() {
        let config = CrawlerConfigBuilder::new().build().expect("valid defaults");
        assert!(config.resume);
        assert!(config.excluded_category_first);
    }

    #[test]
    fn rejects_inverted_water_marks() {
        let err = CrawlerConfigBuilder::new()
            .water_marks(0.9, 0.5)
            .build()
            .expect_err("inverted marks");
        assert!(err.to_string().contains("water marks"));
    }

    #[test]
    fn rejects_session_floor_above_ceiling() {
        assert!(
            CrawlerConfigBuilder::new()
                .max_sessions(2)
                .min_sessions(5)
                .build()
                .is_err()
        );
    }

    #[test]
    fn rejects_bad_base_url() {
        assert!(
            CrawlerConfigBuilder::new()
                .base_url("not a url")
                .build()
                .is_err()
        );
    }

    #[test]
    fn rejects_render_timeout_beyond_job_timeout() {
        assert!(
            CrawlerConfigBuilder::new()
                .job_timeout(Duration::from_secs(10))
                .render_timeout(Duration::from_secs(10))
                .build()
                .is_err()
        );
    }

    #[test]
    fn preset_flows_through() {
        let config = CrawlerConfigBuilder::from_preset(CrawlerConfig::fast())
            .workers(4)
            .build()
            .expect("valid");
        assert_eq!(config.max_attempts, 2);
        assert_eq!(config.workers, 4);
    }
}
