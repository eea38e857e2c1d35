//! Checkpointed, session-pooled crawler for extracting point-of-interest
//! records from map place pages at address scale.
//!
//! The orchestration core ([`crawl_engine`]) is browser-agnostic: workers are
//! generic over a [`extract::SessionProvider`] and a [`extract::PageFetcher`],
//! which production binds to the chromium [`session_pool`] and the
//! [`extract::MapsFetcher`]. Input CSVs become job batches ([`input`]), and
//! results land in append-only CSV sinks ([`sink`]) with per-batch
//! checkpoints for crash-safe resume.

pub mod browser_setup;
pub mod config;
pub mod crawl_engine;
pub mod extract;
pub mod input;
pub mod session_pool;
pub mod sink;

pub use browser_setup::{download_managed_browser, find_browser_executable, launch_browser};
pub use config::{CrawlerConfig, CrawlerConfigBuilder};
pub use crawl_engine::{
    BatchSummary, CheckpointManager, Job, JobId, Orchestrator, PoiRecord, ResourceScheduler,
    SchedulerConfig, TaskQueue,
};
pub use extract::{ExtractionResult, MapsFetcher, NavigationError, PageFetcher, SessionProvider};
pub use session_pool::{SessionGuard, SessionHealth, SessionPool, SessionPoolConfig};
pub use sink::{CsvSink, OutputSink};
