//! Collaborator boundary between the orchestration core and the site-facing
//! code.
//!
//! The worker loop is generic over two seams: a [`SessionProvider`] that
//! hands out exclusive browser sessions, and a [`PageFetcher`] that navigates
//! one address variant and extracts a raw [`ExtractionResult`]. Production
//! wires these to the chromium session pool and the maps fetcher; tests wire
//! scripted mocks so the engine is exercised without a browser.

pub mod maps;

use async_trait::async_trait;
use thiserror::Error;

use crate::crawl_engine::job::PoiRecord;
use crate::session_pool::SessionHealth;

pub use maps::{MapsFetcher, parse_coordinates, parse_rating};

/// Navigation/extraction failure surface. The worker maps these onto the
/// classifier's failure kinds.
#[derive(Debug, Error)]
pub enum NavigationError {
    /// The page did not reach a usable state in time. Retryable as-is.
    #[error("navigation timed out: {0}")]
    Timeout(String),
    /// Protocol or network level failure. Retryable as-is.
    #[error("transport error: {0}")]
    Transport(String),
    /// The browser session itself is broken; recycle it and requeue.
    #[error("session unusable: {0}")]
    SessionFatal(String),
}

/// Raw page read-out, before classification.
#[derive(Debug, Default)]
pub struct ExtractionResult {
    /// False when the page did not resolve to the expected entity (no place
    /// heading), which sends the job to its next address variant.
    pub is_valid_entity: bool,
    /// True when the page is an excluded category (lodging listing).
    pub is_excluded_category: bool,
    /// Heading of the resolved place, used as `building_name`.
    pub entity_name: String,
    /// Extracted POIs. `building_name` and `source_job_id` are stamped by the
    /// worker.
    pub records: Vec<PoiRecord>,
}

/// Hands out exclusive sessions up to a concurrency ceiling.
#[async_trait]
pub trait SessionProvider: Send + Sync + 'static {
    type Session: Send + 'static;

    /// Blocks while the ceiling is reached. Errors only when the pool is
    /// shut down or a slot is declared dead.
    async fn acquire(&self) -> anyhow::Result<Self::Session>;

    /// Return a session with the health observed by its last job.
    async fn release(&self, session: Self::Session, health: SessionHealth);
}

/// Navigates to the place page for one address variant and extracts it.
#[async_trait]
pub trait PageFetcher<S>: Send + Sync + 'static {
    async fn fetch(
        &self,
        session: &mut S,
        query: &str,
    ) -> Result<ExtractionResult, NavigationError>;
}
