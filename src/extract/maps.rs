//! Production fetcher for Google-Maps-style place pages.
//!
//! Navigates `base_url/<encoded address>`, waits for the place heading to
//! render, detects excluded (lodging) listings by their category header, and
//! reads the nearby-POI cards out of the DOM. Coordinates come from the final
//! URL, which the site rewrites to `.../@<lat>,<lng>,<zoom>z/...` once the
//! map has focused the place.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chromiumoxide::Page;
use chromiumoxide::error::CdpError;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, trace};

use super::{ExtractionResult, NavigationError, PageFetcher};
use crate::crawl_engine::job::PoiRecord;
use crate::session_pool::SessionGuard;

const HEADING_SELECTOR: &str = "h1.DUwDvf";
const CATEGORY_HEADER_SELECTOR: &str = "h2.kPvgOb.fontHeadlineSmall";
const POI_CARD_SELECTOR: &str = "div.Nv2PK";
const POI_NAME_SELECTOR: &str = ".qBF1Pd";
const POI_RATING_SELECTOR: &str = "span.MW4etd";
const POI_DETAIL_SELECTOR: &str = ".W4Efsd";

static COMMENT_COUNT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\((\d[\d,]*)\)").unwrap_or_else(|e| panic!("comment count regex: {e}"))
});

#[derive(Debug, Clone)]
pub struct MapsFetcher {
    base_url: String,
    /// How long to wait for the place heading after navigation.
    render_timeout: Duration,
    poll_interval: Duration,
    excluded_labels: Vec<String>,
}

impl MapsFetcher {
    #[must_use]
    pub fn new(
        base_url: impl Into<String>,
        render_timeout: Duration,
        excluded_labels: Vec<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            render_timeout,
            poll_interval: Duration::from_millis(400),
            excluded_labels,
        }
    }

    fn place_url(&self, query: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            urlencoding::encode(query)
        )
    }

    async fn extract(&self, page: &Page) -> Result<ExtractionResult, NavigationError> {
        page.wait_for_navigation().await.map_err(classify_cdp)?;

        // The heading renders well after the navigation settles; poll for it
        // and check the excluded-category header on each pass, which must win
        // over a missing heading (lodging pages sometimes render the header
        // first).
        let deadline = Instant::now() + self.render_timeout;
        let heading = loop {
            if let Some(label) = self.excluded_label(page).await? {
                debug!("excluded category page ({label})");
                return Ok(ExtractionResult {
                    is_valid_entity: true,
                    is_excluded_category: true,
                    entity_name: self.heading_text(page).await?.unwrap_or_default(),
                    records: Vec::new(),
                });
            }
            if let Some(name) = self.heading_text(page).await? {
                break name;
            }
            if Instant::now() >= deadline {
                return Ok(ExtractionResult {
                    is_valid_entity: false,
                    ..ExtractionResult::default()
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        };
        let entity_name = sanitize_name(&heading);

        let (latitude, longitude) = match page.url().await.map_err(classify_cdp)?.as_deref() {
            Some(url) => parse_coordinates(url).map_or((None, None), |(a, b)| (Some(a), Some(b))),
            None => (None, None),
        };

        let mut records = Vec::new();
        let cards = page
            .find_elements(POI_CARD_SELECTOR)
            .await
            .unwrap_or_default();
        trace!("found {} POI cards", cards.len());
        for card in cards {
            let name = match card.find_element(POI_NAME_SELECTOR).await {
                Ok(el) => el
                    .inner_text()
                    .await
                    .ok()
                    .flatten()
                    .unwrap_or_default()
                    .trim()
                    .to_string(),
                Err(_) => continue,
            };
            if name.is_empty() {
                continue;
            }

            let rating = match card.find_element(POI_RATING_SELECTOR).await {
                Ok(el) => el
                    .inner_text()
                    .await
                    .ok()
                    .flatten()
                    .as_deref()
                    .and_then(parse_rating),
                Err(_) => None,
            };

            // The detail block is a run of dot-separated spans; the last one
            // holds "<category> · <address>".
            let (category, address) = match card.find_elements(POI_DETAIL_SELECTOR).await {
                Ok(details) => {
                    let mut text = String::new();
                    if let Some(last) = details.last() {
                        text = last.inner_text().await.ok().flatten().unwrap_or_default();
                    }
                    split_detail_line(&text)
                }
                Err(_) => (String::new(), String::new()),
            };

            let comment_count = card
                .inner_text()
                .await
                .ok()
                .flatten()
                .as_deref()
                .map_or(0, parse_comment_count);

            records.push(PoiRecord {
                name,
                rating,
                category,
                address,
                comment_count,
                building_name: String::new(),
                latitude,
                longitude,
                source_job_id: 0,
            });
        }

        Ok(ExtractionResult {
            is_valid_entity: true,
            is_excluded_category: false,
            entity_name,
            records,
        })
    }

    async fn excluded_label(&self, page: &Page) -> Result<Option<String>, NavigationError> {
        let headers = match page.find_elements(CATEGORY_HEADER_SELECTOR).await {
            Ok(els) => els,
            Err(_) => return Ok(None),
        };
        for header in headers {
            if let Some(text) = header.inner_text().await.ok().flatten() {
                let text = text.trim();
                if self.excluded_labels.iter().any(|l| l == text) {
                    return Ok(Some(text.to_string()));
                }
            }
        }
        Ok(None)
    }

    async fn heading_text(&self, page: &Page) -> Result<Option<String>, NavigationError> {
        match page.find_element(HEADING_SELECTOR).await {
            Ok(el) => {
                let text = el.inner_text().await.ok().flatten().unwrap_or_default();
                let text = text.trim();
                if text.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(text.to_string()))
                }
            }
            Err(_) => Ok(None),
        }
    }
}

#[async_trait]
impl PageFetcher<SessionGuard> for MapsFetcher {
    async fn fetch(
        &self,
        session: &mut SessionGuard,
        query: &str,
    ) -> Result<ExtractionResult, NavigationError> {
        let url = self.place_url(query);
        let page = session
            .browser()
            .new_page(url.as_str())
            .await
            .map_err(classify_cdp)?;
        let result = self.extract(&page).await;
        if let Err(e) = page.close().await {
            debug!("closing page failed: {e}");
        }
        result
    }
}

/// Map a CDP error onto the navigation taxonomy by message shape; the
/// chromiumoxide error type does not distinguish these cases structurally.
fn classify_cdp(err: CdpError) -> NavigationError {
    let msg = err.to_string();
    let lower = msg.to_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        NavigationError::Timeout(msg)
    } else if lower.contains("closed")
        || lower.contains("disconnected")
        || lower.contains("no target")
        || lower.contains("session not found")
        || lower.contains("not connected")
    {
        NavigationError::SessionFatal(msg)
    } else {
        NavigationError::Transport(msg)
    }
}

/// Pull `(lat, lng)` out of a focused-place URL (`.../@35.65,139.69,17z/...`).
#[must_use]
pub fn parse_coordinates(url: &str) -> Option<(f64, f64)> {
    let after = url.split_once("/@").map(|(_, rest)| rest)?;
    let segment = after.split('/').next()?;
    let mut parts = segment.split(',');
    let lat: f64 = parts.next()?.parse().ok()?;
    let lng: f64 = parts.next()?.parse().ok()?;
    if (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lng) {
        Some((lat, lng))
    } else {
        None
    }
}

/// Parse a rating span ("4.3", "4,3" in some locales).
#[must_use]
pub fn parse_rating(text: &str) -> Option<f32> {
    let cleaned = text.trim().replace(',', ".");
    let value: f32 = cleaned.parse().ok()?;
    if (0.0..=5.0).contains(&value) {
        Some(value)
    } else {
        None
    }
}

fn parse_comment_count(card_text: &str) -> u32 {
    COMMENT_COUNT_RE
        .captures(card_text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().replace(',', "").parse().ok())
        .unwrap_or(0)
}

fn split_detail_line(text: &str) -> (String, String) {
    let line = text.lines().next().unwrap_or("");
    match line.split_once('·') {
        Some((category, address)) => {
            (category.trim().to_string(), address.trim().to_string())
        }
        None => (String::new(), line.trim().to_string()),
    }
}

/// Replace filesystem- and CSV-hostile characters in a place heading.
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | '|' | '*' | '?' | ':' | '"' | '<' | '>' => ' ',
            other => other,
        })
        .collect::<String>()
        .trim()
        .to_string()
}
