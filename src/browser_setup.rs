//! Locating and launching the Chromium instances backing pool sessions.
//!
//! Each session gets its own user-data directory (profile lock contention
//! otherwise serializes launches) and its own CDP handler task. Image loading
//! is disabled: place pages are extracted from the DOM only, and skipping
//! images roughly halves navigation time at scale.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use chromiumoxide::browser::{Browser, BrowserConfigBuilder, HeadlessMode};
use chromiumoxide::fetcher::{BrowserFetcher, BrowserFetcherOptions};
use futures::StreamExt;
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info, trace, warn};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Find a Chrome/Chromium executable. `CHROMIUM_PATH` overrides the search;
/// otherwise well-known install locations are probed, then `which`.
pub fn find_browser_executable() -> Result<PathBuf> {
    if let Ok(raw) = std::env::var("CHROMIUM_PATH") {
        let path = PathBuf::from(raw);
        if path.exists() {
            info!("using browser from CHROMIUM_PATH: {}", path.display());
            return Ok(path);
        }
        warn!(
            "CHROMIUM_PATH points to a non-existent file: {}",
            path.display()
        );
    }

    let candidates: &[&str] = if cfg!(target_os = "macos") {
        &[
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/opt/homebrew/bin/chromium",
        ]
    } else if cfg!(target_os = "windows") {
        &[
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files\Chromium\Application\chrome.exe",
        ]
    } else {
        &[
            "/usr/bin/google-chrome",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/snap/bin/chromium",
            "/opt/google/chrome/chrome",
        ]
    };
    for candidate in candidates {
        let path = PathBuf::from(candidate);
        if path.exists() {
            debug!("found browser at {}", path.display());
            return Ok(path);
        }
    }

    if !cfg!(target_os = "windows") {
        for cmd in ["google-chrome", "chromium", "chromium-browser", "chrome"] {
            if let Ok(output) = Command::new("which").arg(cmd).output()
                && output.status.success()
            {
                let found = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !found.is_empty() {
                    debug!("found browser via which: {found}");
                    return Ok(PathBuf::from(found));
                }
            }
        }
    }

    Err(anyhow::anyhow!("no Chrome/Chromium executable found"))
}

/// Download a managed Chromium build into the user cache directory. Used as
/// a fallback when no system browser exists.
pub async fn download_managed_browser() -> Result<PathBuf> {
    let cache_dir = dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("poi-crawler")
        .join("chromium");
    std::fs::create_dir_all(&cache_dir)
        .with_context(|| format!("creating browser cache dir {}", cache_dir.display()))?;

    info!("downloading managed Chromium into {}", cache_dir.display());
    let fetcher = BrowserFetcher::new(
        BrowserFetcherOptions::builder()
            .with_path(&cache_dir)
            .build()
            .context("building browser fetcher options")?,
    );
    let revision = fetcher.fetch().await.context("fetching browser")?;
    info!("downloaded Chromium to {}", revision.folder_path.display());
    Ok(revision.executable_path)
}

/// Launch one browser instance with its own profile directory and spawn the
/// task that drains its CDP event stream.
pub async fn launch_browser(
    headless: bool,
    user_data_dir: PathBuf,
) -> Result<(Browser, JoinHandle<()>)> {
    let executable = match find_browser_executable() {
        Ok(path) => path,
        Err(_) => download_managed_browser().await?,
    };
    std::fs::create_dir_all(&user_data_dir)
        .with_context(|| format!("creating profile dir {}", user_data_dir.display()))?;

    let mut builder = BrowserConfigBuilder::default()
        .request_timeout(Duration::from_secs(30))
        .window_size(1280, 900)
        .user_data_dir(user_data_dir)
        .chrome_executable(executable);
    builder = if headless {
        builder.headless_mode(HeadlessMode::default())
    } else {
        builder.with_head()
    };
    builder = builder
        .arg(format!("--user-agent={USER_AGENT}"))
        .arg("--blink-settings=imagesEnabled=false")
        .arg("--disable-blink-features=AutomationControlled")
        .arg("--no-sandbox")
        .arg("--disable-setuid-sandbox")
        .arg("--disable-dev-shm-usage")
        .arg("--disable-gpu")
        .arg("--disable-extensions")
        .arg("--disable-notifications")
        .arg("--disable-infobars")
        .arg("--disable-background-networking")
        .arg("--disable-background-timer-throttling")
        .arg("--disable-backgrounding-occluded-windows")
        .arg("--disable-breakpad")
        .arg("--disable-hang-monitor")
        .arg("--disable-ipc-flooding-protection")
        .arg("--disable-prompt-on-repost")
        .arg("--metrics-recording-only")
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--password-store=basic")
        .arg("--use-mock-keychain")
        .arg("--hide-scrollbars")
        .arg("--mute-audio");

    let config = builder
        .build()
        .map_err(|e| anyhow::anyhow!("building browser config: {e}"))?;

    let (browser, mut handler) = Browser::launch(config)
        .await
        .context("launching browser")?;

    let handler_task = task::spawn(async move {
        while let Some(event) = handler.next().await {
            if let Err(e) = event {
                let msg = e.to_string();
                // Chrome emits CDP events chromiumoxide cannot deserialize;
                // those are noise, not failures.
                let benign = msg
                    .contains("data did not match any variant of untagged enum Message")
                    || msg.contains("Failed to deserialize WS response");
                if benign {
                    trace!("suppressed benign CDP serialization error: {msg}");
                } else {
                    error!("browser handler error: {e:?}");
                }
            }
        }
        trace!("browser handler stream ended");
    });

    Ok((browser, handler_task))
}
