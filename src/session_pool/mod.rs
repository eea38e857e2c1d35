//! Bounded pool of persistent browser sessions.
//!
//! The concurrency ceiling is a semaphore: a permit is held for the whole
//! time a session is live, including teardown, so the number of running
//! browsers can never exceed the ceiling even transiently. Sessions are
//! launched lazily on acquire, parked idle on release, and recycled (torn
//! down, not relaunched) when reported dead or after a fixed number of jobs —
//! long-lived Chrome processes accumulate memory and slow down.
//!
//! The ceiling is also the resize target for the resource scheduler:
//! [`SessionPool::resize`] forgets or restores permits between a floor and
//! the configured maximum without ever preempting a session in use.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chromiumoxide::Browser;
use parking_lot::Mutex;
use rand::Rng;
use tempfile::TempDir;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::browser_setup;
use crate::extract::SessionProvider;

/// Health of a session as observed by its last job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionHealth {
    Live,
    /// Usable but suspect (e.g. repeated slow navigations). Counts double
    /// toward the recycle threshold.
    Degraded,
    /// Connection lost or browser crashed; recycle immediately.
    Dead,
}

#[derive(Debug, Clone)]
pub struct SessionPoolConfig {
    /// Hard ceiling on concurrently live browsers.
    pub max_sessions: usize,
    /// Resize floor for the resource scheduler.
    pub min_sessions: usize,
    /// Recycle a session after this many jobs.
    pub recycle_after_jobs: u32,
    /// Consecutive launch failures before a slot is declared dead.
    pub launch_retry_limit: u32,
    pub headless: bool,
}

impl Default for SessionPoolConfig {
    fn default() -> Self {
        Self {
            max_sessions: 8,
            min_sessions: 2,
            recycle_after_jobs: 40,
            launch_retry_limit: 3,
            headless: true,
        }
    }
}

/// One live browser plus its CDP handler task and isolated profile dir.
/// The profile dir is removed when the session is dropped, after the browser
/// has been closed.
struct PooledSession {
    id: u64,
    browser: Browser,
    handler: JoinHandle<()>,
    _profile_dir: TempDir,
    created_at: Instant,
    jobs_done: u32,
}

impl PooledSession {
    async fn shutdown(mut self) {
        if let Err(e) = self.browser.close().await {
            debug!(session = self.id, "browser close failed: {e}");
        }
        let _ = self.browser.wait().await;
        self.handler.abort();
        debug!(
            session = self.id,
            age_secs = self.created_at.elapsed().as_secs(),
            jobs = self.jobs_done,
            "session torn down"
        );
    }
}

pub struct SessionPool {
    config: SessionPoolConfig,
    idle: Mutex<VecDeque<PooledSession>>,
    permits: Arc<Semaphore>,
    /// Current resize target; live sessions never exceed it.
    limit: AtomicUsize,
    live: AtomicUsize,
    next_id: AtomicU64,
    dead_slots: AtomicUsize,
    shutdown: AtomicBool,
}

impl SessionPool {
    #[must_use]
    pub fn new(config: SessionPoolConfig) -> Arc<Self> {
        let max = config.max_sessions.max(1);
        Arc::new(Self {
            permits: Arc::new(Semaphore::new(max)),
            limit: AtomicUsize::new(max),
            idle: Mutex::new(VecDeque::with_capacity(max)),
            live: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            dead_slots: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            config,
        })
    }

    /// Acquire an exclusive session, blocking while the ceiling is reached.
    ///
    /// Idle sessions are health-checked (a CDP `version` round trip) before
    /// reuse; unresponsive ones are torn down and replaced. Repeated launch
    /// failures permanently retire the slot instead of failing the run.
    pub async fn acquire(self: &Arc<Self>) -> Result<SessionGuard> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .context("session pool closed: shut down or all slots retired")?;

        loop {
            let candidate = self.idle.lock().pop_front();
            let Some(session) = candidate else { break };
            if session.browser.version().await.is_ok() {
                return Ok(SessionGuard::new(Arc::clone(self), session, permit));
            }
            warn!(session = session.id, "idle session unresponsive, recycling");
            self.retire(session).await;
        }

        let mut failures = 0u32;
        loop {
            match self.launch().await {
                Ok(session) => {
                    return Ok(SessionGuard::new(Arc::clone(self), session, permit));
                }
                Err(e) => {
                    failures += 1;
                    if failures >= self.config.launch_retry_limit {
                        warn!("session slot retired after {failures} launch failures");
                        self.retire_slot(permit);
                        return Err(e.context("browser launch failed repeatedly, slot retired"));
                    }
                    let jitter = rand::rng().random_range(0..250);
                    let backoff = Duration::from_millis(500 * u64::from(failures) + jitter);
                    warn!("browser launch failed (attempt {failures}): {e:#}, retrying");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// Permanently retire one pool slot. When the last slot goes, the
    /// semaphore is closed so acquirers already parked on it fail instead of
    /// waiting on a pool that can never serve them.
    fn retire_slot(&self, permit: OwnedSemaphorePermit) {
        permit.forget();
        let remaining = self.limit.fetch_sub(1, Ordering::AcqRel) - 1;
        let dead = self.dead_slots.fetch_add(1, Ordering::AcqRel) + 1;
        warn!(dead_slots = dead, remaining, "pool slot permanently retired");
        if remaining == 0 {
            self.permits.close();
        }
    }

    async fn launch(&self) -> Result<PooledSession> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let profile_dir = tempfile::Builder::new()
            .prefix("poi-session-")
            .tempdir()
            .context("creating session profile dir")?;
        let (browser, handler) =
            browser_setup::launch_browser(self.config.headless, profile_dir.path().to_path_buf())
                .await?;
        self.live.fetch_add(1, Ordering::AcqRel);
        info!(session = id, "browser session launched");
        Ok(PooledSession {
            id,
            browser,
            handler,
            _profile_dir: profile_dir,
            created_at: Instant::now(),
            jobs_done: 0,
        })
    }

    async fn retire(&self, session: PooledSession) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        session.shutdown().await;
    }

    /// Release path shared by [`SessionGuard::drop`]. The permit is held
    /// until the session is either parked idle or fully torn down.
    async fn release_session(
        self: Arc<Self>,
        mut session: PooledSession,
        health: SessionHealth,
        permit: OwnedSemaphorePermit,
    ) {
        session.jobs_done += match health {
            SessionHealth::Degraded => 2,
            _ => 1,
        };
        let expired = session.jobs_done >= self.config.recycle_after_jobs;
        if health == SessionHealth::Dead || expired || self.shutdown.load(Ordering::Acquire) {
            debug!(
                session = session.id,
                ?health,
                expired,
                "recycling session on release"
            );
            self.retire(session).await;
        } else {
            self.idle.lock().push_back(session);
        }
        drop(permit);
    }

    /// Adjust the concurrency target within `[min_sessions, max_sessions]`.
    /// Shrinking forgets free permits only; sessions in use finish their jobs.
    /// Returns the new target.
    pub fn resize(&self, target: usize) -> usize {
        let dead = self.dead_slots.load(Ordering::Acquire);
        let ceiling = self.config.max_sessions.saturating_sub(dead).max(1);
        let target = target.clamp(self.config.min_sessions.min(ceiling), ceiling);
        loop {
            let current = self.limit.load(Ordering::Acquire);
            if target > current {
                let grow = target - current;
                if self
                    .limit
                    .compare_exchange(current, target, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    continue;
                }
                self.permits.add_permits(grow);
                return target;
            }
            if target < current {
                let shrink = u32::try_from(current - target).unwrap_or(u32::MAX);
                match self.permits.try_acquire_many(shrink) {
                    Ok(taken) => {
                        taken.forget();
                        if self
                            .limit
                            .compare_exchange(current, target, Ordering::AcqRel, Ordering::Acquire)
                            .is_err()
                        {
                            // Lost a race; restore and retry.
                            self.permits.add_permits(shrink as usize);
                            continue;
                        }
                        return target;
                    }
                    // All permits busy; skip this tick rather than wait.
                    Err(_) => return current,
                }
            }
            return current;
        }
    }

    #[must_use]
    pub fn current_limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn live_sessions(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn dead_slots(&self) -> usize {
        self.dead_slots.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn config(&self) -> &SessionPoolConfig {
        &self.config
    }

    /// Tear down idle sessions and fail all future acquires. Sessions in use
    /// are recycled when their guards drop.
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.permits.close();
        let drained: Vec<PooledSession> = self.idle.lock().drain(..).collect();
        for session in drained {
            self.retire(session).await;
        }
        info!("session pool shut down");
    }
}

/// Exclusive handle to one pooled session. Dropping it returns the session to
/// the pool (or recycles it) on a background task, so drops in sync contexts
/// never block.
pub struct SessionGuard {
    pool: Arc<SessionPool>,
    session: Option<PooledSession>,
    permit: Option<OwnedSemaphorePermit>,
    health: SessionHealth,
}

impl SessionGuard {
    fn new(pool: Arc<SessionPool>, session: PooledSession, permit: OwnedSemaphorePermit) -> Self {
        Self {
            pool,
            session: Some(session),
            permit: Some(permit),
            health: SessionHealth::Live,
        }
    }

    #[must_use]
    pub fn browser(&self) -> &Browser {
        // Invariant: `session` is Some until drop.
        match &self.session {
            Some(s) => &s.browser,
            None => unreachable!("session taken before drop"),
        }
    }

    #[must_use]
    pub fn session_id(&self) -> u64 {
        self.session.as_ref().map_or(0, |s| s.id)
    }

    pub fn set_health(&mut self, health: SessionHealth) {
        self.health = health;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let (Some(session), Some(permit)) = (self.session.take(), self.permit.take()) {
            let pool = Arc::clone(&self.pool);
            let health = self.health;
            tokio::spawn(pool.release_session(session, health, permit));
        }
    }
}

#[async_trait]
impl SessionProvider for Arc<SessionPool> {
    type Session = SessionGuard;

    async fn acquire(&self) -> Result<SessionGuard> {
        SessionPool::acquire(self).await
    }

    async fn release(&self, mut session: SessionGuard, health: SessionHealth) {
        session.set_health(health);
        drop(session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(max: usize, min: usize) -> Arc<SessionPool> {
        SessionPool::new(SessionPoolConfig {
            max_sessions: max,
            min_sessions: min,
            ..SessionPoolConfig::default()
        })
    }

    #[tokio::test]
    async fn retiring_last_slot_fails_parked_acquirers() {
        let p = pool(1, 1);
        let permit = Arc::clone(&p.permits)
            .acquire_owned()
            .await
            .expect("free permit");

        let waiter = {
            let p = Arc::clone(&p);
            tokio::spawn(async move { p.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "waiter parked at the ceiling");

        p.retire_slot(permit);
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .expect("join");
        assert!(result.is_err(), "no live slots can ever serve this acquire");
        assert_eq!(p.dead_slots(), 1);
        assert_eq!(p.current_limit(), 0);
        assert!(p.acquire().await.is_err(), "later acquires fail immediately");
    }

    #[tokio::test]
    async fn retiring_one_of_two_slots_keeps_the_pool_open() {
        let p = pool(2, 1);
        let permit = Arc::clone(&p.permits)
            .acquire_owned()
            .await
            .expect("free permit");
        p.retire_slot(permit);
        assert_eq!(p.current_limit(), 1);
        assert_eq!(p.permits.available_permits(), 1);
        assert!(!p.permits.is_closed());
    }
}
