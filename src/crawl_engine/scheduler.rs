//! Resource-aware session scaling.
//!
//! A background task samples CPU and memory on a fixed interval and nudges
//! the session pool's concurrency target: above the high-water mark it
//! withholds one slot, below the low-water mark it restores one. Changes are
//! one step per sample and apply only to future acquires; jobs already
//! holding a session are never preempted.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use sysinfo::System;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::session_pool::SessionPool;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub sample_interval: Duration,
    /// Utilization fraction above which the pool shrinks (CPU or memory).
    pub high_water: f32,
    /// Utilization fraction below which the pool grows (both CPU and memory).
    pub low_water: f32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(5),
            high_water: 0.85,
            low_water: 0.60,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    cpu: f32,
    memory: f32,
}

pub struct ResourceScheduler {
    shutdown: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl ResourceScheduler {
    /// Spawn the sampling loop against a pool. Dropping the returned handle
    /// does not stop it; call [`ResourceScheduler::stop`].
    #[must_use]
    pub fn spawn(config: SchedulerConfig, pool: Arc<SessionPool>) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handle = tokio::spawn(async move {
            info!(
                high_water = config.high_water,
                low_water = config.low_water,
                "resource scheduler started"
            );
            let mut system = System::new();
            // First CPU refresh has no baseline; prime it before the loop.
            system.refresh_cpu_usage();
            let mut ticker = tokio::time::interval(config.sample_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if flag.load(Ordering::Acquire) {
                    break;
                }
                let sample = read_sample(&mut system);
                apply(&config, &pool, sample);
            }
            info!("resource scheduler stopped");
        });
        Self { shutdown, handle }
    }

    pub async fn stop(self) {
        self.shutdown.store(true, Ordering::Release);
        self.handle.abort();
        let _ = self.handle.await;
    }
}

fn read_sample(system: &mut System) -> Sample {
    system.refresh_cpu_usage();
    system.refresh_memory();
    let cpu = system.global_cpu_usage() / 100.0;
    let total = system.total_memory();
    let memory = if total == 0 {
        0.0
    } else {
        system.used_memory() as f32 / total as f32
    };
    Sample { cpu, memory }
}

/// One resize step at most, toward the configured floor or ceiling.
fn apply(config: &SchedulerConfig, pool: &SessionPool, sample: Sample) {
    let current = pool.current_limit();
    let pressured = sample.cpu >= config.high_water || sample.memory >= config.high_water;
    let relaxed = sample.cpu < config.low_water && sample.memory < config.low_water;

    let target = if pressured {
        current.saturating_sub(1)
    } else if relaxed {
        current + 1
    } else {
        return;
    };
    let applied = pool.resize(target);
    if applied != current {
        debug!(
            cpu = sample.cpu,
            memory = sample.memory,
            from = current,
            to = applied,
            "session limit adjusted"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session_pool::SessionPoolConfig;

    fn pool(max: usize, min: usize) -> Arc<SessionPool> {
        SessionPool::new(SessionPoolConfig {
            max_sessions: max,
            min_sessions: min,
            ..SessionPoolConfig::default()
        })
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig::default()
    }

    #[tokio::test]
    async fn pressure_steps_down_one_at_a_time() {
        let pool = pool(8, 2);
        let hot = Sample {
            cpu: 0.95,
            memory: 0.40,
        };
        apply(&config(), &pool, hot);
        assert_eq!(pool.current_limit(), 7);
        apply(&config(), &pool, hot);
        assert_eq!(pool.current_limit(), 6);
    }

    #[tokio::test]
    async fn shrink_stops_at_floor() {
        let pool = pool(4, 3);
        let hot = Sample {
            cpu: 0.99,
            memory: 0.99,
        };
        for _ in 0..5 {
            apply(&config(), &pool, hot);
        }
        assert_eq!(pool.current_limit(), 3);
    }

    #[tokio::test]
    async fn growth_requires_both_resources_relaxed() {
        let pool = pool(8, 2);
        pool.resize(4);
        assert_eq!(pool.current_limit(), 4);

        // CPU relaxed but memory in the dead band: hold steady.
        apply(
            &config(),
            &pool,
            Sample {
                cpu: 0.20,
                memory: 0.70,
            },
        );
        assert_eq!(pool.current_limit(), 4);

        apply(
            &config(),
            &pool,
            Sample {
                cpu: 0.20,
                memory: 0.30,
            },
        );
        assert_eq!(pool.current_limit(), 5);
    }

    #[tokio::test]
    async fn growth_stops_at_ceiling() {
        let pool = pool(3, 1);
        let idle = Sample {
            cpu: 0.05,
            memory: 0.10,
        };
        for _ in 0..5 {
            apply(&config(), &pool, idle);
        }
        assert_eq!(pool.current_limit(), 3);
    }
}
