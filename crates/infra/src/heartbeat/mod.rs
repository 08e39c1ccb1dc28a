//! Periodic claimers.
//!
//! Each task runs under its own named lock so a fleet of workers performs a
//! given tick at most once at a time. A tick that cannot take its lock, or
//! that fails, returns `None`.

mod lock;
#[cfg(feature = "redis")]
mod redis_lock;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use forgejobs_core::Run;

pub use lock::{HeartbeatLock, InMemoryLocks, LockError};
#[cfg(feature = "redis")]
pub use redis_lock::RedisLocks;

use crate::dispatch::{RunDispatcher, RunTicket};
use crate::executor::DEFAULT_MAX_RUNTIME;
use crate::scheduler::Scheduler;
use crate::store::{EngineStore, RunCompletion, StoreResult};

pub const LOCK_CHECK_DUE_JOBS: &str = "forgejobs:lock:check_due_jobs";
pub const LOCK_CHECK_TRIGGER_EVENTS: &str = "forgejobs:lock:check_trigger_events";
pub const LOCK_POLL_TRIGGERS: &str = "forgejobs:lock:poll_triggers";
pub const LOCK_CLEANUP_HISTORY: &str = "forgejobs:lock:cleanup_history";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub cleanup_interval: Duration,
    pub lock_ttl: Duration,
    /// Stale runs are those STARTED for longer than twice this.
    pub max_runtime: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(15),
            cleanup_interval: Duration::from_secs(3_600),
            lock_ttl: Duration::from_secs(120),
            max_runtime: DEFAULT_MAX_RUNTIME,
        }
    }
}

/// Result of one `check_due_jobs` tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DueTick {
    pub stale_runs: u64,
    pub due_runs: usize,
    pub enqueued: usize,
}

pub struct Heartbeat<S> {
    scheduler: Scheduler<S>,
    locks: Arc<dyn HeartbeatLock>,
    dispatcher: Arc<dyn RunDispatcher>,
    config: HeartbeatConfig,
}

impl<S: EngineStore> Heartbeat<S> {
    pub fn new(
        scheduler: Scheduler<S>,
        locks: Arc<dyn HeartbeatLock>,
        dispatcher: Arc<dyn RunDispatcher>,
        config: HeartbeatConfig,
    ) -> Self {
        Self {
            scheduler,
            locks,
            dispatcher,
            config,
        }
    }

    /// Reap stale runs, claim due scheduled runs, then hand them to workers.
    pub async fn check_due_jobs(&self, now: DateTime<Utc>) -> Option<DueTick> {
        let started = Instant::now();
        let tick = self
            .guarded(LOCK_CHECK_DUE_JOBS, async {
                let stale_runs = self.scheduler.reap_stale_runs(now, self.config.max_runtime).await?;
                let runs = self.scheduler.claim_due_runs(now).await?;
                let enqueued = self.enqueue_all(&runs, now).await;
                Ok(DueTick {
                    stale_runs,
                    due_runs: runs.len(),
                    enqueued,
                })
            })
            .await?;
        info!(
            due_runs = tick.due_runs,
            stale_runs = tick.stale_runs,
            enqueued = tick.enqueued,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "check_due_jobs tick"
        );
        Some(tick)
    }

    /// Claim received trigger events and hand their runs to workers.
    pub async fn check_trigger_events(&self, now: DateTime<Utc>) -> Option<usize> {
        self.guarded(LOCK_CHECK_TRIGGER_EVENTS, async {
            let runs = self.scheduler.claim_trigger_runs(now).await?;
            Ok(self.enqueue_all(&runs, now).await)
        })
        .await
    }

    /// Ingestion adapters live outside the engine; this pass only counts the
    /// jobs they would poll.
    pub async fn poll_triggers(&self, _now: DateTime<Utc>) -> Option<usize> {
        self.guarded(LOCK_POLL_TRIGGERS, async {
            let jobs = self
                .scheduler
                .store()
                .list_enabled_triggered_jobs(self.scheduler.tenant_id())
                .await?;
            debug!(triggered_jobs = jobs.len(), "poll_triggers pass");
            Ok(jobs.len())
        })
        .await
    }

    pub async fn cleanup_history(&self, now: DateTime<Utc>) -> Option<u64> {
        self.guarded(LOCK_CLEANUP_HISTORY, self.scheduler.cleanup_history(now))
            .await
    }

    /// Drive the ticks until `shutdown` flips to `true` or its sender is dropped.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(self.config.interval);
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut cleanup = tokio::time::interval(self.config.cleanup_interval);
            cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = heartbeat.tick() => {
                        let now = Utc::now();
                        self.check_due_jobs(now).await;
                        self.check_trigger_events(now).await;
                        self.poll_triggers(now).await;
                    }
                    _ = cleanup.tick() => {
                        self.cleanup_history(Utc::now()).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("heartbeat stopped");
        })
    }

    async fn guarded<T, F>(&self, name: &'static str, task: F) -> Option<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        if !self.config.enabled {
            return None;
        }
        let token = match self.locks.try_acquire(name, self.config.lock_ttl).await {
            Ok(Some(token)) => token,
            Ok(None) => {
                debug!(lock = name, "lock not acquired, skipping tick");
                return None;
            }
            Err(err) => {
                warn!(lock = name, error = %err, "lock backend failed, skipping tick");
                return None;
            }
        };

        let result = task.await;
        if let Err(err) = self.locks.release(name, &token).await {
            warn!(lock = name, error = %err, "failed to release heartbeat lock");
        }
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(lock = name, error = %err, "heartbeat task failed");
                None
            }
        }
    }

    /// Enqueue each run; a run that cannot be enqueued is failed in place.
    /// Returns how many runs reached the transport.
    async fn enqueue_all(&self, runs: &[Run], now: DateTime<Utc>) -> usize {
        let mut enqueued = 0;
        for run in runs {
            let ticket = RunTicket {
                run_id: run.id,
                tenant_id: self.scheduler.tenant_id(),
            };
            match self.dispatcher.enqueue(ticket).await {
                Ok(()) => enqueued += 1,
                Err(err) => {
                    warn!(run_id = %run.id, error = %err, "failed to enqueue run");
                    let store = self.scheduler.store();
                    if let Err(err) = store.finish_run(run.id, enqueue_failure(&err), now).await {
                        warn!(run_id = %run.id, error = %err, "failed to mark unqueued run as failed");
                    }
                }
            }
        }
        enqueued
    }
}

pub(crate) fn enqueue_failure(err: &dyn std::fmt::Display) -> RunCompletion {
    RunCompletion::failed(format!("Failed to enqueue custom job run: {err}"))
}
