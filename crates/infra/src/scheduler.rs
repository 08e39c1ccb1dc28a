//! Claiming work: due scheduled jobs, received trigger events, stale runs and
//! expired history.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use forgejobs_core::{JobId, Run, TenantId, TriggerSourceConfig};

use crate::store::{EngineStore, StoreResult};

pub const DUPLICATE_TRIGGER_MESSAGE: &str = "Duplicate trigger event run suppressed.";
pub const STALE_RUN_MESSAGE: &str = "Run marked failed after exceeding stale timeout window.";

/// Default number of candidates examined per claim pass.
pub const DEFAULT_CLAIM_LIMIT: usize = 50;

/// Per-job admission for one trigger claim pass.
///
/// An event is admitted only while `active + claimed < max_concurrent_runs` and
/// `claimed < max_events_per_claim` for its job. `claimed` counts runs actually
/// created during this pass.
#[derive(Debug, Default)]
pub struct AdmissionTracker {
    active: HashMap<JobId, u64>,
    claimed: HashMap<JobId, u64>,
}

impl AdmissionTracker {
    /// `active` holds PENDING + STARTED run counts per job at the start of the pass.
    pub fn new(active: HashMap<JobId, u64>) -> Self {
        Self {
            active,
            claimed: HashMap::new(),
        }
    }

    pub fn admits(&self, job_id: JobId, config: Option<&TriggerSourceConfig>) -> bool {
        let Some(config) = config else {
            return true;
        };
        let claimed = self.claimed.get(&job_id).copied().unwrap_or(0);
        if let Some(limit) = config.concurrency_limit() {
            let active = self.active.get(&job_id).copied().unwrap_or(0);
            if active + claimed >= limit {
                return false;
            }
        }
        if let Some(limit) = config.per_claim_limit() {
            if claimed >= limit {
                return false;
            }
        }
        true
    }

    pub fn record(&mut self, job_id: JobId) {
        *self.claimed.entry(job_id).or_default() += 1;
    }

    pub fn claimed(&self, job_id: JobId) -> u64 {
        self.claimed.get(&job_id).copied().unwrap_or(0)
    }
}

/// Thin orchestration over the store's claim primitives.
#[derive(Debug)]
pub struct Scheduler<S> {
    store: Arc<S>,
    tenant_id: TenantId,
    claim_limit: usize,
}

impl<S> Clone for Scheduler<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            tenant_id: self.tenant_id,
            claim_limit: self.claim_limit,
        }
    }
}

impl<S: EngineStore> Scheduler<S> {
    pub fn new(store: Arc<S>, tenant_id: TenantId) -> Self {
        Self {
            store,
            tenant_id,
            claim_limit: DEFAULT_CLAIM_LIMIT,
        }
    }

    pub fn with_claim_limit(mut self, limit: usize) -> Self {
        self.claim_limit = limit.max(1);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    #[instrument(skip(self), fields(tenant_id = %self.tenant_id))]
    pub async fn claim_due_runs(&self, now: DateTime<Utc>) -> StoreResult<Vec<Run>> {
        let runs = self.store.claim_due_jobs(self.tenant_id, now, self.claim_limit).await?;
        if !runs.is_empty() {
            info!(count = runs.len(), "claimed due scheduled runs");
        }
        Ok(runs)
    }

    #[instrument(skip(self), fields(tenant_id = %self.tenant_id))]
    pub async fn claim_trigger_runs(&self, now: DateTime<Utc>) -> StoreResult<Vec<Run>> {
        let runs = self
            .store
            .claim_trigger_events(self.tenant_id, now, self.claim_limit)
            .await?;
        if !runs.is_empty() {
            info!(count = runs.len(), "claimed trigger event runs");
        }
        Ok(runs)
    }

    /// Fail STARTED runs older than twice the run time limit.
    #[instrument(skip(self), fields(tenant_id = %self.tenant_id))]
    pub async fn reap_stale_runs(&self, now: DateTime<Utc>, max_runtime: Duration) -> StoreResult<u64> {
        let window = chrono::Duration::from_std(max_runtime.saturating_mul(2)).unwrap_or(chrono::Duration::MAX);
        let started_before = now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let reaped = self
            .store
            .mark_stale_runs_failed(self.tenant_id, started_before, now)
            .await?;
        if reaped > 0 {
            info!(reaped, "marked stale runs failed");
        }
        Ok(reaped)
    }

    #[instrument(skip(self), fields(tenant_id = %self.tenant_id))]
    pub async fn cleanup_history(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let deleted = self.store.delete_expired_history(self.tenant_id, now).await?;
        debug!(deleted, "retention cleanup pass");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(value: serde_json::Value) -> TriggerSourceConfig {
        TriggerSourceConfig::from_value(&value).unwrap()
    }

    #[test]
    fn concurrency_limit_counts_active_and_claimed() {
        let job = JobId::new();
        let mut tracker = AdmissionTracker::new(HashMap::from([(job, 1)]));
        let cfg = config(json!({"max_concurrent_runs": 2}));

        assert!(tracker.admits(job, Some(&cfg)));
        tracker.record(job);
        assert!(!tracker.admits(job, Some(&cfg)));
    }

    #[test]
    fn per_claim_limit_only_counts_this_pass() {
        let job = JobId::new();
        let mut tracker = AdmissionTracker::new(HashMap::from([(job, 50)]));
        let cfg = config(json!({"max_events_per_claim": 2}));

        assert!(tracker.admits(job, Some(&cfg)));
        tracker.record(job);
        assert!(tracker.admits(job, Some(&cfg)));
        tracker.record(job);
        assert!(!tracker.admits(job, Some(&cfg)));
        assert_eq!(tracker.claimed(job), 2);
    }

    #[test]
    fn no_limits_admits_everything() {
        let job = JobId::new();
        let tracker = AdmissionTracker::new(HashMap::from([(job, 1_000)]));
        assert!(tracker.admits(job, Some(&TriggerSourceConfig::default())));
        assert!(tracker.admits(job, None));
    }
}
