//! Persistence for jobs, runs, steps, trigger events and audit entries.
//!
//! Claim operations (`claim_due_jobs`, `claim_trigger_events`, `create_manual_run`) are
//! store methods rather than scheduler logic because their safety comes from the
//! store: row locks that skip contended rows, uniqueness constraints on runs and
//! per-candidate savepoints. The admission and cooldown rules they apply are shared
//! pure functions in [`crate::scheduler`] and [`crate::manual`].

mod in_memory;
mod postgres;
mod schema;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;

use forgejobs_core::{
    AuditLogEntry, CustomJob, DomainError, JobId, NewTriggerEvent, Run, RunId, RunStatus, RunStep, StepStatus,
    TenantId, TriggerEvent, TriggerEventId, TriggerState,
};
use forgejobs_workflow::StepOutput;

pub use in_memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use schema::SCHEMA_SQL;

use crate::manual::ManualRun;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    /// A uniqueness constraint rejected the write.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("storage error: {0}")]
    Storage(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Terminal fields written when a run finishes.
#[derive(Debug, Clone, PartialEq)]
pub struct RunCompletion {
    pub status: RunStatus,
    pub error_message: Option<String>,
    pub output_preview: Option<String>,
    pub metrics: Option<JsonValue>,
}

impl RunCompletion {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failure,
            error_message: Some(message.into()),
            output_preview: None,
            metrics: None,
        }
    }
}

/// Upsert of one run step, keyed by `(run_id, step_id)`.
#[derive(Debug, Clone, PartialEq)]
pub struct StepUpdate {
    pub run_id: RunId,
    pub step_index: u32,
    pub step_id: String,
    pub step_key: String,
    pub status: StepStatus,
    pub error_message: Option<String>,
    pub output: Option<JsonValue>,
    /// Stamp `started_at` if it is not set yet.
    pub mark_started: bool,
}

impl StepUpdate {
    /// Apply this update to an existing row (or a fresh one).
    pub(crate) fn apply(&self, existing: Option<RunStep>, now: DateTime<Utc>) -> RunStep {
        let mut step = existing.unwrap_or_else(|| RunStep {
            run_id: self.run_id,
            step_index: self.step_index,
            step_id: self.step_id.clone(),
            step_key: self.step_key.clone(),
            status: self.status,
            started_at: None,
            finished_at: None,
            error_message: None,
            output: None,
        });
        step.status = self.status;
        if self.mark_started && step.started_at.is_none() {
            step.started_at = Some(now);
        }
        if self.status.is_terminal() {
            step.finished_at = Some(now);
        }
        step.error_message = self.error_message.clone();
        step.output = self.output.clone();
        step
    }
}

/// Sort orders accepted by [`RunQuery`].
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum RunSort {
    /// `-started_at`, nulls last.
    #[default]
    StartedAtDesc,
    /// `started_at`, nulls first.
    StartedAtAsc,
    CreatedAtDesc,
    CreatedAtAsc,
}

impl RunSort {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunSort::StartedAtDesc => "-started_at",
            RunSort::StartedAtAsc => "started_at",
            RunSort::CreatedAtDesc => "-created_at",
            RunSort::CreatedAtAsc => "created_at",
        }
    }
}

impl core::str::FromStr for RunSort {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "-started_at" => Ok(RunSort::StartedAtDesc),
            "started_at" => Ok(RunSort::StartedAtAsc),
            "-created_at" => Ok(RunSort::CreatedAtDesc),
            "created_at" => Ok(RunSort::CreatedAtAsc),
            other => Err(DomainError::validation(format!("Invalid sort: {other}"))),
        }
    }
}

/// Paged, filtered run listing. Pages are zero-based.
#[derive(Debug, Clone, PartialEq)]
pub struct RunQuery {
    pub page: u32,
    pub page_size: u32,
    pub status: Option<RunStatus>,
    pub started_after: Option<DateTime<Utc>>,
    pub started_before: Option<DateTime<Utc>>,
    pub sort: RunSort,
}

impl Default for RunQuery {
    fn default() -> Self {
        Self {
            page: 0,
            page_size: 20,
            status: None,
            started_after: None,
            started_before: None,
            sort: RunSort::default(),
        }
    }
}

impl RunQuery {
    pub(crate) fn offset(&self) -> u64 {
        u64::from(self.page) * u64::from(self.page_size)
    }

    pub(crate) fn matches(&self, run: &Run) -> bool {
        if self.status.is_some_and(|s| s != run.status) {
            return false;
        }
        if let Some(after) = self.started_after {
            if !run.started_at.is_some_and(|t| t >= after) {
                return false;
            }
        }
        if let Some(before) = self.started_before {
            if !run.started_at.is_some_and(|t| t <= before) {
                return false;
            }
        }
        true
    }
}

/// Persistence used by the scheduler, executor and admin service.
///
/// Every claim is safe under concurrent callers: the same eligible work never
/// produces two runs.
#[async_trait]
pub trait EngineStore: Send + Sync + 'static {
    // Jobs and audit.

    async fn insert_job(&self, job: &CustomJob) -> StoreResult<()>;

    async fn update_job(&self, job: &CustomJob) -> StoreResult<()>;

    /// Delete a job; runs, steps, events, state and audit rows go with it.
    async fn delete_job(&self, job_id: JobId) -> StoreResult<bool>;

    async fn get_job(&self, job_id: JobId) -> StoreResult<Option<CustomJob>>;

    /// Newest first.
    async fn list_jobs(&self, tenant_id: TenantId, enabled: Option<bool>) -> StoreResult<Vec<CustomJob>>;

    async fn list_enabled_triggered_jobs(&self, tenant_id: TenantId) -> StoreResult<Vec<CustomJob>>;

    async fn append_audit(&self, entry: &AuditLogEntry) -> StoreResult<()>;

    /// Newest first.
    async fn list_audit(&self, job_id: JobId) -> StoreResult<Vec<AuditLogEntry>>;

    // Claims.

    /// Create one PENDING run per due scheduled job and advance its schedule.
    async fn claim_due_jobs(&self, tenant_id: TenantId, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Run>>;

    /// Turn RECEIVED events into PENDING runs, honoring per-job admission limits.
    async fn claim_trigger_events(&self, tenant_id: TenantId, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Run>>;

    /// Fail STARTED runs whose `started_at` is before `started_before`.
    async fn mark_stale_runs_failed(
        &self,
        tenant_id: TenantId,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<u64>;

    /// Delete terminal runs and terminal events past each job's retention window.
    async fn delete_expired_history(&self, tenant_id: TenantId, now: DateTime<Utc>) -> StoreResult<u64>;

    /// Idempotent, cooldown-guarded manual run creation.
    async fn create_manual_run(
        &self,
        job_id: JobId,
        idempotency_key: Option<&str>,
        cooldown: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<ManualRun>;

    // Trigger ingestion.

    /// `None` when the job already has an event with this dedupe key.
    async fn create_trigger_event(&self, event: NewTriggerEvent, now: DateTime<Utc>) -> StoreResult<Option<TriggerEvent>>;

    async fn get_trigger_event(&self, event_id: TriggerEventId) -> StoreResult<Option<TriggerEvent>>;

    async fn fetch_or_create_trigger_state(
        &self,
        job_id: JobId,
        source_key: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<TriggerState>;

    async fn save_trigger_state(
        &self,
        job_id: JobId,
        source_key: &str,
        cursor: Option<JsonValue>,
        now: DateTime<Utc>,
    ) -> StoreResult<TriggerState>;

    // Runs.

    /// Insert a run as-is; uniqueness violations surface as [`StoreError::Conflict`].
    async fn insert_run(&self, run: &Run) -> StoreResult<()>;

    async fn get_run(&self, run_id: RunId) -> StoreResult<Option<Run>>;

    /// PENDING → STARTED compare-and-swap. `None` when the run was not PENDING.
    async fn transition_run_to_started(&self, run_id: RunId, now: DateTime<Utc>) -> StoreResult<Option<Run>>;

    /// Write terminal fields and settle the linked trigger event, if any.
    async fn finish_run(&self, run_id: RunId, completion: RunCompletion, now: DateTime<Utc>) -> StoreResult<()>;

    async fn upsert_run_step(&self, update: StepUpdate, now: DateTime<Utc>) -> StoreResult<RunStep>;

    /// Outputs of SUCCESS steps, keyed by step id.
    async fn completed_step_outputs(&self, run_id: RunId) -> StoreResult<BTreeMap<String, StepOutput>>;

    async fn list_runs(&self, job_id: JobId, query: &RunQuery) -> StoreResult<(Vec<Run>, u64)>;

    /// Ordered by step index.
    async fn list_run_steps(&self, run_id: RunId, page: u32, page_size: u32) -> StoreResult<(Vec<RunStep>, u64)>;
}

/// Trigger event status a finished run settles its event into.
pub(crate) fn settled_event_status(status: RunStatus) -> Option<forgejobs_core::TriggerEventStatus> {
    use forgejobs_core::TriggerEventStatus;
    match status {
        RunStatus::Success | RunStatus::Skipped => Some(TriggerEventStatus::Consumed),
        RunStatus::Failure | RunStatus::Timeout => Some(TriggerEventStatus::Failed),
        RunStatus::Pending | RunStatus::Started => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forgejobs_core::{NewRun, TriggerEventStatus};

    #[test]
    fn run_sort_parses_known_orders_only() {
        for sort in [RunSort::StartedAtDesc, RunSort::StartedAtAsc, RunSort::CreatedAtDesc, RunSort::CreatedAtAsc] {
            assert_eq!(sort.as_str().parse::<RunSort>().unwrap(), sort);
        }
        let err = "name".parse::<RunSort>().unwrap_err();
        assert_eq!(err.message(), "Invalid sort: name");
    }

    #[test]
    fn query_filters_on_started_window() {
        let now = Utc::now();
        let mut run = NewRun::manual(JobId::new(), None).into_run(now);
        let query = RunQuery {
            started_after: Some(now - Duration::hours(1)),
            ..Default::default()
        };
        assert!(!query.matches(&run));
        run.started_at = Some(now);
        assert!(query.matches(&run));
        assert!(!RunQuery { status: Some(RunStatus::Success), ..Default::default() }.matches(&run));
    }

    #[test]
    fn step_update_stamps_start_once_and_finish_on_terminal() {
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(5);
        let mut update = StepUpdate {
            run_id: RunId::new(),
            step_index: 0,
            step_id: "a".into(),
            step_key: "fetch_trigger_payload".into(),
            status: StepStatus::Started,
            error_message: None,
            output: None,
            mark_started: true,
        };
        let started = update.apply(None, t0);
        assert_eq!(started.started_at, Some(t0));
        assert!(started.finished_at.is_none());

        let again = update.apply(Some(started), t1);
        assert_eq!(again.started_at, Some(t0));

        update.status = StepStatus::Success;
        update.mark_started = false;
        let done = update.apply(Some(again), t1);
        assert_eq!(done.finished_at, Some(t1));
    }

    #[test]
    fn finished_runs_settle_their_event() {
        assert_eq!(settled_event_status(RunStatus::Skipped), Some(TriggerEventStatus::Consumed));
        assert_eq!(settled_event_status(RunStatus::Timeout), Some(TriggerEventStatus::Failed));
        assert_eq!(settled_event_status(RunStatus::Started), None);
    }
}
