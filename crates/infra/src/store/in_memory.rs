use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value as JsonValue;
use tracing::warn;

use forgejobs_core::{
    AuditLogEntry, CustomJob, JobId, NewRun, NewTriggerEvent, Run, RunId, RunStatus, RunStep, StepStatus, TenantId,
    TriggerEvent, TriggerEventId, TriggerEventStatus, TriggerState,
};
use forgejobs_workflow::StepOutput;

use super::{EngineStore, RunCompletion, RunQuery, RunSort, StepUpdate, StoreError, StoreResult, settled_event_status};
use crate::manual::{ManualRun, check_cooldown, normalize_idempotency_key};
use crate::scheduler::{AdmissionTracker, DUPLICATE_TRIGGER_MESSAGE, STALE_RUN_MESSAGE};

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, CustomJob>,
    runs: HashMap<RunId, Run>,
    steps: HashMap<RunId, Vec<RunStep>>,
    events: HashMap<TriggerEventId, TriggerEvent>,
    trigger_states: HashMap<(JobId, String), TriggerState>,
    audit: Vec<AuditLogEntry>,
}

impl State {
    fn tenant_owns(&self, tenant_id: TenantId, job_id: JobId) -> bool {
        self.jobs.get(&job_id).is_some_and(|j| j.tenant_id == tenant_id)
    }

    /// The uniqueness rules the Postgres partial indexes enforce.
    fn run_conflict(&self, candidate: &Run) -> Option<&Run> {
        self.runs.values().find(|existing| {
            existing.job_id == candidate.job_id
                && existing.id != candidate.id
                && ((candidate.scheduled_for.is_some() && existing.scheduled_for == candidate.scheduled_for)
                    || (candidate.trigger_event_id.is_some() && existing.trigger_event_id == candidate.trigger_event_id)
                    || (candidate.idempotency_key.is_some() && existing.idempotency_key == candidate.idempotency_key))
        })
    }

    fn try_insert_run(&mut self, run: Run) -> StoreResult<Run> {
        if !self.jobs.contains_key(&run.job_id) {
            return Err(StoreError::NotFound(format!("custom job {}", run.job_id)));
        }
        if self.run_conflict(&run).is_some() {
            return Err(StoreError::Conflict(format!("duplicate run for job {}", run.job_id)));
        }
        self.runs.insert(run.id, run.clone());
        Ok(run)
    }

    fn remove_run(&mut self, run_id: RunId) {
        self.runs.remove(&run_id);
        self.steps.remove(&run_id);
    }

    fn remove_event(&mut self, event_id: TriggerEventId) {
        self.events.remove(&event_id);
        for run in self.runs.values_mut() {
            if run.trigger_event_id == Some(event_id) {
                run.trigger_event_id = None;
            }
        }
    }

    fn settle_event(&mut self, event_id: TriggerEventId, status: TriggerEventStatus, error: Option<String>, now: DateTime<Utc>) {
        if let Some(event) = self.events.get_mut(&event_id) {
            event.status = status;
            if status == TriggerEventStatus::Failed {
                event.error_message = error;
            }
            event.updated_at = now;
        }
    }
}

/// In-memory engine store.
///
/// Intended for tests/dev. A single lock serializes every operation, which is
/// what makes its claims race-free.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
    #[cfg(test)]
    fail_audit: std::sync::atomic::AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later `append_audit` fail.
    #[cfg(test)]
    pub(crate) fn fail_audit_writes(&self) {
        self.fail_audit.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }
}

fn compare_started_desc(a: &Run, b: &Run) -> Ordering {
    match (a.started_at, b.started_at) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn sort_runs(runs: &mut [Run], sort: RunSort) {
    runs.sort_by(|a, b| {
        let primary = match sort {
            RunSort::StartedAtDesc => compare_started_desc(a, b),
            RunSort::StartedAtAsc => a.started_at.cmp(&b.started_at),
            RunSort::CreatedAtDesc => b.created_at.cmp(&a.created_at),
            RunSort::CreatedAtAsc => a.created_at.cmp(&b.created_at),
        };
        primary.then_with(|| b.created_at.cmp(&a.created_at))
    });
}

fn page<T>(items: Vec<T>, offset: u64, limit: u32) -> (Vec<T>, u64) {
    let total = items.len() as u64;
    let page = items
        .into_iter()
        .skip(usize::try_from(offset).unwrap_or(usize::MAX))
        .take(limit as usize)
        .collect();
    (page, total)
}

#[async_trait]
impl EngineStore for InMemoryStore {
    async fn insert_job(&self, job: &CustomJob) -> StoreResult<()> {
        let mut state = self.write()?;
        if state.jobs.contains_key(&job.id) {
            return Err(StoreError::Conflict(format!("custom job {} already exists", job.id)));
        }
        state.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &CustomJob) -> StoreResult<()> {
        let mut state = self.write()?;
        match state.jobs.get_mut(&job.id) {
            Some(existing) => {
                *existing = job.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("custom job {}", job.id))),
        }
    }

    async fn delete_job(&self, job_id: JobId) -> StoreResult<bool> {
        let mut state = self.write()?;
        if state.jobs.remove(&job_id).is_none() {
            return Ok(false);
        }
        let run_ids: Vec<RunId> = state.runs.values().filter(|r| r.job_id == job_id).map(|r| r.id).collect();
        for run_id in run_ids {
            state.remove_run(run_id);
        }
        state.events.retain(|_, e| e.job_id != job_id);
        state.trigger_states.retain(|(j, _), _| *j != job_id);
        state.audit.retain(|a| a.job_id != job_id);
        Ok(true)
    }

    async fn get_job(&self, job_id: JobId) -> StoreResult<Option<CustomJob>> {
        Ok(self.read()?.jobs.get(&job_id).cloned())
    }

    async fn list_jobs(&self, tenant_id: TenantId, enabled: Option<bool>) -> StoreResult<Vec<CustomJob>> {
        let state = self.read()?;
        let mut jobs: Vec<CustomJob> = state
            .jobs
            .values()
            .filter(|j| j.tenant_id == tenant_id && enabled.is_none_or(|e| j.enabled == e))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn list_enabled_triggered_jobs(&self, tenant_id: TenantId) -> StoreResult<Vec<CustomJob>> {
        let state = self.read()?;
        Ok(state
            .jobs
            .values()
            .filter(|j| j.tenant_id == tenant_id && j.enabled && !j.trigger_type().is_scheduled())
            .cloned()
            .collect())
    }

    async fn append_audit(&self, entry: &AuditLogEntry) -> StoreResult<()> {
        #[cfg(test)]
        if self.fail_audit.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(StoreError::Storage("audit write failed".to_string()));
        }
        let mut state = self.write()?;
        if !state.jobs.contains_key(&entry.job_id) {
            return Err(StoreError::NotFound(format!("custom job {}", entry.job_id)));
        }
        state.audit.push(entry.clone());
        Ok(())
    }

    async fn list_audit(&self, job_id: JobId) -> StoreResult<Vec<AuditLogEntry>> {
        let state = self.read()?;
        let mut entries: Vec<AuditLogEntry> = state.audit.iter().filter(|a| a.job_id == job_id).cloned().collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(entries)
    }

    async fn claim_due_jobs(&self, tenant_id: TenantId, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Run>> {
        let mut state = self.write()?;
        let mut due: Vec<(JobId, DateTime<Utc>)> = state
            .jobs
            .values()
            .filter(|j| j.tenant_id == tenant_id && j.enabled && j.trigger_type().is_scheduled())
            .filter_map(|j| j.next_run_at.filter(|at| *at <= now).map(|at| (j.id, at)))
            .collect();
        due.sort_by_key(|(_, at)| *at);
        due.truncate(limit);

        let mut created = Vec::new();
        for (job_id, scheduled_for) in due {
            let Some(mut job) = state.jobs.get(&job_id).cloned() else {
                continue;
            };
            if let Err(e) = job.advance_schedule(scheduled_for) {
                warn!(job_id = %job_id, error = %e, "could not compute next run; leaving job unclaimed");
                continue;
            }
            let run = NewRun::scheduled(job_id, scheduled_for).into_run(now);
            match state.try_insert_run(run) {
                Ok(run) => {
                    job.updated_at = now;
                    state.jobs.insert(job_id, job);
                    created.push(run);
                }
                Err(StoreError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(created)
    }

    async fn claim_trigger_events(&self, tenant_id: TenantId, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Run>> {
        let mut state = self.write()?;
        let mut candidates: Vec<(TriggerEventId, JobId, Option<DateTime<Utc>>)> = state
            .events
            .values()
            .filter(|e| e.status == TriggerEventStatus::Received)
            .filter(|e| state.tenant_owns(tenant_id, e.job_id))
            .filter(|e| state.jobs.get(&e.job_id).is_some_and(|j| j.enabled))
            .map(|e| (e.id, e.job_id, e.event_time))
            .collect();
        candidates.sort_by_key(|(_, _, t)| *t);
        candidates.truncate(limit);
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let job_ids: HashSet<JobId> = candidates.iter().map(|(_, j, _)| *j).collect();
        let mut active: HashMap<JobId, u64> = HashMap::new();
        for run in state.runs.values().filter(|r| job_ids.contains(&r.job_id) && r.status.is_active()) {
            *active.entry(run.job_id).or_default() += 1;
        }
        let mut tracker = AdmissionTracker::new(active);

        let mut created = Vec::new();
        for (event_id, job_id, _) in candidates {
            let config = state.jobs.get(&job_id).and_then(|j| j.trigger_source_config().cloned());
            if !tracker.admits(job_id, config.as_ref()) {
                continue;
            }
            let run = NewRun::for_event(job_id, event_id).into_run(now);
            match state.try_insert_run(run) {
                Ok(run) => {
                    state.settle_event(event_id, TriggerEventStatus::Enqueued, None, now);
                    tracker.record(job_id);
                    created.push(run);
                }
                Err(StoreError::Conflict(_)) => {
                    if let Some(event) = state.events.get_mut(&event_id) {
                        event.status = TriggerEventStatus::Dropped;
                        event.error_message = Some(DUPLICATE_TRIGGER_MESSAGE.to_string());
                        event.updated_at = now;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(created)
    }

    async fn mark_stale_runs_failed(
        &self,
        tenant_id: TenantId,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut state = self.write()?;
        let stale: Vec<RunId> = state
            .runs
            .values()
            .filter(|r| r.status == RunStatus::Started && r.started_at.is_some_and(|t| t < started_before))
            .filter(|r| state.tenant_owns(tenant_id, r.job_id))
            .map(|r| r.id)
            .collect();

        for run_id in &stale {
            let mut event_id = None;
            if let Some(run) = state.runs.get_mut(run_id) {
                run.status = RunStatus::Failure;
                run.finished_at = Some(now);
                run.error_message = Some(STALE_RUN_MESSAGE.to_string());
                event_id = run.trigger_event_id;
            }
            if let Some(event_id) = event_id {
                state.settle_event(event_id, TriggerEventStatus::Failed, Some(STALE_RUN_MESSAGE.to_string()), now);
            }
        }
        Ok(stale.len() as u64)
    }

    async fn delete_expired_history(&self, tenant_id: TenantId, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut state = self.write()?;
        let cutoffs: HashMap<JobId, DateTime<Utc>> = state
            .jobs
            .values()
            .filter(|j| j.tenant_id == tenant_id)
            .filter_map(|j| {
                let cutoff = now.checked_sub_signed(Duration::days(i64::from(j.retention_days)));
                if cutoff.is_none() {
                    warn!(job_id = %j.id, retention_days = j.retention_days, "retention cutoff out of range; skipping job");
                }
                Some((j.id, cutoff?))
            })
            .collect();
        let expired = |job_id: &JobId, created_at: DateTime<Utc>| cutoffs.get(job_id).is_some_and(|c| created_at < *c);

        let runs: Vec<RunId> = state
            .runs
            .values()
            .filter(|r| r.status.is_terminal() && expired(&r.job_id, r.created_at))
            .map(|r| r.id)
            .collect();
        let events: Vec<TriggerEventId> = state
            .events
            .values()
            .filter(|e| e.status.is_terminal() && expired(&e.job_id, e.created_at))
            .map(|e| e.id)
            .collect();

        for run_id in &runs {
            state.remove_run(*run_id);
        }
        for event_id in &events {
            state.remove_event(*event_id);
        }
        Ok((runs.len() + events.len()) as u64)
    }

    async fn create_manual_run(
        &self,
        job_id: JobId,
        idempotency_key: Option<&str>,
        cooldown: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<ManualRun> {
        let key = normalize_idempotency_key(idempotency_key);
        let mut state = self.write()?;
        if !state.jobs.contains_key(&job_id) {
            return Err(StoreError::NotFound(format!("custom job {job_id}")));
        }
        if let Some(key) = key.as_deref() {
            let existing = state
                .runs
                .values()
                .find(|r| r.job_id == job_id && r.idempotency_key.as_deref() == Some(key));
            if let Some(run) = existing {
                return Ok(ManualRun {
                    run: run.clone(),
                    created: false,
                });
            }
        }

        let latest = state.runs.values().filter(|r| r.job_id == job_id).map(|r| r.created_at).max();
        check_cooldown(latest, now, cooldown)?;

        let run = state.try_insert_run(NewRun::manual(job_id, key).into_run(now))?;
        Ok(ManualRun { run, created: true })
    }

    async fn create_trigger_event(&self, event: NewTriggerEvent, now: DateTime<Utc>) -> StoreResult<Option<TriggerEvent>> {
        let mut state = self.write()?;
        if !state.jobs.contains_key(&event.job_id) {
            return Err(StoreError::NotFound(format!("custom job {}", event.job_id)));
        }
        let duplicate = state
            .events
            .values()
            .any(|e| e.job_id == event.job_id && e.dedupe_key == event.dedupe_key);
        if duplicate {
            return Ok(None);
        }
        let event = event.into_event(now);
        state.events.insert(event.id, event.clone());
        Ok(Some(event))
    }

    async fn get_trigger_event(&self, event_id: TriggerEventId) -> StoreResult<Option<TriggerEvent>> {
        Ok(self.read()?.events.get(&event_id).cloned())
    }

    async fn fetch_or_create_trigger_state(
        &self,
        job_id: JobId,
        source_key: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<TriggerState> {
        let mut state = self.write()?;
        if !state.jobs.contains_key(&job_id) {
            return Err(StoreError::NotFound(format!("custom job {job_id}")));
        }
        let entry = state
            .trigger_states
            .entry((job_id, source_key.to_string()))
            .or_insert_with(|| TriggerState {
                job_id,
                source_key: source_key.to_string(),
                cursor: None,
                updated_at: now,
            });
        Ok(entry.clone())
    }

    async fn save_trigger_state(
        &self,
        job_id: JobId,
        source_key: &str,
        cursor: Option<JsonValue>,
        now: DateTime<Utc>,
    ) -> StoreResult<TriggerState> {
        let mut state = self.write()?;
        if !state.jobs.contains_key(&job_id) {
            return Err(StoreError::NotFound(format!("custom job {job_id}")));
        }
        let saved = TriggerState {
            job_id,
            source_key: source_key.to_string(),
            cursor,
            updated_at: now,
        };
        state.trigger_states.insert((job_id, source_key.to_string()), saved.clone());
        Ok(saved)
    }

    async fn insert_run(&self, run: &Run) -> StoreResult<()> {
        self.write()?.try_insert_run(run.clone()).map(|_| ())
    }

    async fn get_run(&self, run_id: RunId) -> StoreResult<Option<Run>> {
        Ok(self.read()?.runs.get(&run_id).cloned())
    }

    async fn transition_run_to_started(&self, run_id: RunId, now: DateTime<Utc>) -> StoreResult<Option<Run>> {
        let mut state = self.write()?;
        match state.runs.get_mut(&run_id) {
            Some(run) if run.status == RunStatus::Pending => {
                run.status = RunStatus::Started;
                run.started_at = Some(now);
                Ok(Some(run.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn finish_run(&self, run_id: RunId, completion: RunCompletion, now: DateTime<Utc>) -> StoreResult<()> {
        let mut state = self.write()?;
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| StoreError::NotFound(format!("custom job run {run_id}")))?;
        run.status = completion.status;
        run.finished_at = Some(now);
        run.error_message = completion.error_message.clone();
        run.output_preview = completion.output_preview;
        run.metrics = completion.metrics;
        let event_id = run.trigger_event_id;

        if let (Some(event_id), Some(status)) = (event_id, settled_event_status(completion.status)) {
            state.settle_event(event_id, status, completion.error_message, now);
        }
        Ok(())
    }

    async fn upsert_run_step(&self, update: StepUpdate, now: DateTime<Utc>) -> StoreResult<RunStep> {
        let mut state = self.write()?;
        if !state.runs.contains_key(&update.run_id) {
            return Err(StoreError::NotFound(format!("custom job run {}", update.run_id)));
        }
        let steps = state.steps.entry(update.run_id).or_default();
        let position = steps.iter().position(|s| s.step_id == update.step_id);
        if position.is_none() && steps.iter().any(|s| s.step_index == update.step_index) {
            return Err(StoreError::Conflict(format!(
                "step index {} already recorded for run {}",
                update.step_index, update.run_id
            )));
        }
        let step = update.apply(position.map(|i| steps[i].clone()), now);
        match position {
            Some(i) => steps[i] = step.clone(),
            None => steps.push(step.clone()),
        }
        Ok(step)
    }

    async fn completed_step_outputs(&self, run_id: RunId) -> StoreResult<BTreeMap<String, StepOutput>> {
        let state = self.read()?;
        let mut steps: Vec<&RunStep> = state
            .steps
            .get(&run_id)
            .map(|s| s.iter().filter(|s| s.status == StepStatus::Success).collect())
            .unwrap_or_default();
        steps.sort_by_key(|s| s.step_index);
        Ok(steps
            .into_iter()
            .filter_map(|s| match &s.output {
                Some(JsonValue::Object(map)) => Some((s.step_id.clone(), map.clone())),
                _ => None,
            })
            .collect())
    }

    async fn list_runs(&self, job_id: JobId, query: &RunQuery) -> StoreResult<(Vec<Run>, u64)> {
        let state = self.read()?;
        let mut runs: Vec<Run> = state
            .runs
            .values()
            .filter(|r| r.job_id == job_id && query.matches(r))
            .cloned()
            .collect();
        sort_runs(&mut runs, query.sort);
        Ok(page(runs, query.offset(), query.page_size))
    }

    async fn list_run_steps(&self, run_id: RunId, page_no: u32, page_size: u32) -> StoreResult<(Vec<RunStep>, u64)> {
        let state = self.read()?;
        let mut steps = state.steps.get(&run_id).cloned().unwrap_or_default();
        steps.sort_by_key(|s| s.step_index);
        Ok(page(steps, u64::from(page_no) * u64::from(page_size), page_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use forgejobs_core::{JobTrigger, TriggerType};
    use serde_json::json;

    fn at(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, h, m, 0).unwrap()
    }

    fn daily_job(tenant: TenantId, now: DateTime<Utc>) -> CustomJob {
        let trigger =
            JobTrigger::from_fields(TriggerType::Daily, Some("UTC"), Some(9), Some(0), None, None, None).unwrap();
        CustomJob::new(tenant, "digest", "weekly_content_summary", json!({}), trigger, now).unwrap()
    }

    fn triggered_job(tenant: TenantId, config: JsonValue, now: DateTime<Utc>) -> CustomJob {
        let trigger = JobTrigger::from_fields(
            TriggerType::Triggered,
            None,
            None,
            None,
            None,
            Some("email".into()),
            Some(&config),
        )
        .unwrap();
        CustomJob::new(tenant, "crm", "email_crm_processor", json!({}), trigger, now).unwrap()
    }

    fn event(job_id: JobId, key: &str, minute: u32) -> NewTriggerEvent {
        NewTriggerEvent {
            job_id,
            source_type: "email".into(),
            source_event_id: Some(key.into()),
            dedupe_key: key.into(),
            dedupe_key_prefix: None,
            event_time: Some(at(1, 8, minute)),
            payload: None,
        }
    }

    #[tokio::test]
    async fn due_claim_creates_one_run_and_advances_schedule() {
        let store = InMemoryStore::new();
        let tenant = TenantId::new();
        let job = daily_job(tenant, at(1, 8, 0));
        store.insert_job(&job).await.unwrap();

        let runs = store.claim_due_jobs(tenant, at(1, 9, 5), 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].scheduled_for, Some(at(1, 9, 0)));

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.last_scheduled_at, Some(at(1, 9, 0)));
        assert_eq!(job.next_run_at, Some(at(2, 9, 0)));

        assert!(store.claim_due_jobs(tenant, at(1, 9, 6), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn due_claim_leaves_job_unadvanced_on_duplicate_slot() {
        let store = InMemoryStore::new();
        let tenant = TenantId::new();
        let job = daily_job(tenant, at(1, 8, 0));
        store.insert_job(&job).await.unwrap();
        store
            .insert_run(&NewRun::scheduled(job.id, at(1, 9, 0)).into_run(at(1, 8, 0)))
            .await
            .unwrap();

        assert!(store.claim_due_jobs(tenant, at(1, 9, 5), 10).await.unwrap().is_empty());
        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.next_run_at, Some(at(1, 9, 0)));
    }

    #[tokio::test]
    async fn trigger_claim_honors_concurrency_and_orders_by_event_time() {
        let store = InMemoryStore::new();
        let tenant = TenantId::new();
        let job = triggered_job(tenant, json!({"max_concurrent_runs": 2}), at(1, 8, 0));
        store.insert_job(&job).await.unwrap();
        for (key, minute) in [("c", 30), ("a", 10), ("b", 20)] {
            store.create_trigger_event(event(job.id, key, minute), at(1, 8, 40)).await.unwrap();
        }
        let mut no_time = event(job.id, "early", 0);
        no_time.event_time = None;
        let early = store.create_trigger_event(no_time, at(1, 8, 40)).await.unwrap().unwrap();

        let runs = store.claim_trigger_events(tenant, at(1, 9, 0), 10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].trigger_event_id, Some(early.id));

        let claimed = store.get_trigger_event(early.id).await.unwrap().unwrap();
        assert_eq!(claimed.status, TriggerEventStatus::Enqueued);
        assert!(store.claim_trigger_events(tenant, at(1, 9, 1), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_event_run_is_dropped() {
        let store = InMemoryStore::new();
        let tenant = TenantId::new();
        let job = triggered_job(tenant, json!({}), at(1, 8, 0));
        store.insert_job(&job).await.unwrap();
        let event = store.create_trigger_event(event(job.id, "m1", 5), at(1, 8, 0)).await.unwrap().unwrap();
        store
            .insert_run(&NewRun::for_event(job.id, event.id).into_run(at(1, 8, 0)))
            .await
            .unwrap();

        assert!(store.claim_trigger_events(tenant, at(1, 9, 0), 10).await.unwrap().is_empty());
        let event = store.get_trigger_event(event.id).await.unwrap().unwrap();
        assert_eq!(event.status, TriggerEventStatus::Dropped);
        assert_eq!(event.error_message.as_deref(), Some(DUPLICATE_TRIGGER_MESSAGE));
    }

    #[tokio::test]
    async fn duplicate_dedupe_key_is_ignored() {
        let store = InMemoryStore::new();
        let job = triggered_job(TenantId::new(), json!({}), at(1, 8, 0));
        store.insert_job(&job).await.unwrap();
        assert!(store.create_trigger_event(event(job.id, "m1", 5), at(1, 8, 0)).await.unwrap().is_some());
        assert!(store.create_trigger_event(event(job.id, "m1", 6), at(1, 8, 1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn finishing_a_run_settles_its_event() {
        let store = InMemoryStore::new();
        let tenant = TenantId::new();
        let job = triggered_job(tenant, json!({}), at(1, 8, 0));
        store.insert_job(&job).await.unwrap();
        let event = store.create_trigger_event(event(job.id, "m1", 5), at(1, 8, 0)).await.unwrap().unwrap();
        let run = store.claim_trigger_events(tenant, at(1, 9, 0), 10).await.unwrap().remove(0);

        store
            .finish_run(run.id, RunCompletion::failed("boom"), at(1, 9, 1))
            .await
            .unwrap();
        let event = store.get_trigger_event(event.id).await.unwrap().unwrap();
        assert_eq!(event.status, TriggerEventStatus::Failed);
        assert_eq!(event.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn started_transition_is_compare_and_swap() {
        let store = InMemoryStore::new();
        let job = daily_job(TenantId::new(), at(1, 8, 0));
        store.insert_job(&job).await.unwrap();
        let run = NewRun::manual(job.id, None).into_run(at(1, 8, 0));
        store.insert_run(&run).await.unwrap();

        assert!(store.transition_run_to_started(run.id, at(1, 8, 1)).await.unwrap().is_some());
        assert!(store.transition_run_to_started(run.id, at(1, 8, 2)).await.unwrap().is_none());
        let run = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(run.started_at, Some(at(1, 8, 1)));
    }

    #[tokio::test]
    async fn list_runs_sorts_started_desc_with_nulls_last() {
        let store = InMemoryStore::new();
        let job = daily_job(TenantId::new(), at(1, 8, 0));
        store.insert_job(&job).await.unwrap();
        let mut ids = Vec::new();
        for (i, started) in [Some(at(1, 10, 0)), None, Some(at(1, 11, 0))].into_iter().enumerate() {
            let mut run = NewRun::manual(job.id, Some(format!("k{i}"))).into_run(at(1, 8, i as u32));
            run.started_at = started;
            store.insert_run(&run).await.unwrap();
            ids.push(run.id);
        }

        let (runs, total) = store.list_runs(job.id, &RunQuery::default()).await.unwrap();
        assert_eq!(total, 3);
        assert_eq!(runs.iter().map(|r| r.id).collect::<Vec<_>>(), vec![ids[2], ids[0], ids[1]]);

        let query = RunQuery {
            sort: RunSort::StartedAtAsc,
            page: 1,
            page_size: 2,
            ..Default::default()
        };
        let (runs, total) = store.list_runs(job.id, &query).await.unwrap();
        assert_eq!(total, 3);
        assert_eq!(runs.iter().map(|r| r.id).collect::<Vec<_>>(), vec![ids[2]]);
    }

    #[tokio::test]
    async fn deleting_a_job_cascades() {
        let store = InMemoryStore::new();
        let job = daily_job(TenantId::new(), at(1, 8, 0));
        store.insert_job(&job).await.unwrap();
        let run = NewRun::manual(job.id, None).into_run(at(1, 8, 0));
        store.insert_run(&run).await.unwrap();

        assert!(store.delete_job(job.id).await.unwrap());
        assert!(store.get_run(run.id).await.unwrap().is_none());
        assert!(!store.delete_job(job.id).await.unwrap());
    }

    #[tokio::test]
    async fn expired_history_deletes_only_terminal_events() {
        let store = InMemoryStore::new();
        let tenant = TenantId::new();
        let mut job = triggered_job(tenant, json!({}), at(1, 8, 0));
        job.retention_days = 30;
        store.insert_job(&job).await.unwrap();

        let long_ago = at(1, 8, 0) - Duration::days(100);
        let statuses = [
            TriggerEventStatus::Received,
            TriggerEventStatus::Enqueued,
            TriggerEventStatus::Consumed,
            TriggerEventStatus::Dropped,
            TriggerEventStatus::Failed,
        ];
        let mut ids = Vec::new();
        for (i, status) in statuses.into_iter().enumerate() {
            let created = store
                .create_trigger_event(event(job.id, &format!("m{i}"), 5), long_ago)
                .await
                .unwrap()
                .unwrap();
            store.write().unwrap().events.get_mut(&created.id).unwrap().status = status;
            ids.push(created.id);
        }

        assert_eq!(store.delete_expired_history(tenant, at(1, 8, 0)).await.unwrap(), 3);
        for (id, status) in ids.into_iter().zip(statuses) {
            let kept = store.get_trigger_event(id).await.unwrap().is_some();
            assert_eq!(kept, !status.is_terminal(), "{status:?}");
        }
    }

    #[tokio::test]
    async fn out_of_range_retention_skips_the_job() {
        let store = InMemoryStore::new();
        let tenant = TenantId::new();
        let mut job = daily_job(tenant, at(1, 8, 0));
        job.retention_days = u32::MAX;
        store.insert_job(&job).await.unwrap();
        let mut run = NewRun::manual(job.id, None).into_run(at(1, 8, 0) - Duration::days(1_000));
        run.status = RunStatus::Success;
        store.insert_run(&run).await.unwrap();

        assert_eq!(store.delete_expired_history(tenant, at(1, 8, 0)).await.unwrap(), 0);
        assert!(store.get_run(run.id).await.unwrap().is_some());
        assert!(store.get_job(job.id).await.unwrap().is_some());
    }
}
