//! Job administration: the engine-side half of the admin surface.
//!
//! Every write validates the schedule, the trigger-source config and the
//! workflow's step configs before touching the store, and appends an audit row.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use thiserror::Error;
use tracing::{info, warn};

use forgejobs_core::{
    AuditAction, AuditLogEntry, CustomJob, DomainError, JobId, JobTrigger, MAX_RETENTION_DAYS, Run, RunId, RunStep, TenantId, TriggerType,
    UserId,
};
use forgejobs_workflow::{StepCatalogItem, WorkflowDefinition, WorkflowError, WorkflowRuntime, step_catalog, workflow_keys};

use crate::dispatch::{RunDispatcher, RunTicket};
use crate::heartbeat::enqueue_failure;
use crate::manual::normalize_idempotency_key;
use crate::store::{EngineStore, RunQuery, StoreError};

pub const JOB_NOT_FOUND: &str = "Custom job not found.";
pub const RUN_NOT_FOUND: &str = "Run not found for this job.";
pub const MAX_RUNS_PAGE_SIZE: u32 = 200;
pub const MAX_STEPS_PAGE_SIZE: u32 = 500;
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Unable to enqueue manual run: {0}")]
    Enqueue(String),

    #[error(transparent)]
    Store(StoreError),
}

impl From<DomainError> for AdminError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::NotFound(m) => AdminError::NotFound(m),
            DomainError::Conflict(m) => AdminError::Conflict(m),
            other => AdminError::Validation(other.message().to_string()),
        }
    }
}

impl From<WorkflowError> for AdminError {
    fn from(err: WorkflowError) -> Self {
        AdminError::Validation(err.to_string())
    }
}

impl From<StoreError> for AdminError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(m) => AdminError::NotFound(m),
            StoreError::Conflict(m) => AdminError::Conflict(m),
            StoreError::Domain(domain) => domain.into(),
            other => AdminError::Store(other),
        }
    }
}

fn default_job_config() -> JsonValue {
    json!({})
}

fn default_enabled() -> bool {
    true
}

/// A job as submitted for creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDraft {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub workflow_key: String,
    #[serde(default = "default_job_config")]
    pub job_config: JsonValue,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub hour: Option<i32>,
    #[serde(default)]
    pub minute: Option<i32>,
    #[serde(default)]
    pub day_of_week: Option<i32>,
    #[serde(default)]
    pub trigger_source_type: Option<String>,
    #[serde(default)]
    pub trigger_source_config: Option<JsonValue>,
    #[serde(default)]
    pub retention_days: Option<u32>,
}

impl JobDraft {
    pub fn new(name: impl Into<String>, workflow_key: impl Into<String>, trigger_type: TriggerType) -> Self {
        Self {
            name: name.into(),
            description: None,
            workflow_key: workflow_key.into(),
            job_config: default_job_config(),
            enabled: true,
            trigger_type,
            timezone: None,
            hour: None,
            minute: None,
            day_of_week: None,
            trigger_source_type: None,
            trigger_source_config: None,
            retention_days: None,
        }
    }

    pub fn at(mut self, timezone: impl Into<String>, hour: i32, minute: i32) -> Self {
        self.timezone = Some(timezone.into());
        self.hour = Some(hour);
        self.minute = Some(minute);
        self
    }
}

/// Partial update. Unset fields keep their current value; switching to
/// TRIGGERED drops the schedule fields. A blank description clears it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub workflow_key: Option<String>,
    pub job_config: Option<JsonValue>,
    pub enabled: Option<bool>,
    pub trigger_type: Option<TriggerType>,
    pub timezone: Option<String>,
    pub hour: Option<i32>,
    pub minute: Option<i32>,
    pub day_of_week: Option<i32>,
    pub trigger_source_type: Option<String>,
    pub trigger_source_config: Option<JsonValue>,
    pub retention_days: Option<u32>,
}

impl JobPatch {
    /// Names of the fields this patch sets, sorted.
    pub fn fields(&self) -> Vec<&'static str> {
        let mut fields: Vec<&'static str> = [
            ("name", self.name.is_some()),
            ("description", self.description.is_some()),
            ("workflow_key", self.workflow_key.is_some()),
            ("job_config", self.job_config.is_some()),
            ("enabled", self.enabled.is_some()),
            ("trigger_type", self.trigger_type.is_some()),
            ("timezone", self.timezone.is_some()),
            ("hour", self.hour.is_some()),
            ("minute", self.minute.is_some()),
            ("day_of_week", self.day_of_week.is_some()),
            ("trigger_source_type", self.trigger_source_type.is_some()),
            ("trigger_source_config", self.trigger_source_config.is_some()),
            ("retention_days", self.retention_days.is_some()),
        ]
        .into_iter()
        .filter_map(|(name, set)| set.then_some(name))
        .collect();
        fields.sort_unstable();
        fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualTriggerStatus {
    Queued,
    Deduplicated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualTriggerResponse {
    pub run_id: RunId,
    pub status: ManualTriggerStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DryRunReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub step_count: usize,
}

/// Raw trigger descriptor fields, as stored or submitted.
#[derive(Debug, Clone, Default)]
struct TriggerFields {
    trigger_type: Option<TriggerType>,
    timezone: Option<String>,
    hour: Option<i32>,
    minute: Option<i32>,
    day_of_week: Option<i32>,
    source_type: Option<String>,
    source_config: Option<JsonValue>,
}

impl TriggerFields {
    fn of(job: &CustomJob) -> Self {
        match &job.trigger {
            JobTrigger::Scheduled(spec) => Self {
                trigger_type: Some(spec.trigger_type()),
                timezone: Some(spec.timezone.name().to_string()),
                hour: Some(spec.hour as i32),
                minute: Some(spec.minute as i32),
                day_of_week: spec.day_of_week_index(),
                source_type: None,
                source_config: None,
            },
            JobTrigger::Triggered {
                source_type,
                source_config,
            } => Self {
                trigger_type: Some(TriggerType::Triggered),
                source_type: source_type.clone(),
                source_config: Some(source_config.to_value()),
                ..Self::default()
            },
        }
    }

    fn build(&self) -> Result<JobTrigger, DomainError> {
        let trigger_type = self
            .trigger_type
            .ok_or_else(|| DomainError::validation("trigger_type is required."))?;
        let triggered = trigger_type == TriggerType::Triggered;
        JobTrigger::from_fields(
            trigger_type,
            if triggered { None } else { self.timezone.as_deref() },
            if triggered { None } else { self.hour },
            if triggered { None } else { self.minute },
            if triggered { None } else { self.day_of_week },
            self.source_type.clone(),
            if triggered { self.source_config.as_ref() } else { None },
        )
    }
}

fn check_name(name: &str) -> Result<String, AdminError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AdminError::Validation("name cannot be empty.".into()));
    }
    Ok(name.to_string())
}

fn check_retention(days: u32) -> Result<u32, AdminError> {
    if days == 0 {
        return Err(AdminError::Validation("retention_days must be >= 1.".into()));
    }
    if days > MAX_RETENTION_DAYS {
        return Err(AdminError::Validation(format!(
            "retention_days must be <= {MAX_RETENTION_DAYS}."
        )));
    }
    Ok(days)
}

fn check_page_size(page_size: u32, max: u32) -> Result<(), AdminError> {
    if page_size == 0 || page_size > max {
        return Err(AdminError::Validation(format!("page_size must be between 1 and {max}.")));
    }
    Ok(())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

pub struct JobAdmin<S, W> {
    store: Arc<S>,
    runtime: Arc<W>,
    dispatcher: Arc<dyn RunDispatcher>,
    tenant_id: TenantId,
    manual_cooldown: chrono::Duration,
}

impl<S: EngineStore, W: WorkflowRuntime> JobAdmin<S, W> {
    pub fn new(
        store: Arc<S>,
        runtime: Arc<W>,
        dispatcher: Arc<dyn RunDispatcher>,
        tenant_id: TenantId,
        manual_cooldown: chrono::Duration,
    ) -> Self {
        Self {
            store,
            runtime,
            dispatcher,
            tenant_id,
            manual_cooldown,
        }
    }

    fn validate_workflow(&self, workflow_key: &str, job_config: &JsonValue) -> Result<WorkflowDefinition, AdminError> {
        Ok(self.runtime.build_workflow(workflow_key, job_config)?)
    }

    async fn load_job(&self, job_id: JobId) -> Result<CustomJob, AdminError> {
        match self.store.get_job(job_id).await? {
            Some(job) if job.tenant_id == self.tenant_id => Ok(job),
            _ => Err(AdminError::NotFound(JOB_NOT_FOUND.into())),
        }
    }

    pub async fn create_job(
        &self,
        draft: JobDraft,
        actor: Option<UserId>,
        now: DateTime<Utc>,
    ) -> Result<CustomJob, AdminError> {
        let name = check_name(&draft.name)?;
        let trigger = TriggerFields {
            trigger_type: Some(draft.trigger_type),
            timezone: draft.timezone,
            hour: draft.hour,
            minute: draft.minute,
            day_of_week: draft.day_of_week,
            source_type: non_blank(draft.trigger_source_type),
            source_config: draft.trigger_source_config,
        }
        .build()?;
        self.validate_workflow(&draft.workflow_key, &draft.job_config)?;

        let mut job = CustomJob::new(self.tenant_id, name, draft.workflow_key, draft.job_config, trigger, now)?;
        job.description = non_blank(draft.description);
        job.enabled = draft.enabled;
        job.created_by = actor;
        if let Some(days) = draft.retention_days {
            job.retention_days = check_retention(days)?;
        }
        job.refresh_next_run_at(now)?;

        self.store.insert_job(&job).await?;
        self.store
            .append_audit(&AuditLogEntry::new(
                job.id,
                AuditAction::Created,
                actor,
                Some(json!({ "workflow_key": job.workflow_key })),
                now,
            ))
            .await?;
        info!(
            event = "created",
            tenant_id = %self.tenant_id,
            job_id = %job.id,
            workflow_key = %job.workflow_key,
            "custom_job_api_event"
        );
        Ok(job)
    }

    pub async fn update_job(
        &self,
        job_id: JobId,
        patch: JobPatch,
        actor: Option<UserId>,
        now: DateTime<Utc>,
    ) -> Result<CustomJob, AdminError> {
        let mut job = self.load_job(job_id).await?;
        let fields = patch.fields();
        if fields.is_empty() {
            return Ok(job);
        }

        let mut trigger = TriggerFields::of(&job);
        if let Some(trigger_type) = patch.trigger_type {
            trigger.trigger_type = Some(trigger_type);
        }
        trigger.timezone = patch.timezone.or(trigger.timezone);
        trigger.hour = patch.hour.or(trigger.hour);
        trigger.minute = patch.minute.or(trigger.minute);
        trigger.day_of_week = patch.day_of_week.or(trigger.day_of_week);
        if patch.trigger_source_type.is_some() {
            trigger.source_type = non_blank(patch.trigger_source_type);
        }
        trigger.source_config = patch.trigger_source_config.or(trigger.source_config);
        let new_trigger = trigger.build()?;

        let workflow_key = patch.workflow_key.unwrap_or_else(|| job.workflow_key.clone());
        let job_config = patch.job_config.unwrap_or_else(|| job.job_config.clone());
        self.validate_workflow(&workflow_key, &job_config)?;

        if let Some(name) = patch.name {
            job.name = check_name(&name)?;
        }
        if let Some(description) = patch.description {
            job.description = non_blank(Some(description));
        }
        if let Some(days) = patch.retention_days {
            job.retention_days = check_retention(days)?;
        }
        if let Some(enabled) = patch.enabled {
            job.enabled = enabled;
        }
        job.workflow_key = workflow_key;
        job.job_config = job_config;
        job.trigger = new_trigger;
        job.updated_at = now;
        job.refresh_next_run_at(now)?;

        self.store.update_job(&job).await?;
        self.store
            .append_audit(&AuditLogEntry::new(
                job.id,
                AuditAction::Updated,
                actor,
                Some(json!({ "fields": fields })),
                now,
            ))
            .await?;
        info!(
            event = "updated",
            tenant_id = %self.tenant_id,
            job_id = %job.id,
            fields = ?fields,
            "custom_job_api_event"
        );
        Ok(job)
    }

    /// Deletes the job and everything it owns, audit rows included.
    pub async fn delete_job(&self, job_id: JobId, actor: Option<UserId>) -> Result<(), AdminError> {
        self.load_job(job_id).await?;
        if !self.store.delete_job(job_id).await? {
            return Err(AdminError::NotFound(JOB_NOT_FOUND.into()));
        }
        info!(
            event = "deleted",
            tenant_id = %self.tenant_id,
            user_id = ?actor,
            job_id = %job_id,
            "custom_job_api_event"
        );
        Ok(())
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<CustomJob, AdminError> {
        self.load_job(job_id).await
    }

    pub async fn list_jobs(&self, enabled: Option<bool>) -> Result<Vec<CustomJob>, AdminError> {
        Ok(self.store.list_jobs(self.tenant_id, enabled).await?)
    }

    pub async fn audit_log(&self, job_id: JobId) -> Result<Vec<AuditLogEntry>, AdminError> {
        self.load_job(job_id).await?;
        Ok(self.store.list_audit(job_id).await?)
    }

    /// Create (or find, by idempotency key) a manual run and enqueue it.
    pub async fn trigger_manual_run(
        &self,
        job_id: JobId,
        idempotency_key: Option<&str>,
        actor: Option<UserId>,
        now: DateTime<Utc>,
    ) -> Result<ManualTriggerResponse, AdminError> {
        let job = self.load_job(job_id).await?;
        if !job.enabled {
            return Err(AdminError::Validation("Custom job is disabled.".into()));
        }
        let key = normalize_idempotency_key(idempotency_key);
        if key.as_ref().is_some_and(|k| k.chars().count() > MAX_IDEMPOTENCY_KEY_LEN) {
            return Err(AdminError::Validation(format!(
                "idempotency_key must be at most {MAX_IDEMPOTENCY_KEY_LEN} characters."
            )));
        }

        let manual = self
            .store
            .create_manual_run(job.id, key.as_deref(), self.manual_cooldown, now)
            .await?;
        let run = manual.run;
        let audit = AuditLogEntry::new(
            job.id,
            AuditAction::Triggered,
            actor,
            Some(json!({
                "run_id": run.id.to_string(),
                "mode": "manual",
                "deduplicated": !manual.created,
                "idempotency_key": key,
            })),
            now,
        );

        if !manual.created {
            self.store.append_audit(&audit).await?;
            info!(
                event = "manual_trigger_deduplicated",
                job_id = %job.id,
                run_id = %run.id,
                run_status = %run.status,
                "custom_job_api_event"
            );
            return Ok(ManualTriggerResponse {
                run_id: run.id,
                status: ManualTriggerStatus::Deduplicated,
            });
        }

        let ticket = RunTicket {
            run_id: run.id,
            tenant_id: self.tenant_id,
        };
        if let Err(err) = self.dispatcher.enqueue(ticket).await {
            warn!(
                event = "manual_trigger_enqueue_failed",
                job_id = %job.id,
                run_id = %run.id,
                error = %err,
                "custom_job_api_event"
            );
            self.store.finish_run(run.id, enqueue_failure(&err), now).await?;
            return Err(AdminError::Enqueue(err.to_string()));
        }

        // The run is already queued; a lost audit row must not fail the request.
        if let Err(err) = self.store.append_audit(&audit).await {
            warn!(
                event = "manual_trigger_audit_failed",
                job_id = %job.id,
                run_id = %run.id,
                error = %err,
                "custom_job_api_event"
            );
        }

        info!(
            event = "manual_trigger_queued",
            job_id = %job.id,
            run_id = %run.id,
            "custom_job_api_event"
        );
        Ok(ManualTriggerResponse {
            run_id: run.id,
            status: ManualTriggerStatus::Queued,
        })
    }

    /// Validate a stored job end to end without executing anything.
    pub async fn dry_run(&self, job_id: JobId) -> Result<DryRunReport, AdminError> {
        let job = self.load_job(job_id).await?;
        let mut report = DryRunReport::default();

        let fields = TriggerFields::of(&job);
        if let Err(err) = fields.build() {
            report.errors.push(err.message().to_string());
        }
        if let Err(err) = job.check_invariants() {
            report.errors.push(err.message().to_string());
        }

        match self.runtime.build_workflow(&job.workflow_key, &job.job_config) {
            Ok(definition) => {
                report.step_count = definition.steps.len();
                report.errors.extend(self.runtime.preflight(&definition));
            }
            Err(err) => report.errors.push(err.to_string()),
        }

        if matches!(&job.trigger, JobTrigger::Triggered { source_type: None, .. }) {
            report
                .warnings
                .push("Triggered job has no trigger_source_type configured; poller will no-op.".into());
        }

        report.valid = report.errors.is_empty();
        info!(
            event = "dry_run",
            job_id = %job.id,
            valid = report.valid,
            error_count = report.errors.len(),
            "custom_job_api_event"
        );
        Ok(report)
    }

    pub async fn list_runs(&self, job_id: JobId, query: &RunQuery) -> Result<(Vec<Run>, u64), AdminError> {
        check_page_size(query.page_size, MAX_RUNS_PAGE_SIZE)?;
        self.load_job(job_id).await?;
        Ok(self.store.list_runs(job_id, query).await?)
    }

    pub async fn list_run_steps(
        &self,
        job_id: JobId,
        run_id: RunId,
        page: u32,
        page_size: u32,
    ) -> Result<(Vec<RunStep>, u64), AdminError> {
        check_page_size(page_size, MAX_STEPS_PAGE_SIZE)?;
        match self.store.get_run(run_id).await? {
            Some(run) if run.job_id == job_id => {}
            _ => return Err(AdminError::NotFound(RUN_NOT_FOUND.into())),
        }
        Ok(self.store.list_run_steps(run_id, page, page_size).await?)
    }

    pub fn step_catalog(&self) -> Vec<StepCatalogItem> {
        step_catalog()
    }

    pub fn workflow_keys(&self) -> Vec<&'static str> {
        workflow_keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use forgejobs_core::RunStatus;
    use forgejobs_workflow::{StepRegistry, StepServices};

    use crate::dispatch::{ChannelDispatcher, ChannelInbox, RunInbox};
    use crate::store::InMemoryStore;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, h, m, 0).unwrap()
    }

    fn admin(cooldown_secs: i64) -> (JobAdmin<InMemoryStore, StepRegistry>, Arc<InMemoryStore>, ChannelInbox) {
        let store = Arc::new(InMemoryStore::new());
        let (dispatcher, inbox) = ChannelDispatcher::new(16);
        let admin = JobAdmin::new(
            Arc::clone(&store),
            Arc::new(StepRegistry::new(StepServices::default())),
            Arc::new(dispatcher),
            TenantId::new(),
            chrono::Duration::seconds(cooldown_secs),
        );
        (admin, store, inbox)
    }

    fn daily_draft() -> JobDraft {
        JobDraft::new("Weekly digest", "weekly_content_summary", TriggerType::Daily).at("UTC", 9, 30)
    }

    fn triggered_draft() -> JobDraft {
        JobDraft::new("CRM", "email_crm_processor", TriggerType::Triggered)
    }

    #[tokio::test]
    async fn create_computes_next_run_and_audits() {
        let (admin, store, _inbox) = admin(60);
        let job = admin.create_job(daily_draft(), None, at(8, 0)).await.unwrap();
        assert_eq!(job.next_run_at, Some(at(9, 30)));

        let audit = store.list_audit(job.id).await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, AuditAction::Created);
        assert_eq!(audit[0].details, Some(json!({"workflow_key": "weekly_content_summary"})));
    }

    #[tokio::test]
    async fn create_rejects_bad_schedule_and_unknown_workflow() {
        let (admin, _store, _inbox) = admin(60);

        let err = admin
            .create_job(daily_draft().at("UTC", 24, 0), None, at(8, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, AdminError::Validation(m) if m.contains("hour")));

        let mut draft = daily_draft();
        draft.workflow_key = "nope".into();
        let err = admin.create_job(draft, None, at(8, 0)).await.unwrap_err();
        assert!(matches!(err, AdminError::Validation(_)));

        let mut draft = triggered_draft();
        draft.trigger_source_config = Some(json!({"poll_interval_seconds": 5}));
        let err = admin.create_job(draft, None, at(8, 0)).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "trigger_source_config.poll_interval_seconds must be an integer >= 60."
        );
    }

    #[tokio::test]
    async fn update_switching_to_triggered_clears_schedule() {
        let (admin, store, _inbox) = admin(60);
        let job = admin.create_job(daily_draft(), None, at(8, 0)).await.unwrap();

        let patch = JobPatch {
            trigger_type: Some(TriggerType::Triggered),
            trigger_source_type: Some("email".into()),
            ..JobPatch::default()
        };
        let updated = admin.update_job(job.id, patch, None, at(8, 5)).await.unwrap();
        assert!(updated.next_run_at.is_none());
        assert!(updated.schedule().is_none());

        let audit = store.list_audit(job.id).await.unwrap();
        assert_eq!(audit[0].action, AuditAction::Updated);
        assert_eq!(
            audit[0].details,
            Some(json!({"fields": ["trigger_source_type", "trigger_type"]}))
        );
    }

    #[tokio::test]
    async fn disabling_clears_next_run() {
        let (admin, _store, _inbox) = admin(60);
        let job = admin.create_job(daily_draft(), None, at(8, 0)).await.unwrap();
        let patch = JobPatch {
            enabled: Some(false),
            ..JobPatch::default()
        };
        let updated = admin.update_job(job.id, patch, None, at(8, 1)).await.unwrap();
        assert!(!updated.enabled);
        assert!(updated.next_run_at.is_none());
    }

    #[tokio::test]
    async fn manual_trigger_is_idempotent_per_key() {
        let (admin, _store, inbox) = admin(60);
        let job = admin.create_job(triggered_draft(), None, at(8, 0)).await.unwrap();

        let first = admin
            .trigger_manual_run(job.id, Some(" K "), None, at(8, 0))
            .await
            .unwrap();
        assert_eq!(first.status, ManualTriggerStatus::Queued);
        let second = admin.trigger_manual_run(job.id, Some("K"), None, at(8, 0)).await.unwrap();
        assert_eq!(second.status, ManualTriggerStatus::Deduplicated);
        assert_eq!(first.run_id, second.run_id);

        let delivery = inbox.receive().await.unwrap().unwrap();
        assert_eq!(delivery.ticket.run_id, first.run_id);
    }

    #[tokio::test]
    async fn manual_trigger_still_queues_when_audit_write_fails() {
        let (admin, store, inbox) = admin(60);
        let job = admin.create_job(triggered_draft(), None, at(8, 0)).await.unwrap();
        store.fail_audit_writes();

        let queued = admin.trigger_manual_run(job.id, None, None, at(8, 0)).await.unwrap();
        assert_eq!(queued.status, ManualTriggerStatus::Queued);
        let delivery = inbox.receive().await.unwrap().unwrap();
        assert_eq!(delivery.ticket.run_id, queued.run_id);
        let run = store.get_run(queued.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Pending);
    }

    #[tokio::test]
    async fn retention_days_are_bounded() {
        let (admin, _store, _inbox) = admin(60);
        let mut draft = daily_draft();
        draft.retention_days = Some(MAX_RETENTION_DAYS + 1);
        let err = admin.create_job(draft, None, at(8, 0)).await.unwrap_err();
        assert_eq!(err.to_string(), "retention_days must be <= 36500.");

        let job = admin.create_job(daily_draft(), None, at(8, 0)).await.unwrap();
        let patch = JobPatch {
            retention_days: Some(u32::MAX),
            ..JobPatch::default()
        };
        assert!(matches!(
            admin.update_job(job.id, patch, None, at(8, 1)).await,
            Err(AdminError::Validation(_))
        ));
        let patch = JobPatch {
            retention_days: Some(MAX_RETENTION_DAYS),
            ..JobPatch::default()
        };
        let updated = admin.update_job(job.id, patch, None, at(8, 2)).await.unwrap();
        assert_eq!(updated.retention_days, MAX_RETENTION_DAYS);
    }

    #[tokio::test]
    async fn manual_trigger_respects_cooldown_and_disabled_jobs() {
        let (admin, _store, _inbox) = admin(60);
        let job = admin.create_job(triggered_draft(), None, at(8, 0)).await.unwrap();

        admin.trigger_manual_run(job.id, None, None, at(8, 0)).await.unwrap();
        let err = admin
            .trigger_manual_run(job.id, None, None, at(8, 0) + chrono::Duration::seconds(10))
            .await
            .unwrap_err();
        assert!(matches!(err, AdminError::Conflict(m) if m.contains("cooldown")));

        let patch = JobPatch {
            enabled: Some(false),
            ..JobPatch::default()
        };
        admin.update_job(job.id, patch, None, at(9, 0)).await.unwrap();
        let err = admin.trigger_manual_run(job.id, None, None, at(9, 0)).await.unwrap_err();
        assert_eq!(err.to_string(), "Custom job is disabled.");
    }

    #[tokio::test]
    async fn manual_enqueue_failure_fails_the_run() {
        let (admin, store, inbox) = admin(0);
        drop(inbox);
        let job = admin.create_job(triggered_draft(), None, at(8, 0)).await.unwrap();

        let err = admin.trigger_manual_run(job.id, None, None, at(8, 0)).await.unwrap_err();
        assert!(matches!(err, AdminError::Enqueue(_)));
        let (runs, _) = store.list_runs(job.id, &RunQuery::default()).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Failure);
    }

    #[tokio::test]
    async fn dry_run_reports_preflight_errors_and_warnings() {
        let (admin, _store, _inbox) = admin(60);
        let job = admin.create_job(triggered_draft(), None, at(8, 0)).await.unwrap();

        let report = admin.dry_run(job.id).await.unwrap();
        assert_eq!(report.step_count, 2);
        // No CRM collaborator configured.
        assert!(!report.valid);
        assert!(report.errors.iter().any(|e| e.starts_with("process_email_crm:")));
        assert_eq!(report.warnings.len(), 1);
    }

    #[tokio::test]
    async fn run_listing_validates_ownership_and_page_size() {
        let (admin, _store, _inbox) = admin(0);
        let job = admin.create_job(triggered_draft(), None, at(8, 0)).await.unwrap();
        let other = admin.create_job(triggered_draft(), None, at(8, 0)).await.unwrap();
        let triggered = admin.trigger_manual_run(job.id, None, None, at(8, 0)).await.unwrap();

        let (runs, total) = admin.list_runs(job.id, &RunQuery::default()).await.unwrap();
        assert_eq!((runs.len(), total), (1, 1));

        let query = RunQuery {
            page_size: 201,
            ..RunQuery::default()
        };
        assert!(matches!(admin.list_runs(job.id, &query).await, Err(AdminError::Validation(_))));

        let err = admin
            .list_run_steps(other.id, triggered.run_id, 0, 50)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), RUN_NOT_FOUND);
        assert!(admin.list_run_steps(job.id, triggered.run_id, 0, 50).await.is_ok());
    }

    #[tokio::test]
    async fn delete_removes_the_job() {
        let (admin, _store, _inbox) = admin(60);
        let job = admin.create_job(triggered_draft(), None, at(8, 0)).await.unwrap();
        admin.delete_job(job.id, None).await.unwrap();
        assert!(matches!(admin.get_job(job.id).await, Err(AdminError::NotFound(_))));
        assert!(admin.list_jobs(None).await.unwrap().is_empty());
    }

    #[test]
    fn catalog_passthrough_is_sorted() {
        let (admin, _store, _inbox) = admin(60);
        let keys = admin.workflow_keys();
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        assert_eq!(keys, sorted);
        assert!(!admin.step_catalog().is_empty());
    }
}
