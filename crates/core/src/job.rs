//! Custom job definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::{DomainError, DomainResult};
use crate::id::{JobId, TenantId, UserId};
use crate::schedule::{ScheduleSpec, TriggerType};

pub const DEFAULT_RETENTION_DAYS: u32 = 90;
/// About a hundred years; keeps retention cutoffs inside the timestamp range.
pub const MAX_RETENTION_DAYS: u32 = 36_500;

/// Minimum polling interval accepted for trigger sources.
pub const MIN_POLL_INTERVAL_SECONDS: i64 = 60;

/// Per-job settings for TRIGGERED jobs.
///
/// The admission limits are read by the trigger-event claimer; unknown keys
/// belong to the ingestion collaborator and are preserved as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerSourceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_events_per_claim: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_runs: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl TriggerSourceConfig {
    /// Parse and validate a submitted config.
    pub fn from_value(value: &JsonValue) -> DomainResult<Self> {
        let config: Self = serde_json::from_value(value.clone())
            .map_err(|e| DomainError::validation(format!("invalid trigger_source_config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> DomainResult<()> {
        if matches!(self.poll_interval_seconds, Some(v) if v < MIN_POLL_INTERVAL_SECONDS) {
            return Err(DomainError::validation(
                "trigger_source_config.poll_interval_seconds must be an integer >= 60.",
            ));
        }
        if matches!(self.max_events_per_claim, Some(v) if v < 1) {
            return Err(DomainError::validation(
                "trigger_source_config.max_events_per_claim must be an integer >= 1.",
            ));
        }
        if matches!(self.max_concurrent_runs, Some(v) if v < 1) {
            return Err(DomainError::validation(
                "trigger_source_config.max_concurrent_runs must be an integer >= 1.",
            ));
        }
        Ok(())
    }

    /// Effective concurrency cap; non-positive values mean "unlimited".
    pub fn concurrency_limit(&self) -> Option<u64> {
        self.max_concurrent_runs.filter(|v| *v > 0).map(|v| v as u64)
    }

    /// Effective per-batch cap; non-positive values mean "unlimited".
    pub fn per_claim_limit(&self) -> Option<u64> {
        self.max_events_per_claim.filter(|v| *v > 0).map(|v| v as u64)
    }

    pub fn to_value(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}

/// What starts a job: a wall-clock schedule or external trigger events.
///
/// Exactly one side is ever populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobTrigger {
    Scheduled(ScheduleSpec),
    Triggered {
        source_type: Option<String>,
        source_config: TriggerSourceConfig,
    },
}

impl JobTrigger {
    /// Build a trigger from raw admin fields, validating the side that applies.
    pub fn from_fields(
        trigger_type: TriggerType,
        timezone: Option<&str>,
        hour: Option<i32>,
        minute: Option<i32>,
        day_of_week: Option<i32>,
        source_type: Option<String>,
        source_config: Option<&JsonValue>,
    ) -> DomainResult<Self> {
        if let Some(spec) = ScheduleSpec::from_fields(trigger_type, timezone, hour, minute, day_of_week)? {
            return Ok(JobTrigger::Scheduled(spec));
        }

        let source_config = match source_config {
            Some(JsonValue::Null) | None => TriggerSourceConfig::default(),
            Some(value) => TriggerSourceConfig::from_value(value)?,
        };
        Ok(JobTrigger::Triggered {
            source_type,
            source_config,
        })
    }

    pub fn trigger_type(&self) -> TriggerType {
        match self {
            JobTrigger::Scheduled(spec) => spec.trigger_type(),
            JobTrigger::Triggered { .. } => TriggerType::Triggered,
        }
    }
}

/// A long-lived job definition, edited by admins and advanced by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomJob {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub name: String,
    pub description: Option<String>,
    pub workflow_key: String,
    /// Opaque map interpreted by the workflow registry.
    pub job_config: JsonValue,
    pub enabled: bool,
    pub trigger: JobTrigger,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_scheduled_at: Option<DateTime<Utc>>,
    pub retention_days: u32,
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CustomJob {
    /// A new, enabled job with `next_run_at` computed from `now`.
    pub fn new(
        tenant_id: TenantId,
        name: impl Into<String>,
        workflow_key: impl Into<String>,
        job_config: JsonValue,
        trigger: JobTrigger,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let mut job = Self {
            id: JobId::new(),
            tenant_id,
            name: name.into(),
            description: None,
            workflow_key: workflow_key.into(),
            job_config,
            enabled: true,
            trigger,
            next_run_at: None,
            last_scheduled_at: None,
            retention_days: DEFAULT_RETENTION_DAYS,
            created_by: None,
            created_at: now,
            updated_at: now,
        };
        job.refresh_next_run_at(now)?;
        Ok(job)
    }

    pub fn trigger_type(&self) -> TriggerType {
        self.trigger.trigger_type()
    }

    pub fn schedule(&self) -> Option<&ScheduleSpec> {
        match &self.trigger {
            JobTrigger::Scheduled(spec) => Some(spec),
            JobTrigger::Triggered { .. } => None,
        }
    }

    pub fn trigger_source_config(&self) -> Option<&TriggerSourceConfig> {
        match &self.trigger {
            JobTrigger::Triggered { source_config, .. } => Some(source_config),
            JobTrigger::Scheduled(_) => None,
        }
    }

    /// Recompute `next_run_at`: null when disabled or TRIGGERED.
    pub fn refresh_next_run_at(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.next_run_at = match (&self.trigger, self.enabled) {
            (JobTrigger::Scheduled(spec), true) => Some(spec.next_after(now)?),
            _ => None,
        };
        Ok(())
    }

    /// Record a claimed fire time and move to the next one.
    ///
    /// The next slot is computed from one second past the claimed instant so a
    /// slow scheduler never skips or repeats a slot.
    pub fn advance_schedule(&mut self, scheduled_for: DateTime<Utc>) -> DomainResult<()> {
        let spec = self
            .schedule()
            .ok_or_else(|| DomainError::invariant("only scheduled jobs can be advanced"))?;
        let next = spec.next_after(scheduled_for + chrono::Duration::seconds(1))?;
        self.last_scheduled_at = Some(scheduled_for);
        self.next_run_at = Some(next);
        Ok(())
    }

    pub fn check_invariants(&self) -> DomainResult<()> {
        if self.next_run_at.is_some() && (!self.enabled || !self.trigger_type().is_scheduled()) {
            return Err(DomainError::invariant(
                "next_run_at must be null for disabled or triggered jobs",
            ));
        }
        if self.retention_days == 0 {
            return Err(DomainError::validation("retention_days must be >= 1"));
        }
        if self.retention_days > MAX_RETENTION_DAYS {
            return Err(DomainError::validation(format!(
                "retention_days must be <= {MAX_RETENTION_DAYS}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap()
    }

    fn daily_trigger() -> JobTrigger {
        JobTrigger::from_fields(TriggerType::Daily, Some("UTC"), Some(9), Some(0), None, None, None).unwrap()
    }

    #[test]
    fn new_scheduled_job_gets_next_run_at() {
        let job = CustomJob::new(TenantId::new(), "digest", "weekly_content_summary", json!({}), daily_trigger(), at(8, 0))
            .unwrap();
        assert_eq!(job.next_run_at, Some(at(9, 0)));
        job.check_invariants().unwrap();
    }

    #[test]
    fn disabled_or_triggered_jobs_have_no_next_run() {
        let mut job =
            CustomJob::new(TenantId::new(), "digest", "weekly_content_summary", json!({}), daily_trigger(), at(8, 0))
                .unwrap();
        job.enabled = false;
        job.refresh_next_run_at(at(8, 0)).unwrap();
        assert!(job.next_run_at.is_none());

        let triggered = JobTrigger::from_fields(TriggerType::Triggered, None, None, None, None, Some("email".into()), None)
            .unwrap();
        let job = CustomJob::new(TenantId::new(), "crm", "email_crm_processor", json!({}), triggered, at(8, 0)).unwrap();
        assert!(job.next_run_at.is_none());
        assert!(job.schedule().is_none());
        assert_eq!(job.trigger_type(), TriggerType::Triggered);
    }

    #[test]
    fn retention_days_must_fit_the_timestamp_range() {
        let mut job =
            CustomJob::new(TenantId::new(), "digest", "weekly_content_summary", json!({}), daily_trigger(), at(8, 0))
                .unwrap();
        job.retention_days = MAX_RETENTION_DAYS;
        assert!(job.check_invariants().is_ok());
        job.retention_days = u32::MAX;
        assert!(matches!(job.check_invariants(), Err(DomainError::Validation(_))));
    }

    #[test]
    fn advance_schedule_seeds_one_second_past_claimed_slot() {
        let mut job =
            CustomJob::new(TenantId::new(), "digest", "weekly_content_summary", json!({}), daily_trigger(), at(8, 0))
                .unwrap();
        job.advance_schedule(at(9, 0)).unwrap();
        assert_eq!(job.last_scheduled_at, Some(at(9, 0)));
        assert_eq!(job.next_run_at, Some(Utc.with_ymd_and_hms(2024, 1, 2, 9, 0, 0).unwrap()));
    }

    #[test]
    fn trigger_source_config_validation() {
        let ok = TriggerSourceConfig::from_value(&json!({
            "max_concurrent_runs": 2,
            "max_events_per_claim": 5,
            "mailbox": "inbox"
        }))
        .unwrap();
        assert_eq!(ok.concurrency_limit(), Some(2));
        assert_eq!(ok.per_claim_limit(), Some(5));
        assert_eq!(ok.extra.get("mailbox"), Some(&json!("inbox")));

        let err = TriggerSourceConfig::from_value(&json!({"poll_interval_seconds": 30})).unwrap_err();
        assert_eq!(
            err,
            DomainError::validation("trigger_source_config.poll_interval_seconds must be an integer >= 60.")
        );
        assert!(TriggerSourceConfig::from_value(&json!({"max_concurrent_runs": 0})).is_err());
        assert!(TriggerSourceConfig::from_value(&json!({"max_events_per_claim": "many"})).is_err());
    }

    #[test]
    fn scheduled_fields_take_precedence_over_source_fields() {
        let trigger = JobTrigger::from_fields(
            TriggerType::Weekly,
            Some("Europe/Berlin"),
            Some(7),
            Some(30),
            Some(4),
            Some("ignored".into()),
            Some(&json!({"max_concurrent_runs": 1})),
        )
        .unwrap();
        assert!(matches!(trigger, JobTrigger::Scheduled(_)));
        assert_eq!(trigger.trigger_type(), TriggerType::Weekly);
    }
}
