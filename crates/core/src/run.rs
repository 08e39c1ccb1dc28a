//! Runs and per-step run records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::id::{JobId, RunId, TriggerEventId};

/// Run lifecycle: `PENDING → STARTED → {SUCCESS, FAILURE, SKIPPED, TIMEOUT}`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Started,
    Success,
    Failure,
    Skipped,
    Timeout,
}

impl_str_enum!(RunStatus, "run status", {
    Pending => "PENDING",
    Started => "STARTED",
    Success => "SUCCESS",
    Failure => "FAILURE",
    Skipped => "SKIPPED",
    Timeout => "TIMEOUT",
});

impl RunStatus {
    pub const TERMINAL: [RunStatus; 4] = [
        RunStatus::Success,
        RunStatus::Failure,
        RunStatus::Skipped,
        RunStatus::Timeout,
    ];

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    /// PENDING and STARTED runs count against concurrency limits.
    pub fn is_active(&self) -> bool {
        matches!(self, RunStatus::Pending | RunStatus::Started)
    }
}

/// Outcome of a single step attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Started,
    Success,
    Failure,
    Skipped,
    Timeout,
}

impl_str_enum!(StepStatus, "step status", {
    Started => "STARTED",
    Success => "SUCCESS",
    Failure => "FAILURE",
    Skipped => "SKIPPED",
    Timeout => "TIMEOUT",
});

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepStatus::Started)
    }

    /// Run status a terminal step outcome ends the run with.
    pub fn run_status(&self) -> RunStatus {
        match self {
            StepStatus::Started => RunStatus::Started,
            StepStatus::Success => RunStatus::Success,
            StepStatus::Failure => RunStatus::Failure,
            StepStatus::Skipped => RunStatus::Skipped,
            StepStatus::Timeout => RunStatus::Timeout,
        }
    }
}

/// Why a run exists. A run carries at most one origin reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "origin", rename_all = "snake_case")]
pub enum RunOrigin {
    Scheduled { scheduled_for: DateTime<Utc> },
    TriggerEvent { trigger_event_id: TriggerEventId },
    Manual { idempotency_key: Option<String> },
}

/// A run about to be inserted in PENDING state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRun {
    pub job_id: JobId,
    pub origin: RunOrigin,
}

impl NewRun {
    pub fn scheduled(job_id: JobId, scheduled_for: DateTime<Utc>) -> Self {
        Self {
            job_id,
            origin: RunOrigin::Scheduled { scheduled_for },
        }
    }

    pub fn for_event(job_id: JobId, trigger_event_id: TriggerEventId) -> Self {
        Self {
            job_id,
            origin: RunOrigin::TriggerEvent { trigger_event_id },
        }
    }

    pub fn manual(job_id: JobId, idempotency_key: Option<String>) -> Self {
        Self {
            job_id,
            origin: RunOrigin::Manual { idempotency_key },
        }
    }

    pub fn into_run(self, now: DateTime<Utc>) -> Run {
        let (scheduled_for, trigger_event_id, idempotency_key) = match self.origin {
            RunOrigin::Scheduled { scheduled_for } => (Some(scheduled_for), None, None),
            RunOrigin::TriggerEvent { trigger_event_id } => (None, Some(trigger_event_id), None),
            RunOrigin::Manual { idempotency_key } => (None, None, idempotency_key),
        };
        Run {
            id: RunId::new(),
            job_id: self.job_id,
            status: RunStatus::Pending,
            scheduled_for,
            trigger_event_id,
            idempotency_key,
            created_at: now,
            started_at: None,
            finished_at: None,
            error_message: None,
            output_preview: None,
            metrics: None,
        }
    }
}

/// One execution attempt of a custom job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub job_id: JobId,
    pub status: RunStatus,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub trigger_event_id: Option<TriggerEventId>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub output_preview: Option<String>,
    pub metrics: Option<JsonValue>,
}

/// Persisted state of one workflow step within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStep {
    pub run_id: RunId,
    pub step_index: u32,
    pub step_id: String,
    pub step_key: String,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub output: Option<JsonValue>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_run_carries_single_origin() {
        let job_id = JobId::new();
        let event_id = TriggerEventId::new();
        let run = NewRun::for_event(job_id, event_id).into_run(Utc::now());
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.trigger_event_id, Some(event_id));
        assert!(run.scheduled_for.is_none());
        assert!(run.idempotency_key.is_none());
    }

    #[test]
    fn terminal_and_active_partition_statuses() {
        for status in RunStatus::ALL {
            assert_ne!(status.is_active(), status.is_terminal());
        }
        assert_eq!(RunStatus::TERMINAL.len(), 4);
        assert!(RunStatus::TERMINAL.iter().all(RunStatus::is_terminal));
    }

    #[test]
    fn step_outcome_maps_to_run_status() {
        assert_eq!(StepStatus::Timeout.run_status(), RunStatus::Timeout);
        assert_eq!(StepStatus::Skipped.run_status(), RunStatus::Skipped);
        assert_eq!("FAILURE".parse::<StepStatus>().unwrap(), StepStatus::Failure);
    }
}
