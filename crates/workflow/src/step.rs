//! The step contract.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use forgejobs_core::{JobId, RunId, StepStatus, TenantId, TriggerEvent};
use serde_json::{Map, Value as JsonValue};
use tokio::time::Instant;

use crate::config::JobConfig;
use crate::error::StepError;
use crate::key::StepKey;

/// JSON object produced by a successful (or skipped) step.
pub type StepOutput = Map<String, JsonValue>;

/// Outcome of one step attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum StepResult {
    Success(StepOutput),
    Skipped { reason: String, output: Option<StepOutput> },
    Failure(String),
    Timeout(String),
}

impl StepResult {
    pub fn success(output: StepOutput) -> Self {
        StepResult::Success(output)
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        StepResult::Skipped {
            reason: reason.into(),
            output: None,
        }
    }

    pub fn skipped_with(reason: impl Into<String>, output: StepOutput) -> Self {
        StepResult::Skipped {
            reason: reason.into(),
            output: Some(output),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        StepResult::Failure(message.into())
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        StepResult::Timeout(message.into())
    }

    pub fn status(&self) -> StepStatus {
        match self {
            StepResult::Success(_) => StepStatus::Success,
            StepResult::Skipped { .. } => StepStatus::Skipped,
            StepResult::Failure(_) => StepStatus::Failure,
            StepResult::Timeout(_) => StepStatus::Timeout,
        }
    }

    pub fn output(&self) -> Option<&StepOutput> {
        match self {
            StepResult::Success(output) => Some(output),
            StepResult::Skipped { output, .. } => output.as_ref(),
            StepResult::Failure(_) | StepResult::Timeout(_) => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            StepResult::Success(_) => None,
            StepResult::Skipped { reason, .. } => Some(reason),
            StepResult::Failure(msg) | StepResult::Timeout(msg) => Some(msg),
        }
    }
}

/// Everything a step may read while running.
#[derive(Debug, Clone)]
pub struct StepContext<'a> {
    pub tenant_id: TenantId,
    pub run_id: RunId,
    pub job_id: JobId,
    pub job_config: &'a JobConfig,
    /// Outputs of steps that already succeeded in this run, keyed by step id.
    pub previous_outputs: &'a BTreeMap<String, StepOutput>,
    /// The event that caused this run, for trigger-driven runs.
    pub trigger_event: Option<&'a TriggerEvent>,
    pub deadline: Instant,
    pub now: DateTime<Utc>,
}

impl StepContext<'_> {
    pub fn remaining(&self) -> std::time::Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn output_of(&self, step_id: &str) -> Option<&StepOutput> {
        self.previous_outputs.get(step_id)
    }
}

/// A unit of workflow execution with a typed configuration.
#[async_trait]
pub trait Step: Send + Sync + 'static {
    type Config: Send + Sync;

    const KEY: StepKey;

    async fn run(&self, ctx: &StepContext<'_>, config: &Self::Config) -> Result<StepResult, StepError>;

    /// Integration checks reported by dry runs; never executes anything.
    fn preflight(&self, _step_id: &str, _config: &Self::Config, _job_config: &JobConfig) -> Vec<String> {
        Vec::new()
    }
}

/// Build a [`StepOutput`] from a `json!({...})` literal.
pub(crate) fn object(value: JsonValue) -> StepOutput {
    match value {
        JsonValue::Object(map) => map,
        _ => StepOutput::new(),
    }
}
