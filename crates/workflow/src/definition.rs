//! Workflow definitions: ordered step lists built from a job's config.

use serde_json::{Value as JsonValue, json};

use crate::config::{JobConfig, StepConfig};
use crate::error::WorkflowError;
use crate::key::{StepKey, WorkflowKey};

#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowStepDefinition {
    pub step_id: String,
    pub step_key: StepKey,
    pub config: StepConfig,
    pub depends_on: Vec<String>,
}

impl WorkflowStepDefinition {
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts().max(1)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowDefinition {
    pub workflow_key: WorkflowKey,
    pub job_config: JobConfig,
    pub steps: Vec<WorkflowStepDefinition>,
}

impl WorkflowDefinition {
    pub fn step_ids(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.step_id.as_str())
    }
}

/// Build the definition for `workflow_key`, parsing every step config.
pub fn build_workflow_definition(workflow_key: &str, job_config: &JsonValue) -> Result<WorkflowDefinition, WorkflowError> {
    let key: WorkflowKey = workflow_key.parse()?;
    let job_config = JobConfig::from_value(job_config)?;
    key.build(job_config)
}

/// Accumulates steps, each depending on the one before it.
struct Chain<'a> {
    job_config: &'a JobConfig,
    steps: Vec<WorkflowStepDefinition>,
}

impl<'a> Chain<'a> {
    fn new(job_config: &'a JobConfig) -> Self {
        Self {
            job_config,
            steps: Vec::new(),
        }
    }

    fn then(self, key: StepKey) -> Result<Self, WorkflowError> {
        self.then_with_defaults(key, JsonValue::Null)
    }

    /// Add `key`, filling any field absent from the submitted config from `defaults`.
    fn then_with_defaults(mut self, key: StepKey, defaults: JsonValue) -> Result<Self, WorkflowError> {
        let step_id = key.as_str().to_string();
        let mut raw = self.job_config.step_config(&step_id).cloned().unwrap_or(JsonValue::Null);
        if let JsonValue::Object(defaults) = defaults {
            if raw.is_null() {
                raw = JsonValue::Object(Default::default());
            }
            if let JsonValue::Object(submitted) = &mut raw {
                for (field, value) in defaults {
                    submitted.entry(field).or_insert(value);
                }
            }
        }

        let config = StepConfig::parse(key, &step_id, &raw)?;
        let depends_on = self.steps.last().map(|s| vec![s.step_id.clone()]).unwrap_or_default();
        self.steps.push(WorkflowStepDefinition {
            step_id,
            step_key: key,
            config,
            depends_on,
        });
        Ok(self)
    }

    fn finish(self, workflow_key: WorkflowKey) -> WorkflowDefinition {
        WorkflowDefinition {
            workflow_key,
            job_config: self.job_config.clone(),
            steps: self.steps,
        }
    }
}

impl WorkflowKey {
    /// Build this workflow's definition from a parsed job config.
    pub fn build(self, job_config: JobConfig) -> Result<WorkflowDefinition, WorkflowError> {
        let chain = Chain::new(&job_config);
        let chain = match self {
            WorkflowKey::WeeklyContentSummary => chain
                .then(StepKey::FetchChatHistory)?
                .then(StepKey::SummarizeContent)?
                .then(StepKey::PostMessageDigest)?,
            WorkflowKey::DailyChannelWebBrief => chain
                .then(StepKey::ChannelInput)?
                .then(StepKey::WebSearch)?
                .then_with_defaults(
                    StepKey::SummarizeContent,
                    json!({
                        "input_step_id": StepKey::ChannelInput.as_str(),
                        "context_step_ids": [StepKey::WebSearch.as_str()],
                    }),
                )?
                .then(StepKey::DocumentOutput)?,
            WorkflowKey::EmailCrmProcessor => chain
                .then(StepKey::FetchTriggerPayload)?
                .then(StepKey::ProcessEmailCrm)?,
        };
        Ok(chain.finish(self))
    }
}
