//! Step dispatch.
//!
//! [`StepRegistry`] holds one instance of every built-in step for the life of
//! the process, so per-step state (the web search cache) survives across runs.

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::config::StepConfig;
use crate::definition::{WorkflowDefinition, WorkflowStepDefinition, build_workflow_definition};
use crate::error::{StepError, WorkflowError};
use crate::services::StepServices;
use crate::step::{Step, StepContext, StepResult};
use crate::steps::{
    ChannelInputStep, DocumentOutputStep, FetchChatHistoryStep, FetchTriggerPayloadStep, PostMessageDigestStep,
    ProcessEmailCrmStep, SummarizeContentStep, WebSearchStep,
};

/// What the run executor needs from the workflow layer.
#[async_trait]
pub trait WorkflowRuntime: Send + Sync + 'static {
    /// Build (and validate) the definition for a job.
    fn build_workflow(&self, workflow_key: &str, job_config: &JsonValue) -> Result<WorkflowDefinition, WorkflowError> {
        build_workflow_definition(workflow_key, job_config)
    }

    async fn run_step(&self, step: &WorkflowStepDefinition, ctx: &StepContext<'_>) -> Result<StepResult, StepError>;

    /// Integration problems each step can detect without executing.
    fn preflight(&self, definition: &WorkflowDefinition) -> Vec<String>;
}

pub struct StepRegistry {
    fetch_chat_history: FetchChatHistoryStep,
    channel_input: ChannelInputStep,
    web_search: WebSearchStep,
    summarize_content: SummarizeContentStep,
    post_message_digest: PostMessageDigestStep,
    document_output: DocumentOutputStep,
    fetch_trigger_payload: FetchTriggerPayloadStep,
    process_email_crm: ProcessEmailCrmStep,
}

impl StepRegistry {
    pub fn new(services: StepServices) -> Self {
        Self {
            fetch_chat_history: FetchChatHistoryStep::new(services.chat_history),
            channel_input: ChannelInputStep::new(services.channels, services.pacing),
            web_search: WebSearchStep::new(services.search),
            summarize_content: SummarizeContentStep::new(services.summarizer),
            post_message_digest: PostMessageDigestStep::new(services.poster, services.pacing),
            document_output: DocumentOutputStep::new(services.documents),
            fetch_trigger_payload: FetchTriggerPayloadStep,
            process_email_crm: ProcessEmailCrmStep::new(services.crm),
        }
    }

    pub fn web_search(&self) -> &WebSearchStep {
        &self.web_search
    }
}

#[async_trait]
impl WorkflowRuntime for StepRegistry {
    async fn run_step(&self, step: &WorkflowStepDefinition, ctx: &StepContext<'_>) -> Result<StepResult, StepError> {
        match &step.config {
            StepConfig::FetchChatHistory(c) => self.fetch_chat_history.run(ctx, c).await,
            StepConfig::ChannelInput(c) => self.channel_input.run(ctx, c).await,
            StepConfig::WebSearch(c) => self.web_search.run(ctx, c).await,
            StepConfig::SummarizeContent(c) => self.summarize_content.run(ctx, c).await,
            StepConfig::PostMessageDigest(c) => self.post_message_digest.run(ctx, c).await,
            StepConfig::DocumentOutput(c) => self.document_output.run(ctx, c).await,
            StepConfig::FetchTriggerPayload(c) => self.fetch_trigger_payload.run(ctx, c).await,
            StepConfig::ProcessEmailCrm(c) => self.process_email_crm.run(ctx, c).await,
        }
    }

    fn preflight(&self, definition: &WorkflowDefinition) -> Vec<String> {
        let job_config = &definition.job_config;
        definition
            .steps
            .iter()
            .flat_map(|step| {
                let id = step.step_id.as_str();
                match &step.config {
                    StepConfig::FetchChatHistory(c) => self.fetch_chat_history.preflight(id, c, job_config),
                    StepConfig::ChannelInput(c) => self.channel_input.preflight(id, c, job_config),
                    StepConfig::WebSearch(c) => self.web_search.preflight(id, c, job_config),
                    StepConfig::SummarizeContent(c) => self.summarize_content.preflight(id, c, job_config),
                    StepConfig::PostMessageDigest(c) => self.post_message_digest.preflight(id, c, job_config),
                    StepConfig::DocumentOutput(c) => self.document_output.preflight(id, c, job_config),
                    StepConfig::FetchTriggerPayload(c) => self.fetch_trigger_payload.preflight(id, c, job_config),
                    StepConfig::ProcessEmailCrm(c) => self.process_email_crm.preflight(id, c, job_config),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::testing::Fixture;
    use forgejobs_core::{JobId, NewTriggerEvent, StepStatus};
    use serde_json::json;

    #[tokio::test]
    async fn dispatches_on_config_variant() {
        let registry = StepRegistry::new(StepServices::default());
        let def = registry
            .build_workflow("email_crm_processor", &json!({"step_configs": {"process_email_crm": {"persona_id": 3}}}))
            .unwrap();

        let mut fx = Fixture::new();
        fx.event = Some(
            NewTriggerEvent {
                job_id: JobId::new(),
                source_type: "email".into(),
                source_event_id: None,
                dedupe_key: "k".into(),
                dedupe_key_prefix: None,
                event_time: None,
                payload: None,
            }
            .into_event(chrono::Utc::now()),
        );
        let result = registry.run_step(&def.steps[0], &fx.ctx()).await.unwrap();
        assert_eq!(result, StepResult::skipped("Trigger event payload is empty."));
    }

    #[test]
    fn preflight_collects_across_steps() {
        let registry = StepRegistry::new(StepServices::default());
        let def = registry.build_workflow("weekly_content_summary", &json!({})).unwrap();
        let errors = registry.preflight(&def);
        assert_eq!(
            errors,
            vec![
                "fetch_chat_history: chat history source is not configured.",
                "summarize_content: summarizer is not configured.",
                "post_message_digest: message poster is not configured.",
                "post_message_digest: missing channel_id in step or job config.",
            ]
        );
    }

    #[tokio::test]
    async fn web_search_without_provider_fails_cleanly() {
        let registry = StepRegistry::new(StepServices::default());
        let def = registry.build_workflow("daily_channel_web_brief", &json!({})).unwrap();
        let fx = Fixture::new();
        let result = registry.run_step(&def.steps[1], &fx.ctx()).await.unwrap();
        assert_eq!(result.status(), StepStatus::Failure);
        assert_eq!(registry.web_search().cached_queries(), 0);
    }
}
