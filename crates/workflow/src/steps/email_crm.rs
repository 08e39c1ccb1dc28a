use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use tracing::error;

use crate::config::{JobConfig, ProcessEmailCrmConfig};
use crate::error::StepError;
use crate::key::StepKey;
use crate::services::{CrmAgent, require};
use crate::step::{Step, StepContext, StepOutput, StepResult, object};
use crate::steps::{required_output, str_field, take_chars};

const TOOL_RESULT_PREVIEW_CHARS: usize = 500;

/// Hands an inbound email to a CRM agent that upserts contacts and logs the interaction.
pub struct ProcessEmailCrmStep {
    agent: Option<Arc<dyn CrmAgent>>,
}

impl ProcessEmailCrmStep {
    pub fn new(agent: Option<Arc<dyn CrmAgent>>) -> Self {
        Self { agent }
    }
}

fn internal_domains_block(domains: &[String]) -> String {
    if domains.is_empty() {
        return String::new();
    }
    let listed: Vec<String> = domains.iter().map(|d| format!("@{d}")).collect();
    format!(
        "INTERNAL TEAM DOMAINS: {}\n\
         Emails from these domains are from your own team members. \
         Do NOT create or update CRM contacts/organizations for them. \
         Instead, focus on any external contacts mentioned in the email.",
        listed.join(", ")
    )
}

pub(crate) fn build_prompt(email: &StepOutput, internal_domains: &[String]) -> String {
    format!(
        "You are processing an inbound email on behalf of a CRM automation.\n\
         {domains}\n\
         Perform the following steps using the available CRM tools:\n\n\
         1. Determine who the external contact is in this email. If the sender is from an \
         internal domain, look at the body, forwarded content, or signature blocks to find the \
         real external contact; otherwise the sender is the external contact.\n\
         2. Search the CRM for the external contact's email address.\n\
         3. If no matching contact is found, create a new contact with available information \
         (name, email, phone, title, company).\n\
         4. Search the CRM for the external contact's organization.\n\
         5. If no matching organization is found, create a new organization record.\n\
         6. Log this email as an interaction on the contact record, with relevant context from the body.\n\n\
         Do NOT create or update contacts/organizations for internal domains.\n\n\
         Here is the email to process:\n\n\
         From: {from}\nTo: {to}\nSubject: {subject}\nDate: {date}\n\nBody:\n{body}\n\n\
         After completing all steps, reply with a short summary of what you did.",
        domains = internal_domains_block(internal_domains),
        from = str_field(email, "from"),
        to = str_field(email, "to"),
        subject = str_field(email, "subject"),
        date = str_field(email, "date"),
        body = str_field(email, "body"),
    )
}

#[async_trait]
impl Step for ProcessEmailCrmStep {
    type Config = ProcessEmailCrmConfig;

    const KEY: StepKey = StepKey::ProcessEmailCrm;

    async fn run(&self, ctx: &StepContext<'_>, config: &Self::Config) -> Result<StepResult, StepError> {
        let Some(persona_id) = config.persona_id else {
            return Ok(StepResult::failure(
                "persona_id is not configured in step_config. A CRM-focused persona must be specified.",
            ));
        };
        let email = match required_output(ctx.output_of(&config.input_step_id), &config.input_step_id) {
            Ok(email) => email,
            Err(msg) => return Ok(StepResult::failure(msg)),
        };
        let agent = match require(&self.agent, "CRM agent") {
            Ok(agent) => agent,
            Err(msg) => return Ok(StepResult::failure(msg)),
        };

        let prompt = build_prompt(email, &config.internal_domains);
        let response = match agent.process(persona_id, &prompt).await {
            Ok(response) => response,
            Err(e) => {
                error!(run_id = %ctx.run_id, error = %e, "crm agent call failed");
                return Ok(StepResult::failure(format!("CRM agent raised an error: {e}")));
            }
        };
        if let Some(err) = response.error.filter(|e| !e.is_empty()) {
            return Ok(StepResult::failure(format!("CRM agent returned an error: {err}")));
        }

        let tool_calls: Vec<JsonValue> = response
            .tool_calls
            .iter()
            .map(|tc| {
                json!({
                    "tool_name": tc.tool_name,
                    "tool_result_preview": take_chars(&tc.tool_result, TOOL_RESULT_PREVIEW_CHARS),
                })
            })
            .collect();

        Ok(StepResult::success(object(json!({
            "answer": response.answer,
            "tool_calls": tool_calls,
            "tool_call_count": response.tool_calls.len(),
            "chat_session_id": response.chat_session_id,
            "message_id": response.message_id,
        }))))
    }

    fn preflight(&self, step_id: &str, config: &Self::Config, _job_config: &JobConfig) -> Vec<String> {
        let mut errors = Vec::new();
        if config.persona_id.is_none() {
            errors.push(format!("{step_id}: missing persona_id in step config."));
        }
        if self.agent.is_none() {
            errors.push(format!("{step_id}: CRM agent is not configured."));
        }
        errors
    }
}
