//! Built-in steps.

mod channel_input;
mod chat_history;
mod document_output;
mod email_crm;
mod post_digest;
mod summarize;
mod trigger_payload;
mod web_search;

pub use channel_input::ChannelInputStep;
pub use chat_history::FetchChatHistoryStep;
pub use document_output::DocumentOutputStep;
pub use email_crm::ProcessEmailCrmStep;
pub use post_digest::PostMessageDigestStep;
pub use summarize::SummarizeContentStep;
pub use trigger_payload::FetchTriggerPayloadStep;
pub use web_search::WebSearchStep;

use serde_json::Value as JsonValue;

use crate::step::StepOutput;

/// The step output `input_step_id` names, or the standard failure text.
pub(crate) fn required_output<'a>(
    outputs: Option<&'a StepOutput>,
    input_step_id: &str,
) -> Result<&'a StepOutput, String> {
    outputs.ok_or_else(|| format!("Missing required step output: {input_step_id}"))
}

/// Trimmed string field, empty when absent or not a string.
pub(crate) fn str_field<'a>(output: &'a StepOutput, field: &str) -> &'a str {
    output.get(field).and_then(JsonValue::as_str).map(str::trim).unwrap_or("")
}

/// First `max` characters of `text`.
pub(crate) fn take_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use forgejobs_core::{JobId, RunId, TenantId, TriggerEvent};
    use serde_json::Value as JsonValue;

    use crate::config::JobConfig;
    use crate::step::{StepContext, StepOutput, object};

    /// Owns everything a [`StepContext`] borrows.
    pub struct Fixture {
        pub job_config: JobConfig,
        pub outputs: BTreeMap<String, StepOutput>,
        pub event: Option<TriggerEvent>,
    }

    impl Fixture {
        pub fn new() -> Self {
            Self {
                job_config: JobConfig::default(),
                outputs: BTreeMap::new(),
                event: None,
            }
        }

        pub fn with_output(mut self, step_id: &str, output: JsonValue) -> Self {
            self.outputs.insert(step_id.to_string(), object(output));
            self
        }

        pub fn ctx(&self) -> StepContext<'_> {
            StepContext {
                tenant_id: TenantId::new(),
                run_id: RunId::new(),
                job_id: JobId::new(),
                job_config: &self.job_config,
                previous_outputs: &self.outputs,
                trigger_event: self.event.as_ref(),
                deadline: tokio::time::Instant::now() + Duration::from_secs(60),
                now: Utc.with_ymd_and_hms(2024, 6, 3, 9, 0, 0).unwrap(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_chars_respects_char_boundaries() {
        assert_eq!(take_chars("héllo", 2), "hé");
        assert_eq!(take_chars("hi", 10), "hi");
    }
}
