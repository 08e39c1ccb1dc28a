use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use serde_json::{Value as JsonValue, json};

use crate::config::{FetchChatHistoryConfig, JobConfig};
use crate::error::StepError;
use crate::key::StepKey;
use crate::services::{ChatHistorySource, require};
use crate::step::{Step, StepContext, StepResult, object};

/// Reads USER/ASSISTANT chat messages from a trailing time window.
pub struct FetchChatHistoryStep {
    source: Option<Arc<dyn ChatHistorySource>>,
}

impl FetchChatHistoryStep {
    pub fn new(source: Option<Arc<dyn ChatHistorySource>>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl Step for FetchChatHistoryStep {
    type Config = FetchChatHistoryConfig;

    const KEY: StepKey = StepKey::FetchChatHistory;

    async fn run(&self, ctx: &StepContext<'_>, config: &Self::Config) -> Result<StepResult, StepError> {
        let source = match require(&self.source, "Chat history source") {
            Ok(source) => source,
            Err(msg) => return Ok(StepResult::failure(msg)),
        };

        if let Some(reason) = source.unavailable_reason() {
            return Ok(StepResult::skipped_with(
                "Query history mode does not permit this job input.",
                object(json!({
                    "message_count": 0,
                    "window_start": JsonValue::Null,
                    "window_end": JsonValue::Null,
                    "skip_reason": reason,
                })),
            ));
        }

        let window_end = ctx.now;
        let window_start = window_end - Duration::days(i64::from(config.window_days.max(1)));
        let messages = source
            .fetch_messages(ctx.tenant_id, window_start, window_end, config.max_messages)
            .await?;

        let items: Vec<JsonValue> = messages
            .iter()
            .map(|m| {
                json!({
                    "chat_session_id": m.chat_session_id,
                    "message_id": m.message_id,
                    "message_type": m.message_type,
                    "time_sent": m.time_sent.to_rfc3339(),
                    "message": m.message,
                })
            })
            .collect();

        let output = object(json!({
            "message_count": items.len(),
            "window_start": window_start.to_rfc3339(),
            "window_end": window_end.to_rfc3339(),
            "messages": items,
        }));

        if messages.len() < config.min_messages as usize {
            return Ok(StepResult::skipped_with("Insufficient messages in window.", output));
        }
        Ok(StepResult::success(output))
    }

    fn preflight(&self, step_id: &str, _config: &Self::Config, _job_config: &JobConfig) -> Vec<String> {
        if self.source.is_none() {
            return vec![format!("{step_id}: chat history source is not configured.")];
        }
        Vec::new()
    }
}
