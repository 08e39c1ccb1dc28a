use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use tracing::warn;

use crate::config::{ChannelInputConfig, JobConfig};
use crate::error::StepError;
use crate::key::StepKey;
use crate::services::{ChannelReader, require};
use crate::step::{Step, StepContext, StepResult, object};

/// Collects recent messages from one or more messaging channels.
///
/// Per-channel errors are tolerated as long as at least one channel yields messages.
pub struct ChannelInputStep {
    reader: Option<Arc<dyn ChannelReader>>,
    pacing: Duration,
}

impl ChannelInputStep {
    pub fn new(reader: Option<Arc<dyn ChannelReader>>, pacing: Duration) -> Self {
        Self { reader, pacing }
    }
}

#[async_trait]
impl Step for ChannelInputStep {
    type Config = ChannelInputConfig;

    const KEY: StepKey = StepKey::ChannelInput;

    async fn run(&self, ctx: &StepContext<'_>, config: &Self::Config) -> Result<StepResult, StepError> {
        let reader = match require(&self.reader, "Channel reader") {
            Ok(reader) => reader,
            Err(msg) => return Ok(StepResult::failure(msg)),
        };
        if config.channel_ids.is_empty() {
            return Ok(StepResult::failure("Missing channel_ids for channel_input step."));
        }

        let mut messages = Vec::new();
        let mut errors = Vec::new();
        for channel_id in &config.channel_ids {
            match reader
                .read_channel(
                    channel_id,
                    config.oldest.as_deref(),
                    config.latest.as_deref(),
                    config.max_messages_per_channel,
                )
                .await
            {
                Ok(batch) => {
                    messages.extend(batch.into_iter().map(|m| {
                        json!({
                            "channel_id": channel_id,
                            "ts": m.ts,
                            "user": m.user,
                            "text": m.text,
                        })
                    }));
                    if !self.pacing.is_zero() {
                        tokio::time::sleep(self.pacing).await;
                    }
                }
                Err(e) => {
                    warn!(run_id = %ctx.run_id, channel_id = %channel_id, error = %e, "channel read failed");
                    errors.push(json!({"channel_id": channel_id, "error": e.to_string()}));
                }
            }
        }

        if messages.is_empty() && !errors.is_empty() {
            return Ok(StepResult::failure(format!(
                "Channel input failed for all channels: {}",
                JsonValue::Array(errors)
            )));
        }

        Ok(StepResult::success(object(json!({
            "message_count": messages.len(),
            "messages": messages,
            "errors": errors,
        }))))
    }

    fn preflight(&self, step_id: &str, config: &Self::Config, _job_config: &JobConfig) -> Vec<String> {
        let mut errors = Vec::new();
        if self.reader.is_none() {
            errors.push(format!("{step_id}: channel reader is not configured."));
        }
        if config.channel_ids.is_empty() {
            errors.push(format!("{step_id}: missing channel_ids in step config."));
        }
        errors
    }
}
