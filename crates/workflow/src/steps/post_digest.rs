use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::config::{JobConfig, PostMessageDigestConfig};
use crate::error::StepError;
use crate::key::StepKey;
use crate::services::{MessagePoster, require};
use crate::step::{Step, StepContext, StepResult, object};
use crate::steps::{required_output, str_field, take_chars};

/// Messaging platforms reject longer message bodies.
const MESSAGE_CHUNK_CHARS: usize = 3000;

/// Posts a summary to a channel; overflow chunks go into the first message's thread.
pub struct PostMessageDigestStep {
    poster: Option<Arc<dyn MessagePoster>>,
    pacing: Duration,
}

impl PostMessageDigestStep {
    pub fn new(poster: Option<Arc<dyn MessagePoster>>, pacing: Duration) -> Self {
        Self { poster, pacing }
    }

    fn channel_id<'a>(config: &'a PostMessageDigestConfig, job_config: &'a JobConfig) -> Option<&'a str> {
        config
            .channel_id
            .as_deref()
            .or(job_config.channel_id.as_deref())
            .filter(|c| !c.trim().is_empty())
    }
}

/// Split on whitespace into pieces of at most `limit` characters.
pub(crate) fn split_text(text: &str, limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut remaining = text;
    loop {
        if remaining.chars().count() <= limit {
            chunks.push(remaining.to_string());
            return chunks;
        }
        let window = take_chars(remaining, limit);
        let split_at = match window.rfind(' ') {
            Some(0) | None => window.len(),
            Some(idx) => idx,
        };
        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }
}

#[async_trait]
impl Step for PostMessageDigestStep {
    type Config = PostMessageDigestConfig;

    const KEY: StepKey = StepKey::PostMessageDigest;

    async fn run(&self, ctx: &StepContext<'_>, config: &Self::Config) -> Result<StepResult, StepError> {
        let input = match required_output(ctx.output_of(&config.input_step_id), &config.input_step_id) {
            Ok(input) => input,
            Err(msg) => return Ok(StepResult::failure(msg)),
        };

        let summary = str_field(input, "summary");
        if summary.is_empty() {
            return Ok(StepResult::skipped_with(
                "No summary content to post.",
                object(json!({"posted": false, "reason": "empty_summary"})),
            ));
        }

        let poster = match require(&self.poster, "Message poster") {
            Ok(p) => p,
            Err(msg) => return Ok(StepResult::failure(msg)),
        };
        let Some(channel_id) = Self::channel_id(config, ctx.job_config) else {
            return Ok(StepResult::failure("Missing channel_id in step/job configuration."));
        };

        let chunks = split_text(summary, MESSAGE_CHUNK_CHARS);
        let root = match poster.post(channel_id, &chunks[0], None).await {
            Ok(posted) => posted,
            Err(e) => return Ok(StepResult::failure(format!("Failed to post message digest: {e}"))),
        };
        for chunk in &chunks[1..] {
            if !self.pacing.is_zero() {
                tokio::time::sleep(self.pacing).await;
            }
            if let Err(e) = poster.post(channel_id, chunk, Some(&root.ts)).await {
                return Ok(StepResult::failure(format!("Failed to post message digest: {e}")));
            }
        }

        Ok(StepResult::success(object(json!({
            "posted": true,
            "channel_id": channel_id,
            "thread_ts": root.ts,
            "chunk_count": chunks.len(),
        }))))
    }

    fn preflight(&self, step_id: &str, config: &Self::Config, job_config: &JobConfig) -> Vec<String> {
        let mut errors = Vec::new();
        if self.poster.is_none() {
            errors.push(format!("{step_id}: message poster is not configured."));
        }
        if Self::channel_id(config, job_config).is_none() {
            errors.push(format!("{step_id}: missing channel_id in step or job config."));
        }
        errors
    }
}
