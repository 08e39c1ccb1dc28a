use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue, json};
use tracing::{info, warn};

use crate::config::FetchTriggerPayloadConfig;
use crate::error::StepError;
use crate::key::StepKey;
use crate::step::{Step, StepContext, StepResult, object};

pub const REQUIRED_PAYLOAD_FIELDS: [&str; 5] = [
    "document_id",
    "source",
    "semantic_identifier",
    "primary_owner_emails",
    "text",
];

/// Validates and normalizes the email payload of the run's trigger event.
#[derive(Debug, Default)]
pub struct FetchTriggerPayloadStep;

fn string_list(value: Option<&JsonValue>) -> Vec<String> {
    let Some(JsonValue::Array(items)) = value else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(JsonValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn text(payload: &Map<String, JsonValue>, field: &str) -> String {
    match payload.get(field) {
        Some(JsonValue::String(s)) => s.trim().to_string(),
        Some(JsonValue::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn first_non_empty(candidates: [String; 2]) -> String {
    let [primary, fallback] = candidates;
    if primary.is_empty() { fallback } else { primary }
}

pub(crate) fn normalize_email_payload(payload: &Map<String, JsonValue>) -> JsonValue {
    let primary = string_list(payload.get("primary_owner_emails"));
    let secondary = string_list(payload.get("secondary_owner_emails"));

    let from = first_non_empty([text(payload, "from"), primary.first().cloned().unwrap_or_default()]);
    let to = first_non_empty([text(payload, "to"), secondary.join(", ")]);
    let subject = first_non_empty([text(payload, "subject"), text(payload, "semantic_identifier")]);
    let date = first_non_empty([text(payload, "date"), text(payload, "doc_updated_at")]);
    let body = first_non_empty([text(payload, "body"), text(payload, "text")]);

    json!({
        "document_id": payload.get("document_id"),
        "source": payload.get("source"),
        "semantic_identifier": payload.get("semantic_identifier"),
        "doc_updated_at": payload.get("doc_updated_at"),
        "primary_owner_emails": primary,
        "secondary_owner_emails": secondary,
        "text": payload.get("text").and_then(JsonValue::as_str).unwrap_or(""),
        "from": from,
        "to": to,
        "subject": subject,
        "date": date,
        "body": body,
    })
}

#[async_trait]
impl Step for FetchTriggerPayloadStep {
    type Config = FetchTriggerPayloadConfig;

    const KEY: StepKey = StepKey::FetchTriggerPayload;

    async fn run(&self, ctx: &StepContext<'_>, _config: &Self::Config) -> Result<StepResult, StepError> {
        let Some(event) = ctx.trigger_event else {
            info!(run_id = %ctx.run_id, "no trigger event linked to run");
            return Ok(StepResult::skipped("No trigger event associated with this run."));
        };

        let payload = match &event.payload {
            Some(JsonValue::Object(map)) if !map.is_empty() => map,
            _ => {
                info!(run_id = %ctx.run_id, trigger_event_id = %event.id, "trigger event payload is empty");
                return Ok(StepResult::skipped("Trigger event payload is empty."));
            }
        };

        let missing: Vec<&str> = REQUIRED_PAYLOAD_FIELDS
            .into_iter()
            .filter(|field| !payload.contains_key(*field))
            .collect();
        if !missing.is_empty() {
            warn!(run_id = %ctx.run_id, trigger_event_id = %event.id, ?missing, "trigger payload missing fields");
            return Ok(StepResult::skipped(format!(
                "Trigger event payload missing required fields: {}",
                json!(missing)
            )));
        }

        info!(run_id = %ctx.run_id, trigger_event_id = %event.id, "trigger payload accepted");
        Ok(StepResult::success(object(normalize_email_payload(payload))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::testing::Fixture;
    use chrono::Utc;
    use forgejobs_core::{JobId, NewTriggerEvent, StepStatus};

    fn config() -> FetchTriggerPayloadConfig {
        FetchTriggerPayloadConfig { max_attempts: 2 }
    }

    fn fixture_with(payload: Option<JsonValue>) -> Fixture {
        let mut fx = Fixture::new();
        fx.event = Some(
            NewTriggerEvent {
                job_id: JobId::new(),
                source_type: "email".into(),
                source_event_id: Some("msg-1".into()),
                dedupe_key: "email:msg-1".into(),
                dedupe_key_prefix: Some("email".into()),
                event_time: None,
                payload,
            }
            .into_event(Utc::now()),
        );
        fx
    }

    #[tokio::test]
    async fn normalizes_with_fallbacks() {
        let fx = fixture_with(Some(json!({
            "document_id": "d1",
            "source": "gmail",
            "semantic_identifier": "Quarterly plan",
            "primary_owner_emails": [" alice@acme.io ", ""],
            "secondary_owner_emails": ["bob@team.io", "carol@team.io"],
            "text": "Let's meet",
            "doc_updated_at": "2024-06-01T10:00:00Z"
        })));
        let result = FetchTriggerPayloadStep.run(&fx.ctx(), &config()).await.unwrap();
        let output = result.output().unwrap();
        assert_eq!(output["from"], json!("alice@acme.io"));
        assert_eq!(output["to"], json!("bob@team.io, carol@team.io"));
        assert_eq!(output["subject"], json!("Quarterly plan"));
        assert_eq!(output["date"], json!("2024-06-01T10:00:00Z"));
        assert_eq!(output["body"], json!("Let's meet"));
    }

    #[tokio::test]
    async fn skips_without_event_or_with_incomplete_payload() {
        let fx = Fixture::new();
        let result = FetchTriggerPayloadStep.run(&fx.ctx(), &config()).await.unwrap();
        assert_eq!(result.error_message(), Some("No trigger event associated with this run."));

        let fx = fixture_with(Some(json!({})));
        let result = FetchTriggerPayloadStep.run(&fx.ctx(), &config()).await.unwrap();
        assert_eq!(result.error_message(), Some("Trigger event payload is empty."));

        let fx = fixture_with(Some(json!({"document_id": "d1", "source": "gmail"})));
        let result = FetchTriggerPayloadStep.run(&fx.ctx(), &config()).await.unwrap();
        assert_eq!(result.status(), StepStatus::Skipped);
        assert_eq!(
            result.error_message(),
            Some("Trigger event payload missing required fields: [\"semantic_identifier\",\"primary_owner_emails\",\"text\"]")
        );
    }
}
