//! Step catalog for admin tooling.

use serde::Serialize;
use serde_json::{Value as JsonValue, json};

use crate::key::{StepKey, WorkflowKey};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepCatalogItem {
    pub step_key: StepKey,
    pub description: &'static str,
    pub config_schema: JsonValue,
}

fn max_attempts_schema() -> JsonValue {
    json!({"type": "integer", "minimum": 1})
}

fn config_schema(key: StepKey) -> JsonValue {
    let mut properties = match key {
        StepKey::FetchChatHistory => json!({
            "window_days": {"type": "integer", "minimum": 1},
            "max_messages": {"type": "integer", "minimum": 1},
            "min_messages": {"type": "integer", "minimum": 1},
        }),
        StepKey::ChannelInput => json!({
            "channel_ids": {"type": "array", "items": {"type": "string"}},
            "oldest": {"type": "string"},
            "latest": {"type": "string"},
            "max_messages_per_channel": {"type": "integer", "minimum": 1},
        }),
        StepKey::WebSearch => json!({
            "queries": {"type": "array", "items": {"type": "string"}},
            "max_results": {"type": "integer", "minimum": 1},
            "cache_ttl_seconds": {"type": "integer", "minimum": 0, "maximum": 2_592_000},
            "max_cache_entries": {"type": "integer", "minimum": 1},
        }),
        StepKey::SummarizeContent => json!({
            "input_step_id": {"type": "string"},
            "context_step_ids": {"type": "array", "items": {"type": "string"}},
            "min_messages": {"type": "integer", "minimum": 1},
            "max_chunks": {"type": "integer", "minimum": 1},
        }),
        StepKey::PostMessageDigest => json!({
            "input_step_id": {"type": "string"},
            "channel_id": {"type": "string"},
        }),
        StepKey::DocumentOutput => json!({
            "input_step_id": {"type": "string"},
            "credential_id": {"type": "string"},
            "title": {"type": "string"},
            "folder_id": {"type": "string"},
            "share_with": {"type": "array", "items": {"type": "string"}},
        }),
        StepKey::FetchTriggerPayload => json!({}),
        StepKey::ProcessEmailCrm => json!({
            "persona_id": {"type": "integer"},
            "input_step_id": {"type": "string"},
            "internal_domains": {"type": "array", "items": {"type": "string"}},
        }),
    };
    if let JsonValue::Object(map) = &mut properties {
        map.insert("max_attempts".to_string(), max_attempts_schema());
    }
    json!({
        "type": "object",
        "additionalProperties": false,
        "properties": properties,
    })
}

/// Every step with its description and config schema, sorted by key.
pub fn step_catalog() -> Vec<StepCatalogItem> {
    let mut keys = StepKey::ALL.to_vec();
    keys.sort_by_key(|k| k.as_str());
    keys.into_iter()
        .map(|step_key| StepCatalogItem {
            step_key,
            description: step_key.description(),
            config_schema: config_schema(step_key),
        })
        .collect()
}

pub fn workflow_keys() -> Vec<&'static str> {
    let mut keys: Vec<_> = WorkflowKey::ALL.iter().map(WorkflowKey::as_str).collect();
    keys.sort_unstable();
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_is_sorted_and_complete() {
        let catalog = step_catalog();
        assert_eq!(catalog.len(), StepKey::ALL.len());
        let keys: Vec<_> = catalog.iter().map(|i| i.step_key.as_str()).collect();
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        assert_eq!(keys, sorted);
        assert_eq!(keys[0], "channel_input");

        let web = catalog.iter().find(|i| i.step_key == StepKey::WebSearch).unwrap();
        assert_eq!(web.config_schema["properties"]["max_results"]["minimum"], json!(1));
        assert_eq!(web.config_schema["properties"]["max_attempts"]["minimum"], json!(1));
    }

    #[test]
    fn workflow_keys_sorted() {
        assert_eq!(
            workflow_keys(),
            ["daily_channel_web_brief", "email_crm_processor", "weekly_content_summary"]
        );
    }
}
