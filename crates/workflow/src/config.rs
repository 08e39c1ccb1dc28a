//! Job-level and per-step configuration.
//!
//! Step configs are typed: unknown fields are rejected and numeric minimums are
//! enforced at parse time, so a definition that builds is a definition that runs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::WorkflowError;
use crate::key::StepKey;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 2;
/// Thirty days.
pub const MAX_CACHE_TTL_SECONDS: u64 = 2_592_000;

/// The opaque `job_config` map, as read by workflow builders.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(default)]
    pub step_configs: BTreeMap<String, JsonValue>,
    /// Default channel for messaging steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    /// Default credential for document steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl JobConfig {
    pub fn from_value(value: &JsonValue) -> Result<Self, WorkflowError> {
        match value {
            JsonValue::Null => Ok(Self::default()),
            JsonValue::Object(_) => serde_json::from_value(value.clone())
                .map_err(|e| WorkflowError::InvalidJobConfig(e.to_string())),
            _ => Err(WorkflowError::InvalidJobConfig("job_config must be an object".to_string())),
        }
    }

    /// Raw config submitted for `step_id`, if any.
    pub fn step_config(&self, step_id: &str) -> Option<&JsonValue> {
        self.step_configs.get(step_id)
    }
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn at_least(field: &str, value: u64, min: u64) -> Result<(), String> {
    if value < min {
        return Err(format!("{field} must be >= {min}"));
    }
    Ok(())
}

fn at_most(field: &str, value: u64, max: u64) -> Result<(), String> {
    if value > max {
        return Err(format!("{field} must be <= {max}"));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FetchChatHistoryConfig {
    #[serde(default = "FetchChatHistoryConfig::default_window_days")]
    pub window_days: u32,
    #[serde(default = "FetchChatHistoryConfig::default_max_messages")]
    pub max_messages: u32,
    #[serde(default = "FetchChatHistoryConfig::default_min_messages")]
    pub min_messages: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl FetchChatHistoryConfig {
    fn default_window_days() -> u32 {
        7
    }

    fn default_max_messages() -> u32 {
        5000
    }

    fn default_min_messages() -> u32 {
        1
    }

    fn validate(&self) -> Result<(), String> {
        at_least("window_days", self.window_days.into(), 1)?;
        at_least("max_messages", self.max_messages.into(), 1)?;
        at_least("min_messages", self.min_messages.into(), 1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelInputConfig {
    #[serde(default)]
    pub channel_ids: Vec<String>,
    #[serde(default)]
    pub oldest: Option<String>,
    #[serde(default)]
    pub latest: Option<String>,
    #[serde(default = "ChannelInputConfig::default_max_messages_per_channel")]
    pub max_messages_per_channel: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl ChannelInputConfig {
    fn default_max_messages_per_channel() -> u32 {
        200
    }

    fn validate(&self) -> Result<(), String> {
        at_least("max_messages_per_channel", self.max_messages_per_channel.into(), 1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebSearchConfig {
    #[serde(default)]
    pub queries: Vec<String>,
    #[serde(default = "WebSearchConfig::default_max_results")]
    pub max_results: u32,
    #[serde(default = "WebSearchConfig::default_cache_ttl_seconds")]
    pub cache_ttl_seconds: u64,
    #[serde(default = "WebSearchConfig::default_max_cache_entries")]
    pub max_cache_entries: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl WebSearchConfig {
    fn default_max_results() -> u32 {
        5
    }

    fn default_cache_ttl_seconds() -> u64 {
        300
    }

    fn default_max_cache_entries() -> u32 {
        256
    }

    fn validate(&self) -> Result<(), String> {
        at_least("max_results", self.max_results.into(), 1)?;
        at_most("cache_ttl_seconds", self.cache_ttl_seconds, MAX_CACHE_TTL_SECONDS)?;
        at_least("max_cache_entries", self.max_cache_entries.into(), 1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SummarizeContentConfig {
    #[serde(default = "SummarizeContentConfig::default_input_step_id")]
    pub input_step_id: String,
    /// Additional step outputs (e.g. search results) appended as context.
    #[serde(default)]
    pub context_step_ids: Vec<String>,
    #[serde(default = "SummarizeContentConfig::default_min_messages")]
    pub min_messages: u32,
    #[serde(default = "SummarizeContentConfig::default_max_chunks")]
    pub max_chunks: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl SummarizeContentConfig {
    fn default_input_step_id() -> String {
        StepKey::FetchChatHistory.as_str().to_string()
    }

    fn default_min_messages() -> u32 {
        3
    }

    fn default_max_chunks() -> u32 {
        20
    }

    fn validate(&self) -> Result<(), String> {
        at_least("min_messages", self.min_messages.into(), 1)?;
        at_least("max_chunks", self.max_chunks.into(), 1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PostMessageDigestConfig {
    #[serde(default = "summarize_step_id")]
    pub input_step_id: String,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl PostMessageDigestConfig {
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

fn summarize_step_id() -> String {
    StepKey::SummarizeContent.as_str().to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DocumentOutputConfig {
    #[serde(default = "summarize_step_id")]
    pub input_step_id: String,
    #[serde(default)]
    pub credential_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub folder_id: Option<String>,
    #[serde(default)]
    pub share_with: Vec<String>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl DocumentOutputConfig {
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FetchTriggerPayloadConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl FetchTriggerPayloadConfig {
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessEmailCrmConfig {
    /// CRM-focused agent persona; required at execution.
    #[serde(default)]
    pub persona_id: Option<i64>,
    #[serde(default = "ProcessEmailCrmConfig::default_input_step_id")]
    pub input_step_id: String,
    /// Team email domains the agent must not create CRM records for.
    #[serde(default)]
    pub internal_domains: Vec<String>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl ProcessEmailCrmConfig {
    fn default_input_step_id() -> String {
        StepKey::FetchTriggerPayload.as_str().to_string()
    }

    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

macro_rules! step_configs {
    ($($variant:ident($cfg:ty)),+ $(,)?) => {
        /// A parsed, validated step configuration; one variant per [`StepKey`].
        #[derive(Debug, Clone, PartialEq)]
        pub enum StepConfig {
            $($variant($cfg)),+
        }

        impl StepConfig {
            /// Parse `raw` for `key`; `null` means "all defaults".
            pub fn parse(key: StepKey, step_id: &str, raw: &JsonValue) -> Result<Self, WorkflowError> {
                let value = match raw {
                    JsonValue::Null => JsonValue::Object(Map::new()),
                    other => other.clone(),
                };
                let invalid = |message: String| WorkflowError::InvalidStepConfig {
                    step_id: step_id.to_string(),
                    message,
                };
                let config = match key {
                    $(StepKey::$variant => StepConfig::$variant(
                        serde_json::from_value::<$cfg>(value).map_err(|e| invalid(e.to_string()))?,
                    ),)+
                };
                config.validate().map_err(invalid)?;
                Ok(config)
            }

            pub fn key(&self) -> StepKey {
                match self {
                    $(StepConfig::$variant(_) => StepKey::$variant),+
                }
            }

            pub fn max_attempts(&self) -> u32 {
                match self {
                    $(StepConfig::$variant(c) => c.max_attempts),+
                }
            }

            pub fn to_value(&self) -> JsonValue {
                let value = match self {
                    $(StepConfig::$variant(c) => serde_json::to_value(c)),+
                };
                value.unwrap_or(JsonValue::Null)
            }

            fn validate(&self) -> Result<(), String> {
                at_least("max_attempts", self.max_attempts().into(), 1)?;
                match self {
                    $(StepConfig::$variant(c) => c.validate()),+
                }
            }
        }
    };
}

step_configs! {
    FetchChatHistory(FetchChatHistoryConfig),
    ChannelInput(ChannelInputConfig),
    WebSearch(WebSearchConfig),
    SummarizeContent(SummarizeContentConfig),
    PostMessageDigest(PostMessageDigestConfig),
    DocumentOutput(DocumentOutputConfig),
    FetchTriggerPayload(FetchTriggerPayloadConfig),
    ProcessEmailCrm(ProcessEmailCrmConfig),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn null_config_takes_defaults() {
        let config = StepConfig::parse(StepKey::WebSearch, "web_search", &JsonValue::Null).unwrap();
        let StepConfig::WebSearch(ws) = &config else {
            panic!("expected web search config");
        };
        assert!(ws.queries.is_empty());
        assert_eq!(ws.max_results, 5);
        assert_eq!(ws.cache_ttl_seconds, 300);
        assert_eq!(ws.max_cache_entries, 256);
        assert_eq!(config.max_attempts(), DEFAULT_MAX_ATTEMPTS);
        assert_eq!(config.key(), StepKey::WebSearch);
    }

    #[test]
    fn unknown_fields_are_rejected_with_step_id() {
        let err = StepConfig::parse(
            StepKey::SummarizeContent,
            "summarize_content",
            &json!({"min_mesages": 2}),
        )
        .unwrap_err();
        match err {
            WorkflowError::InvalidStepConfig { step_id, message } => {
                assert_eq!(step_id, "summarize_content");
                assert!(message.contains("min_mesages"), "{message}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn minimums_are_enforced() {
        let err = StepConfig::parse(StepKey::FetchChatHistory, "fetch", &json!({"window_days": 0})).unwrap_err();
        assert_eq!(err.to_string(), "Invalid config for step 'fetch': window_days must be >= 1");

        let err = StepConfig::parse(StepKey::ChannelInput, "in", &json!({"max_attempts": 0})).unwrap_err();
        assert_eq!(err.to_string(), "Invalid config for step 'in': max_attempts must be >= 1");

        assert!(StepConfig::parse(StepKey::WebSearch, "ws", &json!({"max_results": -1})).is_err());
        assert!(StepConfig::parse(StepKey::WebSearch, "ws", &json!({"cache_ttl_seconds": 0})).is_ok());
    }

    #[test]
    fn cache_ttl_is_capped_at_thirty_days() {
        assert!(StepConfig::parse(StepKey::WebSearch, "ws", &json!({"cache_ttl_seconds": 2_592_000})).is_ok());
        let err =
            StepConfig::parse(StepKey::WebSearch, "ws", &json!({"cache_ttl_seconds": u64::MAX})).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid config for step 'ws': cache_ttl_seconds must be <= 2592000"
        );
    }

    #[test]
    fn job_config_keeps_extra_keys_and_rejects_non_objects() {
        let config = JobConfig::from_value(&json!({
            "step_configs": {"web_search": {"queries": ["rust"]}},
            "channel_id": "C1",
            "team": "growth"
        }))
        .unwrap();
        assert_eq!(config.channel_id.as_deref(), Some("C1"));
        assert_eq!(config.extra.get("team"), Some(&json!("growth")));
        assert!(config.step_config("web_search").is_some());

        assert_eq!(JobConfig::from_value(&JsonValue::Null).unwrap(), JobConfig::default());
        assert!(matches!(
            JobConfig::from_value(&json!([1, 2])),
            Err(WorkflowError::InvalidJobConfig(_))
        ));
    }
}
