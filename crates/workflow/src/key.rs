//! Closed sets of workflow and step keys.
//!
//! Both sets are fixed at compile time; string forms are what job definitions
//! and run-step rows persist.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;

macro_rules! keyed_enum {
    ($t:ident, $err:ident, { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $t {
            pub const ALL: &'static [$t] = &[$($t::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($t::$variant => $s),+
                }
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $t {
            type Err = WorkflowError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok($t::$variant),)+
                    other => Err(WorkflowError::$err(other.to_string())),
                }
            }
        }
    };
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKey {
    WeeklyContentSummary,
    DailyChannelWebBrief,
    EmailCrmProcessor,
}

keyed_enum!(WorkflowKey, UnknownWorkflow, {
    WeeklyContentSummary => "weekly_content_summary",
    DailyChannelWebBrief => "daily_channel_web_brief",
    EmailCrmProcessor => "email_crm_processor",
});

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKey {
    FetchChatHistory,
    ChannelInput,
    WebSearch,
    SummarizeContent,
    PostMessageDigest,
    DocumentOutput,
    FetchTriggerPayload,
    ProcessEmailCrm,
}

keyed_enum!(StepKey, UnknownStep, {
    FetchChatHistory => "fetch_chat_history",
    ChannelInput => "channel_input",
    WebSearch => "web_search",
    SummarizeContent => "summarize_content",
    PostMessageDigest => "post_message_digest",
    DocumentOutput => "document_output",
    FetchTriggerPayload => "fetch_trigger_payload",
    ProcessEmailCrm => "process_email_crm",
});

impl StepKey {
    /// External API label for error counters, when the step calls one.
    pub fn external_api(&self) -> Option<&'static str> {
        match self {
            StepKey::FetchChatHistory => Some("chat"),
            StepKey::ChannelInput | StepKey::PostMessageDigest => Some("messaging"),
            StepKey::WebSearch => Some("web_search"),
            StepKey::SummarizeContent => Some("llm"),
            StepKey::DocumentOutput => Some("documents"),
            StepKey::ProcessEmailCrm => Some("crm"),
            StepKey::FetchTriggerPayload => None,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            StepKey::FetchChatHistory => "Fetches chat USER/ASSISTANT messages for a time window.",
            StepKey::ChannelInput => "Reads recent messages from one or more messaging channels.",
            StepKey::WebSearch => "Runs configured web queries with partial-failure tolerance.",
            StepKey::SummarizeContent => {
                "Generates a summary with size-aware single-pass/map-reduce behavior."
            }
            StepKey::PostMessageDigest => "Posts a markdown summary to a channel and threads long chunks.",
            StepKey::DocumentOutput => "Creates a document and writes output content.",
            StepKey::FetchTriggerPayload => {
                "Reads and validates the email trigger event payload for downstream CRM processing."
            }
            StepKey::ProcessEmailCrm => {
                "Sends an email through a CRM agent to search/create contacts and log interactions."
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_round_trip_and_reject_unknown() {
        for key in StepKey::ALL {
            assert_eq!(key.as_str().parse::<StepKey>().unwrap(), *key);
        }
        for key in WorkflowKey::ALL {
            assert_eq!(key.as_str().parse::<WorkflowKey>().unwrap(), *key);
        }
        assert_eq!(
            "send_fax".parse::<StepKey>().unwrap_err(),
            WorkflowError::UnknownStep("send_fax".into())
        );
        assert_eq!(
            "nightly".parse::<WorkflowKey>().unwrap_err().to_string(),
            "Unknown workflow key: nightly"
        );
    }

    #[test]
    fn serde_uses_persisted_names() {
        assert_eq!(serde_json::to_string(&StepKey::WebSearch).unwrap(), "\"web_search\"");
        assert_eq!(
            serde_json::from_str::<WorkflowKey>("\"email_crm_processor\"").unwrap(),
            WorkflowKey::EmailCrmProcessor
        );
    }
}
