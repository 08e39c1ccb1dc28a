//! Collaborators the built-in steps talk to.
//!
//! Implementations live outside this crate (chat store, messaging platform,
//! search provider, LLM, document store, CRM agent). Every collaborator is
//! optional: a step whose collaborator is missing fails with a clear message.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use forgejobs_core::TenantId;
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub chat_session_id: String,
    pub message_id: i64,
    /// `USER` or `ASSISTANT`.
    pub message_type: String,
    pub time_sent: DateTime<Utc>,
    pub message: String,
}

#[async_trait]
pub trait ChatHistorySource: Send + Sync {
    /// Why history may not be read at all (e.g. anonymized query history).
    fn unavailable_reason(&self) -> Option<String> {
        None
    }

    async fn fetch_messages(
        &self,
        tenant_id: TenantId,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ChatMessage>, ServiceError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub ts: Option<String>,
    pub user: Option<String>,
    pub text: String,
}

#[async_trait]
pub trait ChannelReader: Send + Sync {
    async fn read_channel(
        &self,
        channel_id: &str,
        oldest: Option<&str>,
        latest: Option<&str>,
        limit: u32,
    ) -> Result<Vec<ChannelMessage>, ServiceError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn provider_type(&self) -> &str;

    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, ServiceError>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Input budget, in characters, left after the system prompt and reserved output.
    fn input_budget_chars(&self) -> usize;

    async fn complete(&self, system_prompt: &str, content: &str) -> Result<Completion, ServiceError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct PostedMessage {
    pub ts: String,
}

#[async_trait]
pub trait MessagePoster: Send + Sync {
    async fn post(&self, channel_id: &str, text: &str, thread_ts: Option<&str>) -> Result<PostedMessage, ServiceError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRequest {
    pub credential_id: String,
    pub title: String,
    pub content: String,
    pub folder_id: Option<String>,
    pub share_with: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreatedDocument {
    pub doc_id: String,
    pub doc_url: Option<String>,
}

#[async_trait]
pub trait DocumentWriter: Send + Sync {
    /// Problems with a credential that make writing impossible.
    async fn check_credential(&self, _credential_id: &str) -> Result<(), ServiceError> {
        Ok(())
    }

    async fn create_document(&self, request: &DocumentRequest) -> Result<CreatedDocument, ServiceError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_name: String,
    pub tool_result: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentResponse {
    pub answer: String,
    pub tool_calls: Vec<ToolCall>,
    pub chat_session_id: Option<String>,
    pub message_id: Option<i64>,
    /// Error reported inside an otherwise completed agent turn.
    pub error: Option<String>,
}

#[async_trait]
pub trait CrmAgent: Send + Sync {
    async fn process(&self, persona_id: i64, prompt: &str) -> Result<AgentResponse, ServiceError>;
}

/// Collaborator bundle handed to the step registry at process start.
#[derive(Clone)]
pub struct StepServices {
    pub chat_history: Option<Arc<dyn ChatHistorySource>>,
    pub channels: Option<Arc<dyn ChannelReader>>,
    pub search: Option<Arc<dyn SearchProvider>>,
    pub summarizer: Option<Arc<dyn Summarizer>>,
    pub poster: Option<Arc<dyn MessagePoster>>,
    pub documents: Option<Arc<dyn DocumentWriter>>,
    pub crm: Option<Arc<dyn CrmAgent>>,
    /// Pause between consecutive calls to the messaging platform.
    pub pacing: Duration,
}

impl Default for StepServices {
    fn default() -> Self {
        Self {
            chat_history: None,
            channels: None,
            search: None,
            summarizer: None,
            poster: None,
            documents: None,
            crm: None,
            pacing: Duration::from_secs(1),
        }
    }
}

impl std::fmt::Debug for StepServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepServices")
            .field("chat_history", &self.chat_history.is_some())
            .field("channels", &self.channels.is_some())
            .field("search", &self.search.is_some())
            .field("summarizer", &self.summarizer.is_some())
            .field("poster", &self.poster.is_some())
            .field("documents", &self.documents.is_some())
            .field("crm", &self.crm.is_some())
            .field("pacing", &self.pacing)
            .finish()
    }
}

/// Resolve an optional collaborator or produce the standard failure text.
pub(crate) fn require<'a, T: ?Sized>(service: &'a Option<Arc<T>>, name: &str) -> Result<&'a T, String> {
    service.as_deref().ok_or_else(|| format!("{name} is not configured."))
}
