//! Externally observed trigger events and per-source polling cursors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::id::{JobId, TriggerEventId};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerEventStatus {
    Received,
    Enqueued,
    Consumed,
    Failed,
    Dropped,
}

impl_str_enum!(TriggerEventStatus, "trigger event status", {
    Received => "RECEIVED",
    Enqueued => "ENQUEUED",
    Consumed => "CONSUMED",
    Failed => "FAILED",
    Dropped => "DROPPED",
});

impl TriggerEventStatus {
    pub const TERMINAL: [TriggerEventStatus; 3] = [
        TriggerEventStatus::Consumed,
        TriggerEventStatus::Dropped,
        TriggerEventStatus::Failed,
    ];

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }
}

/// Ingestion request; `dedupe_key` is unique per job.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTriggerEvent {
    pub job_id: JobId,
    pub source_type: String,
    pub source_event_id: Option<String>,
    pub dedupe_key: String,
    pub dedupe_key_prefix: Option<String>,
    pub event_time: Option<DateTime<Utc>>,
    pub payload: Option<JsonValue>,
}

impl NewTriggerEvent {
    pub fn into_event(self, now: DateTime<Utc>) -> TriggerEvent {
        TriggerEvent {
            id: TriggerEventId::new(),
            job_id: self.job_id,
            source_type: self.source_type,
            source_event_id: self.source_event_id,
            dedupe_key: self.dedupe_key,
            dedupe_key_prefix: self.dedupe_key_prefix,
            event_time: self.event_time,
            payload: self.payload,
            status: TriggerEventStatus::Received,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub id: TriggerEventId,
    pub job_id: JobId,
    pub source_type: String,
    pub source_event_id: Option<String>,
    pub dedupe_key: String,
    pub dedupe_key_prefix: Option<String>,
    pub event_time: Option<DateTime<Utc>>,
    pub payload: Option<JsonValue>,
    pub status: TriggerEventStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Opaque incremental-polling cursor, keyed by `(job_id, source_key)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerState {
    pub job_id: JobId,
    pub source_key: String,
    pub cursor: Option<JsonValue>,
    pub updated_at: DateTime<Utc>,
}
