//! Append-only audit trail of administrative actions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::id::{JobId, UserId};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Created,
    Updated,
    Deleted,
    Triggered,
}

impl_str_enum!(AuditAction, "audit action", {
    Created => "CREATED",
    Updated => "UPDATED",
    Deleted => "DELETED",
    Triggered => "TRIGGERED",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub job_id: JobId,
    pub actor: Option<UserId>,
    pub action: AuditAction,
    pub details: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
}

impl AuditLogEntry {
    pub fn new(
        job_id: JobId,
        action: AuditAction,
        actor: Option<UserId>,
        details: Option<JsonValue>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_id,
            actor,
            action,
            details,
            created_at: now,
        }
    }
}
