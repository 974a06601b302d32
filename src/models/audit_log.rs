use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::FromRow;
use uuid::Uuid;

/// Immutable record of an admin or system action. Never updated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub actor_id: Option<Uuid>, // None for actions taken by the system itself
    pub actor_email: Option<String>,
    pub action: String,
    pub target_type: String,
    pub target_id: Uuid,
    pub details: JsonValue, // JSONB field
    pub created_at: DateTime<Utc>,
}

impl AuditLogEntry {
    pub fn system(
        action: &str,
        target_type: &str,
        target_id: Uuid,
        details: JsonValue,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            actor_id: None,
            actor_email: None,
            action: action.to_string(),
            target_type: target_type.to_string(),
            target_id,
            details,
            created_at: now,
        }
    }

    pub fn by_actor(mut self, actor_id: Uuid, actor_email: Option<String>) -> Self {
        self.actor_id = Some(actor_id);
        self.actor_email = actor_email;
        self
    }
}
