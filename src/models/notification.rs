use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub recipient_id: Uuid,
    pub kind: String, // 'booking', 'payment', 'field', 'cancellation'
    pub message: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(recipient_id: Uuid, kind: &str, message: String, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            recipient_id,
            kind: kind.to_string(),
            message,
            read: false,
            created_at: now,
        }
    }
}
