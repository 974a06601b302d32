use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::Money;

/// Record of a settled payment. Append-only, one per successfully paid booking.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Transaction {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub external_ref: String,
    pub amount: Money,
    pub commission: Money,
    pub status: String, // always 'success'; failures never produce a transaction
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    pub fn success(
        booking_id: Uuid,
        external_ref: &str,
        amount: Money,
        commission: Money,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            booking_id,
            external_ref: external_ref.to_string(),
            amount,
            commission,
            status: "success".to_string(),
            created_at: now,
        }
    }
}
