use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::Money;

/// Catalog view of a field as the booking core needs it.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Field {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub base_price: Money,
    pub subscription_price: Option<Money>, // carried, not used by pricing
    pub approved: bool,
}
