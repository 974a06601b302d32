use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::Money;

/// Match length for a single booking. Reservation granularity stays hourly.
pub const MATCH_DURATION_MINUTES: i32 = 90;

/// Matches billed together by a subscription booking.
pub const SUBSCRIPTION_MATCHES: i32 = 4;

/// One reservable match window. Two slots conflict iff field and start are equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub field_id: Uuid,
    pub start: DateTime<Utc>,
    pub duration_minutes: i32,
}

impl TimeSlot {
    pub fn new(field_id: Uuid, start: DateTime<Utc>) -> Self {
        Self {
            field_id,
            start,
            duration_minutes: MATCH_DURATION_MINUTES,
        }
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.start + Duration::minutes(i64::from(self.duration_minutes))
    }

    pub fn conflicts_with(&self, other: &TimeSlot) -> bool {
        self.field_id == other.field_id && self.start == other.start
    }
}

/// Money split for a booking. `total_paid == owner_share + platform_fee` always.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoneyBreakdown {
    pub total_paid: Money,
    pub owner_share: Money,
    pub platform_fee: Money,
}

impl MoneyBreakdown {
    pub fn is_balanced(&self) -> bool {
        self.owner_share
            .checked_add(self.platform_fee)
            .map(|sum| sum == self.total_paid)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Reserved,
    Paid,
    Confirmed,
    CancelledPaymentFailed,
    CancelledByConsumer,
    Completed,
}

impl BookingStatus {
    pub const ACTIVE: [BookingStatus; 3] = [
        BookingStatus::Reserved,
        BookingStatus::Paid,
        BookingStatus::Confirmed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Reserved => "reserved",
            BookingStatus::Paid => "paid",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::CancelledPaymentFailed => "cancelled_payment_failed",
            BookingStatus::CancelledByConsumer => "cancelled_by_consumer",
            BookingStatus::Completed => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BookingStatus::CancelledPaymentFailed
                | BookingStatus::CancelledByConsumer
                | BookingStatus::Completed
        )
    }

    /// Whether a booking in this state occupies its slot.
    pub fn holds_slot(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        use BookingStatus::*;

        match (self, next) {
            (Reserved, Paid) | (Reserved, CancelledPaymentFailed) => true,
            (Paid, Confirmed) => true,
            (Reserved | Paid | Confirmed, CancelledByConsumer) => true,
            (Reserved | Paid | Confirmed, Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reserved" => Ok(BookingStatus::Reserved),
            "paid" => Ok(BookingStatus::Paid),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "cancelled_payment_failed" => Ok(BookingStatus::CancelledPaymentFailed),
            "cancelled_by_consumer" => Ok(BookingStatus::CancelledByConsumer),
            "completed" => Ok(BookingStatus::Completed),
            other => Err(format!("unknown booking status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Booking {
    pub id: Uuid,
    pub consumer_id: Uuid,
    pub slot: TimeSlot,
    pub is_subscription: bool,
    // Tracked, never decremented by the core.
    pub matches_remaining: i32,
    pub amounts: MoneyBreakdown,
    pub status: BookingStatus,
    pub external_ref: Option<String>,
    pub hold_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn field_id(&self) -> Uuid {
        self.slot.field_id
    }

    /// Checks if the consumer may still cancel at `now` given the window before kickoff.
    pub fn is_within_cancellation_window(&self, now: DateTime<Utc>, window: Duration) -> bool {
        now < self.slot.start - window
    }
}
