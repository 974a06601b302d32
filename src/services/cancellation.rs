use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BookingError, Result};
use crate::models::{Booking, BookingStatus, Money};

/// Default notice a consumer must give before kickoff.
pub const DEFAULT_CANCELLATION_WINDOW_HOURS: i64 = 72;

/// Refund owed after a consumer cancellation. Executing the transfer is the
/// payment collaborator's job; the core only records what is owed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Refund {
    pub booking_id: Uuid,
    pub consumer_id: Uuid,
    pub amount: Money,
    pub previous_status: BookingStatus,
}

impl Refund {
    /// Full refund when the booking had been paid; nothing when it was only reserved.
    pub fn for_cancelled(booking: &Booking, previous_status: BookingStatus) -> Self {
        let amount = match previous_status {
            BookingStatus::Paid | BookingStatus::Confirmed => booking.amounts.total_paid,
            _ => Money::ZERO,
        };

        Self {
            booking_id: booking.id,
            consumer_id: booking.consumer_id,
            amount,
            previous_status,
        }
    }
}

/// Checks whether `requester_id` may cancel `booking` at `now`.
///
/// The window is strict: cancelling exactly `window` before kickoff is refused.
pub fn check_cancellable(
    booking: &Booking,
    requester_id: Uuid,
    now: DateTime<Utc>,
    window: Duration,
) -> Result<()> {
    if booking.consumer_id != requester_id {
        return Err(BookingError::NotOwner);
    }

    if booking.status.is_terminal() {
        return Err(BookingError::BookingNotCancellable);
    }

    if !booking.is_within_cancellation_window(now, window) {
        return Err(BookingError::BookingNotCancellable);
    }

    Ok(())
}
