use crate::error::{BookingError, Result};
use crate::models::booking::SUBSCRIPTION_MATCHES;
use crate::models::{Money, MoneyBreakdown};

/// Result of pricing a reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quote {
    pub amounts: MoneyBreakdown,
    pub matches_remaining: i32,
}

/// Prices a reservation.
///
/// Single match: the owner receives the hourly price and the platform adds its
/// per-match fee on top. Subscription: both parts are multiplied by the four
/// matches billed together. No loyalty discount is applied.
pub fn price(base_hourly_price: Money, is_subscription: bool, platform_fee_per_match: Money) -> Result<Quote> {
    if !base_hourly_price.is_positive() {
        return Err(BookingError::InvalidPrice);
    }
    if platform_fee_per_match.minor() < 0 {
        return Err(BookingError::InvalidPrice);
    }

    let matches = if is_subscription { SUBSCRIPTION_MATCHES } else { 1 };

    let owner_share = base_hourly_price.checked_mul(i64::from(matches))?;
    let platform_fee = platform_fee_per_match.checked_mul(i64::from(matches))?;
    let total_paid = owner_share.checked_add(platform_fee)?;

    Ok(Quote {
        amounts: MoneyBreakdown {
            total_paid,
            owner_share,
            platform_fee,
        },
        matches_remaining: matches,
    })
}
