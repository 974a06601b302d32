use thiserror::Error;

#[derive(Error, Debug)]
pub enum BookingError {
    #[error("Time slot already booked")]
    SlotUnavailable,

    #[error("Price must be greater than zero")]
    InvalidPrice,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Booking can no longer be cancelled")]
    BookingNotCancellable,

    #[error("Booking belongs to another user")]
    NotOwner,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Field not found")]
    FieldNotFound,

    #[error("Field is not approved for bookings")]
    FieldNotApproved,

    #[error("Booking not found")]
    BookingNotFound,

    #[error("Slot ledger unavailable: {0}")]
    LedgerUnavailable(String),

    #[error("Database error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Payment gateway error: {0}")]
    Gateway(String),

    #[error("Payment callback signature mismatch")]
    InvalidSignature,

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),
}

impl BookingError {
    /// Infrastructure failures the caller may retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BookingError::LedgerUnavailable(_) | BookingError::Storage(_) | BookingError::Gateway(_)
        )
    }

    /// HTTP-equivalent status for whichever transport sits in front of the core.
    pub fn status_code(&self) -> u16 {
        match self {
            BookingError::SlotUnavailable => 409,
            BookingError::InvalidPrice | BookingError::InvalidInput(_) => 400,
            BookingError::BookingNotCancellable | BookingError::FieldNotApproved => 422,
            BookingError::NotOwner | BookingError::Forbidden(_) => 403,
            BookingError::Unauthorized | BookingError::InvalidSignature => 401,
            BookingError::FieldNotFound | BookingError::BookingNotFound => 404,
            BookingError::LedgerUnavailable(_) | BookingError::Gateway(_) => 503,
            BookingError::Storage(_) | BookingError::InvariantViolation(_) => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, BookingError>;
