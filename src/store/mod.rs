// Store module - persistence seams for the booking core

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{AuditLogEntry, Booking, BookingStatus, Field, Notification, Transaction};
use crate::services::slot_ledger::HoldToken;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Result of the atomic payment check-and-set on a booking.
#[derive(Debug, Clone)]
pub enum PaymentWrite {
    /// Booking moved `reserved -> paid` and the transaction was written.
    Applied(Booking),
    /// This external reference was already applied; nothing was written.
    Duplicate(Booking),
    /// Booking is in a state that cannot accept this payment.
    Rejected(Booking),
}

#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    Applied {
        previous: BookingStatus,
        booking: Booking,
    },
    /// Current state was not in the allowed `from` set; nothing was written.
    Unchanged(Booking),
}

#[async_trait]
pub trait BookingStore: Send + Sync {
    /// Persists a new booking and attaches its hold in the same write.
    ///
    /// Fails with `SlotUnavailable` if another active booking already references
    /// the same (field, start) pair.
    async fn insert_booking(&self, booking: &Booking, hold: &HoldToken) -> Result<()>;

    async fn find_booking(&self, id: Uuid) -> Result<Option<Booking>>;

    async fn find_by_external_ref(&self, external_ref: &str) -> Result<Option<Booking>>;

    /// Stores the gateway order reference while the booking is still `reserved`.
    async fn set_external_ref(
        &self,
        id: Uuid,
        external_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome>;

    /// Atomically moves `reserved -> paid` and writes the transaction, keyed on
    /// the external reference so redelivered callbacks are absorbed.
    async fn record_payment(
        &self,
        id: Uuid,
        transaction: &Transaction,
        now: DateTime<Utc>,
    ) -> Result<PaymentWrite>;

    /// Conditional state change. When `to` no longer occupies the slot, the
    /// booking's hold is released as part of the same write.
    async fn transition(
        &self,
        id: Uuid,
        from: &[BookingStatus],
        to: BookingStatus,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome>;

    async fn transactions_for_booking(&self, booking_id: Uuid) -> Result<Vec<Transaction>>;

    async fn bookings_for_consumer(&self, consumer_id: Uuid) -> Result<Vec<Booking>>;

    async fn bookings_for_owner(&self, owner_id: Uuid) -> Result<Vec<Booking>>;
}

/// Read side of the field catalog collaborator.
#[async_trait]
pub trait FieldCatalog: Send + Sync {
    async fn field(&self, id: Uuid) -> Result<Option<Field>>;
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn append(&self, notification: &Notification) -> Result<()>;

    async fn for_recipient(&self, recipient_id: Uuid) -> Result<Vec<Notification>>;

    /// Flips `read` only when `recipient_id` owns the notification.
    async fn mark_read(&self, id: Uuid, recipient_id: Uuid) -> Result<bool>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, entry: &AuditLogEntry) -> Result<()>;

    async fn for_target(&self, target_id: Uuid) -> Result<Vec<AuditLogEntry>>;
}
