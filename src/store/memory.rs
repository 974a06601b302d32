//! In-process store backing tests and single-node deployments.
//!
//! Mirrors the Postgres constraints: one active booking per (field, start),
//! one transaction per booking and per external reference.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use super::{AuditStore, BookingStore, FieldCatalog, NotificationStore, PaymentWrite, TransitionOutcome};
use crate::error::{BookingError, Result};
use crate::models::{AuditLogEntry, Booking, BookingStatus, Field, Notification, Transaction};
use crate::services::slot_ledger::{HoldToken, InMemorySlotLedger, SlotKey};

#[derive(Clone, Default)]
pub struct MemoryStore {
    ledger: InMemorySlotLedger,
    fields: Arc<DashMap<Uuid, Field>>,
    bookings: Arc<DashMap<Uuid, Booking>>,
    active_slots: Arc<DashMap<SlotKey, Uuid>>,
    // Keyed by booking id: at most one transaction per booking.
    transactions: Arc<DashMap<Uuid, Transaction>>,
    notifications: Arc<RwLock<Vec<Notification>>>,
    audit_log: Arc<RwLock<Vec<AuditLogEntry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The ledger this store releases holds on. Share it with the booking service.
    pub fn ledger(&self) -> InMemorySlotLedger {
        self.ledger.clone()
    }

    /// Seeds or replaces a catalog entry. Catalog CRUD lives outside the core.
    pub fn put_field(&self, field: Field) {
        self.fields.insert(field.id, field);
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    fn hold_of(booking: &Booking) -> HoldToken {
        HoldToken {
            id: booking.hold_id,
            key: SlotKey::from(&booking.slot),
        }
    }

    fn poisoned() -> BookingError {
        BookingError::LedgerUnavailable("in-memory store lock poisoned".to_string())
    }
}

#[async_trait]
impl BookingStore for MemoryStore {
    async fn insert_booking(&self, booking: &Booking, hold: &HoldToken) -> Result<()> {
        let key = SlotKey::from(&booking.slot);

        match self.active_slots.entry(key.clone()) {
            Entry::Occupied(_) => return Err(BookingError::SlotUnavailable),
            Entry::Vacant(vacant) => {
                vacant.insert(booking.id);
            }
        }

        if let Err(e) = self.ledger.attach_now(hold, booking.id) {
            self.active_slots.remove_if(&key, |_, id| *id == booking.id);
            return Err(e);
        }

        self.bookings.insert(booking.id, booking.clone());
        Ok(())
    }

    async fn find_booking(&self, id: Uuid) -> Result<Option<Booking>> {
        Ok(self.bookings.get(&id).map(|b| b.clone()))
    }

    async fn find_by_external_ref(&self, external_ref: &str) -> Result<Option<Booking>> {
        Ok(self
            .bookings
            .iter()
            .find(|b| b.external_ref.as_deref() == Some(external_ref))
            .map(|b| b.clone()))
    }

    async fn set_external_ref(
        &self,
        id: Uuid,
        external_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome> {
        let mut booking = self.bookings.get_mut(&id).ok_or(BookingError::BookingNotFound)?;

        if booking.status != BookingStatus::Reserved {
            return Ok(TransitionOutcome::Unchanged(booking.clone()));
        }

        booking.external_ref = Some(external_ref.to_string());
        booking.updated_at = now;
        Ok(TransitionOutcome::Applied {
            previous: BookingStatus::Reserved,
            booking: booking.clone(),
        })
    }

    async fn record_payment(
        &self,
        id: Uuid,
        transaction: &Transaction,
        now: DateTime<Utc>,
    ) -> Result<PaymentWrite> {
        // The entry guard serializes callbacks for this booking.
        let mut booking = self.bookings.get_mut(&id).ok_or(BookingError::BookingNotFound)?;
        let same_ref = booking.external_ref.as_deref() == Some(transaction.external_ref.as_str());

        match booking.status {
            BookingStatus::Reserved if same_ref || booking.external_ref.is_none() => {
                match self.transactions.entry(id) {
                    Entry::Occupied(_) => return Ok(PaymentWrite::Duplicate(booking.clone())),
                    Entry::Vacant(vacant) => {
                        vacant.insert(transaction.clone());
                    }
                }
                booking.status = BookingStatus::Paid;
                booking.external_ref = Some(transaction.external_ref.clone());
                booking.updated_at = now;
                Ok(PaymentWrite::Applied(booking.clone()))
            }
            BookingStatus::Paid | BookingStatus::Confirmed if same_ref => {
                Ok(PaymentWrite::Duplicate(booking.clone()))
            }
            _ => Ok(PaymentWrite::Rejected(booking.clone())),
        }
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[BookingStatus],
        to: BookingStatus,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome> {
        let mut booking = self.bookings.get_mut(&id).ok_or(BookingError::BookingNotFound)?;

        if !from.contains(&booking.status) || !booking.status.can_transition_to(to) {
            return Ok(TransitionOutcome::Unchanged(booking.clone()));
        }

        let previous = booking.status;
        booking.status = to;
        booking.updated_at = now;

        if !to.holds_slot() {
            let hold = Self::hold_of(&booking);
            self.ledger.release_now(&hold);
            self.active_slots.remove_if(&hold.key, |_, owner| *owner == id);
        }

        Ok(TransitionOutcome::Applied {
            previous,
            booking: booking.clone(),
        })
    }

    async fn transactions_for_booking(&self, booking_id: Uuid) -> Result<Vec<Transaction>> {
        Ok(self
            .transactions
            .get(&booking_id)
            .map(|t| vec![t.clone()])
            .unwrap_or_default())
    }

    async fn bookings_for_consumer(&self, consumer_id: Uuid) -> Result<Vec<Booking>> {
        let mut bookings: Vec<Booking> = self
            .bookings
            .iter()
            .filter(|b| b.consumer_id == consumer_id)
            .map(|b| b.clone())
            .collect();
        bookings.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(bookings)
    }

    async fn bookings_for_owner(&self, owner_id: Uuid) -> Result<Vec<Booking>> {
        let owned: Vec<Uuid> = self
            .fields
            .iter()
            .filter(|f| f.owner_id == owner_id)
            .map(|f| f.id)
            .collect();

        let mut bookings: Vec<Booking> = self
            .bookings
            .iter()
            .filter(|b| owned.contains(&b.field_id()))
            .map(|b| b.clone())
            .collect();
        bookings.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(bookings)
    }
}

#[async_trait]
impl FieldCatalog for MemoryStore {
    async fn field(&self, id: Uuid) -> Result<Option<Field>> {
        Ok(self.fields.get(&id).map(|f| f.clone()))
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn append(&self, notification: &Notification) -> Result<()> {
        self.notifications
            .write()
            .map_err(|_| Self::poisoned())?
            .push(notification.clone());
        Ok(())
    }

    async fn for_recipient(&self, recipient_id: Uuid) -> Result<Vec<Notification>> {
        let notifications = self.notifications.read().map_err(|_| Self::poisoned())?;
        let mut mine: Vec<Notification> = notifications
            .iter()
            .filter(|n| n.recipient_id == recipient_id)
            .cloned()
            .collect();
        mine.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(mine)
    }

    async fn mark_read(&self, id: Uuid, recipient_id: Uuid) -> Result<bool> {
        let mut notifications = self.notifications.write().map_err(|_| Self::poisoned())?;
        match notifications
            .iter_mut()
            .find(|n| n.id == id && n.recipient_id == recipient_id)
        {
            Some(notification) => {
                notification.read = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn append(&self, entry: &AuditLogEntry) -> Result<()> {
        self.audit_log
            .write()
            .map_err(|_| Self::poisoned())?
            .push(entry.clone());
        Ok(())
    }

    async fn for_target(&self, target_id: Uuid) -> Result<Vec<AuditLogEntry>> {
        let entries = self.audit_log.read().map_err(|_| Self::poisoned())?;
        Ok(entries
            .iter()
            .filter(|e| e.target_id == target_id)
            .cloned()
            .collect())
    }
}
