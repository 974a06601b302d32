//! Turns lifecycle transitions into notifications and audit entries.
//!
//! Writes are best-effort: a failed write is logged and parked for retry, and
//! never reaches back into the transition that triggered it.

use chrono::{DateTime, FixedOffset, Utc};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::models::identity::{authorize, Action};
use crate::models::{AuditLogEntry, Booking, Caller, Field, Notification};
use crate::services::cancellation::Refund;
use crate::store::{AuditStore, NotificationStore};

/// Parked effects kept for retry before the oldest are dropped.
pub const DEFAULT_RETRY_CAPACITY: usize = 10_000;

#[derive(Debug, Clone)]
pub enum PendingEffect {
    Notification(Notification),
    Audit(AuditLogEntry),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub written: usize,
    pub failed: usize,
}

pub struct SideEffectDispatcher {
    notifications: Arc<dyn NotificationStore>,
    audit: Arc<dyn AuditStore>,
    local_offset: FixedOffset,
    failed: Mutex<VecDeque<PendingEffect>>,
    retry_capacity: usize,
}

impl SideEffectDispatcher {
    pub fn new(
        notifications: Arc<dyn NotificationStore>,
        audit: Arc<dyn AuditStore>,
        local_offset: FixedOffset,
    ) -> Self {
        Self {
            notifications,
            audit,
            local_offset,
            failed: Mutex::new(VecDeque::new()),
            retry_capacity: DEFAULT_RETRY_CAPACITY,
        }
    }

    pub fn with_retry_capacity(mut self, capacity: usize) -> Self {
        self.retry_capacity = capacity.max(1);
        self
    }

    fn local_time(&self, at: DateTime<Utc>) -> String {
        at.with_timezone(&self.local_offset)
            .format("%Y-%m-%d %H:%M")
            .to_string()
    }

    /// Owner learns about the new confirmed booking.
    #[tracing::instrument(skip_all, fields(booking_id = %booking.id))]
    pub async fn on_booking_confirmed(&self, booking: &Booking, field: &Field, now: DateTime<Utc>) -> DispatchReport {
        let kind = if booking.is_subscription { "subscription" } else { "single match" };
        let message = format!(
            "New booking on {}: {} ({})",
            field.name,
            self.local_time(booking.slot.start),
            kind
        );

        let audit = AuditLogEntry::system(
            "booking.confirmed",
            "booking",
            booking.id,
            json!({
                "field_id": field.id,
                "slot_start": booking.slot.start,
                "total_paid": booking.amounts.total_paid.minor(),
                "owner_share": booking.amounts.owner_share.minor(),
                "platform_fee": booking.amounts.platform_fee.minor(),
                "external_ref": booking.external_ref,
            }),
            now,
        );

        self.dispatch(vec![
            PendingEffect::Notification(Notification::new(field.owner_id, "booking", message, now)),
            PendingEffect::Audit(audit),
        ])
        .await
    }

    #[tracing::instrument(skip_all, fields(booking_id = %booking.id))]
    pub async fn on_payment_failed(&self, booking: &Booking, now: DateTime<Utc>) -> DispatchReport {
        let message = format!(
            "Payment for your booking at {} did not go through; the slot was released.",
            self.local_time(booking.slot.start)
        );
        let audit = AuditLogEntry::system(
            "booking.payment_failed",
            "booking",
            booking.id,
            json!({ "external_ref": booking.external_ref }),
            now,
        );

        self.dispatch(vec![
            PendingEffect::Notification(Notification::new(booking.consumer_id, "payment", message, now)),
            PendingEffect::Audit(audit),
        ])
        .await
    }

    /// Cancellation notice to the owner, plus the refund record when money was taken.
    #[tracing::instrument(skip_all, fields(booking_id = %booking.id))]
    pub async fn on_cancellation(
        &self,
        booking: &Booking,
        field: Option<&Field>,
        refund: &Refund,
        actor: &Caller,
        now: DateTime<Utc>,
    ) -> DispatchReport {
        let mut effects = Vec::with_capacity(3);

        if let Some(field) = field {
            effects.push(PendingEffect::Notification(Notification::new(
                field.owner_id,
                "cancellation",
                format!(
                    "Booking on {} at {} was cancelled by the customer.",
                    field.name,
                    self.local_time(booking.slot.start)
                ),
                now,
            )));
        }

        effects.push(PendingEffect::Audit(
            AuditLogEntry::system(
                "booking.cancelled",
                "booking",
                booking.id,
                json!({ "slot_start": booking.slot.start, "previous_status": refund.previous_status }),
                now,
            )
            .by_actor(actor.user_id, actor.email.clone()),
        ));

        if refund.amount.is_positive() {
            effects.push(PendingEffect::Audit(AuditLogEntry::system(
                "refund.requested",
                "booking",
                booking.id,
                json!({
                    "consumer_id": refund.consumer_id,
                    "amount": refund.amount.minor(),
                    "external_ref": booking.external_ref,
                }),
                now,
            )));
        }

        self.dispatch(effects).await
    }

    pub async fn on_field_approved(&self, field: &Field, admin: &Caller, now: DateTime<Utc>) -> Result<DispatchReport> {
        let admin = authorize(Some(admin), Action::ModerateField)?;

        Ok(self
            .dispatch(vec![
                PendingEffect::Notification(Notification::new(
                    field.owner_id,
                    "field",
                    format!("Your field {} was approved and is open for bookings.", field.name),
                    now,
                )),
                PendingEffect::Audit(
                    AuditLogEntry::system("field.approved", "field", field.id, json!({}), now)
                        .by_actor(admin.user_id, admin.email.clone()),
                ),
            ])
            .await)
    }

    pub async fn on_field_rejected(
        &self,
        field: &Field,
        admin: &Caller,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<DispatchReport> {
        let admin = authorize(Some(admin), Action::ModerateField)?;

        Ok(self
            .dispatch(vec![
                PendingEffect::Notification(Notification::new(
                    field.owner_id,
                    "field",
                    format!("Your field {} was rejected: {}", field.name, reason),
                    now,
                )),
                PendingEffect::Audit(
                    AuditLogEntry::system("field.rejected", "field", field.id, json!({ "reason": reason }), now)
                        .by_actor(admin.user_id, admin.email.clone()),
                ),
            ])
            .await)
    }

    async fn dispatch(&self, effects: Vec<PendingEffect>) -> DispatchReport {
        let mut report = DispatchReport::default();

        for effect in effects {
            let written = match &effect {
                PendingEffect::Notification(n) => self.notifications.append(n).await,
                PendingEffect::Audit(entry) => self.audit.append(entry).await,
            };

            match written {
                Ok(()) => report.written += 1,
                Err(e) => {
                    tracing::error!(error = %e, ?effect, "Side effect write failed; parked for retry");
                    report.failed += 1;
                    self.park(effect);
                }
            }
        }

        report
    }

    fn park(&self, effect: PendingEffect) {
        let mut failed = match self.failed.lock() {
            Ok(failed) => failed,
            Err(_) => {
                tracing::error!(?effect, "Retry queue poisoned; side effect dropped");
                return;
            }
        };

        while failed.len() >= self.retry_capacity {
            if let Some(dropped) = failed.pop_front() {
                tracing::error!(
                    ?dropped,
                    capacity = self.retry_capacity,
                    "Retry queue full; oldest side effect dropped"
                );
            }
        }
        failed.push_back(effect);
    }

    pub fn pending_count(&self) -> usize {
        self.failed.lock().map(|f| f.len()).unwrap_or(0)
    }

    /// Hands the parked effects to an external worker.
    pub fn drain_failed(&self) -> Vec<PendingEffect> {
        self.failed
            .lock()
            .map(|mut f| Vec::from(std::mem::take(&mut *f)))
            .unwrap_or_default()
    }

    /// Re-attempts every parked effect once; failures are parked again.
    pub async fn retry_failed(&self) -> DispatchReport {
        let pending = self.drain_failed();
        if pending.is_empty() {
            return DispatchReport::default();
        }

        let report = self.dispatch(pending).await;
        tracing::info!(?report, "Retried parked side effects");
        report
    }
}
