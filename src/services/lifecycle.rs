//! Booking lifecycle: reserve, pay, confirm, cancel, complete.
//!
//! Every state change goes through a conditional store write, so concurrent
//! callers racing on the same booking cannot both win. Side effects run after
//! the write and never undo it.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Offset, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{BookingError, Result};
use crate::models::identity::{authorize, Action};
use crate::models::{Booking, BookingStatus, Caller, Money, Role, TimeSlot, Transaction};
use crate::services::availability::{availability_for, validate_slot_start, Availability, OpeningHours};
use crate::services::cancellation::{check_cancellable, Refund, DEFAULT_CANCELLATION_WINDOW_HOURS};
use crate::services::dispatcher::SideEffectDispatcher;
use crate::services::payment_gateway::{
    merchant_order_ref, PaymentCallback, PaymentGateway, PaymentOutcome, PaymentRequest, PaymentSession,
};
use crate::services::pricing;
use crate::services::slot_ledger::{HoldAttempt, SlotLedger};
use crate::store::{BookingStore, FieldCatalog, PaymentWrite, TransitionOutcome};

/// Policy values fixed at startup.
#[derive(Debug, Clone)]
pub struct BookingPolicy {
    pub platform_fee_per_match: Money,
    pub cancellation_window: Duration,
    pub require_approved_field: bool,
    pub local_offset: FixedOffset,
    pub opening_hour: u32,
    pub closing_hour: u32,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            platform_fee_per_match: Money::from_major(50),
            cancellation_window: Duration::hours(DEFAULT_CANCELLATION_WINDOW_HOURS),
            require_approved_field: true,
            local_offset: FixedOffset::east_opt(3 * 3600).unwrap_or_else(|| Utc.fix()),
            opening_hour: 9,
            closing_hour: 24,
        }
    }
}

impl BookingPolicy {
    pub fn opening_hours(&self) -> OpeningHours {
        OpeningHours {
            offset: self.local_offset,
            opening_hour: self.opening_hour,
            closing_hour: self.closing_hour,
        }
    }
}

/// What a payment result did to the booking.
#[derive(Debug, Clone)]
pub enum PaymentResult {
    Confirmed(Booking),
    PaymentFailed(Booking),
    /// Already applied for this reference; absorbed without side effects.
    Duplicate(Booking),
    /// Booking is in a state that cannot take this result.
    Rejected(Booking),
    /// No such booking; logged and dropped.
    Discarded,
}

pub struct BookingService {
    ledger: Arc<dyn SlotLedger>,
    bookings: Arc<dyn BookingStore>,
    fields: Arc<dyn FieldCatalog>,
    gateway: Arc<dyn PaymentGateway>,
    dispatcher: Arc<SideEffectDispatcher>,
    clock: Arc<dyn Clock>,
    policy: BookingPolicy,
}

impl BookingService {
    pub fn new(
        ledger: Arc<dyn SlotLedger>,
        bookings: Arc<dyn BookingStore>,
        fields: Arc<dyn FieldCatalog>,
        gateway: Arc<dyn PaymentGateway>,
        dispatcher: Arc<SideEffectDispatcher>,
        clock: Arc<dyn Clock>,
        policy: BookingPolicy,
    ) -> Self {
        Self {
            ledger,
            bookings,
            fields,
            gateway,
            dispatcher,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> &BookingPolicy {
        &self.policy
    }

    /// Reserves a slot for the caller.
    ///
    /// The hold is taken with a single conditional write; the booking is then
    /// persisted with the hold attached. If persisting fails the hold is
    /// released before returning.
    #[tracing::instrument(skip(self, caller), fields(%field_id, %start))]
    pub async fn create(
        &self,
        caller: Option<&Caller>,
        field_id: Uuid,
        start: DateTime<Utc>,
        is_subscription: bool,
    ) -> Result<Booking> {
        let caller = authorize(caller, Action::CreateBooking)?;

        let field = self
            .fields
            .field(field_id)
            .await?
            .ok_or(BookingError::FieldNotFound)?;

        if self.policy.require_approved_field && !field.approved {
            return Err(BookingError::FieldNotApproved);
        }

        let now = self.clock.now();
        validate_slot_start(start, now, &self.policy.opening_hours())?;

        let quote = pricing::price(field.base_price, is_subscription, self.policy.platform_fee_per_match)?;
        if !quote.amounts.is_balanced() {
            tracing::error!(amounts = ?quote.amounts, "Price breakdown does not add up; refusing to persist");
            return Err(BookingError::InvariantViolation(
                "total_paid != owner_share + platform_fee".to_string(),
            ));
        }

        let slot = TimeSlot::new(field_id, start);
        let hold = match self.ledger.try_hold(&slot).await? {
            HoldAttempt::Held(hold) => hold,
            HoldAttempt::Conflict => {
                tracing::info!("Slot already taken");
                return Err(BookingError::SlotUnavailable);
            }
        };

        let booking = Booking {
            id: Uuid::new_v4(),
            consumer_id: caller.user_id,
            slot,
            is_subscription,
            matches_remaining: quote.matches_remaining,
            amounts: quote.amounts,
            status: BookingStatus::Reserved,
            external_ref: None,
            hold_id: hold.id,
            created_at: now,
            updated_at: now,
        };

        if let Err(e) = self.bookings.insert_booking(&booking, &hold).await {
            if let Err(release_err) = self.ledger.release(&hold).await {
                // Left for the orphan sweep.
                tracing::error!(hold_id = %hold.id, error = %release_err, "Failed to release hold after insert failure");
            }
            return Err(e);
        }

        tracing::info!(
            booking_id = %booking.id,
            consumer_id = %booking.consumer_id,
            total_paid = %booking.amounts.total_paid,
            "Booking reserved"
        );

        Ok(booking)
    }

    /// Opens a payment session for a reserved booking.
    ///
    /// The order reference is stored before the gateway is called, so a callback
    /// can never arrive for a reference the store does not know.
    #[tracing::instrument(skip(self, caller), fields(%booking_id))]
    pub async fn initiate_payment(&self, caller: Option<&Caller>, booking_id: Uuid) -> Result<PaymentSession> {
        let caller = authorize(caller, Action::ManageBooking)?;

        let booking = self
            .bookings
            .find_booking(booking_id)
            .await?
            .ok_or(BookingError::BookingNotFound)?;

        if booking.consumer_id != caller.user_id {
            return Err(BookingError::NotOwner);
        }

        let external_ref = merchant_order_ref(booking.id);
        let now = self.clock.now();

        if let TransitionOutcome::Unchanged(current) =
            self.bookings.set_external_ref(booking.id, &external_ref, now).await?
        {
            return Err(BookingError::InvalidInput(format!(
                "booking is {} and not awaiting payment",
                current.status
            )));
        }

        let request = PaymentRequest {
            booking_id: booking.id,
            consumer_id: booking.consumer_id,
            external_ref,
            amount: booking.amounts.total_paid,
            description: format!(
                "Field booking {}",
                booking
                    .slot
                    .start
                    .with_timezone(&self.policy.local_offset)
                    .format("%Y-%m-%d %H:%M")
            ),
        };

        let session = self.gateway.initiate_payment(&request).await?;
        tracing::info!(external_ref = %session.external_ref, simulated = session.simulated, "Payment initiated");

        Ok(session)
    }

    /// Entry point for processor callbacks. Safe to call any number of times.
    #[tracing::instrument(skip(self, callback), fields(external_ref = %callback.external_ref, status = %callback.status))]
    pub async fn handle_callback(&self, callback: &PaymentCallback) -> Result<PaymentResult> {
        if !self.gateway.verify_callback(callback) {
            tracing::warn!("Rejected payment callback with bad signature");
            return Err(BookingError::InvalidSignature);
        }

        let Some(booking) = self.bookings.find_by_external_ref(&callback.external_ref).await? else {
            tracing::warn!("Payment callback for unknown reference discarded");
            return Ok(PaymentResult::Discarded);
        };

        let outcome = callback.outcome();
        if outcome == PaymentOutcome::Success && callback.amount() != booking.amounts.total_paid {
            tracing::error!(
                booking_id = %booking.id,
                reported = %callback.amount(),
                expected = %booking.amounts.total_paid,
                "Payment amount mismatch"
            );
            return Err(BookingError::InvariantViolation(format!(
                "callback amount {} does not match booking total {}",
                callback.amount(),
                booking.amounts.total_paid
            )));
        }

        self.apply_payment_result(booking.id, &callback.external_ref, outcome)
            .await
    }

    /// Applies a payment outcome, keyed on `external_ref` for deduplication.
    ///
    /// Success: `reserved -> paid` together with the transaction row, then the
    /// booking moves to `confirmed` and the owner is notified. Failure:
    /// `reserved -> cancelled_payment_failed` with the hold released.
    #[tracing::instrument(skip(self), fields(%booking_id, %external_ref, ?outcome))]
    pub async fn apply_payment_result(
        &self,
        booking_id: Uuid,
        external_ref: &str,
        outcome: PaymentOutcome,
    ) -> Result<PaymentResult> {
        let Some(booking) = self.bookings.find_booking(booking_id).await? else {
            tracing::warn!("Payment result for unknown booking discarded");
            return Ok(PaymentResult::Discarded);
        };

        let now = self.clock.now();

        match outcome {
            PaymentOutcome::Success => {
                let transaction = Transaction::success(
                    booking.id,
                    external_ref,
                    booking.amounts.total_paid,
                    booking.amounts.platform_fee,
                    now,
                );

                match self.bookings.record_payment(booking.id, &transaction, now).await? {
                    PaymentWrite::Applied(paid) => {
                        tracing::info!(transaction_id = %transaction.id, "Payment recorded");
                        self.confirm(paid, now).await
                    }
                    PaymentWrite::Duplicate(current) if current.status == BookingStatus::Paid => {
                        // An earlier delivery recorded the payment but never confirmed.
                        tracing::debug!("Duplicate callback finishing an unconfirmed payment");
                        self.confirm(current, now).await
                    }
                    PaymentWrite::Duplicate(current) => {
                        tracing::debug!(status = %current.status, "Duplicate payment callback absorbed");
                        Ok(PaymentResult::Duplicate(current))
                    }
                    PaymentWrite::Rejected(current) => {
                        tracing::warn!(status = %current.status, "Payment success for a booking that cannot take it");
                        Ok(PaymentResult::Rejected(current))
                    }
                }
            }
            PaymentOutcome::Failure => {
                if booking
                    .external_ref
                    .as_deref()
                    .is_some_and(|current| current != external_ref)
                {
                    tracing::warn!("Failure for a superseded payment reference ignored");
                    return Ok(PaymentResult::Rejected(booking));
                }

                match self
                    .bookings
                    .transition(
                        booking.id,
                        &[BookingStatus::Reserved],
                        BookingStatus::CancelledPaymentFailed,
                        now,
                    )
                    .await?
                {
                    TransitionOutcome::Applied { booking, .. } => {
                        tracing::info!("Payment failed; slot released");
                        self.dispatcher.on_payment_failed(&booking, now).await;
                        Ok(PaymentResult::PaymentFailed(booking))
                    }
                    TransitionOutcome::Unchanged(current)
                        if current.status == BookingStatus::CancelledPaymentFailed =>
                    {
                        tracing::debug!("Duplicate failure callback absorbed");
                        Ok(PaymentResult::Duplicate(current))
                    }
                    TransitionOutcome::Unchanged(current) => {
                        tracing::warn!(status = %current.status, "Payment failure for a booking that cannot take it");
                        Ok(PaymentResult::Rejected(current))
                    }
                }
            }
        }
    }

    /// Moves a paid booking to `confirmed`. Whichever delivery wins that
    /// transition notifies the owner, so a payment recorded by a delivery that
    /// never got this far is still announced exactly once on redelivery.
    ///
    /// A failed field lookup leaves the booking `paid` and returns the error,
    /// so the gateway redelivers and the next attempt finishes the job.
    async fn confirm(&self, paid: Booking, now: DateTime<Utc>) -> Result<PaymentResult> {
        let field = match self.fields.field(paid.field_id()).await {
            Ok(field) => field,
            Err(e) => {
                tracing::warn!(error = %e, "Field lookup failed; booking left paid for redelivery");
                return Err(e);
            }
        };

        match self
            .bookings
            .transition(paid.id, &[BookingStatus::Paid], BookingStatus::Confirmed, now)
            .await?
        {
            TransitionOutcome::Applied { booking, .. } => {
                tracing::info!(booking_id = %booking.id, "Booking confirmed");
                match field {
                    Some(field) => {
                        self.dispatcher.on_booking_confirmed(&booking, &field, now).await;
                    }
                    None => tracing::warn!(field_id = %booking.field_id(), "Field vanished; owner not notified"),
                }
                Ok(PaymentResult::Confirmed(booking))
            }
            TransitionOutcome::Unchanged(current) if current.status == BookingStatus::Confirmed => {
                tracing::debug!("Concurrent delivery confirmed first");
                Ok(PaymentResult::Duplicate(current))
            }
            TransitionOutcome::Unchanged(current) => {
                tracing::warn!(status = %current.status, "Booking left paid state before confirmation");
                Ok(PaymentResult::Rejected(current))
            }
        }
    }

    /// Cancels a booking on behalf of its consumer and returns the refund owed.
    #[tracing::instrument(skip(self, caller), fields(%booking_id))]
    pub async fn cancel(&self, caller: Option<&Caller>, booking_id: Uuid) -> Result<Refund> {
        let caller = authorize(caller, Action::ManageBooking)?;

        let booking = self
            .bookings
            .find_booking(booking_id)
            .await?
            .ok_or(BookingError::BookingNotFound)?;

        let now = self.clock.now();
        check_cancellable(&booking, caller.user_id, now, self.policy.cancellation_window)?;

        let (previous, cancelled) = match self
            .bookings
            .transition(
                booking.id,
                &BookingStatus::ACTIVE,
                BookingStatus::CancelledByConsumer,
                now,
            )
            .await?
        {
            TransitionOutcome::Applied { previous, booking } => (previous, booking),
            TransitionOutcome::Unchanged(_) => return Err(BookingError::BookingNotCancellable),
        };

        let refund = Refund::for_cancelled(&cancelled, previous);
        tracing::info!(refund = %refund.amount, %previous, "Booking cancelled by consumer");

        let field = match self.fields.field(cancelled.field_id()).await {
            Ok(field) => field,
            Err(e) => {
                tracing::warn!(error = %e, "Field lookup failed; owner not notified");
                None
            }
        };
        self.dispatcher
            .on_cancellation(&cancelled, field.as_ref(), &refund, caller, now)
            .await;

        Ok(refund)
    }

    /// Marks a booking as played. Repeating the call is a no-op.
    #[tracing::instrument(skip(self), fields(%booking_id))]
    pub async fn complete(&self, booking_id: Uuid) -> Result<Booking> {
        let now = self.clock.now();

        match self
            .bookings
            .transition(booking_id, &BookingStatus::ACTIVE, BookingStatus::Completed, now)
            .await?
        {
            TransitionOutcome::Applied { booking, .. } => {
                tracing::info!("Booking completed");
                Ok(booking)
            }
            TransitionOutcome::Unchanged(current) if current.status == BookingStatus::Completed => Ok(current),
            TransitionOutcome::Unchanged(current) => Err(BookingError::InvalidInput(format!(
                "booking is {} and cannot be completed",
                current.status
            ))),
        }
    }

    pub async fn booking(&self, caller: Option<&Caller>, booking_id: Uuid) -> Result<Booking> {
        let caller = authorize(caller, Action::ManageBooking)?;

        let booking = self
            .bookings
            .find_booking(booking_id)
            .await?
            .ok_or(BookingError::BookingNotFound)?;

        if booking.consumer_id == caller.user_id || caller.role == Role::Admin {
            return Ok(booking);
        }

        match self.fields.field(booking.field_id()).await? {
            Some(field) if field.owner_id == caller.user_id => Ok(booking),
            _ => Err(BookingError::NotOwner),
        }
    }

    /// Consumers get their own bookings, owners the bookings on their fields.
    pub async fn bookings_for(&self, caller: Option<&Caller>) -> Result<Vec<Booking>> {
        let caller = authorize(caller, Action::ManageBooking)?;

        match caller.role {
            Role::Consumer => self.bookings.bookings_for_consumer(caller.user_id).await,
            Role::Owner => self.bookings.bookings_for_owner(caller.user_id).await,
            Role::Admin => Err(BookingError::Forbidden(
                "admins do not hold bookings".to_string(),
            )),
        }
    }

    pub async fn availability(&self, field_id: Uuid, date: NaiveDate) -> Result<Availability> {
        if self.fields.field(field_id).await?.is_none() {
            return Err(BookingError::FieldNotFound);
        }

        availability_for(self.ledger.as_ref(), field_id, date, &self.policy.opening_hours()).await
    }
}
