use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use slotbook::app::AppState;
use slotbook::clock::ManualClock;
use slotbook::models::{Booking, BookingStatus, Caller, Field, Money, Notification, Role, Transaction};
use slotbook::services::payment_gateway::{PaymentCallback, PaymentOutcome, SimulatedGateway};
use slotbook::services::{BookingPolicy, BookingService, PaymentResult, SideEffectDispatcher};
use slotbook::store::{AuditStore, BookingStore, FieldCatalog, MemoryStore, NotificationStore, PaymentWrite};
use slotbook::BookingError;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
}

/// 18:00 local (+03:00), nine days after `t0`
fn kickoff() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 10, 15, 0, 0).unwrap()
}

struct Harness {
    state: AppState,
    store: MemoryStore,
    clock: Arc<ManualClock>,
    field: Field,
    owner: Caller,
    consumer: Caller,
}

fn field_for(owner: &Caller, approved: bool) -> Field {
    Field {
        id: Uuid::new_v4(),
        owner_id: owner.user_id,
        name: "Moda Arena".to_string(),
        base_price: Money::from_major(100),
        subscription_price: Some(Money::from_major(350)),
        approved,
    }
}

fn harness_with(policy: BookingPolicy, now: DateTime<Utc>) -> Harness {
    let store = MemoryStore::new();
    let owner = Caller::new(Uuid::new_v4(), Role::Owner);
    let consumer = Caller::new(Uuid::new_v4(), Role::Consumer);
    let field = field_for(&owner, true);
    store.put_field(field.clone());

    let clock = Arc::new(ManualClock::new(now));
    let state = AppState::in_memory(store.clone(), clock.clone(), policy);

    Harness {
        state,
        store,
        clock,
        field,
        owner,
        consumer,
    }
}

fn harness() -> Harness {
    harness_with(BookingPolicy::default(), t0())
}

fn callback(external_ref: &str, status: &str, booking: &Booking) -> PaymentCallback {
    PaymentCallback {
        external_ref: external_ref.to_string(),
        status: status.to_string(),
        total_amount: booking.amounts.total_paid.minor(),
        hash: String::new(),
    }
}

impl Harness {
    async fn reserve(&self, start: DateTime<Utc>) -> Booking {
        self.state
            .bookings
            .create(Some(&self.consumer), self.field.id, start, false)
            .await
            .unwrap()
    }

    async fn pay(&self, booking: &Booking, status: &str) -> PaymentResult {
        let session = self
            .state
            .bookings
            .initiate_payment(Some(&self.consumer), booking.id)
            .await
            .unwrap();
        self.state
            .bookings
            .handle_callback(&callback(&session.external_ref, status, booking))
            .await
            .unwrap()
    }

    async fn notifications_of(&self, caller: &Caller) -> Vec<Notification> {
        self.state.inbox.list(Some(caller)).await.unwrap()
    }
}

#[tokio::test]
async fn test_single_match_reservation_is_priced_and_reserved() {
    let h = harness();
    let booking = h.reserve(kickoff()).await;

    assert_eq!(booking.status, BookingStatus::Reserved);
    assert_eq!(booking.amounts.total_paid, Money::from_major(150));
    assert_eq!(booking.amounts.owner_share, Money::from_major(100));
    assert_eq!(booking.amounts.platform_fee, Money::from_major(50));
    assert_eq!(booking.matches_remaining, 1);
    assert!(h.store.ledger().is_held(&booking.slot));
}

#[tokio::test]
async fn test_subscription_reservation_bills_four_matches() {
    let h = harness();
    let booking = h
        .state
        .bookings
        .create(Some(&h.consumer), h.field.id, kickoff(), true)
        .await
        .unwrap();

    assert!(booking.is_subscription);
    assert_eq!(booking.amounts.total_paid, Money::from_major(600));
    assert_eq!(booking.amounts.owner_share, Money::from_major(400));
    assert_eq!(booking.amounts.platform_fee, Money::from_major(200));
    assert_eq!(booking.matches_remaining, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_simultaneous_reservations_have_exactly_one_winner() {
    let policy = BookingPolicy {
        local_offset: FixedOffset::east_opt(0).unwrap(),
        ..BookingPolicy::default()
    };
    let h = harness_with(policy, Utc.with_ymd_and_hms(2023, 12, 31, 12, 0, 0).unwrap());
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 18, 0, 0).unwrap();

    let handles: Vec<_> = (0..32)
        .map(|i| {
            let bookings = h.state.bookings.clone();
            let field_id = h.field.id;
            let caller = Caller::new(Uuid::new_v4(), Role::Consumer);
            tokio::spawn(async move { bookings.create(Some(&caller), field_id, start, i % 2 == 0).await })
        })
        .collect();

    let mut won = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => won += 1,
            Err(BookingError::SlotUnavailable) => conflicts += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(won, 1);
    assert_eq!(conflicts, 31);
}

#[tokio::test]
async fn test_successful_payment_confirms_and_notifies_owner() {
    let h = harness();
    let booking = h.reserve(kickoff()).await;

    let result = h.pay(&booking, "success").await;
    let PaymentResult::Confirmed(confirmed) = result else {
        panic!("expected confirmation, got {result:?}");
    };

    assert_eq!(confirmed.status, BookingStatus::Confirmed);
    assert!(confirmed.amounts.is_balanced());
    assert_eq!(h.store.transaction_count(), 1);

    let owner_inbox = h.notifications_of(&h.owner).await;
    assert_eq!(owner_inbox.len(), 1);
    assert_eq!(owner_inbox[0].kind, "booking");
    assert!(owner_inbox[0].message.contains("18:00"));

    let audit = h.state.audit.for_target(booking.id).await.unwrap();
    assert!(audit.iter().any(|e| e.action == "booking.confirmed"));
}

#[tokio::test]
async fn test_redelivered_success_callback_creates_one_transaction() {
    let h = harness();
    let booking = h.reserve(kickoff()).await;
    let session = h
        .state
        .bookings
        .initiate_payment(Some(&h.consumer), booking.id)
        .await
        .unwrap();
    let delivery = callback(&session.external_ref, "success", &booking);

    let first = h.state.bookings.handle_callback(&delivery).await.unwrap();
    let second = h.state.bookings.handle_callback(&delivery).await.unwrap();

    assert!(matches!(first, PaymentResult::Confirmed(_)));
    assert!(matches!(second, PaymentResult::Duplicate(ref b) if b.status == BookingStatus::Confirmed));
    assert_eq!(h.store.transaction_count(), 1);
    assert_eq!(h.notifications_of(&h.owner).await.len(), 1);
}

#[tokio::test]
async fn test_apply_payment_result_twice_is_idempotent() {
    let h = harness();
    let booking = h.reserve(kickoff()).await;

    for _ in 0..3 {
        h.state
            .bookings
            .apply_payment_result(booking.id, "X", PaymentOutcome::Success)
            .await
            .unwrap();
    }

    let transactions = h.store.transaction_count();
    assert_eq!(transactions, 1);
    assert_eq!(h.notifications_of(&h.owner).await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicate_callbacks_cannot_both_win() {
    let h = harness();
    let booking = h.reserve(kickoff()).await;

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let bookings = h.state.bookings.clone();
            let id = booking.id;
            tokio::spawn(async move {
                bookings
                    .apply_payment_result(id, "X", PaymentOutcome::Success)
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut confirmed = 0;
    for handle in handles {
        if let PaymentResult::Confirmed(_) = handle.await.unwrap() {
            confirmed += 1;
        }
    }

    assert_eq!(confirmed, 1);
    assert_eq!(h.store.transaction_count(), 1);
    assert_eq!(h.notifications_of(&h.owner).await.len(), 1);
}

#[tokio::test]
async fn test_failed_payment_releases_slot_for_next_consumer() {
    let h = harness();
    let booking = h.reserve(kickoff()).await;

    let result = h.pay(&booking, "failed").await;
    assert!(matches!(result, PaymentResult::PaymentFailed(ref b) if b.status == BookingStatus::CancelledPaymentFailed));
    assert_eq!(h.store.transaction_count(), 0);
    assert!(!h.store.ledger().is_held(&booking.slot));

    let consumer_inbox = h.notifications_of(&h.consumer).await;
    assert_eq!(consumer_inbox.len(), 1);
    assert_eq!(consumer_inbox[0].kind, "payment");

    let other = Caller::new(Uuid::new_v4(), Role::Consumer);
    let rebooked = h
        .state
        .bookings
        .create(Some(&other), h.field.id, kickoff(), false)
        .await
        .unwrap();
    assert_eq!(rebooked.status, BookingStatus::Reserved);
}

#[tokio::test]
async fn test_redelivered_failure_callback_is_absorbed() {
    let h = harness();
    let booking = h.reserve(kickoff()).await;
    let session = h
        .state
        .bookings
        .initiate_payment(Some(&h.consumer), booking.id)
        .await
        .unwrap();
    let delivery = callback(&session.external_ref, "failed", &booking);

    let first = h.state.bookings.handle_callback(&delivery).await.unwrap();
    let second = h.state.bookings.handle_callback(&delivery).await.unwrap();

    assert!(matches!(first, PaymentResult::PaymentFailed(_)));
    assert!(matches!(second, PaymentResult::Duplicate(_)));
    assert_eq!(h.notifications_of(&h.consumer).await.len(), 1);
}

#[tokio::test]
async fn test_late_failure_does_not_undo_confirmed_payment() {
    let h = harness();
    let booking = h.reserve(kickoff()).await;
    h.state
        .bookings
        .apply_payment_result(booking.id, "X", PaymentOutcome::Success)
        .await
        .unwrap();

    let late = h
        .state
        .bookings
        .apply_payment_result(booking.id, "X", PaymentOutcome::Failure)
        .await
        .unwrap();

    assert!(matches!(late, PaymentResult::Rejected(ref b) if b.status == BookingStatus::Confirmed));
    assert!(h.store.ledger().is_held(&booking.slot));
}

#[tokio::test]
async fn test_payment_result_for_unknown_booking_is_discarded() {
    let h = harness();

    let by_id = h
        .state
        .bookings
        .apply_payment_result(Uuid::new_v4(), "X", PaymentOutcome::Success)
        .await
        .unwrap();
    assert!(matches!(by_id, PaymentResult::Discarded));

    let by_ref = h
        .state
        .bookings
        .handle_callback(&PaymentCallback {
            external_ref: "nosuchref".to_string(),
            status: "success".to_string(),
            total_amount: 15000,
            hash: String::new(),
        })
        .await
        .unwrap();
    assert!(matches!(by_ref, PaymentResult::Discarded));
}

#[tokio::test]
async fn test_callback_amount_mismatch_is_rejected() {
    let h = harness();
    let booking = h.reserve(kickoff()).await;
    let session = h
        .state
        .bookings
        .initiate_payment(Some(&h.consumer), booking.id)
        .await
        .unwrap();

    let mut delivery = callback(&session.external_ref, "success", &booking);
    delivery.total_amount -= 1;

    let result = h.state.bookings.handle_callback(&delivery).await;
    assert!(matches!(result, Err(BookingError::InvariantViolation(_))));
    assert_eq!(h.store.transaction_count(), 0);
}

#[tokio::test]
async fn test_cancel_eighty_hours_ahead_succeeds_sixty_hours_fails() {
    let h = harness_with(BookingPolicy::default(), Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap());

    // 21:00 local, 80h after the clock
    let far = Utc.with_ymd_and_hms(2024, 6, 4, 18, 0, 0).unwrap();
    let booking = h.reserve(far).await;
    h.state
        .bookings
        .apply_payment_result(booking.id, "X", PaymentOutcome::Success)
        .await
        .unwrap();

    let refund = h.state.bookings.cancel(Some(&h.consumer), booking.id).await.unwrap();
    assert_eq!(refund.amount, Money::from_major(150));
    assert_eq!(refund.previous_status, BookingStatus::Confirmed);

    // 18:00 local, clock moved to 60h before kickoff
    let near = Utc.with_ymd_and_hms(2024, 6, 4, 15, 0, 0).unwrap();
    let booking = h.reserve(near).await;
    h.clock.set(near - Duration::hours(60));

    let result = h.state.bookings.cancel(Some(&h.consumer), booking.id).await;
    assert!(matches!(result, Err(BookingError::BookingNotCancellable)));
}

#[tokio::test]
async fn test_cancellation_window_boundary_is_exclusive() {
    let h = harness();
    let booking = h.reserve(kickoff()).await;

    h.clock.set(kickoff() - Duration::hours(72));
    let result = h.state.bookings.cancel(Some(&h.consumer), booking.id).await;
    assert!(matches!(result, Err(BookingError::BookingNotCancellable)));

    h.clock.set(kickoff() - Duration::hours(72) - Duration::seconds(1));
    assert!(h.state.bookings.cancel(Some(&h.consumer), booking.id).await.is_ok());
}

#[tokio::test]
async fn test_cancellation_releases_slot_and_records_refund() {
    let h = harness();
    let booking = h.reserve(kickoff()).await;
    h.pay(&booking, "success").await;

    let refund = h.state.bookings.cancel(Some(&h.consumer), booking.id).await.unwrap();
    assert_eq!(refund.amount, booking.amounts.total_paid);
    assert!(!h.store.ledger().is_held(&booking.slot));

    let audit = h.state.audit.for_target(booking.id).await.unwrap();
    let cancelled = audit
        .iter()
        .find(|e| e.action == "booking.cancelled")
        .expect("cancellation audited");
    assert_eq!(cancelled.actor_id, Some(h.consumer.user_id));
    assert!(audit.iter().any(|e| e.action == "refund.requested"));

    let owner_inbox = h.notifications_of(&h.owner).await;
    assert!(owner_inbox.iter().any(|n| n.kind == "cancellation"));

    // Slot is free again
    let other = Caller::new(Uuid::new_v4(), Role::Consumer);
    h.state
        .bookings
        .create(Some(&other), h.field.id, kickoff(), false)
        .await
        .unwrap();

    // Terminal now
    let again = h.state.bookings.cancel(Some(&h.consumer), booking.id).await;
    assert!(matches!(again, Err(BookingError::BookingNotCancellable)));
}

#[tokio::test]
async fn test_cancelling_unpaid_reservation_owes_nothing() {
    let h = harness();
    let booking = h.reserve(kickoff()).await;

    let refund = h.state.bookings.cancel(Some(&h.consumer), booking.id).await.unwrap();
    assert_eq!(refund.amount, Money::ZERO);

    let audit = h.state.audit.for_target(booking.id).await.unwrap();
    assert!(!audit.iter().any(|e| e.action == "refund.requested"));
}

#[tokio::test]
async fn test_only_the_booking_consumer_can_cancel() {
    let h = harness();
    let booking = h.reserve(kickoff()).await;
    let stranger = Caller::new(Uuid::new_v4(), Role::Consumer);

    let result = h.state.bookings.cancel(Some(&stranger), booking.id).await;
    assert!(matches!(result, Err(BookingError::NotOwner)));
    assert!(h.store.ledger().is_held(&booking.slot));
}

#[tokio::test]
async fn test_complete_releases_slot_and_is_repeatable() {
    let h = harness();
    let booking = h.reserve(kickoff()).await;
    h.pay(&booking, "success").await;

    let done = h.state.bookings.complete(booking.id).await.unwrap();
    assert_eq!(done.status, BookingStatus::Completed);
    assert!(!h.store.ledger().is_held(&booking.slot));

    let again = h.state.bookings.complete(booking.id).await.unwrap();
    assert_eq!(again.status, BookingStatus::Completed);
}

#[tokio::test]
async fn test_initiating_payment_requires_reserved_booking() {
    let h = harness();
    let booking = h.reserve(kickoff()).await;
    h.pay(&booking, "success").await;

    let result = h
        .state
        .bookings
        .initiate_payment(Some(&h.consumer), booking.id)
        .await;
    assert!(matches!(result, Err(BookingError::InvalidInput(_))));

    let stranger = Caller::new(Uuid::new_v4(), Role::Consumer);
    let result = h.state.bookings.initiate_payment(Some(&stranger), booking.id).await;
    assert!(matches!(result, Err(BookingError::NotOwner)));
}

#[tokio::test]
async fn test_simulated_session_points_at_simulator() {
    let h = harness();
    let booking = h.reserve(kickoff()).await;

    let session = h
        .state
        .bookings
        .initiate_payment(Some(&h.consumer), booking.id)
        .await
        .unwrap();

    assert!(session.simulated);
    assert!(session.external_ref.starts_with(&booking.id.simple().to_string()));
    assert_eq!(
        session.payment_url,
        format!("/api/payments/simulate/{}", session.external_ref)
    );
}

#[tokio::test]
async fn test_unapproved_field_rejects_reservations() {
    let h = harness();
    let pending = field_for(&h.owner, false);
    h.store.put_field(pending.clone());

    let result = h
        .state
        .bookings
        .create(Some(&h.consumer), pending.id, kickoff(), false)
        .await;
    assert!(matches!(result, Err(BookingError::FieldNotApproved)));
    assert!(h.store.ledger().is_empty());
}

#[tokio::test]
async fn test_unapproved_field_allowed_when_policy_disabled() {
    let policy = BookingPolicy {
        require_approved_field: false,
        ..BookingPolicy::default()
    };
    let h = harness_with(policy, t0());
    let pending = field_for(&h.owner, false);
    h.store.put_field(pending.clone());

    let booking = h
        .state
        .bookings
        .create(Some(&h.consumer), pending.id, kickoff(), false)
        .await
        .unwrap();
    assert_eq!(booking.field_id(), pending.id);
}

#[tokio::test]
async fn test_reservation_rejections() {
    let h = harness();
    let admin = Caller::new(Uuid::new_v4(), Role::Admin);
    let mut suspended = Caller::new(Uuid::new_v4(), Role::Consumer);
    suspended.suspended = true;

    let cases: Vec<(Option<&Caller>, Uuid, DateTime<Utc>)> = vec![
        (None, h.field.id, kickoff()),
        (Some(&admin), h.field.id, kickoff()),
        (Some(&suspended), h.field.id, kickoff()),
        (Some(&h.consumer), Uuid::new_v4(), kickoff()),
        (Some(&h.consumer), h.field.id, kickoff() + Duration::minutes(30)),
        (Some(&h.consumer), h.field.id, t0() - Duration::hours(1)),
    ];

    let results = {
        let mut out = Vec::new();
        for (caller, field_id, start) in cases {
            out.push(h.state.bookings.create(caller, field_id, start, false).await);
        }
        out
    };

    assert!(matches!(results[0], Err(BookingError::Unauthorized)));
    assert!(matches!(results[1], Err(BookingError::Forbidden(_))));
    assert!(matches!(results[2], Err(BookingError::Forbidden(_))));
    assert!(matches!(results[3], Err(BookingError::FieldNotFound)));
    assert!(matches!(results[4], Err(BookingError::InvalidInput(_))));
    assert!(matches!(results[5], Err(BookingError::InvalidInput(_))));
    assert!(h.store.ledger().is_empty());
}

#[tokio::test]
async fn test_owner_may_book_another_owners_field() {
    let h = harness();
    let other_owner = Caller::new(Uuid::new_v4(), Role::Owner);

    let booking = h
        .state
        .bookings
        .create(Some(&other_owner), h.field.id, kickoff(), false)
        .await
        .unwrap();
    assert_eq!(booking.consumer_id, other_owner.user_id);
}

#[tokio::test]
async fn test_bookings_listing_per_role() {
    let h = harness();
    let booking = h.reserve(kickoff()).await;

    let mine = h.state.bookings.bookings_for(Some(&h.consumer)).await.unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].id, booking.id);

    let on_my_fields = h.state.bookings.bookings_for(Some(&h.owner)).await.unwrap();
    assert_eq!(on_my_fields.len(), 1);

    let admin = Caller::new(Uuid::new_v4(), Role::Admin);
    let result = h.state.bookings.bookings_for(Some(&admin)).await;
    assert!(matches!(result, Err(BookingError::Forbidden(_))));

    let stranger = Caller::new(Uuid::new_v4(), Role::Consumer);
    assert!(matches!(
        h.state.bookings.booking(Some(&stranger), booking.id).await,
        Err(BookingError::NotOwner)
    ));
    assert!(h.state.bookings.booking(Some(&h.owner), booking.id).await.is_ok());
}

#[tokio::test]
async fn test_availability_reflects_held_slots() {
    let h = harness();
    h.reserve(kickoff()).await;
    let date = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();

    let availability = h.state.bookings.availability(h.field.id, date).await.unwrap();
    assert_eq!(availability.booked(), vec!["18:00"]);
    assert_eq!(availability.available().len(), 14);

    let missing = h.state.bookings.availability(Uuid::new_v4(), date).await;
    assert!(matches!(missing, Err(BookingError::FieldNotFound)));
}

#[tokio::test]
async fn test_mark_read_only_by_recipient() {
    let h = harness();
    let booking = h.reserve(kickoff()).await;
    h.pay(&booking, "success").await;

    let notification = h.notifications_of(&h.owner).await.remove(0);
    assert!(!notification.read);

    let result = h.state.inbox.mark_read(Some(&h.consumer), notification.id).await;
    assert!(matches!(result, Err(BookingError::InvalidInput(_))));
    assert_eq!(h.state.inbox.unread_count(Some(&h.owner)).await.unwrap(), 1);

    h.state.inbox.mark_read(Some(&h.owner), notification.id).await.unwrap();
    assert_eq!(h.state.inbox.unread_count(Some(&h.owner)).await.unwrap(), 0);

    assert!(matches!(
        h.state.inbox.list(None).await,
        Err(BookingError::Unauthorized)
    ));
}

#[tokio::test]
async fn test_field_moderation_notifies_owner_and_requires_admin() {
    let h = harness();
    let admin = Caller::new(Uuid::new_v4(), Role::Admin);

    let report = h
        .state
        .dispatcher
        .on_field_approved(&h.field, &admin, t0())
        .await
        .unwrap();
    assert_eq!(report.written, 2);

    h.state
        .dispatcher
        .on_field_rejected(&h.field, &admin, "missing photos", t0())
        .await
        .unwrap();

    let inbox = h.notifications_of(&h.owner).await;
    assert_eq!(inbox.iter().filter(|n| n.kind == "field").count(), 2);

    let audit = h.state.audit.for_target(h.field.id).await.unwrap();
    assert!(audit.iter().any(|e| e.action == "field.approved" && e.actor_id == Some(admin.user_id)));
    assert!(audit.iter().any(|e| e.action == "field.rejected"));

    let result = h.state.dispatcher.on_field_approved(&h.field, &h.owner, t0()).await;
    assert!(matches!(result, Err(BookingError::Forbidden(_))));
}

struct DownNotifications;

#[async_trait]
impl NotificationStore for DownNotifications {
    async fn append(&self, _notification: &Notification) -> slotbook::Result<()> {
        Err(sqlx::Error::PoolTimedOut.into())
    }

    async fn for_recipient(&self, _recipient_id: Uuid) -> slotbook::Result<Vec<Notification>> {
        Err(sqlx::Error::PoolTimedOut.into())
    }

    async fn mark_read(&self, _id: Uuid, _recipient_id: Uuid) -> slotbook::Result<bool> {
        Err(sqlx::Error::PoolTimedOut.into())
    }
}

#[tokio::test]
async fn test_notification_outage_does_not_roll_back_confirmation() {
    let store = MemoryStore::new();
    let owner = Caller::new(Uuid::new_v4(), Role::Owner);
    let consumer = Caller::new(Uuid::new_v4(), Role::Consumer);
    let field = field_for(&owner, true);
    store.put_field(field.clone());

    let policy = BookingPolicy::default();
    let audit: Arc<dyn AuditStore> = Arc::new(store.clone());
    let dispatcher = Arc::new(SideEffectDispatcher::new(
        Arc::new(DownNotifications),
        audit.clone(),
        policy.local_offset,
    ));
    let service = BookingService::new(
        Arc::new(store.ledger()),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(SimulatedGateway),
        dispatcher.clone(),
        Arc::new(ManualClock::new(t0())),
        policy,
    );

    let booking = service
        .create(Some(&consumer), field.id, kickoff(), false)
        .await
        .unwrap();
    let result = service
        .apply_payment_result(booking.id, "X", PaymentOutcome::Success)
        .await
        .unwrap();

    assert!(matches!(result, PaymentResult::Confirmed(ref b) if b.status == BookingStatus::Confirmed));
    assert_eq!(store.transaction_count(), 1);
    assert_eq!(dispatcher.pending_count(), 1);

    // Audit sink was healthy
    let entries = audit.for_target(booking.id).await.unwrap();
    assert!(entries.iter().any(|e| e.action == "booking.confirmed"));

    // Still down: the effect is parked again
    let report = dispatcher.retry_failed().await;
    assert_eq!(report.failed, 1);
    assert_eq!(dispatcher.pending_count(), 1);

    let drained = dispatcher.drain_failed();
    assert_eq!(drained.len(), 1);
    assert_eq!(dispatcher.pending_count(), 0);
}

#[tokio::test]
async fn test_payment_recorded_before_crash_is_confirmed_and_announced_on_redelivery() {
    let h = harness();
    let booking = h.reserve(kickoff()).await;

    // The first delivery wrote the payment and stopped there.
    let transaction = Transaction::success(
        booking.id,
        "ref-1",
        booking.amounts.total_paid,
        booking.amounts.platform_fee,
        t0(),
    );
    let write = h.store.record_payment(booking.id, &transaction, t0()).await.unwrap();
    assert!(matches!(write, PaymentWrite::Applied(ref b) if b.status == BookingStatus::Paid));
    assert!(h.notifications_of(&h.owner).await.is_empty());

    let redelivered = h
        .state
        .bookings
        .apply_payment_result(booking.id, "ref-1", PaymentOutcome::Success)
        .await
        .unwrap();

    assert!(matches!(redelivered, PaymentResult::Confirmed(ref b) if b.status == BookingStatus::Confirmed));
    assert_eq!(h.notifications_of(&h.owner).await.len(), 1);
    assert_eq!(h.store.transaction_count(), 1);
    let audit = h.state.audit.for_target(booking.id).await.unwrap();
    assert_eq!(audit.iter().filter(|e| e.action == "booking.confirmed").count(), 1);

    let again = h
        .state
        .bookings
        .apply_payment_result(booking.id, "ref-1", PaymentOutcome::Success)
        .await
        .unwrap();
    assert!(matches!(again, PaymentResult::Duplicate(_)));
    assert_eq!(h.notifications_of(&h.owner).await.len(), 1);
}

/// Field catalog over a [`MemoryStore`] that can fail lookups, or cancel a
/// booking while the lookup is in flight.
struct InterleavingCatalog {
    store: MemoryStore,
    failing: AtomicBool,
    cancel_on_lookup: Mutex<Option<Uuid>>,
}

#[async_trait]
impl FieldCatalog for InterleavingCatalog {
    async fn field(&self, id: Uuid) -> slotbook::Result<Option<Field>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(sqlx::Error::PoolTimedOut.into());
        }
        let cancel = self.cancel_on_lookup.lock().unwrap().take();
        if let Some(booking_id) = cancel {
            self.store
                .transition(
                    booking_id,
                    &BookingStatus::ACTIVE,
                    BookingStatus::CancelledByConsumer,
                    t0(),
                )
                .await?;
        }
        self.store.field(id).await
    }
}

struct Interleaved {
    service: BookingService,
    catalog: Arc<InterleavingCatalog>,
    store: MemoryStore,
    owner: Caller,
    booking: Booking,
}

async fn interleaved() -> Interleaved {
    let store = MemoryStore::new();
    let owner = Caller::new(Uuid::new_v4(), Role::Owner);
    let consumer = Caller::new(Uuid::new_v4(), Role::Consumer);
    let field = field_for(&owner, true);
    store.put_field(field.clone());

    let catalog = Arc::new(InterleavingCatalog {
        store: store.clone(),
        failing: AtomicBool::new(false),
        cancel_on_lookup: Mutex::new(None),
    });
    let policy = BookingPolicy::default();
    let dispatcher = Arc::new(SideEffectDispatcher::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        policy.local_offset,
    ));
    let service = BookingService::new(
        Arc::new(store.ledger()),
        Arc::new(store.clone()),
        catalog.clone(),
        Arc::new(SimulatedGateway),
        dispatcher,
        Arc::new(ManualClock::new(t0())),
        policy,
    );

    let booking = service
        .create(Some(&consumer), field.id, kickoff(), false)
        .await
        .unwrap();

    Interleaved {
        service,
        catalog,
        store,
        owner,
        booking,
    }
}

#[tokio::test]
async fn test_field_lookup_failure_leaves_booking_paid_until_redelivery() {
    let t = interleaved().await;
    t.catalog.failing.store(true, Ordering::SeqCst);

    let result = t
        .service
        .apply_payment_result(t.booking.id, "X", PaymentOutcome::Success)
        .await;
    assert!(matches!(result, Err(ref e) if e.is_retryable()));

    let current = t.store.find_booking(t.booking.id).await.unwrap().unwrap();
    assert_eq!(current.status, BookingStatus::Paid);
    assert!(t.store.for_recipient(t.owner.user_id).await.unwrap().is_empty());

    t.catalog.failing.store(false, Ordering::SeqCst);
    let redelivered = t
        .service
        .apply_payment_result(t.booking.id, "X", PaymentOutcome::Success)
        .await
        .unwrap();

    assert!(matches!(redelivered, PaymentResult::Confirmed(ref b) if b.status == BookingStatus::Confirmed));
    assert_eq!(t.store.for_recipient(t.owner.user_id).await.unwrap().len(), 1);
    assert_eq!(t.store.transaction_count(), 1);
}

#[tokio::test]
async fn test_cancellation_racing_confirmation_is_not_reported_confirmed() {
    let t = interleaved().await;
    *t.catalog.cancel_on_lookup.lock().unwrap() = Some(t.booking.id);

    let result = t
        .service
        .apply_payment_result(t.booking.id, "X", PaymentOutcome::Success)
        .await
        .unwrap();

    assert!(
        matches!(result, PaymentResult::Rejected(ref b) if b.status == BookingStatus::CancelledByConsumer),
        "got {result:?}"
    );
    assert!(t.store.for_recipient(t.owner.user_id).await.unwrap().is_empty());
    assert_eq!(t.store.transaction_count(), 1);
    assert!(!t.store.ledger().is_held(&t.booking.slot));
}
