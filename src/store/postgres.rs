use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres};
use std::time::Duration;
use uuid::Uuid;

use super::{AuditStore, BookingStore, FieldCatalog, NotificationStore, PaymentWrite, TransitionOutcome};
use crate::error::{BookingError, Result};
use crate::models::{
    AuditLogEntry, Booking, BookingStatus, Field, Money, MoneyBreakdown, Notification, TimeSlot,
    Transaction,
};
use crate::services::slot_ledger::{HoldAttempt, HoldToken, SlotKey, SlotLedger};

/// Postgres-backed storage handle. Constructed once in `main` and shared.
///
/// One active booking per slot is enforced by `UNIQUE (field_id, slot_start)` on
/// `slot_holds` and by the partial unique index on active bookings; one
/// transaction per payment by unique constraints on `transactions`.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

#[derive(Debug, FromRow)]
struct BookingRow {
    id: Uuid,
    consumer_id: Uuid,
    field_id: Uuid,
    slot_start: DateTime<Utc>,
    duration_minutes: i32,
    is_subscription: bool,
    matches_remaining: i32,
    total_paid: Money,
    owner_share: Money,
    platform_fee: Money,
    status: String,
    external_ref: Option<String>,
    hold_id: Uuid,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BookingRow> for Booking {
    type Error = BookingError;

    fn try_from(row: BookingRow) -> Result<Self> {
        let status = row
            .status
            .parse::<BookingStatus>()
            .map_err(BookingError::InvariantViolation)?;

        Ok(Booking {
            id: row.id,
            consumer_id: row.consumer_id,
            slot: TimeSlot {
                field_id: row.field_id,
                start: row.slot_start,
                duration_minutes: row.duration_minutes,
            },
            is_subscription: row.is_subscription,
            matches_remaining: row.matches_remaining,
            amounts: MoneyBreakdown {
                total_paid: row.total_paid,
                owner_share: row.owner_share,
                platform_fee: row.platform_fee,
            },
            status,
            external_ref: row.external_ref,
            hold_id: row.hold_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct HoldRow {
    hold_id: Uuid,
    field_id: Uuid,
    slot_start: DateTime<Utc>,
}

fn ledger_error(e: sqlx::Error) -> BookingError {
    BookingError::LedgerUnavailable(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Locks the booking row for the rest of the transaction.
    async fn lock_booking(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        id: Uuid,
    ) -> Result<Booking> {
        let row = sqlx::query_as::<_, BookingRow>(
            r#"
            SELECT * FROM bookings WHERE id = $1 FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(BookingError::BookingNotFound)?;

        Booking::try_from(row)
    }
}

#[async_trait]
impl SlotLedger for PgStore {
    async fn try_hold(&self, slot: &TimeSlot) -> Result<HoldAttempt> {
        let hold_id = Uuid::new_v4();

        let result = sqlx::query(
            r#"
            INSERT INTO slot_holds (hold_id, field_id, slot_start)
            VALUES ($1, $2, $3)
            ON CONFLICT (field_id, slot_start) DO NOTHING
            "#,
        )
        .bind(hold_id)
        .bind(slot.field_id)
        .bind(slot.start)
        .execute(&self.pool)
        .await
        .map_err(ledger_error)?;

        if result.rows_affected() == 0 {
            return Ok(HoldAttempt::Conflict);
        }

        Ok(HoldAttempt::Held(HoldToken {
            id: hold_id,
            key: SlotKey::from(slot),
        }))
    }

    async fn attach(&self, token: &HoldToken, booking_id: Uuid) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE slot_holds SET booking_id = $2 WHERE hold_id = $1
            "#,
        )
        .bind(token.id)
        .bind(booking_id)
        .execute(&self.pool)
        .await
        .map_err(ledger_error)?;

        if result.rows_affected() == 0 {
            return Err(BookingError::LedgerUnavailable(format!(
                "hold {} expired before it was attached",
                token.id
            )));
        }
        Ok(())
    }

    async fn release(&self, token: &HoldToken) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM slot_holds WHERE hold_id = $1
            "#,
        )
        .bind(token.id)
        .execute(&self.pool)
        .await
        .map_err(ledger_error)?;

        Ok(())
    }

    async fn held_starts(
        &self,
        field_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        let starts = sqlx::query_scalar::<_, DateTime<Utc>>(
            r#"
            SELECT slot_start FROM slot_holds
            WHERE field_id = $1 AND slot_start >= $2 AND slot_start < $3
            ORDER BY slot_start
            "#,
        )
        .bind(field_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(ledger_error)?;

        Ok(starts)
    }

    async fn sweep_orphans(&self, max_age: Duration) -> Result<Vec<HoldToken>> {
        // Hold age is measured against the database clock only, the same clock
        // that stamped acquired_at.
        let rows = sqlx::query_as::<_, HoldRow>(
            r#"
            DELETE FROM slot_holds
            WHERE booking_id IS NULL
              AND acquired_at < clock_timestamp() - make_interval(secs => $1)
            RETURNING hold_id, field_id, slot_start
            "#,
        )
        .bind(max_age.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(ledger_error)?;

        Ok(rows
            .into_iter()
            .map(|row| HoldToken {
                id: row.hold_id,
                key: SlotKey {
                    field_id: row.field_id,
                    start: row.slot_start,
                },
            })
            .collect())
    }
}

#[async_trait]
impl BookingStore for PgStore {
    async fn insert_booking(&self, booking: &Booking, hold: &HoldToken) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO bookings (
                id, consumer_id, field_id, slot_start, duration_minutes,
                is_subscription, matches_remaining,
                total_paid, owner_share, platform_fee,
                status, external_ref, hold_id, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(booking.id)
        .bind(booking.consumer_id)
        .bind(booking.slot.field_id)
        .bind(booking.slot.start)
        .bind(booking.slot.duration_minutes)
        .bind(booking.is_subscription)
        .bind(booking.matches_remaining)
        .bind(booking.amounts.total_paid)
        .bind(booking.amounts.owner_share)
        .bind(booking.amounts.platform_fee)
        .bind(booking.status.as_str())
        .bind(&booking.external_ref)
        .bind(booking.hold_id)
        .bind(booking.created_at)
        .bind(booking.updated_at)
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            if is_unique_violation(&e) {
                return Err(BookingError::SlotUnavailable);
            }
            return Err(e.into());
        }

        let attached = sqlx::query(
            r#"
            UPDATE slot_holds SET booking_id = $2 WHERE hold_id = $1
            "#,
        )
        .bind(hold.id)
        .bind(booking.id)
        .execute(&mut *tx)
        .await
        .map_err(ledger_error)?;

        if attached.rows_affected() == 0 {
            // Dropping the transaction rolls back the booking insert.
            return Err(BookingError::LedgerUnavailable(format!(
                "hold {} expired before it was attached",
                hold.id
            )));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn find_booking(&self, id: Uuid) -> Result<Option<Booking>> {
        let row = sqlx::query_as::<_, BookingRow>(
            r#"
            SELECT * FROM bookings WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Booking::try_from).transpose()
    }

    async fn find_by_external_ref(&self, external_ref: &str) -> Result<Option<Booking>> {
        let row = sqlx::query_as::<_, BookingRow>(
            r#"
            SELECT * FROM bookings WHERE external_ref = $1
            "#,
        )
        .bind(external_ref)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Booking::try_from).transpose()
    }

    async fn set_external_ref(
        &self,
        id: Uuid,
        external_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome> {
        let mut tx = self.pool.begin().await?;
        let booking = Self::lock_booking(&mut tx, id).await?;

        if booking.status != BookingStatus::Reserved {
            return Ok(TransitionOutcome::Unchanged(booking));
        }

        let row = sqlx::query_as::<_, BookingRow>(
            r#"
            UPDATE bookings SET external_ref = $2, updated_at = $3
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(external_ref)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(TransitionOutcome::Applied {
            previous: BookingStatus::Reserved,
            booking: Booking::try_from(row)?,
        })
    }

    async fn record_payment(
        &self,
        id: Uuid,
        transaction: &Transaction,
        now: DateTime<Utc>,
    ) -> Result<PaymentWrite> {
        let mut tx = self.pool.begin().await?;
        let booking = Self::lock_booking(&mut tx, id).await?;
        let same_ref = booking.external_ref.as_deref() == Some(transaction.external_ref.as_str());

        match booking.status {
            BookingStatus::Reserved if same_ref || booking.external_ref.is_none() => {}
            BookingStatus::Paid | BookingStatus::Confirmed if same_ref => {
                return Ok(PaymentWrite::Duplicate(booking));
            }
            _ => return Ok(PaymentWrite::Rejected(booking)),
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO transactions (id, booking_id, external_ref, amount, commission, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(transaction.id)
        .bind(transaction.booking_id)
        .bind(&transaction.external_ref)
        .bind(transaction.amount)
        .bind(transaction.commission)
        .bind(&transaction.status)
        .bind(transaction.created_at)
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            if is_unique_violation(&e) {
                return Ok(PaymentWrite::Duplicate(booking));
            }
            return Err(e.into());
        }

        let row = sqlx::query_as::<_, BookingRow>(
            r#"
            UPDATE bookings
            SET status = 'paid', external_ref = $2, updated_at = $3
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&transaction.external_ref)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(PaymentWrite::Applied(Booking::try_from(row)?))
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[BookingStatus],
        to: BookingStatus,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome> {
        let mut tx = self.pool.begin().await?;
        let booking = Self::lock_booking(&mut tx, id).await?;

        if !from.contains(&booking.status) || !booking.status.can_transition_to(to) {
            return Ok(TransitionOutcome::Unchanged(booking));
        }

        let row = sqlx::query_as::<_, BookingRow>(
            r#"
            UPDATE bookings SET status = $2, updated_at = $3
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(to.as_str())
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        if !to.holds_slot() {
            sqlx::query(
                r#"
                DELETE FROM slot_holds WHERE hold_id = $1
                "#,
            )
            .bind(booking.hold_id)
            .execute(&mut *tx)
            .await
            .map_err(ledger_error)?;
        }

        tx.commit().await?;

        Ok(TransitionOutcome::Applied {
            previous: booking.status,
            booking: Booking::try_from(row)?,
        })
    }

    async fn transactions_for_booking(&self, booking_id: Uuid) -> Result<Vec<Transaction>> {
        let transactions = sqlx::query_as::<_, Transaction>(
            r#"
            SELECT * FROM transactions WHERE booking_id = $1 ORDER BY created_at
            "#,
        )
        .bind(booking_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(transactions)
    }

    async fn bookings_for_consumer(&self, consumer_id: Uuid) -> Result<Vec<Booking>> {
        let rows = sqlx::query_as::<_, BookingRow>(
            r#"
            SELECT * FROM bookings WHERE consumer_id = $1 ORDER BY created_at DESC
            "#,
        )
        .bind(consumer_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Booking::try_from).collect()
    }

    async fn bookings_for_owner(&self, owner_id: Uuid) -> Result<Vec<Booking>> {
        let rows = sqlx::query_as::<_, BookingRow>(
            r#"
            SELECT b.* FROM bookings b
            JOIN fields f ON f.id = b.field_id
            WHERE f.owner_id = $1
            ORDER BY b.created_at DESC
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Booking::try_from).collect()
    }
}

#[async_trait]
impl FieldCatalog for PgStore {
    async fn field(&self, id: Uuid) -> Result<Option<Field>> {
        let field = sqlx::query_as::<_, Field>(
            r#"
            SELECT id, owner_id, name, base_price, subscription_price, approved
            FROM fields WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(field)
    }
}

#[async_trait]
impl NotificationStore for PgStore {
    async fn append(&self, notification: &Notification) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notifications (id, recipient_id, kind, message, read, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(notification.id)
        .bind(notification.recipient_id)
        .bind(&notification.kind)
        .bind(&notification.message)
        .bind(notification.read)
        .bind(notification.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn for_recipient(&self, recipient_id: Uuid) -> Result<Vec<Notification>> {
        let notifications = sqlx::query_as::<_, Notification>(
            r#"
            SELECT * FROM notifications
            WHERE recipient_id = $1
            ORDER BY created_at DESC
            LIMIT 100
            "#,
        )
        .bind(recipient_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(notifications)
    }

    async fn mark_read(&self, id: Uuid, recipient_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE notifications SET read = TRUE
            WHERE id = $1 AND recipient_id = $2
            "#,
        )
        .bind(id)
        .bind(recipient_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl AuditStore for PgStore {
    async fn append(&self, entry: &AuditLogEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (
                id, actor_id, actor_email, action, target_type, target_id, details, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.id)
        .bind(entry.actor_id)
        .bind(&entry.actor_email)
        .bind(&entry.action)
        .bind(&entry.target_type)
        .bind(entry.target_id)
        .bind(&entry.details)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn for_target(&self, target_id: Uuid) -> Result<Vec<AuditLogEntry>> {
        let entries = sqlx::query_as::<_, AuditLogEntry>(
            r#"
            SELECT * FROM audit_log WHERE target_id = $1 ORDER BY created_at
            "#,
        )
        .bind(target_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }
}
