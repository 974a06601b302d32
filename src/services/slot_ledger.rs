//! Authoritative record of which (field, start) pairs are held.
//!
//! A hold is acquired with a single atomic conditional write and must be attached
//! to a booking right after, or released. Unattached holds older than the
//! configured timeout are orphans and are reaped by the sweep job.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{BookingError, Result};
use crate::models::TimeSlot;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub field_id: Uuid,
    pub start: DateTime<Utc>,
}

impl From<&TimeSlot> for SlotKey {
    fn from(slot: &TimeSlot) -> Self {
        Self {
            field_id: slot.field_id,
            start: slot.start,
        }
    }
}

/// Proof of a hold. Releasing requires the id, so a stale token cannot free a
/// slot that has since been held by someone else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoldToken {
    pub id: Uuid,
    pub key: SlotKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HoldAttempt {
    Held(HoldToken),
    Conflict,
}

#[async_trait]
pub trait SlotLedger: Send + Sync {
    /// Atomically claims the slot. Exactly one concurrent caller per key wins.
    async fn try_hold(&self, slot: &TimeSlot) -> Result<HoldAttempt>;

    /// Marks the hold as owned by a booking so the sweep leaves it alone.
    async fn attach(&self, token: &HoldToken, booking_id: Uuid) -> Result<()>;

    /// Idempotent: unknown or already released tokens are a no-op.
    async fn release(&self, token: &HoldToken) -> Result<()>;

    /// Start instants currently held for a field within `[from, to)`.
    async fn held_starts(
        &self,
        field_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>>;

    /// Releases unattached holds older than `max_age` and returns them.
    async fn sweep_orphans(&self, max_age: Duration) -> Result<Vec<HoldToken>>;
}

#[derive(Debug)]
struct HoldEntry {
    hold_id: Uuid,
    booking_id: Option<Uuid>,
    acquired_at: Instant,
}

impl HoldEntry {
    fn is_orphaned(&self, max_age: Duration) -> bool {
        self.booking_id.is_none() && self.acquired_at.elapsed() >= max_age
    }
}

/// In-process ledger for single-node deployments and tests.
///
/// DashMap's entry API locks only the shard owning the key, so holds on
/// unrelated fields or times never contend.
#[derive(Clone, Default)]
pub struct InMemorySlotLedger {
    holds: Arc<DashMap<SlotKey, HoldEntry>>,
}

impl InMemorySlotLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.holds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.holds.is_empty()
    }

    pub fn is_held(&self, slot: &TimeSlot) -> bool {
        self.holds.contains_key(&SlotKey::from(slot))
    }

    /// Synchronous attach, usable while a caller holds its own map guard.
    pub(crate) fn attach_now(&self, token: &HoldToken, booking_id: Uuid) -> Result<()> {
        match self.holds.get_mut(&token.key) {
            Some(mut entry) if entry.hold_id == token.id => {
                entry.booking_id = Some(booking_id);
                Ok(())
            }
            _ => Err(BookingError::LedgerUnavailable(format!(
                "hold {} expired before it was attached",
                token.id
            ))),
        }
    }

    pub(crate) fn release_now(&self, token: &HoldToken) {
        if self
            .holds
            .remove_if(&token.key, |_, entry| entry.hold_id == token.id)
            .is_some()
        {
            tracing::debug!(hold_id = %token.id, "Hold released");
        }
    }
}

#[async_trait]
impl SlotLedger for InMemorySlotLedger {
    async fn try_hold(&self, slot: &TimeSlot) -> Result<HoldAttempt> {
        let key = SlotKey::from(slot);

        match self.holds.entry(key.clone()) {
            Entry::Occupied(_) => {
                tracing::debug!(field_id = %key.field_id, start = %key.start, "Slot already held");
                Ok(HoldAttempt::Conflict)
            }
            Entry::Vacant(vacant) => {
                let hold_id = Uuid::new_v4();
                vacant.insert(HoldEntry {
                    hold_id,
                    booking_id: None,
                    acquired_at: Instant::now(),
                });
                tracing::debug!(%hold_id, field_id = %key.field_id, start = %key.start, "Slot held");
                Ok(HoldAttempt::Held(HoldToken { id: hold_id, key }))
            }
        }
    }

    async fn attach(&self, token: &HoldToken, booking_id: Uuid) -> Result<()> {
        self.attach_now(token, booking_id)
    }

    async fn release(&self, token: &HoldToken) -> Result<()> {
        self.release_now(token);
        Ok(())
    }

    async fn held_starts(
        &self,
        field_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        let mut starts: Vec<DateTime<Utc>> = self
            .holds
            .iter()
            .filter(|e| e.key().field_id == field_id && e.key().start >= from && e.key().start < to)
            .map(|e| e.key().start)
            .collect();
        starts.sort();
        Ok(starts)
    }

    async fn sweep_orphans(&self, max_age: Duration) -> Result<Vec<HoldToken>> {
        // Collect first; removing while iterating would deadlock on the shard.
        let candidates: Vec<(SlotKey, Uuid)> = self
            .holds
            .iter()
            .filter(|e| e.value().is_orphaned(max_age))
            .map(|e| (e.key().clone(), e.value().hold_id))
            .collect();

        let mut released = Vec::with_capacity(candidates.len());
        for (key, hold_id) in candidates {
            // Re-check under the shard lock: the hold may have been attached meanwhile.
            if self
                .holds
                .remove_if(&key, |_, entry| entry.hold_id == hold_id && entry.is_orphaned(max_age))
                .is_some()
            {
                released.push(HoldToken { id: hold_id, key });
            }
        }

        Ok(released)
    }
}
