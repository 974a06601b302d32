use std::sync::Arc;
use std::time::Duration;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};

use crate::error::Result;
use crate::services::dispatcher::SideEffectDispatcher;
use crate::services::slot_ledger::SlotLedger;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepStats {
    pub released: usize,
    pub slots: Vec<String>,
}

/// Releases holds that were never attached to a booking within `hold_timeout`.
///
/// Such holds come from a reservation that crashed or failed between acquiring
/// the hold and persisting its booking. Attached holds are never touched.
pub async fn sweep_orphaned_holds(ledger: &dyn SlotLedger, hold_timeout: Duration) -> Result<SweepStats> {
    let released = ledger.sweep_orphans(hold_timeout).await?;

    let stats = SweepStats {
        released: released.len(),
        slots: released
            .iter()
            .map(|hold| format!("{}@{}", hold.key.field_id, hold.key.start.to_rfc3339()))
            .collect(),
    };

    if stats.released > 0 {
        tracing::warn!(?stats, "Released orphaned slot holds");
    } else {
        tracing::debug!("No orphaned slot holds");
    }

    Ok(stats)
}

/// Registers the orphan sweep and the side-effect retry on `schedule` and starts
/// the scheduler. The caller owns shutdown.
pub async fn start_scheduler(
    ledger: Arc<dyn SlotLedger>,
    dispatcher: Arc<SideEffectDispatcher>,
    schedule: &str,
    hold_timeout: Duration,
) -> std::result::Result<JobScheduler, JobSchedulerError> {
    let scheduler = JobScheduler::new().await?;

    let sweep = Job::new_async(schedule, move |_id, _scheduler| {
        let ledger = ledger.clone();
        Box::pin(async move {
            if let Err(e) = sweep_orphaned_holds(ledger.as_ref(), hold_timeout).await {
                tracing::error!(error = %e, retryable = e.is_retryable(), "Orphaned hold sweep failed");
            }
        })
    })?;
    scheduler.add(sweep).await?;

    let retry = Job::new_async(schedule, move |_id, _scheduler| {
        let dispatcher = dispatcher.clone();
        Box::pin(async move {
            if dispatcher.pending_count() > 0 {
                dispatcher.retry_failed().await;
            }
        })
    })?;
    scheduler.add(retry).await?;

    scheduler.start().await?;
    tracing::info!(%schedule, hold_timeout_secs = hold_timeout.as_secs(), "Background jobs scheduled");

    Ok(scheduler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TimeSlot;
    use crate::services::slot_ledger::{HoldAttempt, InMemorySlotLedger};
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    #[tokio::test(start_paused = true)]
    async fn test_sweep_reports_released_orphans() {
        let ledger = InMemorySlotLedger::new();
        let field = Uuid::new_v4();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 18, 0, 0).unwrap();

        let HoldAttempt::Held(_) = ledger.try_hold(&TimeSlot::new(field, start)).await.unwrap() else {
            panic!("expected hold");
        };

        let stats = sweep_orphaned_holds(&ledger, Duration::from_secs(5)).await.unwrap();
        assert_eq!(stats.released, 0);

        tokio::time::advance(Duration::from_secs(5)).await;

        let stats = sweep_orphaned_holds(&ledger, Duration::from_secs(5)).await.unwrap();
        assert_eq!(stats.released, 1);
        assert_eq!(stats.slots, vec![format!("{}@{}", field, start.to_rfc3339())]);
        assert!(ledger.is_empty());
    }
}
