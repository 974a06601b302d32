//! Hourly slot grid for a field on a given local day.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, TimeZone, Timelike, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{BookingError, Result};
use crate::services::slot_ledger::SlotLedger;

/// Local opening hours. `closing_hour` is exclusive and may be 24.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpeningHours {
    pub offset: FixedOffset,
    pub opening_hour: u32,
    pub closing_hour: u32,
}

impl OpeningHours {
    fn local_instant(&self, date: NaiveDate, hour: u32) -> Result<DateTime<Utc>> {
        let midnight = date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| BookingError::InvalidInput(format!("invalid date {}", date)))?;

        self.offset
            .from_local_datetime(&midnight)
            .single()
            .map(|local| local.with_timezone(&Utc) + Duration::hours(i64::from(hour)))
            .ok_or_else(|| BookingError::InvalidInput(format!("unrepresentable local time on {}", date)))
    }

    /// Every bookable start on `date`, in order.
    pub fn starts_on(&self, date: NaiveDate) -> Result<Vec<DateTime<Utc>>> {
        (self.opening_hour..self.closing_hour)
            .map(|hour| self.local_instant(date, hour))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotState {
    pub start: DateTime<Utc>,
    /// Local wall-clock label, e.g. "18:00"
    pub label: String,
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Availability {
    pub field_id: Uuid,
    pub date: NaiveDate,
    pub slots: Vec<SlotState>,
}

impl Availability {
    pub fn available(&self) -> Vec<&str> {
        self.slots
            .iter()
            .filter(|s| s.available)
            .map(|s| s.label.as_str())
            .collect()
    }

    pub fn booked(&self) -> Vec<&str> {
        self.slots
            .iter()
            .filter(|s| !s.available)
            .map(|s| s.label.as_str())
            .collect()
    }
}

/// Reads held starts from the ledger, so the answer reflects in-flight holds too.
pub async fn availability_for(
    ledger: &dyn SlotLedger,
    field_id: Uuid,
    date: NaiveDate,
    hours: &OpeningHours,
) -> Result<Availability> {
    let starts = hours.starts_on(date)?;

    let slots = match (starts.first(), starts.last()) {
        (Some(&first), Some(&last)) => {
            let held = ledger.held_starts(field_id, first, last + Duration::hours(1)).await?;
            starts
                .into_iter()
                .map(|start| SlotState {
                    start,
                    label: start.with_timezone(&hours.offset).format("%H:%M").to_string(),
                    available: !held.contains(&start),
                })
                .collect()
        }
        _ => Vec::new(),
    };

    Ok(Availability {
        field_id,
        date,
        slots,
    })
}

/// Start must be a whole local hour inside opening hours and strictly in the future.
pub fn validate_slot_start(start: DateTime<Utc>, now: DateTime<Utc>, hours: &OpeningHours) -> Result<()> {
    let local = start.with_timezone(&hours.offset);

    if local.minute() != 0 || local.second() != 0 || local.nanosecond() != 0 {
        return Err(BookingError::InvalidInput(
            "slot start must be on the hour".to_string(),
        ));
    }

    if local.hour() < hours.opening_hour || local.hour() >= hours.closing_hour {
        return Err(BookingError::InvalidInput(format!(
            "slot start {} is outside opening hours {:02}:00-{:02}:00",
            local.format("%H:%M"),
            hours.opening_hour,
            hours.closing_hour
        )));
    }

    if start <= now {
        return Err(BookingError::InvalidInput(
            "slot start must be in the future".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TimeSlot;
    use crate::services::slot_ledger::InMemorySlotLedger;

    fn istanbul() -> OpeningHours {
        OpeningHours {
            offset: FixedOffset::east_opt(3 * 3600).unwrap(),
            opening_hour: 9,
            closing_hour: 24,
        }
    }

    #[test]
    fn test_grid_covers_opening_to_closing() {
        let date = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
        let starts = istanbul().starts_on(date).unwrap();

        assert_eq!(starts.len(), 15);
        // 09:00 local is 06:00 UTC
        assert_eq!(starts[0], Utc.with_ymd_and_hms(2024, 6, 10, 6, 0, 0).unwrap());
        assert_eq!(starts[14], Utc.with_ymd_and_hms(2024, 6, 10, 20, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_held_slots_show_as_booked() {
        let ledger = InMemorySlotLedger::new();
        let field = Uuid::new_v4();
        let date = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();

        // 18:00 local
        let evening = Utc.with_ymd_and_hms(2024, 6, 10, 15, 0, 0).unwrap();
        ledger.try_hold(&TimeSlot::new(field, evening)).await.unwrap();
        // Same hour on another field does not count
        ledger
            .try_hold(&TimeSlot::new(Uuid::new_v4(), evening))
            .await
            .unwrap();

        let availability = availability_for(&ledger, field, date, &istanbul()).await.unwrap();

        assert_eq!(availability.booked(), vec!["18:00"]);
        assert_eq!(availability.available().len(), 14);
        assert_eq!(availability.available()[0], "09:00");
        assert_eq!(availability.available()[13], "23:00");
    }

    #[test]
    fn test_slot_start_validation() {
        let hours = istanbul();
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();

        let ok = Utc.with_ymd_and_hms(2024, 6, 10, 15, 0, 0).unwrap();
        assert!(validate_slot_start(ok, now, &hours).is_ok());

        let half_past = ok + Duration::minutes(30);
        let too_early = Utc.with_ymd_and_hms(2024, 6, 10, 4, 0, 0).unwrap(); // 07:00 local
        let past = Utc.with_ymd_and_hms(2024, 5, 30, 15, 0, 0).unwrap();

        for start in [half_past, too_early, past] {
            assert!(matches!(
                validate_slot_start(start, now, &hours),
                Err(BookingError::InvalidInput(_))
            ));
        }
    }
}
