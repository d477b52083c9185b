//! Time-slot reservations: conflict check, coalescing, and expiry detection.
//!
//! All windows are half-open `[start, end)`, so two slots that merely touch do
//! not overlap and are stored with their ends exactly as requested.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use wsn_common::SlotWindow;

use crate::models::TimeSlot;
use crate::store::{Store, StoreError};

/// Hours before a day's UTC midnight covered by a day query.
const DAY_LEAD_HOURS: i64 = 12;
/// Hours after a day's UTC end covered by a day query.
const DAY_TRAIL_HOURS: i64 = 14;

/// Whether two half-open windows share any instant.
pub fn overlaps(a: &SlotWindow, b: &SlotWindow) -> bool {
    a.start < b.end && b.start < a.end
}

fn touches(a: &SlotWindow, b: &SlotWindow) -> bool {
    a.end == b.start || b.end == a.start
}

/// Drop empty candidates and every candidate overlapping an existing slot.
pub fn validate(existing: &[SlotWindow], mut candidates: Vec<SlotWindow>) -> Vec<SlotWindow> {
    candidates.retain(|c| c.start < c.end);
    for slot in existing {
        if candidates.is_empty() {
            break;
        }
        candidates.retain(|c| !overlaps(slot, c));
    }
    candidates
}

/// Coalesce touching or overlapping windows until nothing more can be joined.
///
/// A freshly merged window goes back into the batch, since it may now reach
/// a window that neither half touched. Output is ordered by start.
pub fn merge(mut batch: Vec<SlotWindow>) -> Vec<SlotWindow> {
    let mut done = Vec::with_capacity(batch.len());
    while let Some(slot) = batch.pop() {
        match batch
            .iter()
            .position(|other| touches(&slot, other) || overlaps(&slot, other))
        {
            Some(i) => {
                let other = batch.swap_remove(i);
                batch.push(SlotWindow {
                    start: slot.start.min(other.start),
                    end: slot.end.max(other.end),
                });
            }
            None => done.push(slot),
        }
    }
    done.sort_by_key(|w| w.start);
    done
}

/// Query range for a day view: `[date - 12h, end of date's UTC day + 14h)`.
pub fn day_window(date: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let from = date - Duration::hours(DAY_LEAD_HOURS);
    let midnight = date.date_naive().and_time(NaiveTime::default());
    let end_of_day = Utc.from_utc_datetime(&midnight) + Duration::days(1);
    (from, end_of_day + Duration::hours(DAY_TRAIL_HOURS))
}

/// Validates, merges and persists reservations.
pub struct SlotScheduler {
    store: Arc<Store>,
    lookahead: Duration,
}

impl SlotScheduler {
    pub fn new(store: Arc<Store>, lookahead: Duration) -> Self {
        Self { store, lookahead }
    }

    /// Persist the surviving candidates for `user_id` and return what was stored.
    pub fn save(
        &self,
        user_id: &str,
        candidates: Vec<SlotWindow>,
    ) -> Result<Vec<TimeSlot>, StoreError> {
        let existing: Vec<SlotWindow> = self
            .store
            .list_slots()?
            .iter()
            .map(TimeSlot::window)
            .collect();
        let requested = candidates.len();
        let valid = validate(&existing, candidates);
        let merged = merge(valid);

        let mut saved = Vec::with_capacity(merged.len());
        for window in &merged {
            saved.push(self.store.insert_slot(user_id, window)?);
        }
        tracing::info!(
            user = %user_id,
            requested,
            saved = saved.len(),
            "Saved time slots"
        );
        Ok(saved)
    }

    pub fn day(&self, date: DateTime<Utc>) -> Result<Vec<TimeSlot>, StoreError> {
        let (from, to) = day_window(date);
        self.store.slots_between(from, to)
    }

    pub fn user_slots(&self, user_id: &str) -> Result<Vec<TimeSlot>, StoreError> {
        self.store.slots_by_user(user_id)
    }

    /// Earliest slot about to start (or running) other than `active`.
    pub fn starting(
        &self,
        now: DateTime<Utc>,
        active: Option<&str>,
    ) -> Result<Option<TimeSlot>, StoreError> {
        let horizon = now + self.lookahead;
        Ok(self
            .store
            .list_slots()?
            .into_iter()
            .find(|s| s.start <= horizon && s.end > now && Some(s.uid.as_str()) != active))
    }

    /// Slots ending within the lookahead.
    pub fn ending(&self, now: DateTime<Utc>) -> Result<Vec<TimeSlot>, StoreError> {
        let horizon = now + self.lookahead;
        Ok(self
            .store
            .list_slots()?
            .into_iter()
            .filter(|s| s.end <= horizon)
            .collect())
    }
}
