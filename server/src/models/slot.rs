use chrono::{DateTime, Utc};
use serde::Serialize;
use wsn_common::SlotWindow;

/// Stored reservation `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimeSlot {
    #[serde(rename = "slot_id")]
    pub uid: String,
    pub user_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeSlot {
    pub fn window(&self) -> SlotWindow {
        SlotWindow {
            start: self.start,
            end: self.end,
        }
    }
}
