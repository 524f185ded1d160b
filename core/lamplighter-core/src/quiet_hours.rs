//! Quiet-hours gate.
//!
//! A daily window of local clock hours during which callbacks are told to
//! keep their side effects quiet. The gate never affects state tracking.

use chrono::{DateTime, Local, Timelike};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHoursWindow {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl QuietHoursWindow {
    pub fn new(start_hour: u32, end_hour: u32) -> Self {
        Self {
            start_hour,
            end_hour,
        }
    }

    /// `start == end` (including `{0, 0}`) disables quiet hours.
    pub fn is_disabled(&self) -> bool {
        self.start_hour == self.end_hour
    }

    pub fn is_quiet_hour(&self, hour: u32) -> bool {
        let (start, end) = (self.start_hour, self.end_hour);
        if start < end {
            start <= hour && hour < end
        } else if start > end {
            hour >= start || hour < end
        } else {
            false
        }
    }

    pub fn is_quiet(&self, now: &DateTime<Local>) -> bool {
        self.is_quiet_hour(now.hour())
    }
}
