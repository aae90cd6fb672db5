//! Job schedules: a fixed UTC time of day, or a fixed interval.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, TimeDelta, Utc};

use crate::error::{CourierError, Result};

/// When a job runs.
///
/// Only constructible through [`Schedule::daily`] and [`Schedule::every`],
/// so every value is valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule(Kind);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    /// Once a day at this UTC time.
    Daily(NaiveTime),
    /// Every period, measured from the end of the previous run.
    Interval(TimeDelta),
}

impl Schedule {
    /// Daily at `hour:minute` UTC.
    pub fn daily(hour: u32, minute: u32) -> Result<Self> {
        if hour >= 24 {
            return Err(CourierError::InvalidSchedule(format!("hour {} out of range", hour)));
        }
        if minute >= 60 {
            return Err(CourierError::InvalidSchedule(format!("minute {} out of range", minute)));
        }
        let slot = NaiveTime::from_hms_opt(hour, minute, 0)
            .ok_or_else(|| CourierError::InvalidSchedule(format!("invalid time {:02}:{:02}", hour, minute)))?;
        Ok(Self(Kind::Daily(slot)))
    }

    /// Fixed interval. Zero is rejected.
    pub fn every(period: Duration) -> Result<Self> {
        if period.is_zero() {
            return Err(CourierError::InvalidSchedule("interval must be positive".to_string()));
        }
        let delta = TimeDelta::from_std(period)
            .map_err(|e| CourierError::InvalidSchedule(format!("interval too large: {}", e)))?;
        Ok(Self(Kind::Interval(delta)))
    }

    /// Next run strictly after `now`.
    ///
    /// Daily rolls over to tomorrow when today's slot is `now` or already past.
    pub fn next_run(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.0 {
            Kind::Daily(slot) => {
                let today = now.date_naive().and_time(slot).and_utc();
                if today > now { today } else { today + TimeDelta::days(1) }
            }
            Kind::Interval(period) => now.checked_add_signed(period).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Kind::Daily(slot) => write!(f, "daily at {} UTC", slot.format("%H:%M")),
            Kind::Interval(period) => write!(f, "every {}s", period.num_seconds()),
        }
    }
}
