//! Agreement update schedules.
//!
//! Stored as `HHMM-HHMM <days>` where days are digits, `0` = Sunday through
//! `6` = Saturday, e.g. `0800-1730 12345`. No schedule means replicate
//! continuously.

use crate::error::{TopologyError, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Day of week as used by the schedule attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Weekday {
    /// Sunday (`0`).
    Sun,
    /// Monday (`1`).
    Mon,
    /// Tuesday (`2`).
    Tue,
    /// Wednesday (`3`).
    Wed,
    /// Thursday (`4`).
    Thu,
    /// Friday (`5`).
    Fri,
    /// Saturday (`6`).
    Sat,
}

impl Weekday {
    /// All days, Sunday first.
    pub const ALL: [Weekday; 7] = [
        Weekday::Sun,
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
        Weekday::Sat,
    ];

    /// Schedule digit.
    pub fn digit(self) -> char {
        (b'0' + self as u8) as char
    }

    /// Parse a schedule digit.
    pub fn from_digit(c: char) -> Option<Weekday> {
        c.to_digit(10)
            .and_then(|d| Weekday::ALL.get(d as usize).copied())
    }

    /// Parse a day name such as `mon` or `Monday`.
    pub fn from_name(name: &str) -> Option<Weekday> {
        let lower = name.trim().to_ascii_lowercase();
        Weekday::ALL
            .into_iter()
            .find(|d| lower.starts_with(&format!("{:?}", d).to_ascii_lowercase()))
    }
}

/// A time of day, minute precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeOfDay {
    hour: u8,
    minute: u8,
}

impl TimeOfDay {
    /// Build from hour and minute.
    pub fn new(hour: u8, minute: u8) -> Result<Self, ValidationError> {
        if hour > 23 || minute > 59 {
            return Err(ValidationError::ScheduleTime(format!("{:02}{:02}", hour, minute)));
        }
        Ok(Self { hour, minute })
    }

    /// Parse `HHMM` or `HH:MM`.
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        let digits: String = s.trim().chars().filter(|c| *c != ':').collect();
        if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(ValidationError::ScheduleTime(s.to_string()));
        }
        let hour = digits[0..2].parse().map_err(|_| ValidationError::ScheduleTime(s.to_string()))?;
        let minute = digits[2..4].parse().map_err(|_| ValidationError::ScheduleTime(s.to_string()))?;
        TimeOfDay::new(hour, minute).map_err(|_| ValidationError::ScheduleTime(s.to_string()))
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}{:02}", self.hour, self.minute)
    }
}

/// A replication window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    /// Window start.
    pub start: TimeOfDay,
    /// Window end.
    pub end: TimeOfDay,
    /// Days replication may run.
    pub days: BTreeSet<Weekday>,
}

impl Schedule {
    /// Build and validate a schedule.
    pub fn new(
        start: TimeOfDay,
        end: TimeOfDay,
        days: impl IntoIterator<Item = Weekday>,
    ) -> Result<Self, ValidationError> {
        let schedule = Self {
            start,
            end,
            days: days.into_iter().collect(),
        };
        schedule.validate()?;
        Ok(schedule)
    }

    /// At least one day, and distinct start and end.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.days.is_empty() {
            return Err(ValidationError::EmptySchedule);
        }
        if self.start == self.end {
            return Err(ValidationError::ScheduleTimesEqual(self.start.to_string()));
        }
        Ok(())
    }

    /// Attribute value form.
    pub fn encode(&self) -> String {
        let days: String = self.days.iter().map(|d| d.digit()).collect();
        format!("{}-{} {}", self.start, self.end, days)
    }

    /// Parse the attribute value form.
    pub fn decode(value: &str) -> Result<Self, TopologyError> {
        let malformed = || TopologyError::MalformedSchedule {
            value: value.to_string(),
        };
        let (times, days) = value.trim().split_once(' ').ok_or_else(malformed)?;
        let (start, end) = times.split_once('-').ok_or_else(malformed)?;
        let start = TimeOfDay::parse(start).map_err(|_| malformed())?;
        let end = TimeOfDay::parse(end).map_err(|_| malformed())?;
        let days = days
            .trim()
            .chars()
            .map(Weekday::from_digit)
            .collect::<Option<BTreeSet<_>>>()
            .ok_or_else(malformed)?;
        Ok(Self { start, end, days })
    }
}
