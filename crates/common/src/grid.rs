//! Cadence-aligned time grid.
//!
//! GFS analyses are published on a fixed cycle (00/06/12/18 UTC). Every
//! instant falls into exactly one [`Interval`], and every interval has
//! exactly one [`SnapshotKey`] of the form `YYYYMMDDHH`. The key is the only
//! index into the snapshot store, so its format must never change.

use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Timelike, Utc};
use serde::Serialize;

use crate::Error;

/// Spacing between published snapshots, in whole hours.
///
/// Always divides 24, so every day starts on a grid boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cadence(u32);

impl Cadence {
    /// The GFS 4-cycles-per-day cadence.
    pub const SIX_HOURLY: Cadence = Cadence(6);

    pub fn from_hours(hours: u32) -> Result<Self, Error> {
        if hours == 0 || hours > 24 || 24 % hours != 0 {
            return Err(Error::Config(format!(
                "cadence must be a divisor of 24 hours, got {hours}"
            )));
        }
        Ok(Self(hours))
    }

    pub fn hours(self) -> u32 {
        self.0
    }

    pub fn duration(self) -> Duration {
        Duration::hours(i64::from(self.0))
    }
}

/// Canonical identity of a snapshot: `YYYYMMDDHH`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct SnapshotKey(String);

impl SnapshotKey {
    /// Validate a stored key such as a file stem.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        Interval::from_key(raw).map(|interval| interval.key())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SnapshotKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A cadence-aligned time bucket, identified by its starting instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Interval {
    start: DateTime<Utc>,
}

impl Interval {
    /// The interval a `YYYYMMDDHH` key names.
    ///
    /// Accepts exactly ten ASCII digits that form a real date and an hour
    /// below 24. Cadence alignment is not checked.
    pub fn from_key(raw: &str) -> Result<Self, Error> {
        let invalid = || Error::InvalidInput(format!("not a snapshot key: {raw:?}"));

        if raw.len() != 10 || !raw.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let (date_part, hour_part) = raw.split_at(8);
        let date = NaiveDate::parse_from_str(date_part, "%Y%m%d").map_err(|_| invalid())?;
        let hour: u32 = hour_part.parse().map_err(|_| invalid())?;
        if hour >= 24 {
            return Err(invalid());
        }
        Ok(Self::from_parts(date, hour))
    }

    fn from_parts(date: NaiveDate, hour: u32) -> Self {
        let start = (date.and_time(NaiveTime::MIN) + Duration::hours(i64::from(hour))).and_utc();
        Self { start }
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// `YYYYMMDD`, the date segment of the upstream directory.
    pub fn date_label(&self) -> String {
        self.start.format("%Y%m%d").to_string()
    }

    /// Zero-padded cycle hour, e.g. `"06"`.
    pub fn hour_label(&self) -> String {
        format!("{:02}", self.start.hour())
    }

    pub fn key(&self) -> SnapshotKey {
        SnapshotKey(format!("{}{}", self.date_label(), self.hour_label()))
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Maps instants onto the snapshot grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeGrid {
    cadence: Cadence,
}

impl TimeGrid {
    pub fn new(cadence: Cadence) -> Self {
        Self { cadence }
    }

    pub fn cadence(&self) -> Cadence {
        self.cadence
    }

    /// Floor `instant` to the start of its interval.
    pub fn round_down(&self, instant: DateTime<Utc>) -> Interval {
        let hours = self.cadence.hours();
        let hour = (instant.hour() / hours) * hours;
        Interval::from_parts(instant.date_naive(), hour)
    }

    pub fn key(&self, instant: DateTime<Utc>) -> SnapshotKey {
        self.round_down(instant).key()
    }

    /// Move `steps` cadence periods; negative steps go back in time.
    pub fn step(&self, interval: Interval, steps: i64) -> Interval {
        let offset = Duration::hours(i64::from(self.cadence.hours()) * steps);
        Interval {
            start: interval.start + offset,
        }
    }

    pub fn previous(&self, interval: Interval) -> Interval {
        self.step(interval, -1)
    }

    pub fn next(&self, interval: Interval) -> Interval {
        self.step(interval, 1)
    }
}

impl Default for TimeGrid {
    fn default() -> Self {
        Self::new(Cadence::SIX_HOURLY)
    }
}
