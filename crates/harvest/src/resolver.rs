//! Time-based snapshot lookup.
//!
//! `nearest` searches the intervals within `limit` of the requested
//! instant. Older candidates run from the interval containing the target
//! back while `d * cadence < limit`.
//!
//! - [`SearchPolicy::Nearest`] adds every later interval that starts less
//!   than `limit` after the target and visits all of them closest first.
//! - [`SearchPolicy::BackwardFirst`] walks the older candidates newest first,
//!   then restarts at `target + limit` and walks forward under the same
//!   bound. That restart is already at the bound, so no newer interval is
//!   ever visited and a backward miss exhausts the search.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use common::config::SearchPolicy;
use common::{Error, Interval, Result, SnapshotKey, TimeGrid};
use tracing::debug;

use crate::store::SnapshotStore;

#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub policy: SearchPolicy,
    pub default_limit_days: u32,
    pub max_limit_days: u32,
    /// How far `latest` walks back before giving up.
    pub latest_lookback: Duration,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            policy: SearchPolicy::Nearest,
            default_limit_days: 1,
            max_limit_days: 30,
            latest_lookback: Duration::days(30),
        }
    }
}

/// A snapshot found by the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub key: SnapshotKey,
    pub payload: Vec<u8>,
}

pub struct Resolver {
    grid: TimeGrid,
    settings: ResolverSettings,
    store: Arc<dyn SnapshotStore>,
}

impl Resolver {
    pub fn new(grid: TimeGrid, settings: ResolverSettings, store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            grid,
            settings,
            store,
        }
    }

    /// Normalise a raw `searchLimit` query value to whole days.
    ///
    /// Only the leading integer counts (`"3days"` is 3, `"2.7"` is 2).
    /// Missing, non-numeric or non-positive values fall back to the default;
    /// large values are clamped.
    pub fn search_limit(&self, raw: Option<&str>) -> u32 {
        match raw.and_then(leading_int) {
            Some(days) if days > 0 => self.clamp_limit(u32::try_from(days).unwrap_or(u32::MAX)),
            _ => self.settings.default_limit_days,
        }
    }

    fn clamp_limit(&self, days: u32) -> u32 {
        if days == 0 {
            self.settings.default_limit_days
        } else {
            days.min(self.settings.max_limit_days)
        }
    }

    /// Candidate intervals for `target`, in visiting order.
    pub fn candidates(&self, target: DateTime<Utc>, limit_days: u32) -> Vec<Interval> {
        let limit = Duration::days(i64::from(limit_days));
        let step_hours = i64::from(self.grid.cadence().hours());
        let anchor = self.grid.round_down(target);

        let mut backward = Vec::new();
        let mut d: i64 = 0;
        while Duration::hours(step_hours * d) < limit {
            backward.push(self.grid.step(anchor, -d));
            d += 1;
        }

        match self.settings.policy {
            SearchPolicy::BackwardFirst => backward,
            SearchPolicy::Nearest => {
                let mut all = backward;
                let mut s: i64 = 1;
                loop {
                    let candidate = self.grid.step(anchor, s);
                    if candidate.start() - target >= limit {
                        break;
                    }
                    all.push(candidate);
                    s += 1;
                }
                all.sort_by_key(|c| ((c.start() - target).num_seconds().abs(), c.start()));
                all
            }
        }
    }

    /// Closest cached snapshot to `target` within `limit_days`.
    pub async fn nearest(&self, target: DateTime<Utc>, limit_days: u32) -> Result<Resolved> {
        let limit_days = self.clamp_limit(limit_days);

        for candidate in self.candidates(target, limit_days) {
            if let Some(found) = self.try_read(candidate).await? {
                return Ok(found);
            }
        }

        Err(Error::SearchExhausted { limit_days })
    }

    /// `nearest` driven by raw query strings.
    pub async fn nearest_query(&self, time: Option<&str>, limit: Option<&str>) -> Result<Resolved> {
        let target = parse_instant(time.unwrap_or_default())?;
        self.nearest(target, self.search_limit(limit)).await
    }

    /// Newest cached snapshot at or before `now`.
    pub async fn latest(&self, now: DateTime<Utc>) -> Result<Resolved> {
        let mut candidate = self.grid.round_down(now);

        while now - candidate.start() <= self.settings.latest_lookback {
            if let Some(found) = self.try_read(candidate).await? {
                return Ok(found);
            }
            debug!("{} doesn't exist yet, trying previous interval", candidate.key());
            candidate = self.grid.previous(candidate);
        }

        Err(Error::NotFoundYet)
    }

    async fn try_read(&self, candidate: Interval) -> Result<Option<Resolved>> {
        let key = candidate.key();
        match self.store.read(&key).await {
            Ok(payload) => Ok(Some(Resolved { key, payload })),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Signed integer prefix of `raw`, ignoring leading whitespace.
fn leading_int(raw: &str) -> Option<i64> {
    let s = raw.trim_start();
    let (negative, rest) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    if end == 0 {
        return None;
    }
    // Only overflow can fail here.
    let value = rest[..end].parse::<i64>().unwrap_or(i64::MAX);
    Some(if negative { -value } else { value })
}

/// Parse a query timestamp as UTC.
///
/// Accepts RFC 3339, `YYYY-MM-DDTHH:MM[:SS[.fff]]` with an optional `Z`,
/// and bare `YYYY-MM-DD`.
pub fn parse_instant(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::InvalidInput("timeIso is required".into()));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }

    let naive = raw
        .strip_suffix('Z')
        .or_else(|| raw.strip_suffix('z'))
        .unwrap_or(raw);
    for fmt in [
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(naive, fmt) {
            return Ok(dt.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(naive, "%Y-%m-%d") {
        return Ok(date.and_time(NaiveTime::MIN).and_utc());
    }

    Err(Error::InvalidInput(format!("invalid timeIso: {raw:?}")))
}
