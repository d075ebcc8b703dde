//! Short relative durations (`7d`, `24h`, `30m`) resolved to absolute UTC instants.

use chrono::{DateTime, TimeDelta, Utc};

pub const DEFAULT_TIME_RANGE: &str = "7d";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Days,
    Hours,
    Minutes,
}

impl TimeUnit {
    fn from_suffix(c: char) -> Option<Self> {
        match c.to_ascii_lowercase() {
            'd' => Some(TimeUnit::Days),
            'h' => Some(TimeUnit::Hours),
            'm' => Some(TimeUnit::Minutes),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub magnitude: i64,
    pub unit: TimeUnit,
}

impl TimeRange {
    pub const FALLBACK: TimeRange = TimeRange {
        magnitude: 7,
        unit: TimeUnit::Days,
    };

    /// Parse a duration token. Never fails.
    ///
    /// An unparsable magnitude yields [`TimeRange::FALLBACK`]. A valid
    /// magnitude with an unknown unit keeps the magnitude and counts days.
    pub fn parse(raw: Option<&str>) -> Self {
        let raw = match raw {
            Some(value) if !value.is_empty() => value,
            _ => DEFAULT_TIME_RANGE,
        };
        let Some(suffix) = raw.chars().next_back() else {
            return Self::FALLBACK;
        };
        let prefix = &raw[..raw.len() - suffix.len_utf8()];
        let Ok(magnitude) = prefix.trim().parse::<i64>() else {
            return Self::FALLBACK;
        };
        Self {
            magnitude,
            unit: TimeUnit::from_suffix(suffix).unwrap_or(TimeUnit::Days),
        }
    }

    pub fn duration(&self) -> Option<TimeDelta> {
        match self.unit {
            TimeUnit::Days => TimeDelta::try_days(self.magnitude),
            TimeUnit::Hours => TimeDelta::try_hours(self.magnitude),
            TimeUnit::Minutes => TimeDelta::try_minutes(self.magnitude),
        }
    }

    /// `now - duration`. Magnitudes outside chrono's range resolve as the fallback.
    pub fn start_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.checked_start_from(now)
            .or_else(|| Self::FALLBACK.checked_start_from(now))
            .unwrap_or(now)
    }

    fn checked_start_from(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        now.checked_sub_signed(self.duration()?)
    }
}

/// ISO-8601 UTC with millisecond precision and a trailing `Z`.
pub fn format_timestamp(instant: DateTime<Utc>) -> String {
    instant.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

pub fn parse_time_range(raw: Option<&str>) -> String {
    parse_time_range_at(raw, Utc::now())
}

pub fn parse_time_range_at(raw: Option<&str>, now: DateTime<Utc>) -> String {
    format_timestamp(TimeRange::parse(raw).start_from(now))
}
