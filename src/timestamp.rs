//! Timestamp normalization and period truncation.
//!
//! Every instant that takes part in matching is truncated to the start of its
//! containing UTC hour first. Day and week truncation only exist for summary
//! grouping; weeks start on Monday 00:00 UTC.

use std::fmt;
use std::str::FromStr;

use chrono::{
    DateTime, Datelike, Duration as ChronoDuration, NaiveDate, NaiveDateTime, NaiveTime, Timelike,
    Utc,
};
use serde::{Deserialize, Serialize};

const OFFSET_FORMATS: [&str; 8] = [
    "%Y-%m-%dT%H:%M:%S%.f%:z",
    "%Y-%m-%dT%H:%M%:z",
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M%:z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%dT%H:%M%z",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M%z",
];

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hour,
    Day,
    Week,
}

pub const ALL_GRANULARITIES: [Granularity; 3] =
    [Granularity::Hour, Granularity::Day, Granularity::Week];

impl Granularity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hour => "hourly",
            Self::Day => "daily",
            Self::Week => "weekly",
        }
    }

    pub fn period_length(self) -> ChronoDuration {
        match self {
            Self::Hour => ChronoDuration::hours(1),
            Self::Day => ChronoDuration::days(1),
            Self::Week => ChronoDuration::weeks(1),
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "hour" | "hourly" => Ok(Self::Hour),
            "day" | "daily" => Ok(Self::Day),
            "week" | "weekly" => Ok(Self::Week),
            other => Err(format!("unknown granularity: {other}")),
        }
    }
}

/// Parses an ISO-8601 timestamp into a UTC instant.
///
/// Accepts a `Z` designator, a numeric offset, or no designator at all (read
/// as UTC), with or without seconds. Malformed input yields `None`.
pub fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let trimmed = raw?.trim();
    if trimmed.is_empty() {
        return None;
    }

    let normalized = normalize_zulu(trimmed);

    for format in OFFSET_FORMATS {
        if let Ok(parsed) = DateTime::parse_from_str(&normalized, format) {
            return Some(parsed.with_timezone(&Utc));
        }
    }

    for format in NAIVE_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(&normalized, format) {
            return Some(parsed.and_utc());
        }
    }

    NaiveDate::parse_from_str(&normalized, "%Y-%m-%d")
        .ok()
        .map(|date| date.and_time(NaiveTime::MIN).and_utc())
}

pub fn truncate_to_hour(instant: DateTime<Utc>) -> DateTime<Utc> {
    start_of_day(instant) + ChronoDuration::hours(i64::from(instant.hour()))
}

pub fn truncate(instant: DateTime<Utc>, granularity: Granularity) -> DateTime<Utc> {
    match granularity {
        Granularity::Hour => truncate_to_hour(instant),
        Granularity::Day => start_of_day(instant),
        Granularity::Week => {
            let days_since_monday = instant.weekday().num_days_from_monday();
            start_of_day(instant)
                .checked_sub_signed(ChronoDuration::days(i64::from(days_since_monday)))
                .unwrap_or(DateTime::<Utc>::MIN_UTC)
        }
    }
}

/// Moves `instant` by whole hours, clamping at the representable range
/// instead of overflowing.
pub fn shift_hours(instant: DateTime<Utc>, hours: i64) -> DateTime<Utc> {
    ChronoDuration::try_hours(hours)
        .and_then(|delta| instant.checked_add_signed(delta))
        .unwrap_or(if hours < 0 {
            DateTime::<Utc>::MIN_UTC
        } else {
            DateTime::<Utc>::MAX_UTC
        })
}

fn start_of_day(instant: DateTime<Utc>) -> DateTime<Utc> {
    instant.date_naive().and_time(NaiveTime::MIN).and_utc()
}

fn normalize_zulu(raw: &str) -> String {
    match raw.strip_suffix(['Z', 'z']) {
        Some(stripped) => format!("{stripped}+00:00"),
        None => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s)
            .single()
            .expect("valid test timestamp")
    }

    #[test]
    fn zulu_and_zero_offset_parse_to_same_instant() {
        let zulu = parse_timestamp(Some("2025-12-09T14:00Z")).expect("zulu form parses");
        let offset = parse_timestamp(Some("2025-12-09T14:00+00:00")).expect("offset form parses");

        assert_eq!(zulu, offset);
        assert_eq!(zulu.year(), 2025);
        assert_eq!(zulu.month(), 12);
        assert_eq!(zulu.day(), 9);
        assert_eq!(zulu.hour(), 14);
    }

    #[test]
    fn missing_and_malformed_input_yield_none() {
        assert_eq!(parse_timestamp(None), None);
        assert_eq!(parse_timestamp(Some("")), None);
        assert_eq!(parse_timestamp(Some("   ")), None);
        assert_eq!(parse_timestamp(Some("invalid")), None);
        assert_eq!(parse_timestamp(Some("2025-13-40T99:00Z")), None);
        assert_eq!(parse_timestamp(Some("Z")), None);
    }

    #[test]
    fn accepts_seconds_fractions_offsets_and_naive_forms() {
        let expected = utc(2025, 12, 9, 14, 30, 15);
        assert_eq!(
            parse_timestamp(Some("2025-12-09T14:30:15Z")),
            Some(expected)
        );
        assert_eq!(
            parse_timestamp(Some("2025-12-09T16:30:15+02:00")),
            Some(expected)
        );
        assert_eq!(
            parse_timestamp(Some("2025-12-09T14:30:15")),
            Some(expected)
        );
        assert_eq!(
            parse_timestamp(Some("2025-12-09 14:30:15")),
            Some(expected)
        );

        let fractional = parse_timestamp(Some("2025-12-09T14:30:15.250Z")).expect("fraction");
        assert_eq!(truncate_to_hour(fractional), utc(2025, 12, 9, 14, 0, 0));

        assert_eq!(
            parse_timestamp(Some("2025-12-09")),
            Some(utc(2025, 12, 9, 0, 0, 0))
        );
    }

    #[test]
    fn negative_offset_crosses_day_boundary() {
        let parsed = parse_timestamp(Some("2025-12-09T22:15-05:00")).expect("offset parses");
        assert_eq!(parsed, utc(2025, 12, 10, 3, 15, 0));
    }

    #[test]
    fn truncation_by_granularity() {
        // 2025-01-01 was a Wednesday.
        let instant = utc(2025, 1, 1, 10, 59, 59);
        assert_eq!(truncate_to_hour(instant), utc(2025, 1, 1, 10, 0, 0));
        assert_eq!(truncate(instant, Granularity::Hour), utc(2025, 1, 1, 10, 0, 0));
        assert_eq!(truncate(instant, Granularity::Day), utc(2025, 1, 1, 0, 0, 0));
        assert_eq!(
            truncate(instant, Granularity::Week),
            utc(2024, 12, 30, 0, 0, 0)
        );

        let monday = utc(2024, 12, 30, 0, 0, 0);
        assert_eq!(truncate(monday, Granularity::Week), monday);
    }

    #[test]
    fn granularity_parses_both_spellings() {
        assert_eq!("hour".parse::<Granularity>(), Ok(Granularity::Hour));
        assert_eq!("Daily".parse::<Granularity>(), Ok(Granularity::Day));
        assert_eq!("weekly".parse::<Granularity>(), Ok(Granularity::Week));
        assert!("monthly".parse::<Granularity>().is_err());
    }
}
