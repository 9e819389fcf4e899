#![forbid(unsafe_code)]

//! Derived `uptime` dimension.
//!
//! The value is computed from a record's epoch-seconds `starttime` and an
//! explicit reference instant. Callers read the wall clock once at the
//! program boundary and pass it down; nothing in here looks at the clock.

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use cp_types::INVALID_LABEL;
use serde::{Deserialize, Serialize};

pub const THREE_MONTHS_DAYS: i64 = 90;
pub const SIX_MONTHS_DAYS: i64 = 180;
pub const ONE_YEAR_DAYS: i64 = 365;
pub const TWO_YEARS_DAYS: i64 = 730;

/// 0001-01-01T00:00:00Z, the earliest accepted start time.
pub const MIN_EPOCH_SECONDS: i64 = -62_135_596_800;
/// 9999-12-31T23:59:59Z, the latest accepted start time.
pub const MAX_EPOCH_SECONDS: i64 = 253_402_300_799;

/// How the derived value is represented.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UptimeMode {
    #[default]
    Bucket,
    Days,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UptimeBucket {
    UnderThreeMonths,
    ThreeToSixMonths,
    SixToTwelveMonths,
    OneToTwoYears,
    OverTwoYears,
}

impl UptimeBucket {
    pub const ALL: [Self; 5] = [
        Self::UnderThreeMonths,
        Self::ThreeToSixMonths,
        Self::SixToTwelveMonths,
        Self::OneToTwoYears,
        Self::OverTwoYears,
    ];

    /// Bucket for a whole number of elapsed days; `None` for negative input.
    ///
    /// The 730-day boundary belongs to `1-2 years`; only 731 days and beyond
    /// are `>2 years`.
    #[must_use]
    pub fn for_days(days: i64) -> Option<Self> {
        match days {
            d if d > TWO_YEARS_DAYS => Some(Self::OverTwoYears),
            d if d >= ONE_YEAR_DAYS => Some(Self::OneToTwoYears),
            d if d >= SIX_MONTHS_DAYS => Some(Self::SixToTwelveMonths),
            d if d >= THREE_MONTHS_DAYS => Some(Self::ThreeToSixMonths),
            d if d >= 0 => Some(Self::UnderThreeMonths),
            _ => None,
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::UnderThreeMonths => "0-3 months",
            Self::ThreeToSixMonths => "3-6 months",
            Self::SixToTwelveMonths => "6-12 months",
            Self::OneToTwoYears => "1-2 years",
            Self::OverTwoYears => ">2 years",
        }
    }
}

/// Resolved value of the derived field for one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UptimeValue {
    Bucket(UptimeBucket),
    Days(i64),
    Invalid,
}

impl UptimeValue {
    #[must_use]
    pub fn is_invalid(self) -> bool {
        matches!(self, Self::Invalid)
    }

    /// Value as it appears in keys and output, or `None` when it is invalid
    /// and invalid values are suppressed.
    #[must_use]
    pub fn label_with_policy(self, include_invalid: bool) -> Option<String> {
        if self.is_invalid() && !include_invalid {
            None
        } else {
            Some(self.to_string())
        }
    }
}

impl fmt::Display for UptimeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bucket(bucket) => f.write_str(bucket.label()),
            Self::Days(days) => write!(f, "{days}"),
            Self::Invalid => f.write_str(INVALID_LABEL),
        }
    }
}

/// Parse a floating-point epoch-seconds string. Non-finite values and
/// instants outside years 1 through 9999 yield `None`.
#[must_use]
pub fn parse_epoch_seconds(raw: &str) -> Option<DateTime<Utc>> {
    let seconds: f64 = raw.trim().parse().ok()?;
    if !seconds.is_finite() {
        return None;
    }
    let whole = seconds.floor();
    if whole < MIN_EPOCH_SECONDS as f64 || whole > MAX_EPOCH_SECONDS as f64 {
        return None;
    }
    let nanos = ((seconds - whole) * 1e9).round().clamp(0.0, 999_999_999.0) as u32;
    DateTime::from_timestamp(whole as i64, nanos)
}

/// Resolve the derived field from a raw `starttime` value.
///
/// Missing, empty, non-numeric, out-of-range, and future start times are all
/// [`UptimeValue::Invalid`], in both representations.
#[must_use]
pub fn resolve_uptime(
    raw_starttime: Option<&str>,
    now: DateTime<Utc>,
    mode: UptimeMode,
) -> UptimeValue {
    let Some(start) = raw_starttime.and_then(parse_epoch_seconds) else {
        return UptimeValue::Invalid;
    };

    let delta = now.signed_duration_since(start);
    if delta < TimeDelta::zero() {
        return UptimeValue::Invalid;
    }

    // num_days truncates toward zero; delta is non-negative here.
    let days = delta.num_days();
    match mode {
        UptimeMode::Days => UptimeValue::Days(days),
        UptimeMode::Bucket => {
            UptimeBucket::for_days(days).map_or(UptimeValue::Invalid, UptimeValue::Bucket)
        }
    }
}
