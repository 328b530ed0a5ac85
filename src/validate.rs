//! Ingestion gate for telemetry records.
//!
//! Upstream payloads are loosely typed JSON, so every field is type-checked
//! before it is range-checked. Numeric-looking strings are rejected, never
//! coerced.

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::records::{RawTelemetryRecord, TelemetryRecord};
use crate::timestamp::{parse_timestamp, shift_hours};

pub const MAX_INTENSITY: f64 = 1_000.0;
pub const MAX_FUEL_PERCENTAGE: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationPolicy {
    pub max_future_skew_hours: i64,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            max_future_skew_hours: 24,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationFailure {
    #[error("timestamp is missing or not ISO-8601: {raw}")]
    InvalidTimestamp { raw: String },
    #[error("timestamp {timestamp} is more than {max_future_skew_hours}h ahead of {now}")]
    FutureTimestamp {
        timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
        max_future_skew_hours: i64,
    },
    #[error("{field} is not a number: {raw}")]
    NonNumeric { field: &'static str, raw: String },
    #[error("{field} value {value} outside [0, {max}]")]
    OutOfRange {
        field: &'static str,
        value: f64,
        max: f64,
    },
}

impl ValidationFailure {
    pub fn field(&self) -> &'static str {
        match self {
            Self::InvalidTimestamp { .. } | Self::FutureTimestamp { .. } => "timestamp",
            Self::NonNumeric { field, .. } | Self::OutOfRange { field, .. } => field,
        }
    }
}

pub fn validate_intensity(value: &Value) -> bool {
    let valid = in_range(value, MAX_INTENSITY);
    if !valid {
        debug!(
            component = "validate",
            event = "validate.intensity.rejected",
            value = %value
        );
    }
    valid
}

/// `label` only attributes the rejection in logs; the rule is identical for every fuel.
pub fn validate_fuel_percentage(label: &str, value: &Value) -> bool {
    let valid = in_range(value, MAX_FUEL_PERCENTAGE);
    if !valid {
        debug!(
            component = "validate",
            event = "validate.fuel_percentage.rejected",
            label,
            value = %value
        );
    }
    valid
}

pub fn validate_timestamp(value: Option<&DateTime<Utc>>) -> bool {
    value.is_some()
}

/// Runs every field check and returns the typed record, or the first failure.
pub fn validate_record(
    raw: &RawTelemetryRecord,
    now: DateTime<Utc>,
    policy: &ValidationPolicy,
) -> Result<TelemetryRecord, ValidationFailure> {
    let timestamp = match &raw.timestamp {
        Value::String(text) => parse_timestamp(Some(text)),
        _ => None,
    };
    let timestamp = match timestamp {
        Some(ts) if validate_timestamp(Some(&ts)) => ts,
        _ => {
            return Err(ValidationFailure::InvalidTimestamp {
                raw: raw.timestamp.to_string(),
            })
        }
    };

    let horizon = shift_hours(now, policy.max_future_skew_hours);
    if timestamp > horizon {
        return Err(ValidationFailure::FutureTimestamp {
            timestamp,
            now,
            max_future_skew_hours: policy.max_future_skew_hours,
        });
    }

    let overall_intensity = match as_number(&raw.overall_intensity) {
        Some(number) if validate_intensity(&raw.overall_intensity) => number,
        _ => {
            return Err(rejection(
                "overall_intensity",
                &raw.overall_intensity,
                MAX_INTENSITY,
            ))
        }
    };

    Ok(TelemetryRecord {
        timestamp,
        overall_intensity,
        fuel_wind_perc: checked_fuel("wind", "fuel_wind_perc", &raw.fuel_wind_perc)?,
        fuel_solar_perc: checked_fuel("solar", "fuel_solar_perc", &raw.fuel_solar_perc)?,
        fuel_gas_perc: checked_fuel("gas", "fuel_gas_perc", &raw.fuel_gas_perc)?,
        fuel_nuclear_perc: checked_fuel("nuclear", "fuel_nuclear_perc", &raw.fuel_nuclear_perc)?,
    })
}

fn checked_fuel(label: &str, field: &'static str, value: &Value) -> Result<f64, ValidationFailure> {
    if validate_fuel_percentage(label, value) {
        if let Some(number) = as_number(value) {
            return Ok(number);
        }
    }
    Err(rejection(field, value, MAX_FUEL_PERCENTAGE))
}

fn rejection(field: &'static str, value: &Value, max: f64) -> ValidationFailure {
    match as_number(value) {
        Some(number) => ValidationFailure::OutOfRange {
            field,
            value: number,
            max,
        },
        None => ValidationFailure::NonNumeric {
            field,
            raw: value.to_string(),
        },
    }
}

fn in_range(value: &Value, max: f64) -> bool {
    as_number(value)
        .map(|number| (0.0..=max).contains(&number))
        .unwrap_or(false)
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64().filter(|v| v.is_finite()),
        _ => None,
    }
}
