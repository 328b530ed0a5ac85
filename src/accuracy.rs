//! Error metrics for a single actual/predicted pair.

use std::str::FromStr;

use bigdecimal::{BigDecimal, RoundingMode};
use serde::{Deserialize, Serialize};

pub const REPORTED_DECIMALS: i64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub absolute_error: Option<f64>,
    pub percentage_error: Option<f64>,
}

/// A zero actual yields no percentage rather than an infinite one.
pub fn compute_error(actual: Option<f64>, predicted: f64) -> ErrorMetrics {
    let Some(actual) = actual else {
        return ErrorMetrics {
            absolute_error: None,
            percentage_error: None,
        };
    };

    let absolute_error = (actual - predicted).abs();
    let percentage_error = if actual == 0.0 {
        None
    } else {
        round_half_up(absolute_error * 100.0 / actual)
    };

    ErrorMetrics {
        absolute_error: Some(absolute_error),
        percentage_error,
    }
}

/// Rounds to two decimals, half away from zero, on the shortest decimal form
/// of `value` so that `1.005` becomes `1.01` rather than `1.0`.
pub fn round_half_up(value: f64) -> Option<f64> {
    if !value.is_finite() {
        return None;
    }
    let decimal = BigDecimal::from_str(&value.to_string()).ok()?;
    decimal
        .with_scale_round(REPORTED_DECIMALS, RoundingMode::HalfUp)
        .to_string()
        .parse::<f64>()
        .ok()
}
