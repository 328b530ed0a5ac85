//! Joins predictions to the telemetry they are scored against.
//!
//! A telemetry record is a candidate for a prediction when its hour lies in
//! `[hour(created_at) - lookback, hour(created_at) + lookahead)`. Every
//! candidate is kept here; choosing one per prediction is an aggregation
//! policy.

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::accuracy::compute_error;
use crate::records::{FuelType, PredictionRecord, TelemetryRecord};
use crate::timestamp::{shift_hours, truncate_to_hour};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchWindow {
    pub lookback_hours: i64,
    pub lookahead_hours: i64,
}

impl Default for MatchWindow {
    fn default() -> Self {
        Self {
            lookback_hours: 24,
            lookahead_hours: 1,
        }
    }
}

impl MatchWindow {
    /// Inclusive lower and exclusive upper hour bound for a prediction.
    pub fn bounds(&self, prediction_created_at: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let anchor = truncate_to_hour(prediction_created_at);
        (
            shift_hours(anchor, self.lookback_hours.saturating_neg()),
            shift_hours(anchor, self.lookahead_hours),
        )
    }

    pub fn contains(
        &self,
        prediction_created_at: DateTime<Utc>,
        telemetry_timestamp: DateTime<Utc>,
    ) -> bool {
        let (lower, upper) = self.bounds(prediction_created_at);
        let hour = truncate_to_hour(telemetry_timestamp);
        hour >= lower && hour < upper
    }
}

/// A record paired with its storage identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keyed<T> {
    pub id: i64,
    pub record: T,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedPair {
    pub prediction_id: i64,
    pub telemetry_id: i64,
    pub actual_timestamp: DateTime<Utc>,
    pub prediction_created_at: DateTime<Utc>,
    pub prediction_timestamp: DateTime<Utc>,
    pub fuel_type: FuelType,
    pub actual_value: Option<f64>,
    pub predicted_value: f64,
    pub prediction_error: Option<f64>,
    pub error_percentage: Option<f64>,
}

impl MatchedPair {
    /// Hour distance between the scored telemetry and the prediction's creation.
    pub fn hour_distance(&self) -> i64 {
        (self.actual_timestamp - self.prediction_created_at)
            .num_hours()
            .abs()
    }
}

pub fn actual_value(fuel_type: &FuelType, telemetry: &TelemetryRecord) -> Option<f64> {
    match fuel_type {
        FuelType::OverallIntensity => Some(telemetry.overall_intensity),
        FuelType::Wind => Some(telemetry.fuel_wind_perc),
        FuelType::Solar => Some(telemetry.fuel_solar_perc),
        FuelType::Gas => Some(telemetry.fuel_gas_perc),
        FuelType::Nuclear => Some(telemetry.fuel_nuclear_perc),
        FuelType::Unknown(_) => None,
    }
}

/// Indices of every telemetry record inside the prediction's window.
pub fn match_prediction(
    prediction: &PredictionRecord,
    telemetry: &[TelemetryRecord],
    window: &MatchWindow,
) -> Vec<usize> {
    telemetry
        .iter()
        .enumerate()
        .filter(|(_, record)| window.contains(prediction.created_at, record.timestamp))
        .map(|(idx, _)| idx)
        .collect()
}

pub fn build_pair(
    prediction: &Keyed<PredictionRecord>,
    telemetry: &Keyed<TelemetryRecord>,
) -> MatchedPair {
    let actual = actual_value(&prediction.record.fuel_type, &telemetry.record);
    let metrics = compute_error(actual, prediction.record.predicted_value);

    MatchedPair {
        prediction_id: prediction.id,
        telemetry_id: telemetry.id,
        actual_timestamp: truncate_to_hour(telemetry.record.timestamp),
        prediction_created_at: truncate_to_hour(prediction.record.created_at),
        prediction_timestamp: prediction.record.prediction_timestamp,
        fuel_type: prediction.record.fuel_type.clone(),
        actual_value: actual,
        predicted_value: prediction.record.predicted_value,
        prediction_error: metrics.absolute_error,
        error_percentage: metrics.percentage_error,
    }
}

/// Matched view over in-memory slices; ids are slice positions.
pub fn reconcile(
    predictions: &[PredictionRecord],
    telemetry: &[TelemetryRecord],
    window: &MatchWindow,
) -> Vec<MatchedPair> {
    let predictions: Vec<Keyed<PredictionRecord>> = predictions
        .iter()
        .cloned()
        .enumerate()
        .map(|(idx, record)| Keyed {
            id: idx as i64,
            record,
        })
        .collect();
    let telemetry: Vec<Keyed<TelemetryRecord>> = telemetry
        .iter()
        .cloned()
        .enumerate()
        .map(|(idx, record)| Keyed {
            id: idx as i64,
            record,
        })
        .collect();

    reconcile_keyed(&predictions, &telemetry, window)
}

pub fn reconcile_keyed(
    predictions: &[Keyed<PredictionRecord>],
    telemetry: &[Keyed<TelemetryRecord>],
    window: &MatchWindow,
) -> Vec<MatchedPair> {
    let mut by_hour: Vec<(DateTime<Utc>, &Keyed<TelemetryRecord>)> = telemetry
        .iter()
        .map(|entry| (truncate_to_hour(entry.record.timestamp), entry))
        .collect();
    by_hour.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.id.cmp(&b.1.id)));

    let index: &[(DateTime<Utc>, &Keyed<TelemetryRecord>)] = &by_hour;

    let mut pairs: Vec<MatchedPair> = predictions
        .par_iter()
        .filter(|prediction| prediction.record.predicted_value.is_finite())
        .flat_map_iter(move |prediction| {
            let (lower, upper) = window.bounds(prediction.record.created_at);
            let start = index.partition_point(|(hour, _)| *hour < lower);
            let end = index.partition_point(|(hour, _)| *hour < upper);
            index[start..end.max(start)]
                .iter()
                .map(move |(_, entry)| build_pair(prediction, entry))
        })
        .collect();

    pairs.sort_by(|a, b| {
        a.actual_timestamp
            .cmp(&b.actual_timestamp)
            .then(a.prediction_created_at.cmp(&b.prediction_created_at))
            .then(a.fuel_type.cmp(&b.fuel_type))
            .then(a.prediction_id.cmp(&b.prediction_id))
            .then(a.telemetry_id.cmp(&b.telemetry_id))
    });
    pairs
}
