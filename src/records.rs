//! Telemetry and prediction records shared by every stage of the pipeline.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::timestamp::parse_timestamp;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FuelType {
    OverallIntensity,
    Wind,
    Solar,
    Gas,
    Nuclear,
    /// Any label outside the known set. Still matched by time window, never scored.
    Unknown(String),
}

pub const KNOWN_FUEL_TYPES: [FuelType; 5] = [
    FuelType::OverallIntensity,
    FuelType::Wind,
    FuelType::Solar,
    FuelType::Gas,
    FuelType::Nuclear,
];

impl FuelType {
    pub fn parse(label: &str) -> Self {
        match label {
            "Overall_Intensity" => Self::OverallIntensity,
            "Wind" => Self::Wind,
            "Solar" => Self::Solar,
            "Gas" => Self::Gas,
            "Nuclear" => Self::Nuclear,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::OverallIntensity => "Overall_Intensity",
            Self::Wind => "Wind",
            Self::Solar => "Solar",
            Self::Gas => "Gas",
            Self::Nuclear => "Nuclear",
            Self::Unknown(label) => label,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

impl fmt::Display for FuelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Ordered by label so in-memory and SQL orderings agree.
impl Ord for FuelType {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_str()
            .cmp(other.as_str())
            .then(self.is_known().cmp(&other.is_known()))
    }
}

impl PartialOrd for FuelType {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<String> for FuelType {
    fn from(label: String) -> Self {
        Self::parse(&label)
    }
}

impl From<FuelType> for String {
    fn from(fuel_type: FuelType) -> Self {
        fuel_type.as_str().to_string()
    }
}

/// A grid measurement that passed the validation gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub timestamp: DateTime<Utc>,
    pub overall_intensity: f64,
    pub fuel_wind_perc: f64,
    pub fuel_solar_perc: f64,
    pub fuel_gas_perc: f64,
    pub fuel_nuclear_perc: f64,
}

/// A telemetry record exactly as delivered upstream, before any type checks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawTelemetryRecord {
    #[serde(default)]
    pub timestamp: Value,
    #[serde(default)]
    pub overall_intensity: Value,
    #[serde(default)]
    pub fuel_wind_perc: Value,
    #[serde(default)]
    pub fuel_solar_perc: Value,
    #[serde(default)]
    pub fuel_gas_perc: Value,
    #[serde(default)]
    pub fuel_nuclear_perc: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    #[serde(deserialize_with = "normalized_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(deserialize_with = "normalized_timestamp")]
    pub prediction_timestamp: DateTime<Utc>,
    pub fuel_type: FuelType,
    pub predicted_value: f64,
}

/// Reads a prediction timestamp through the same normalizer telemetry uses.
fn normalized_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(Some(&raw))
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fuel_type_labels_round_trip_through_serde() {
        for fuel_type in KNOWN_FUEL_TYPES {
            let json = serde_json::to_string(&fuel_type).expect("serialize");
            let back: FuelType = serde_json::from_str(&json).expect("deserialize");
            assert_eq!(back, fuel_type);
        }
        assert_eq!(
            serde_json::to_string(&FuelType::OverallIntensity).expect("serialize"),
            "\"Overall_Intensity\""
        );
    }

    #[test]
    fn unrecognized_label_is_preserved() {
        let parsed: FuelType = serde_json::from_str("\"Coal\"").expect("deserialize");
        assert_eq!(parsed, FuelType::Unknown("Coal".to_string()));
        assert!(!parsed.is_known());
        assert_eq!(parsed.as_str(), "Coal");

        assert!(FuelType::Gas < FuelType::Wind);
        assert!(FuelType::OverallIntensity < FuelType::Solar);

        // Labels are case sensitive.
        assert_eq!(FuelType::parse("wind"), FuelType::Unknown("wind".to_string()));
    }

    #[test]
    fn raw_record_keeps_loose_json_types() {
        let raw: RawTelemetryRecord = serde_json::from_str(
            r#"{"timestamp":"2025-01-01T10:00Z","overall_intensity":"120","fuel_wind_perc":40}"#,
        )
        .expect("raw record parses");

        assert!(raw.overall_intensity.is_string());
        assert!(raw.fuel_wind_perc.is_number());
        assert!(raw.fuel_solar_perc.is_null());
    }
}
