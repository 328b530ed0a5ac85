//! JSON-lines readers for telemetry and prediction feeds.

use std::io::BufRead;

use serde::de::DeserializeOwned;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedLine {
    /// 1-based line number in the source.
    pub line: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JsonLines<T> {
    pub records: Vec<T>,
    pub malformed: Vec<MalformedLine>,
}

impl<T> Default for JsonLines<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            malformed: Vec::new(),
        }
    }
}

/// Parses one JSON document per line. Blank lines are skipped; lines that do
/// not decode are reported instead of failing the whole feed.
pub fn read_json_lines<T, R>(reader: R, source: &str) -> Result<JsonLines<T>, std::io::Error>
where
    T: DeserializeOwned,
    R: BufRead,
{
    let mut out = JsonLines::default();

    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match serde_json::from_str::<T>(trimmed) {
            Ok(record) => out.records.push(record),
            Err(err) => {
                warn!(
                    component = "feed",
                    event = "feed.line.malformed",
                    source,
                    line = idx + 1,
                    error = %err
                );
                out.malformed.push(MalformedLine {
                    line: idx + 1,
                    reason: err.to_string(),
                });
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{FuelType, PredictionRecord, RawTelemetryRecord};
    use std::io::Cursor;

    #[test]
    fn skips_blank_lines_and_reports_bad_ones() {
        let input = concat!(
            "{\"timestamp\":\"2025-01-01T10:00Z\",\"overall_intensity\":120}\n",
            "\n",
            "not json\n",
            "{\"timestamp\":\"2025-01-01T11:00Z\",\"overall_intensity\":\"n/a\"}\n",
        );

        let parsed: JsonLines<RawTelemetryRecord> =
            read_json_lines(Cursor::new(input), "telemetry").expect("in-memory read");

        assert_eq!(parsed.records.len(), 2);
        assert_eq!(parsed.malformed.len(), 1);
        assert_eq!(parsed.malformed[0].line, 3);
        // Loose values survive the read; the validation gate decides later.
        assert!(parsed.records[1].overall_intensity.is_string());
    }

    #[test]
    fn prediction_lines_require_typed_fields() {
        let input = concat!(
            "{\"created_at\":\"2025-01-01T10:30:00Z\",\"prediction_timestamp\":\"2025-01-01T11:00:00Z\",\"fuel_type\":\"Wind\",\"predicted_value\":45.0}\n",
            "{\"created_at\":\"2025-01-01T10:30:00Z\",\"prediction_timestamp\":\"2025-01-01T11:00:00Z\",\"fuel_type\":\"Wind\",\"predicted_value\":null}\n",
        );

        let parsed: JsonLines<PredictionRecord> =
            read_json_lines(Cursor::new(input), "predictions").expect("in-memory read");

        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.records[0].fuel_type, FuelType::Wind);
        assert_eq!(parsed.malformed.len(), 1);
        assert_eq!(parsed.malformed[0].line, 2);
    }

    #[test]
    fn prediction_timestamps_accept_every_normalized_form() {
        let input = concat!(
            "{\"created_at\":\"2025-01-01T10:30Z\",\"prediction_timestamp\":\"2025-01-01T11:00Z\",\"fuel_type\":\"Wind\",\"predicted_value\":45.0}\n",
            "{\"created_at\":\"2025-01-01T10:30:00\",\"prediction_timestamp\":\"2025-01-01 11:00:00\",\"fuel_type\":\"Gas\",\"predicted_value\":30.0}\n",
            "{\"created_at\":\"2025-01-01T11:30:00+01:00\",\"prediction_timestamp\":\"2025-01-01T11:00:00Z\",\"fuel_type\":\"Solar\",\"predicted_value\":5.0}\n",
            "{\"created_at\":\"yesterday\",\"prediction_timestamp\":\"2025-01-01T11:00:00Z\",\"fuel_type\":\"Solar\",\"predicted_value\":5.0}\n",
        );

        let parsed: JsonLines<PredictionRecord> =
            read_json_lines(Cursor::new(input), "predictions").expect("in-memory read");

        let expected = crate::timestamp::parse_timestamp(Some("2025-01-01T10:30:00Z"))
            .expect("valid timestamp");
        assert_eq!(parsed.records.len(), 3);
        for record in &parsed.records {
            assert_eq!(record.created_at, expected);
        }
        assert_eq!(parsed.malformed.len(), 1);
        assert_eq!(parsed.malformed[0].line, 4);
    }
}
