//! CSV export of summary tables for external dashboards.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::SecondsFormat;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::aggregate::AggregateSummary;
use crate::store::{summary_table, ReconciliationStore, StoreError, SummaryQuery};
use crate::timestamp::ALL_GRANULARITIES;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Serialize)]
struct SummaryCsvRow<'a> {
    granularity: &'static str,
    period_start: String,
    fuel_type: &'a str,
    total_predictions: u64,
    avg_error_pct: Option<f64>,
    worst_error_pct: Option<f64>,
    error_std_dev: Option<f64>,
}

impl<'a> From<&'a AggregateSummary> for SummaryCsvRow<'a> {
    fn from(summary: &'a AggregateSummary) -> Self {
        Self {
            granularity: summary.granularity.as_str(),
            period_start: summary
                .period_start
                .to_rfc3339_opts(SecondsFormat::Secs, true),
            fuel_type: summary.fuel_type.as_str(),
            total_predictions: summary.total_predictions,
            avg_error_pct: summary.avg_error_pct,
            worst_error_pct: summary.worst_error_pct,
            error_std_dev: summary.error_std_dev,
        }
    }
}

pub fn write_summaries_csv<W: Write>(
    writer: W,
    summaries: &[AggregateSummary],
) -> Result<(), ExportError> {
    let mut writer = csv::Writer::from_writer(writer);
    for summary in summaries {
        writer.serialize(SummaryCsvRow::from(summary))?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes `<table>.csv` for every granularity into `dir`.
pub fn export_all_summaries(
    store: &ReconciliationStore,
    dir: &Path,
) -> Result<Vec<PathBuf>, ExportError> {
    std::fs::create_dir_all(dir)?;

    let mut written = Vec::new();
    for granularity in ALL_GRANULARITIES {
        let rows = store.summaries(granularity, &SummaryQuery::default())?;
        let path = dir.join(format!("{}.csv", summary_table(granularity)));
        write_summaries_csv(File::create(&path)?, &rows)?;

        info!(
            component = "export",
            event = "export.summaries.written",
            granularity = granularity.as_str(),
            path = %path.display(),
            rows = rows.len()
        );
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::FuelType;
    use crate::timestamp::Granularity;
    use chrono::{TimeZone, Utc};

    #[test]
    fn csv_has_header_and_blank_missing_statistics() {
        let summaries = vec![AggregateSummary {
            granularity: Granularity::Day,
            period_start: Utc
                .with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
                .single()
                .expect("valid"),
            fuel_type: FuelType::Wind,
            total_predictions: 1,
            avg_error_pct: Some(12.5),
            worst_error_pct: Some(12.5),
            error_std_dev: None,
        }];

        let mut out = Vec::new();
        write_summaries_csv(&mut out, &summaries).expect("write csv");
        let text = String::from_utf8(out).expect("utf8");
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(
            lines[0],
            "granularity,period_start,fuel_type,total_predictions,avg_error_pct,worst_error_pct,error_std_dev"
        );
        assert_eq!(lines[1], "daily,2025-01-01T00:00:00Z,Wind,1,12.5,12.5,");
    }
}
