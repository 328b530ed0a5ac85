//! SQLite persistence for telemetry, predictions and the summary tables.
//!
//! Telemetry and predictions are append-only. The three summary tables are
//! caches that can always be rebuilt from them; `summary_state` records, per
//! granularity, the highest row ids folded in and the matching fingerprint the
//! rows were built with.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::aggregate::{aggregate, matching_fingerprint, AggregateSummary, TieBreak};
use crate::matcher::{reconcile_keyed, Keyed, MatchWindow, MatchedPair};
use crate::records::{FuelType, PredictionRecord, RawTelemetryRecord, TelemetryRecord};
use crate::timestamp::{shift_hours, truncate, truncate_to_hour, Granularity};
use crate::validate::{validate_record, ValidationFailure, ValidationPolicy};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid UTC timestamp: {0}")]
    InvalidTimestamp(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Inserted { id: i64 },
    /// A telemetry record with the exact same timestamp already exists.
    Duplicate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRecord {
    /// Position of the record in the submitted batch.
    pub index: usize,
    pub failure: ValidationFailure,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    pub accepted: usize,
    pub duplicates: usize,
    pub rejected: Vec<RejectedRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "asc" => Ok(Self::Asc),
            "desc" => Ok(Self::Desc),
            other => Err(format!("unknown sort order: {other}")),
        }
    }
}

/// Filter over the matched view, by `actual_timestamp`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchedQuery {
    pub start: Option<DateTime<Utc>>,
    pub end_exclusive: Option<DateTime<Utc>>,
    pub fuel_type: Option<FuelType>,
    pub order: SortOrder,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SummaryQuery {
    pub fuel_type: Option<FuelType>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshMode {
    Full,
    Incremental,
}

impl RefreshMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
        }
    }
}

impl fmt::Display for RefreshMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RefreshMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "incremental" => Ok(Self::Incremental),
            other => Err(format!("unknown refresh mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshReport {
    pub granularity: Granularity,
    pub requested: RefreshMode,
    /// Differs from `requested` when an incremental refresh had to fall back.
    pub performed: RefreshMode,
    pub new_telemetry: u64,
    pub new_predictions: u64,
    pub periods_recomputed: usize,
    pub rows_written: usize,
    pub total_rows: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryFreshness {
    pub granularity: Granularity,
    pub refreshed_at: Option<DateTime<Utc>>,
    pub pending_telemetry: u64,
    pub pending_predictions: u64,
    pub fingerprint_matches: bool,
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SummaryState {
    last_telemetry_id: i64,
    last_prediction_id: i64,
    fingerprint: String,
    refreshed_at_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Watermark {
    telemetry_id: i64,
    prediction_id: i64,
}

/// Row selection shared by the telemetry and prediction loaders.
#[derive(Debug, Clone, Copy)]
struct RowBounds {
    start_ms: i64,
    end_ms: i64,
    after_id: i64,
}

impl RowBounds {
    fn all() -> Self {
        Self {
            start_ms: i64::MIN,
            end_ms: i64::MAX,
            after_id: 0,
        }
    }

    fn time(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start_ms: start.timestamp_millis(),
            end_ms: end.timestamp_millis(),
            after_id: 0,
        }
    }

    fn after(after_id: i64) -> Self {
        Self {
            after_id,
            ..Self::all()
        }
    }
}

const BASE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS grid_telemetry (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts_ms INTEGER NOT NULL UNIQUE,
    overall_intensity REAL NOT NULL,
    fuel_wind_perc REAL NOT NULL,
    fuel_solar_perc REAL NOT NULL,
    fuel_gas_perc REAL NOT NULL,
    fuel_nuclear_perc REAL NOT NULL
);
CREATE TABLE IF NOT EXISTS grid_predictions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at_ms INTEGER NOT NULL,
    prediction_ts_ms INTEGER NOT NULL,
    fuel_type TEXT NOT NULL,
    predicted_value REAL
);
CREATE INDEX IF NOT EXISTS idx_grid_predictions_created_at
    ON grid_predictions (created_at_ms);
CREATE TABLE IF NOT EXISTS summary_state (
    granularity TEXT PRIMARY KEY,
    last_telemetry_id INTEGER NOT NULL,
    last_prediction_id INTEGER NOT NULL,
    fingerprint TEXT NOT NULL,
    refreshed_at_ms INTEGER NOT NULL
);
";

pub fn summary_table(granularity: Granularity) -> &'static str {
    match granularity {
        Granularity::Hour => "hourly_accuracy",
        Granularity::Day => "daily_accuracy",
        Granularity::Week => "weekly_accuracy",
    }
}

pub struct ReconciliationStore {
    conn: Connection,
    window: MatchWindow,
    tie_break: TieBreak,
    validation: ValidationPolicy,
}

impl ReconciliationStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
            ",
        )?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        ensure_schema(&conn)?;
        Ok(Self {
            conn,
            window: MatchWindow::default(),
            tie_break: TieBreak::default(),
            validation: ValidationPolicy::default(),
        })
    }

    pub fn with_matching(mut self, window: MatchWindow, tie_break: TieBreak) -> Self {
        self.window = window;
        self.tie_break = tie_break;
        self
    }

    pub fn with_validation(mut self, validation: ValidationPolicy) -> Self {
        self.validation = validation;
        self
    }

    pub fn window(&self) -> MatchWindow {
        self.window
    }

    pub fn tie_break(&self) -> TieBreak {
        self.tie_break
    }

    /// Inserts an already validated record. Use [`Self::ingest_telemetry`]
    /// for raw upstream payloads.
    pub fn insert_telemetry(&self, record: &TelemetryRecord) -> Result<IngestOutcome, StoreError> {
        insert_telemetry_row(&self.conn, record)
    }

    /// Runs every raw record through the validation gate and inserts the
    /// accepted ones in a single transaction. Rejections are reported, never
    /// fatal.
    pub fn ingest_telemetry(
        &mut self,
        raw: &[RawTelemetryRecord],
        now: DateTime<Utc>,
    ) -> Result<IngestReport, StoreError> {
        let policy = self.validation;
        let mut report = IngestReport::default();

        let tx = self.conn.transaction()?;
        for (index, record) in raw.iter().enumerate() {
            match validate_record(record, now, &policy) {
                Ok(valid) => match insert_telemetry_row(&tx, &valid)? {
                    IngestOutcome::Inserted { .. } => report.accepted += 1,
                    IngestOutcome::Duplicate => {
                        debug!(
                            component = "store",
                            event = "ingest.record.duplicate",
                            index,
                            timestamp = %valid.timestamp
                        );
                        report.duplicates += 1;
                    }
                },
                Err(failure) => {
                    warn!(
                        component = "store",
                        event = "ingest.record.rejected",
                        index,
                        field = failure.field(),
                        reason = %failure
                    );
                    report.rejected.push(RejectedRecord { index, failure });
                }
            }
        }
        tx.commit()?;

        info!(
            component = "store",
            event = "ingest.telemetry.finish",
            submitted = raw.len(),
            accepted = report.accepted,
            duplicates = report.duplicates,
            rejected = report.rejected.len()
        );
        Ok(report)
    }

    pub fn insert_prediction(&self, record: &PredictionRecord) -> Result<i64, StoreError> {
        insert_prediction_row(&self.conn, record)
    }

    pub fn insert_predictions(
        &mut self,
        records: &[PredictionRecord],
    ) -> Result<Vec<i64>, StoreError> {
        let tx = self.conn.transaction()?;
        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            ids.push(insert_prediction_row(&tx, record)?);
        }
        tx.commit()?;

        info!(
            component = "store",
            event = "ingest.predictions.finish",
            inserted = ids.len()
        );
        Ok(ids)
    }

    pub fn telemetry_count(&self) -> Result<u64, StoreError> {
        count_rows(&self.conn, "grid_telemetry")
    }

    pub fn prediction_count(&self) -> Result<u64, StoreError> {
        count_rows(&self.conn, "grid_predictions")
    }

    /// Matched pairs computed from the base tables at query time.
    pub fn matched_view(&self, query: &MatchedQuery) -> Result<Vec<MatchedPair>, StoreError> {
        let lookback = self.window.lookback_hours;
        let lookahead = self.window.lookahead_hours;

        // `hour(t) >= start` implies `t >= start`; `hour(t) < end` implies `t < end + 1h`.
        let telemetry_bounds = RowBounds {
            start_ms: bound_ms(query.start, 0, i64::MIN),
            end_ms: bound_ms(query.end_exclusive, 1, i64::MAX),
            after_id: 0,
        };
        let prediction_bounds = RowBounds {
            start_ms: bound_ms(query.start, lookahead.saturating_add(1).saturating_neg(), i64::MIN),
            end_ms: bound_ms(query.end_exclusive, lookback.saturating_add(1), i64::MAX),
            after_id: 0,
        };

        let fuel_filter = query.fuel_type.as_ref().map(FuelType::as_str);
        let telemetry = load_telemetry(&self.conn, telemetry_bounds)?;
        let predictions = load_predictions(&self.conn, prediction_bounds, fuel_filter)?;

        let mut pairs: Vec<MatchedPair> = reconcile_keyed(&predictions, &telemetry, &self.window)
            .into_iter()
            .filter(|pair| {
                query.start.map_or(true, |start| pair.actual_timestamp >= start)
                    && query
                        .end_exclusive
                        .map_or(true, |end| pair.actual_timestamp < end)
            })
            .collect();

        if query.order == SortOrder::Desc {
            pairs.reverse();
        }
        if let Some(limit) = query.limit {
            pairs.truncate(limit);
        }

        debug!(
            component = "store",
            event = "matched.query",
            telemetry_rows = telemetry.len(),
            prediction_rows = predictions.len(),
            pairs = pairs.len()
        );
        Ok(pairs)
    }

    /// Rebuilds one summary table.
    ///
    /// `Incremental` recomputes only the periods that rows ingested since the
    /// last refresh can affect, including periods where the tie-break may now
    /// pick a different telemetry record. It falls back to `Full` when the
    /// table was never refreshed or the matching settings changed. Both modes
    /// leave the table in the same state.
    pub fn refresh_summaries(
        &mut self,
        granularity: Granularity,
        mode: RefreshMode,
    ) -> Result<RefreshReport, StoreError> {
        let window = self.window;
        let tie_break = self.tie_break;
        let fingerprint = matching_fingerprint(&window, tie_break);
        let table = summary_table(granularity);

        info!(
            component = "store",
            event = "summaries.refresh.start",
            granularity = granularity.as_str(),
            requested = mode.as_str()
        );

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let state = read_state(&tx, granularity)?;
        let watermark = current_watermark(&tx)?;

        let performed = match (&state, mode) {
            (Some(state), RefreshMode::Incremental) if state.fingerprint == fingerprint => {
                RefreshMode::Incremental
            }
            (state, RefreshMode::Incremental) => {
                info!(
                    component = "store",
                    event = "summaries.refresh.fallback",
                    granularity = granularity.as_str(),
                    reason = if state.is_some() {
                        "fingerprint_changed"
                    } else {
                        "never_refreshed"
                    }
                );
                RefreshMode::Full
            }
            (_, RefreshMode::Full) => RefreshMode::Full,
        };

        let since = state
            .as_ref()
            .map(|state| Watermark {
                telemetry_id: state.last_telemetry_id,
                prediction_id: state.last_prediction_id,
            })
            .unwrap_or(Watermark {
                telemetry_id: 0,
                prediction_id: 0,
            });
        let new_telemetry = load_telemetry(&tx, RowBounds::after(since.telemetry_id))?;
        let new_predictions = load_predictions(&tx, RowBounds::after(since.prediction_id), None)?;

        let (periods_recomputed, rows_written) = match performed {
            RefreshMode::Full => {
                let telemetry = load_telemetry(&tx, RowBounds::all())?;
                let predictions = load_predictions(&tx, RowBounds::all(), None)?;
                let pairs = reconcile_keyed(&predictions, &telemetry, &window);
                let summaries = aggregate(&pairs, granularity, tie_break);

                tx.execute(&format!("DELETE FROM {table}"), [])?;
                insert_summaries(&tx, table, &summaries)?;
                let periods: BTreeSet<DateTime<Utc>> =
                    summaries.iter().map(|s| s.period_start).collect();
                (periods.len(), summaries.len())
            }
            RefreshMode::Incremental => {
                let spans =
                    touched_spans(&new_telemetry, &new_predictions, &window, granularity);
                let mut rows_written = 0;
                let mut periods = 0;
                for &(span_start, span_end) in &spans {
                    periods += periods_in_span(span_start, span_end, granularity);
                    rows_written += recompute_span(
                        &tx,
                        table,
                        granularity,
                        &window,
                        tie_break,
                        span_start,
                        span_end,
                    )?;
                }
                (periods, rows_written)
            }
        };

        let refreshed_at_ms = Utc::now().timestamp_millis();
        write_state(&tx, granularity, watermark, &fingerprint, refreshed_at_ms)?;
        let total_rows = count_rows(&tx, table)?;
        tx.commit()?;

        let report = RefreshReport {
            granularity,
            requested: mode,
            performed,
            new_telemetry: new_telemetry.len() as u64,
            new_predictions: new_predictions.len() as u64,
            periods_recomputed,
            rows_written,
            total_rows,
        };

        info!(
            component = "store",
            event = "summaries.refresh.finish",
            granularity = granularity.as_str(),
            performed = report.performed.as_str(),
            new_telemetry = report.new_telemetry,
            new_predictions = report.new_predictions,
            periods_recomputed = report.periods_recomputed,
            rows_written = report.rows_written,
            total_rows = report.total_rows
        );
        Ok(report)
    }

    /// Most recent periods first, then fuel type.
    pub fn summaries(
        &self,
        granularity: Granularity,
        query: &SummaryQuery,
    ) -> Result<Vec<AggregateSummary>, StoreError> {
        let table = summary_table(granularity);
        let mut stmt = self.conn.prepare(&format!(
            "
            SELECT
                period_start_ms,
                fuel_type,
                total_predictions,
                avg_error_pct,
                worst_error_pct,
                error_std_dev
            FROM {table}
            WHERE (?1 IS NULL OR fuel_type = ?1)
            ORDER BY period_start_ms DESC, fuel_type ASC
            LIMIT ?2
            "
        ))?;

        // SQLite treats a negative LIMIT as unbounded.
        let limit = query
            .limit
            .map(|limit| i64::try_from(limit).unwrap_or(i64::MAX))
            .unwrap_or(-1);
        let fuel_filter = query.fuel_type.as_ref().map(FuelType::as_str);

        let mut rows = stmt.query(params![fuel_filter, limit])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let period_start_ms: i64 = row.get(0)?;
            let fuel_type: String = row.get(1)?;
            let total_predictions: i64 = row.get(2)?;
            out.push(AggregateSummary {
                granularity,
                period_start: from_ms(period_start_ms)?,
                fuel_type: FuelType::parse(&fuel_type),
                total_predictions: total_predictions as u64,
                avg_error_pct: row.get(3)?,
                worst_error_pct: row.get(4)?,
                error_std_dev: row.get(5)?,
            });
        }
        Ok(out)
    }

    pub fn freshness(&self, granularity: Granularity) -> Result<SummaryFreshness, StoreError> {
        let state = read_state(&self.conn, granularity)?;
        let fingerprint = matching_fingerprint(&self.window, self.tie_break);

        let (after_telemetry, after_prediction) = state
            .as_ref()
            .map(|state| (state.last_telemetry_id, state.last_prediction_id))
            .unwrap_or((0, 0));
        let pending_telemetry = count_after(&self.conn, "grid_telemetry", after_telemetry)?;
        let pending_predictions = count_after(&self.conn, "grid_predictions", after_prediction)?;

        let fingerprint_matches = state
            .as_ref()
            .map(|state| state.fingerprint == fingerprint)
            .unwrap_or(false);
        let refreshed_at = match state.as_ref() {
            Some(state) => Some(from_ms(state.refreshed_at_ms)?),
            None => None,
        };

        Ok(SummaryFreshness {
            granularity,
            refreshed_at,
            pending_telemetry,
            pending_predictions,
            fingerprint_matches,
            stale: refreshed_at.is_none()
                || !fingerprint_matches
                || pending_telemetry > 0
                || pending_predictions > 0,
        })
    }
}

fn ensure_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(BASE_SCHEMA)?;
    for granularity in [Granularity::Hour, Granularity::Day, Granularity::Week] {
        let table = summary_table(granularity);
        conn.execute_batch(&format!(
            "
            CREATE TABLE IF NOT EXISTS {table} (
                period_start_ms INTEGER NOT NULL,
                fuel_type TEXT NOT NULL,
                total_predictions INTEGER NOT NULL,
                avg_error_pct REAL,
                worst_error_pct REAL,
                error_std_dev REAL,
                PRIMARY KEY (period_start_ms, fuel_type)
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_period
                ON {table} (period_start_ms DESC, fuel_type);
            "
        ))?;
    }
    Ok(())
}

fn insert_telemetry_row(
    conn: &Connection,
    record: &TelemetryRecord,
) -> Result<IngestOutcome, StoreError> {
    let changed = conn.execute(
        "
        INSERT INTO grid_telemetry (
            ts_ms,
            overall_intensity,
            fuel_wind_perc,
            fuel_solar_perc,
            fuel_gas_perc,
            fuel_nuclear_perc
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(ts_ms) DO NOTHING
        ",
        params![
            record.timestamp.timestamp_millis(),
            record.overall_intensity,
            record.fuel_wind_perc,
            record.fuel_solar_perc,
            record.fuel_gas_perc,
            record.fuel_nuclear_perc,
        ],
    )?;

    if changed == 0 {
        Ok(IngestOutcome::Duplicate)
    } else {
        Ok(IngestOutcome::Inserted {
            id: conn.last_insert_rowid(),
        })
    }
}

fn insert_prediction_row(conn: &Connection, record: &PredictionRecord) -> Result<i64, StoreError> {
    // Non-finite values are kept as NULL and never matched.
    let predicted_value = Some(record.predicted_value).filter(|value| value.is_finite());
    conn.execute(
        "
        INSERT INTO grid_predictions (
            created_at_ms,
            prediction_ts_ms,
            fuel_type,
            predicted_value
        ) VALUES (?1, ?2, ?3, ?4)
        ",
        params![
            record.created_at.timestamp_millis(),
            record.prediction_timestamp.timestamp_millis(),
            record.fuel_type.as_str(),
            predicted_value,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn load_telemetry(
    conn: &Connection,
    bounds: RowBounds,
) -> Result<Vec<Keyed<TelemetryRecord>>, StoreError> {
    let mut stmt = conn.prepare_cached(
        "
        SELECT
            id,
            ts_ms,
            overall_intensity,
            fuel_wind_perc,
            fuel_solar_perc,
            fuel_gas_perc,
            fuel_nuclear_perc
        FROM grid_telemetry
        WHERE ts_ms >= ?1
          AND ts_ms < ?2
          AND id > ?3
        ORDER BY id ASC
        ",
    )?;

    let mut rows = stmt.query(params![bounds.start_ms, bounds.end_ms, bounds.after_id])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let ts_ms: i64 = row.get(1)?;
        out.push(Keyed {
            id: row.get(0)?,
            record: TelemetryRecord {
                timestamp: from_ms(ts_ms)?,
                overall_intensity: row.get(2)?,
                fuel_wind_perc: row.get(3)?,
                fuel_solar_perc: row.get(4)?,
                fuel_gas_perc: row.get(5)?,
                fuel_nuclear_perc: row.get(6)?,
            },
        });
    }
    Ok(out)
}

/// Predictions with a stored value, bounded on `created_at`.
fn load_predictions(
    conn: &Connection,
    bounds: RowBounds,
    fuel_type: Option<&str>,
) -> Result<Vec<Keyed<PredictionRecord>>, StoreError> {
    let mut stmt = conn.prepare_cached(
        "
        SELECT
            id,
            created_at_ms,
            prediction_ts_ms,
            fuel_type,
            predicted_value
        FROM grid_predictions
        WHERE created_at_ms >= ?1
          AND created_at_ms < ?2
          AND id > ?3
          AND (?4 IS NULL OR fuel_type = ?4)
          AND predicted_value IS NOT NULL
        ORDER BY id ASC
        ",
    )?;

    let mut rows = stmt.query(params![
        bounds.start_ms,
        bounds.end_ms,
        bounds.after_id,
        fuel_type
    ])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let created_at_ms: i64 = row.get(1)?;
        let prediction_ts_ms: i64 = row.get(2)?;
        let fuel_type: String = row.get(3)?;
        out.push(Keyed {
            id: row.get(0)?,
            record: PredictionRecord {
                created_at: from_ms(created_at_ms)?,
                prediction_timestamp: from_ms(prediction_ts_ms)?,
                fuel_type: FuelType::parse(&fuel_type),
                predicted_value: row.get(4)?,
            },
        });
    }
    Ok(out)
}

fn insert_summaries(
    conn: &Connection,
    table: &str,
    summaries: &[AggregateSummary],
) -> Result<(), StoreError> {
    let mut stmt = conn.prepare(&format!(
        "
        INSERT INTO {table} (
            period_start_ms,
            fuel_type,
            total_predictions,
            avg_error_pct,
            worst_error_pct,
            error_std_dev
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "
    ))?;

    for summary in summaries {
        stmt.execute(params![
            summary.period_start.timestamp_millis(),
            summary.fuel_type.as_str(),
            i64::try_from(summary.total_predictions).unwrap_or(i64::MAX),
            summary.avg_error_pct,
            summary.worst_error_pct,
            summary.error_std_dev,
        ])?;
    }
    Ok(())
}

/// Rebuilds every period starting in `[span_start, span_end)`.
///
/// A prediction contributes to the span only if its window overlaps it, so
/// predictions created in `[span_start - lookahead + 1h, span_end + lookback)`
/// are loaded, together with every telemetry record any of their windows can
/// reach, so the tie-break sees all candidates.
fn recompute_span(
    conn: &Connection,
    table: &str,
    granularity: Granularity,
    window: &MatchWindow,
    tie_break: TieBreak,
    span_start: DateTime<Utc>,
    span_end: DateTime<Utc>,
) -> Result<usize, StoreError> {
    let lookback = window.lookback_hours;
    let lookahead = window.lookahead_hours;

    let created_from = shift_hours(span_start, 1i64.saturating_sub(lookahead));
    let created_until = shift_hours(span_end, lookback);
    let predictions = load_predictions(
        conn,
        RowBounds::time(created_from, created_until),
        None,
    )?;
    let telemetry = load_telemetry(
        conn,
        RowBounds::time(
            shift_hours(created_from, lookback.saturating_neg()),
            shift_hours(created_until, lookahead),
        ),
    )?;

    let pairs = reconcile_keyed(&predictions, &telemetry, window);
    let summaries: Vec<AggregateSummary> = aggregate(&pairs, granularity, tie_break)
        .into_iter()
        .filter(|summary| summary.period_start >= span_start && summary.period_start < span_end)
        .collect();

    conn.execute(
        &format!("DELETE FROM {table} WHERE period_start_ms >= ?1 AND period_start_ms < ?2"),
        params![span_start.timestamp_millis(), span_end.timestamp_millis()],
    )?;
    insert_summaries(conn, table, &summaries)?;

    debug!(
        component = "store",
        event = "summaries.span.recomputed",
        granularity = granularity.as_str(),
        span_start = %span_start,
        span_end = %span_end,
        predictions = predictions.len(),
        telemetry = telemetry.len(),
        rows = summaries.len()
    );
    Ok(summaries.len())
}

/// Merged `[start, end)` period spans whose summary rows can change because
/// of the given new rows.
///
/// New telemetry at hour `T` pairs with predictions created in
/// `[T - lookahead + 1h, T + lookback]`; under the nearest-hour tie-break
/// those predictions may switch away from any hour of their own window, so
/// every hour those windows cover is touched.
fn touched_spans(
    new_telemetry: &[Keyed<TelemetryRecord>],
    new_predictions: &[Keyed<PredictionRecord>],
    window: &MatchWindow,
    granularity: Granularity,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let lookback = window.lookback_hours;
    let lookahead = window.lookahead_hours;

    // Inclusive hour ranges.
    let mut ranges: Vec<(DateTime<Utc>, DateTime<Utc>)> = Vec::new();
    let reach = lookback.saturating_add(lookahead).saturating_sub(1);
    for entry in new_telemetry {
        let hour = truncate_to_hour(entry.record.timestamp);
        ranges.push((
            shift_hours(hour, reach.saturating_neg()),
            shift_hours(hour, reach),
        ));
    }
    for entry in new_predictions {
        let hour = truncate_to_hour(entry.record.created_at);
        ranges.push((
            shift_hours(hour, lookback.saturating_neg()),
            shift_hours(hour, lookahead.saturating_sub(1)),
        ));
    }

    let step = granularity.period_length();
    let mut periods: Vec<(DateTime<Utc>, DateTime<Utc>)> = ranges
        .into_iter()
        .map(|(lo, hi)| {
            let end = truncate(hi, granularity)
                .checked_add_signed(step)
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            (truncate(lo, granularity), end)
        })
        .collect();
    periods.sort();

    let mut spans: Vec<(DateTime<Utc>, DateTime<Utc>)> = Vec::new();
    for (start, end) in periods {
        match spans.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => spans.push((start, end)),
        }
    }
    spans
}

fn periods_in_span(start: DateTime<Utc>, end: DateTime<Utc>, granularity: Granularity) -> usize {
    let step_ms = granularity.period_length().num_milliseconds();
    let span_ms = (end - start).num_milliseconds();
    usize::try_from(span_ms.div_euclid(step_ms) + i64::from(span_ms.rem_euclid(step_ms) != 0))
        .unwrap_or(0)
}

fn read_state(
    conn: &Connection,
    granularity: Granularity,
) -> Result<Option<SummaryState>, StoreError> {
    let state = conn
        .query_row(
            "
            SELECT last_telemetry_id, last_prediction_id, fingerprint, refreshed_at_ms
            FROM summary_state
            WHERE granularity = ?1
            ",
            params![granularity.as_str()],
            |row| {
                Ok(SummaryState {
                    last_telemetry_id: row.get(0)?,
                    last_prediction_id: row.get(1)?,
                    fingerprint: row.get(2)?,
                    refreshed_at_ms: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(state)
}

fn write_state(
    conn: &Connection,
    granularity: Granularity,
    watermark: Watermark,
    fingerprint: &str,
    refreshed_at_ms: i64,
) -> Result<(), StoreError> {
    conn.execute(
        "
        INSERT INTO summary_state (
            granularity,
            last_telemetry_id,
            last_prediction_id,
            fingerprint,
            refreshed_at_ms
        ) VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(granularity) DO UPDATE SET
            last_telemetry_id = excluded.last_telemetry_id,
            last_prediction_id = excluded.last_prediction_id,
            fingerprint = excluded.fingerprint,
            refreshed_at_ms = excluded.refreshed_at_ms
        ",
        params![
            granularity.as_str(),
            watermark.telemetry_id,
            watermark.prediction_id,
            fingerprint,
            refreshed_at_ms,
        ],
    )?;
    Ok(())
}

fn current_watermark(conn: &Connection) -> Result<Watermark, StoreError> {
    let telemetry_id: i64 = conn.query_row(
        "SELECT COALESCE(MAX(id), 0) FROM grid_telemetry",
        [],
        |row| row.get(0),
    )?;
    let prediction_id: i64 = conn.query_row(
        "SELECT COALESCE(MAX(id), 0) FROM grid_predictions",
        [],
        |row| row.get(0),
    )?;
    Ok(Watermark {
        telemetry_id,
        prediction_id,
    })
}

fn count_rows(conn: &Connection, table: &str) -> Result<u64, StoreError> {
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
        row.get(0)
    })?;
    Ok(count as u64)
}

fn count_after(conn: &Connection, table: &str, after_id: i64) -> Result<u64, StoreError> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {table} WHERE id > ?1"),
        params![after_id],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

fn from_ms(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or(StoreError::InvalidTimestamp(ms))
}

fn bound_ms(instant: Option<DateTime<Utc>>, hours: i64, unbounded: i64) -> i64 {
    instant
        .map(|instant| shift_hours(instant, hours).timestamp_millis())
        .unwrap_or(unbounded)
}
