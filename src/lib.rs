//! gridrecon core crate.
//!
//! Reconciles grid telemetry against forecaster predictions:
//! - validation gate for raw telemetry
//! - timestamp normalization and hour/day/week truncation
//! - window matching and error metrics
//! - hourly/daily/weekly accuracy summaries, persisted in SQLite
//! - JSON query routes and CSV export

mod accuracy;
mod aggregate;
mod api;
mod config;
mod export;
mod feed;
mod matcher;
mod observability;
mod records;
mod store;
mod timestamp;
mod validate;

pub use accuracy::{compute_error, round_half_up, ErrorMetrics, REPORTED_DECIMALS};
pub use aggregate::{aggregate, matching_fingerprint, select_pairs, AggregateSummary, TieBreak};
pub use api::{
    api_router, matched_query_from_params, ApiError, MatchedParams, MatchedResponse,
    ReconciliationSource, SharedStore, SummaryParams, SummaryResponse, DEFAULT_ROW_LIMIT,
    MAX_ROW_LIMIT,
};
pub use config::{
    reconcile_config_from_env, validate_window, ConfigError, ReconcileConfig, ENV_ADDR,
    ENV_DB_PATH, ENV_LOOKAHEAD_HOURS, ENV_LOOKBACK_HOURS, ENV_MAX_FUTURE_SKEW_HOURS,
    ENV_TIE_BREAK, MAX_CONFIG_HOURS,
};
pub use export::{export_all_summaries, write_summaries_csv, ExportError};
pub use feed::{read_json_lines, JsonLines, MalformedLine};
pub use matcher::{
    actual_value, build_pair, match_prediction, reconcile, reconcile_keyed, Keyed, MatchWindow,
    MatchedPair,
};
pub use observability::{
    init_logging, log_app_bind, log_app_start, log_store_opened, logging_config_from_env,
    LogFormat, LoggingConfig, LoggingInitError, ENV_LOG_FORMAT, ENV_LOG_LEVEL, ENV_LOG_TARGET,
};
pub use records::{FuelType, PredictionRecord, RawTelemetryRecord, TelemetryRecord, KNOWN_FUEL_TYPES};
pub use store::{
    summary_table, IngestOutcome, IngestReport, MatchedQuery, ReconciliationStore, RefreshMode,
    RefreshReport, RejectedRecord, SortOrder, StoreError, SummaryFreshness, SummaryQuery,
};
pub use timestamp::{
    parse_timestamp, shift_hours, truncate, truncate_to_hour, Granularity, ALL_GRANULARITIES,
};
pub use validate::{
    validate_fuel_percentage, validate_intensity, validate_record, validate_timestamp,
    ValidationFailure, ValidationPolicy, MAX_FUEL_PERCENTAGE, MAX_INTENSITY,
};
