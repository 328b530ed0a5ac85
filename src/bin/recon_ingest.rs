use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use chrono::Utc;
use gridrecon::{
    export_all_summaries, init_logging, log_app_start, log_store_opened, logging_config_from_env,
    read_json_lines, reconcile_config_from_env, JsonLines, PredictionRecord, RawTelemetryRecord,
    ReconciliationStore, RefreshMode, ALL_GRANULARITIES,
};

const ENV_TELEMETRY_FILE: &str = "GRIDRECON_TELEMETRY_FILE";
const ENV_PREDICTIONS_FILE: &str = "GRIDRECON_PREDICTIONS_FILE";
const ENV_REFRESH: &str = "GRIDRECON_REFRESH";
const ENV_EXPORT_DIR: &str = "GRIDRECON_EXPORT_DIR";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("recon_ingest", &logging_cfg);

    let config = reconcile_config_from_env()?;
    let refresh_mode = match env_value(ENV_REFRESH) {
        Some(raw) => raw.parse::<RefreshMode>()?,
        None => RefreshMode::Incremental,
    };

    let mut store = ReconciliationStore::open(&config.db_path)?
        .with_matching(config.window, config.tie_break)
        .with_validation(config.validation);
    log_store_opened("recon_ingest", &config.db_path, &config);

    if let Some(path) = env_value(ENV_TELEMETRY_FILE).map(PathBuf::from) {
        let feed: JsonLines<RawTelemetryRecord> =
            read_json_lines(BufReader::new(File::open(&path)?), "telemetry")?;
        let report = store.ingest_telemetry(&feed.records, Utc::now())?;
        println!(
            "telemetry | file={} accepted={} duplicates={} rejected={} malformed_lines={}",
            path.display(),
            report.accepted,
            report.duplicates,
            report.rejected.len(),
            feed.malformed.len()
        );
    }

    if let Some(path) = env_value(ENV_PREDICTIONS_FILE).map(PathBuf::from) {
        let feed: JsonLines<PredictionRecord> =
            read_json_lines(BufReader::new(File::open(&path)?), "predictions")?;
        let ids = store.insert_predictions(&feed.records)?;
        println!(
            "predictions | file={} inserted={} malformed_lines={}",
            path.display(),
            ids.len(),
            feed.malformed.len()
        );
    }

    for granularity in ALL_GRANULARITIES {
        let report = store.refresh_summaries(granularity, refresh_mode)?;
        println!(
            "refresh | {} requested={} performed={} periods={} rows_written={} total_rows={}",
            granularity,
            report.requested,
            report.performed,
            report.periods_recomputed,
            report.rows_written,
            report.total_rows
        );
    }

    if let Some(dir) = env_value(ENV_EXPORT_DIR).map(PathBuf::from) {
        for path in export_all_summaries(&store, &dir)? {
            println!("export | {}", path.display());
        }
    }

    Ok(())
}

fn env_value(var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}
