use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use chrono::{DateTime, Utc};
use gridrecon::{
    api_router, AggregateSummary, FuelType, Granularity, MatchedPair, MatchedQuery,
    PredictionRecord, RawTelemetryRecord, ReconciliationSource, ReconciliationStore, RefreshMode,
    SharedStore, StoreError, SummaryFreshness, SummaryQuery,
};
use serde_json::{json, Value};
use tower::util::ServiceExt;

fn ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .expect("valid test timestamp")
        .with_timezone(&Utc)
}

fn telemetry(timestamp: &str, wind: i64, gas: i64) -> RawTelemetryRecord {
    RawTelemetryRecord {
        timestamp: json!(timestamp),
        overall_intensity: json!(150),
        fuel_wind_perc: json!(wind),
        fuel_solar_perc: json!(5),
        fuel_gas_perc: json!(gas),
        fuel_nuclear_perc: json!(15),
    }
}

fn prediction(created_at: &str, fuel_type: FuelType, value: f64) -> PredictionRecord {
    PredictionRecord {
        created_at: ts(created_at),
        prediction_timestamp: ts(created_at),
        fuel_type,
        predicted_value: value,
    }
}

fn seeded_app() -> Router {
    let mut store = ReconciliationStore::open_in_memory().expect("in-memory store");
    store
        .ingest_telemetry(
            &[
                telemetry("2025-01-01T10:00Z", 40, 30),
                telemetry("2025-01-02T09:00Z", 20, 50),
            ],
            ts("2025-01-05T00:00:00Z"),
        )
        .expect("ingest telemetry");
    store
        .insert_predictions(&[
            prediction("2025-01-01T10:30:00Z", FuelType::Wind, 45.0),
            prediction("2025-01-02T09:10:00Z", FuelType::Gas, 40.0),
        ])
        .expect("insert predictions");
    store
        .refresh_summaries(Granularity::Day, RefreshMode::Full)
        .expect("refresh");

    api_router(Arc::new(SharedStore::new(store)))
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(
            Request::builder()
                .uri(uri)
                .body(Body::empty())
                .expect("request should build"),
        )
        .await
        .expect("request should be served");

    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body should be readable");
    let value = serde_json::from_slice(&body).expect("body should be JSON");
    (status, value)
}

#[tokio::test]
async fn health_reports_ok() {
    let (status, body) = get_json(seeded_app(), "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn matched_route_filters_by_fuel_and_window() {
    let (status, body) = get_json(
        seeded_app(),
        "/matched?start=2025-01-01T00:00Z&end=2025-01-02T00:00Z&fuel_type=Wind",
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    let row = &body["rows"][0];
    assert_eq!(row["fuel_type"], "Wind");
    assert_eq!(row["actual_value"], 40.0);
    assert_eq!(row["prediction_error"], 5.0);
    assert_eq!(row["error_percentage"], 12.5);
    assert_eq!(row["actual_timestamp"], "2025-01-01T10:00:00Z");
}

#[tokio::test]
async fn matched_route_orders_descending_on_request() {
    let (status, body) = get_json(seeded_app(), "/matched?order=desc").await;

    assert_eq!(status, StatusCode::OK);
    // The Gas prediction also reaches back to the Jan 1 telemetry.
    assert_eq!(body["count"], 3);
    assert_eq!(body["rows"][0]["actual_timestamp"], "2025-01-02T09:00:00Z");
}

#[tokio::test]
async fn summaries_route_serves_most_recent_day_first() {
    let (status, body) = get_json(seeded_app(), "/summaries/daily").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["granularity"], "day");
    assert_eq!(body["count"], 2);
    assert_eq!(body["rows"][0]["fuel_type"], "Gas");
    assert_eq!(body["rows"][0]["period_start"], "2025-01-02T00:00:00Z");
    assert_eq!(body["rows"][0]["avg_error_pct"], 20.0);
    assert_eq!(body["rows"][1]["fuel_type"], "Wind");
    assert_eq!(body["rows"][1]["error_std_dev"], Value::Null);

    let (_, filtered) = get_json(seeded_app(), "/summaries/day?fuel_type=Wind&limit=5").await;
    assert_eq!(filtered["count"], 1);
}

#[tokio::test]
async fn freshness_route_reports_unrefreshed_granularities() {
    let (status, body) = get_json(seeded_app(), "/summaries/weekly/freshness").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stale"], true);
    assert_eq!(body["refreshed_at"], Value::Null);
    assert_eq!(body["pending_telemetry"], 2);

    let (_, daily) = get_json(seeded_app(), "/summaries/daily/freshness").await;
    assert_eq!(daily["stale"], false);
    assert_eq!(daily["fingerprint_matches"], true);
}

#[tokio::test]
async fn bad_parameters_return_json_errors() {
    let (status, body) = get_json(seeded_app(), "/summaries/monthly").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]
        .as_str()
        .expect("error message")
        .contains("monthly"));

    let (status, _) = get_json(seeded_app(), "/matched?start=not-a-time").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[derive(Default)]
struct ThreadRecordingSource {
    seen: Mutex<Vec<ThreadId>>,
}

impl ThreadRecordingSource {
    fn record(&self) {
        self.seen
            .lock()
            .expect("thread log lock should not be poisoned")
            .push(thread::current().id());
    }
}

impl ReconciliationSource for ThreadRecordingSource {
    fn matched(&self, _query: &MatchedQuery) -> Result<Vec<MatchedPair>, StoreError> {
        self.record();
        Ok(Vec::new())
    }

    fn summaries(
        &self,
        _granularity: Granularity,
        _query: &SummaryQuery,
    ) -> Result<Vec<AggregateSummary>, StoreError> {
        self.record();
        Ok(Vec::new())
    }

    fn freshness(&self, _granularity: Granularity) -> Result<SummaryFreshness, StoreError> {
        panic!("freshness lookup failed");
    }
}

#[tokio::test]
async fn store_reads_run_off_the_executor_thread() {
    let source = Arc::new(ThreadRecordingSource::default());
    let app = api_router(source.clone());

    let (status, body) = get_json(app.clone(), "/matched").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 0);
    let (status, _) = get_json(app, "/summaries/hourly").await;
    assert_eq!(status, StatusCode::OK);

    let executor = thread::current().id();
    let seen = source
        .seen
        .lock()
        .expect("thread log lock should not be poisoned")
        .clone();
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().all(|id| *id != executor));
}

#[tokio::test]
async fn failed_query_worker_returns_json_error() {
    let app = api_router(Arc::new(ThreadRecordingSource::default()));

    let (status, body) = get_json(app, "/summaries/daily/freshness").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"]
        .as_str()
        .expect("error message")
        .contains("query worker failed"));
}
