//! JSON query routes over the matched view and the summary tables.

use std::sync::{Arc, Mutex, MutexGuard};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::aggregate::AggregateSummary;
use crate::matcher::MatchedPair;
use crate::records::FuelType;
use crate::store::{
    MatchedQuery, ReconciliationStore, SortOrder, StoreError, SummaryFreshness, SummaryQuery,
};
use crate::timestamp::{parse_timestamp, Granularity};

pub const DEFAULT_ROW_LIMIT: usize = 1_000;
pub const MAX_ROW_LIMIT: usize = 10_000;

/// Read side the router serves from.
pub trait ReconciliationSource: Send + Sync + 'static {
    fn matched(&self, query: &MatchedQuery) -> Result<Vec<MatchedPair>, StoreError>;
    fn summaries(
        &self,
        granularity: Granularity,
        query: &SummaryQuery,
    ) -> Result<Vec<AggregateSummary>, StoreError>;
    fn freshness(&self, granularity: Granularity) -> Result<SummaryFreshness, StoreError>;
}

/// A store behind a mutex; SQLite connections are not `Sync`.
#[derive(Clone)]
pub struct SharedStore {
    inner: Arc<Mutex<ReconciliationStore>>,
}

impl SharedStore {
    pub fn new(store: ReconciliationStore) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    /// Every write is a single transaction, so a poisoned lock still guards a
    /// consistent connection.
    pub fn lock(&self) -> MutexGuard<'_, ReconciliationStore> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ReconciliationSource for SharedStore {
    fn matched(&self, query: &MatchedQuery) -> Result<Vec<MatchedPair>, StoreError> {
        self.lock().matched_view(query)
    }

    fn summaries(
        &self,
        granularity: Granularity,
        query: &SummaryQuery,
    ) -> Result<Vec<AggregateSummary>, StoreError> {
        self.lock().summaries(granularity, query)
    }

    fn freshness(&self, granularity: Granularity) -> Result<SummaryFreshness, StoreError> {
        self.lock().freshness(granularity)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MatchedParams {
    pub start: Option<String>,
    pub end: Option<String>,
    pub fuel_type: Option<String>,
    pub order: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SummaryParams {
    pub fuel_type: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchedResponse {
    pub count: usize,
    pub rows: Vec<MatchedPair>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SummaryResponse {
    pub granularity: Granularity,
    pub count: usize,
    pub rows: Vec<AggregateSummary>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("query worker failed: {0}")]
    Worker(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Store(err) => {
                warn!(
                    component = "api",
                    event = "http.store.error",
                    error = %err
                );
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Worker(reason) => {
                warn!(
                    component = "api",
                    event = "http.worker.error",
                    reason = %reason
                );
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

#[derive(Clone)]
struct ApiState {
    source: Arc<dyn ReconciliationSource>,
}

pub fn api_router(source: Arc<dyn ReconciliationSource>) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/matched", get(get_matched))
        .route("/summaries/{granularity}", get(get_summaries))
        .route("/summaries/{granularity}/freshness", get(get_freshness))
        .with_state(ApiState { source })
}

/// Converts raw query parameters, rejecting anything unparseable.
pub fn matched_query_from_params(params: &MatchedParams) -> Result<MatchedQuery, ApiError> {
    Ok(MatchedQuery {
        start: optional_timestamp("start", params.start.as_deref())?,
        end_exclusive: optional_timestamp("end", params.end.as_deref())?,
        fuel_type: optional_fuel(params.fuel_type.as_deref()),
        order: match params.order.as_deref() {
            Some(raw) => raw.parse::<SortOrder>().map_err(ApiError::BadRequest)?,
            None => SortOrder::default(),
        },
        limit: Some(clamp_limit(params.limit)),
    })
}

async fn get_health() -> impl IntoResponse {
    info!(component = "api", event = "http.health.request");
    Json(serde_json::json!({ "status": "ok" }))
}

async fn get_matched(
    State(state): State<ApiState>,
    Query(params): Query<MatchedParams>,
) -> Result<Json<MatchedResponse>, ApiError> {
    let query = matched_query_from_params(&params)?;
    info!(
        component = "api",
        event = "http.matched.request",
        start = ?query.start,
        end = ?query.end_exclusive,
        fuel_type = query.fuel_type.as_ref().map(FuelType::as_str),
        order = ?query.order,
        limit = query.limit
    );

    let rows = run_blocking(&state, move |source| source.matched(&query)).await?;
    Ok(Json(MatchedResponse {
        count: rows.len(),
        rows,
    }))
}

async fn get_summaries(
    State(state): State<ApiState>,
    Path(granularity): Path<String>,
    Query(params): Query<SummaryParams>,
) -> Result<Json<SummaryResponse>, ApiError> {
    let granularity = parse_granularity(&granularity)?;
    let query = SummaryQuery {
        fuel_type: optional_fuel(params.fuel_type.as_deref()),
        limit: Some(clamp_limit(params.limit)),
    };
    info!(
        component = "api",
        event = "http.summaries.request",
        granularity = granularity.as_str(),
        fuel_type = query.fuel_type.as_ref().map(FuelType::as_str),
        limit = query.limit
    );

    let rows = run_blocking(&state, move |source| source.summaries(granularity, &query)).await?;
    Ok(Json(SummaryResponse {
        granularity,
        count: rows.len(),
        rows,
    }))
}

async fn get_freshness(
    State(state): State<ApiState>,
    Path(granularity): Path<String>,
) -> Result<Json<SummaryFreshness>, ApiError> {
    let granularity = parse_granularity(&granularity)?;
    info!(
        component = "api",
        event = "http.freshness.request",
        granularity = granularity.as_str()
    );

    let freshness = run_blocking(&state, move |source| source.freshness(granularity)).await?;
    Ok(Json(freshness))
}

/// SQLite reads are synchronous; keep them off the async executor threads.
async fn run_blocking<T, F>(state: &ApiState, query: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&dyn ReconciliationSource) -> Result<T, StoreError> + Send + 'static,
{
    let source = Arc::clone(&state.source);
    tokio::task::spawn_blocking(move || query(source.as_ref()))
        .await
        .map_err(|err| ApiError::Worker(err.to_string()))?
        .map_err(ApiError::from)
}

fn parse_granularity(raw: &str) -> Result<Granularity, ApiError> {
    raw.parse::<Granularity>().map_err(ApiError::BadRequest)
}

fn optional_timestamp(
    name: &str,
    raw: Option<&str>,
) -> Result<Option<chrono::DateTime<chrono::Utc>>, ApiError> {
    match raw {
        None => Ok(None),
        Some(text) if text.trim().is_empty() => Ok(None),
        Some(text) => parse_timestamp(Some(text))
            .map(Some)
            .ok_or_else(|| ApiError::BadRequest(format!("invalid {name} timestamp: {text}"))),
    }
}

fn optional_fuel(raw: Option<&str>) -> Option<FuelType> {
    raw.map(str::trim)
        .filter(|label| !label.is_empty())
        .map(FuelType::parse)
}

fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_ROW_LIMIT).min(MAX_ROW_LIMIT)
}
