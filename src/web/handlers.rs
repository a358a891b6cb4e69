//! HTTP request handlers.

use super::AppState;
use crate::config::{RuntimeSettings, SettingsError, SettingsUpdate};
use crate::db::SampleRecord;
use crate::query::{CurrentStatus, DowntimeView, QueryError};

use axum::{
    body::Bytes,
    extract::{rejection::QueryRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

const DEFAULT_DOWNTIME_LIMIT: usize = 50;
const MAX_DOWNTIME_LIMIT: usize = 1000;

fn error_response(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (status, Json(json!({ "error": message.to_string() }))).into_response()
}

fn query_string_error(rejection: QueryRejection) -> Response {
    error_response(StatusCode::BAD_REQUEST, rejection.body_text())
}

impl IntoResponse for QueryError {
    fn into_response(self) -> Response {
        error_response(StatusCode::SERVICE_UNAVAILABLE, self)
    }
}

// ============================================================================
// API: Status
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    #[serde(flatten)]
    pub current: CurrentStatus,
    pub last_sample: Option<SampleRecord>,
}

pub async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
    let current = state.query.current_status();
    // Live status never depends on the store being readable.
    let last_sample = state.query.last_sample().unwrap_or_else(|e| {
        tracing::warn!("Status without last sample: {}", e);
        None
    });

    Json(StatusResponse { current, last_sample })
}

// ============================================================================
// API: Stats
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    /// Trailing window in seconds.
    #[serde(default)]
    pub window: Option<u64>,
}

pub async fn handle_stats(
    State(state): State<AppState>,
    query: Result<Query<StatsQuery>, QueryRejection>,
) -> impl IntoResponse {
    let Query(query) = match query {
        Ok(q) => q,
        Err(rejection) => return query_string_error(rejection),
    };
    let window = match query.window {
        Some(0) => return error_response(StatusCode::BAD_REQUEST, "window must be at least 1 second"),
        Some(secs) => Duration::from_secs(secs),
        None => state.query.default_window(),
    };

    match state.query.stats(window) {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => e.into_response(),
    }
}

// ============================================================================
// API: Downtimes
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct DowntimesQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct DowntimesResponse {
    pub downtimes: Vec<DowntimeView>,
}

pub async fn handle_downtimes(
    State(state): State<AppState>,
    query: Result<Query<DowntimesQuery>, QueryRejection>,
) -> impl IntoResponse {
    let Query(query) = match query {
        Ok(q) => q,
        Err(rejection) => return query_string_error(rejection),
    };
    let limit = query
        .limit
        .unwrap_or(DEFAULT_DOWNTIME_LIMIT)
        .clamp(1, MAX_DOWNTIME_LIMIT);

    match state.query.recent_downtimes(limit) {
        Ok(downtimes) => Json(DowntimesResponse { downtimes }).into_response(),
        Err(e) => e.into_response(),
    }
}

// ============================================================================
// API: Runtime config
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigResponse {
    #[serde(flatten)]
    pub settings: RuntimeSettings,
    pub settings_file: String,
}

fn config_response(state: &AppState, settings: RuntimeSettings) -> Json<ConfigResponse> {
    Json(ConfigResponse {
        settings,
        settings_file: state.settings.path().display().to_string(),
    })
}

pub async fn handle_get_config(State(state): State<AppState>) -> impl IntoResponse {
    config_response(&state, state.settings.current())
}

pub async fn handle_update_config(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let update: SettingsUpdate = match serde_json::from_slice(&body) {
        Ok(u) => u,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("expected a JSON settings object: {}", e)),
    };

    match state.settings.update(update) {
        Ok(settings) => config_response(&state, settings).into_response(),
        Err(SettingsError::Invalid(msg)) => error_response(StatusCode::BAD_REQUEST, msg),
        Err(e) => {
            tracing::error!("Failed to save runtime settings: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}
