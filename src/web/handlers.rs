//! HTTP request handlers.

use super::AppState;
use crate::history::{parse_time, HistoryError, HistoryQuery};
use crate::probe::ProbeKind;
use crate::reliability::DEFAULT_WINDOWS;
use crate::scheduler::OUTCOME_RETENTION_DAYS;
use crate::state::{Category, StateKey};

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::{Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::json;

const STATE_CACHE: &str = "public, max-age=60, must-revalidate";
const HISTORY_CACHE_OPEN: &str = "public, max-age=600, must-revalidate";
const HISTORY_CACHE_CLOSED: &str = "public, max-age=31536000, immutable";

/// Lookback used when a history query has no `from`.
const DEFAULT_HISTORY_FROM: &str = "-6h";

/// Split a comma-separated `include` parameter.
fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn bad_request(message: impl ToString) -> Response {
    (StatusCode::BAD_REQUEST, message.to_string()).into_response()
}

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct StateParams {
    pub include: Option<String>,
}

pub async fn handle_state(State(app): State<AppState>, Query(params): Query<StateParams>) -> Response {
    let include = split_list(params.include.as_deref());
    ([(header::CACHE_CONTROL, STATE_CACHE)], Json(app.state.view(&include))).into_response()
}

// ============================================================================
// History
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub from: Option<String>,
    pub to: Option<String>,
    /// Minimum seconds between returned snapshots
    pub interval: Option<i64>,
    pub include: Option<String>,
    pub gateway: Option<String>,
    pub router: Option<String>,
    pub relay: Option<String>,
    pub name_service: Option<String>,
    pub node: Option<String>,
    pub page: Option<String>,
}

impl HistoryParams {
    fn filters(&self) -> Vec<(Category, String)> {
        [
            (Category::Gateway, &self.gateway),
            (Category::ContentRouter, &self.router),
            (Category::Relay, &self.relay),
            (Category::NameService, &self.name_service),
            (Category::ApplicationNode, &self.node),
            (Category::StaticPage, &self.page),
        ]
        .into_iter()
        .filter_map(|(category, target)| target.clone().map(|t| (category, t)))
        .collect()
    }
}

pub async fn handle_history(State(app): State<AppState>, Query(params): Query<HistoryParams>) -> Response {
    let now = Utc::now();
    let from = match parse_time(params.from.as_deref().unwrap_or(DEFAULT_HISTORY_FROM), now) {
        Ok(t) => t,
        Err(e) => return bad_request(e),
    };
    let to = match params.to.as_deref().map(|t| parse_time(t, now)).transpose() {
        Ok(t) => t.unwrap_or(now),
        Err(e) => return bad_request(e),
    };

    let mut query = HistoryQuery::new(from, to);
    if let Some(seconds) = params.interval {
        match ChronoDuration::try_seconds(seconds) {
            Some(interval) if seconds > 0 => query.interval = Some(interval),
            _ => return bad_request("interval must be a positive number of seconds"),
        }
    }
    query.filters = params.filters();
    query.include = split_list(params.include.as_deref());

    match app.history.query(&query) {
        Ok(points) => {
            // a closed range never gains new snapshots
            let cache = if to < now { HISTORY_CACHE_CLOSED } else { HISTORY_CACHE_OPEN };
            ([(header::CACHE_CONTROL, cache)], Json(points)).into_response()
        }
        Err(e @ (HistoryError::TooManyResults { .. } | HistoryError::BadRange | HistoryError::BadTime(_))) => {
            bad_request(e)
        }
        Err(HistoryError::Db(e)) => {
            tracing::error!("History query failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

// ============================================================================
// Reliability
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ReliabilityParams {
    pub kind: String,
    pub target: String,
    pub category: Option<String>,
    /// Node address for per-node kinds, e.g. snapshot fetches
    pub node: Option<String>,
    pub hours: Option<u32>,
}

pub async fn handle_reliability(
    State(app): State<AppState>,
    Query(params): Query<ReliabilityParams>,
) -> Response {
    let kind: ProbeKind = match params.kind.parse() {
        Ok(kind) => kind,
        Err(e) => return bad_request(e),
    };
    let spec = kind.spec();
    if !spec.logged {
        return bad_request(format!("probe kind '{}' keeps no run history", spec.name));
    }
    if let Some(category) = &params.category {
        match category.parse::<Category>() {
            Ok(c) if c == spec.category => {}
            Ok(c) => return bad_request(format!("probe kind '{}' does not apply to {}", spec.name, c)),
            Err(e) => return bad_request(e),
        }
    }

    let mut key = StateKey::new(spec.category, params.target.clone());
    match (spec.nested, params.node) {
        (Some(field), Some(node)) => key = key.nested(field, node),
        (Some(_), None) => return bad_request(format!("probe kind '{}' requires a node", spec.name)),
        (None, Some(_)) => return bad_request(format!("probe kind '{}' takes no node", spec.name)),
        (None, None) => {}
    }

    let max_hours = (OUTCOME_RETENTION_DAYS * 24) as u32;
    let hours: Vec<u32> = match params.hours {
        Some(h) if h == 0 || h > max_hours => {
            return bad_request(format!("hours must be between 1 and {}", max_hours))
        }
        Some(h) => vec![h],
        None => DEFAULT_WINDOWS.to_vec(),
    };

    let target = key.to_string();
    match app.reliability.windows(spec.name, &target, &hours) {
        Ok(windows) => Json(json!({
            "kind": spec.name,
            "target": target,
            "windows": windows,
        }))
        .into_response(),
        Err(e) => {
            tracing::error!("Reliability query failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

// ============================================================================
// Metrics
// ============================================================================

pub async fn handle_prometheus(State(app): State<AppState>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        app.metrics.render(),
    )
        .into_response()
}
