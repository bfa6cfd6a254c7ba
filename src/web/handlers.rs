//! HTTP request handlers.

use super::metrics::{content_type, encode_results};
use super::AppState;
use crate::config::parse_duration;
use crate::probe::{measure, validate_bitrate, MeasurementResult, Protocol, TargetSpec};

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

const LANDING_TEMPLATE: &str = include_str!("templates/landing.html");

/// Header Prometheus sets to the scrape timeout, in seconds.
const SCRAPE_TIMEOUT_HEADER: &str = "x-prometheus-scrape-timeout-seconds";
/// Headroom left for encoding and transport when honouring the scrape timeout.
const SCRAPE_TIMEOUT_OFFSET: f64 = 0.5;

// ============================================================================
// Landing page
// ============================================================================

pub async fn handle_landing(State(state): State<AppState>) -> impl IntoResponse {
    let scheduled = state
        .config
        .targets
        .iter()
        .filter(|t| t.is_scheduled())
        .count();
    let cached = state.cache.len().await;

    let page = LANDING_TEMPLATE
        .replace("{{metrics_path}}", &state.config.metrics_path)
        .replace("{{probe_path}}", &state.config.probe_path)
        .replace("{{target_count}}", &scheduled.to_string())
        .replace("{{result_count}}", &cached.to_string())
        .replace("{{version}}", env!("CARGO_PKG_VERSION"));

    Html(page)
}

// ============================================================================
// Metrics
// ============================================================================

pub async fn handle_metrics(State(state): State<AppState>) -> Response {
    let results = state.cache.gather().await;
    render(results.iter().map(|r| r.as_ref()))
}

fn render<'a>(results: impl IntoIterator<Item = &'a MeasurementResult>) -> Response {
    match encode_results(results) {
        Ok(body) => ([(header::CONTENT_TYPE, content_type())], body).into_response(),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

// ============================================================================
// On-demand probe
// ============================================================================

/// Request validation errors for the probe endpoint.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProbeRequestError {
    #[error("'target' parameter must be specified")]
    MissingTarget,
    #[error("invalid 'port' parameter {0:?}")]
    InvalidPort(String),
    #[error("invalid 'protocol' parameter {0:?}, expected tcp or udp")]
    InvalidProtocol(String),
    #[error("invalid 'reverse_mode' parameter {0:?}")]
    InvalidReverseMode(String),
    #[error("invalid 'bitrate' parameter {0:?}, expected #[KMG][/#]")]
    InvalidBitrate(String),
    #[error("invalid 'period' parameter {0:?}")]
    InvalidPeriod(String),
}

/// Query parameters accepted by the probe endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct ProbeQuery {
    pub target: Option<String>,
    pub port: Option<String>,
    pub reverse_mode: Option<String>,
    pub protocol: Option<String>,
    pub bitrate: Option<String>,
    pub period: Option<String>,
}

impl ProbeQuery {
    /// Build a transient target from the query; unset fields take defaults.
    pub fn into_target_spec(self, timeout: Duration) -> Result<TargetSpec, ProbeRequestError> {
        let host = non_empty(self.target).ok_or(ProbeRequestError::MissingTarget)?;

        let mut spec = TargetSpec::new(host);
        spec.timeout = timeout;

        if let Some(port) = non_empty(self.port) {
            spec.port = match port.parse::<u16>() {
                Ok(p) if p != 0 => p,
                _ => return Err(ProbeRequestError::InvalidPort(port)),
            };
        }

        if let Some(protocol) = non_empty(self.protocol) {
            spec.protocol = protocol
                .parse::<Protocol>()
                .map_err(|_| ProbeRequestError::InvalidProtocol(protocol))?;
        }

        if let Some(reverse) = non_empty(self.reverse_mode) {
            spec.reverse_mode = match reverse.to_ascii_lowercase().as_str() {
                "true" | "1" => true,
                "false" | "0" => false,
                _ => return Err(ProbeRequestError::InvalidReverseMode(reverse)),
            };
        }

        if let Some(bitrate) = non_empty(self.bitrate) {
            if !validate_bitrate(&bitrate) {
                return Err(ProbeRequestError::InvalidBitrate(bitrate));
            }
            spec.bitrate = Some(bitrate);
        }

        if let Some(period) = non_empty(self.period) {
            spec.period = match parse_duration(&period) {
                Ok(d) if !d.is_zero() => d,
                _ => return Err(ProbeRequestError::InvalidPeriod(period)),
            };
        }

        Ok(spec)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Timeout for an on-demand probe: the scrape timeout less some headroom
/// when Prometheus sends a shorter one than configured.
pub fn probe_timeout(headers: &HeaderMap, configured: Duration) -> Duration {
    headers
        .get(SCRAPE_TIMEOUT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs > 0.0)
        .and_then(|secs| Duration::try_from_secs_f64((secs - SCRAPE_TIMEOUT_OFFSET).max(1.0)).ok())
        .filter(|timeout| *timeout < configured)
        .unwrap_or(configured)
}

pub async fn handle_probe(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ProbeQuery>,
) -> Response {
    let timeout = probe_timeout(&headers, state.config.timeout);

    let target = match query.into_target_spec(timeout) {
        Ok(t) => t,
        Err(e) => {
            tracing::debug!("Rejected probe request: {}", e);
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    let result = measure(state.runner.as_ref(), &target).await;
    match &result.error {
        None => tracing::debug!("Probe of {} finished in {:?}", result.target, result.duration),
        Some(e) => tracing::warn!("Probe failed for {}: {}", result.target, e),
    }

    render([&result])
}
