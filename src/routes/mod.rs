mod detection;
mod health;
mod live;
mod metrics;
mod pipeline;

use crate::{inference::InferenceError, pipeline::PipelineError, server::SharedState};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::json;
use thiserror::Error;

pub fn api_routes() -> Router<SharedState> {
    let v1 = Router::new()
        .route("/pipeline/start", post(pipeline::start_pipeline))
        .route("/pipeline/stop", post(pipeline::stop_pipeline))
        .route("/pipeline/status", get(pipeline::pipeline_status))
        .route("/live/ws", get(live::live_feed))
        .route("/live/stats", get(live::live_stats))
        .route("/detection/estimate", post(detection::estimate_weight))
        .route(
            "/detection/estimate-base64",
            post(detection::estimate_weight_base64),
        )
        .route("/detection/health", get(detection::detection_health))
        .route("/detection/model-info", get(detection::model_info));

    Router::new()
        .route("/health", get(health::healthcheck))
        .route("/metrics", get(metrics::metrics_handler))
        .nest("/api/v1", v1)
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Pipeline(PipelineError::Source(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Pipeline(_) => StatusCode::BAD_REQUEST,
            ApiError::Inference(InferenceError::InvalidFrame(_)) => StatusCode::BAD_REQUEST,
            ApiError::Inference(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Parses a comma-separated class list such as `19,20`.
fn parse_classes(raw: &str) -> Result<Option<Vec<u32>>, ApiError> {
    let classes = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u32>()
                .map_err(|_| ApiError::BadRequest(format!("invalid class id `{}`", s)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok((!classes.is_empty()).then_some(classes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineState;

    #[test]
    fn test_parse_classes() {
        assert_eq!(parse_classes("19,20").unwrap(), Some(vec![19, 20]));
        assert_eq!(parse_classes(" 19 , ").unwrap(), Some(vec![19]));
        assert_eq!(parse_classes("").unwrap(), None);
        assert!(parse_classes("cow").is_err());
    }

    #[test]
    fn test_error_status_codes() {
        let already = ApiError::from(PipelineError::AlreadyRunning(PipelineState::Running));
        assert_eq!(already.status(), StatusCode::BAD_REQUEST);

        let not_running = ApiError::from(PipelineError::NotRunning(PipelineState::Stopped));
        assert_eq!(not_running.status(), StatusCode::BAD_REQUEST);

        let timeout = ApiError::from(InferenceError::Timeout(std::time::Duration::from_secs(1)));
        assert_eq!(timeout.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let response = ApiError::BadRequest("nope".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
