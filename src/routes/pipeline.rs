use super::{parse_classes, ApiError};
use crate::{config::PipelineConfig, server::SharedState};
use axum::{
    extract::{Query, State},
    response::Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::instrument;

#[derive(Debug, Default, Deserialize)]
pub struct StartParams {
    skip_frames: Option<u32>,
    confidence_threshold: Option<f32>,
    target_classes: Option<String>,
    conservative: Option<bool>,
}

impl StartParams {
    /// Overlays the query parameters on the configured defaults.
    fn apply(self, defaults: &PipelineConfig) -> Result<PipelineConfig, ApiError> {
        let mut config = defaults.clone();
        if let Some(skip_frames) = self.skip_frames {
            config.frame_skip = skip_frames;
        }
        if let Some(threshold) = self.confidence_threshold {
            config.confidence_threshold = threshold;
        }
        if let Some(raw) = self.target_classes {
            config.target_classes = parse_classes(&raw)?;
        }
        if let Some(conservative) = self.conservative {
            config.conservative = conservative;
        }
        config.validate().map_err(ApiError::BadRequest)?;
        Ok(config)
    }
}

#[instrument(skip(state))]
pub async fn start_pipeline(
    State(state): State<SharedState>,
    Query(params): Query<StartParams>,
) -> Result<Json<Value>, ApiError> {
    let config = params.apply(&state.pipeline_defaults)?;
    state.pipeline.start(config.clone()).await?;

    Ok(Json(json!({
        "status": "started",
        "config": config,
    })))
}

#[instrument(skip(state))]
pub async fn stop_pipeline(State(state): State<SharedState>) -> Result<Json<Value>, ApiError> {
    let stats = state.pipeline.stop().await?;

    Ok(Json(json!({
        "status": "stopped",
        "stats": stats,
    })))
}

pub async fn pipeline_status(State(state): State<SharedState>) -> Json<Value> {
    let status = state.pipeline.status();
    Json(json!({
        "state": status.state,
        "stats": status.stats,
        "config": status.config,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_override_defaults() {
        let params = StartParams {
            skip_frames: Some(2),
            confidence_threshold: None,
            target_classes: Some("19,20".into()),
            conservative: Some(false),
        };
        let config = params.apply(&PipelineConfig::default()).unwrap();

        assert_eq!(config.frame_skip, 2);
        assert_eq!(config.confidence_threshold, 0.5);
        assert_eq!(config.target_classes, Some(vec![19, 20]));
        assert!(!config.conservative);
    }

    #[test]
    fn test_empty_params_keep_defaults() {
        let defaults = PipelineConfig::default();
        assert_eq!(StartParams::default().apply(&defaults).unwrap(), defaults);
    }

    #[test]
    fn test_invalid_params_rejected() {
        let zero_skip = StartParams {
            skip_frames: Some(0),
            ..StartParams::default()
        };
        assert!(matches!(
            zero_skip.apply(&PipelineConfig::default()),
            Err(ApiError::BadRequest(_))
        ));

        let bad_threshold = StartParams {
            confidence_threshold: Some(2.0),
            ..StartParams::default()
        };
        assert!(bad_threshold.apply(&PipelineConfig::default()).is_err());
    }
}
