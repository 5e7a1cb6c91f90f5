use super::{parse_classes, ApiError};
use crate::{
    detection::Detection,
    estimator::{SpeciesInfo, WeightEstimate},
    frame::{Frame, FrameShape},
    inference::ModelInfo,
    server::SharedState,
};
use axum::{
    body::Bytes,
    extract::{Query, State},
    response::Json,
};
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;

const UPLOAD_CAMERA_ID: &str = "upload";

#[derive(Debug, Default, Deserialize)]
pub struct EstimateParams {
    confidence_threshold: Option<f32>,
    target_classes: Option<String>,
    conservative: Option<bool>,
}

#[derive(Serialize)]
pub struct EstimatedDetection {
    #[serde(flatten)]
    detection: Detection,
    weight: Option<WeightEstimate>,
    error: Option<String>,
}

#[derive(Serialize)]
pub struct EstimateResponse {
    model_name: String,
    inference_time_ms: f64,
    frame_shape: FrameShape,
    detections: Vec<EstimatedDetection>,
}

#[derive(Debug, Deserialize)]
pub struct Base64Image {
    image_base64: String,
}

#[derive(Debug, Serialize)]
pub struct DetectionHealth {
    status: &'static str,
    model_loaded: bool,
    model_name: String,
}

impl From<ModelInfo> for DetectionHealth {
    fn from(model: ModelInfo) -> Self {
        Self {
            status: if model.is_loaded { "healthy" } else { "unhealthy" },
            model_loaded: model.is_loaded,
            model_name: model.model_name,
        }
    }
}

#[derive(Serialize)]
pub struct ModelInfoResponse {
    model: ModelInfo,
    supported_species: Vec<SpeciesInfo>,
}

/// Runs detection and weight estimation on one uploaded image without
/// persisting or broadcasting anything.
#[instrument(skip(state, image_data))]
pub async fn estimate_weight(
    State(state): State<SharedState>,
    Query(params): Query<EstimateParams>,
    image_data: Bytes,
) -> Result<Json<EstimateResponse>, ApiError> {
    estimate(&state, &image_data, params).await.map(Json)
}

/// Same as [`estimate_weight`] for clients that send the image as base64 JSON.
#[instrument(skip(state, body))]
pub async fn estimate_weight_base64(
    State(state): State<SharedState>,
    Query(params): Query<EstimateParams>,
    Json(body): Json<Base64Image>,
) -> Result<Json<EstimateResponse>, ApiError> {
    let image_data = decode_base64_image(&body.image_base64)?;
    estimate(&state, &image_data, params).await.map(Json)
}

/// Accepts plain base64 or a `data:image/...;base64,` URL.
fn decode_base64_image(raw: &str) -> Result<Vec<u8>, ApiError> {
    let encoded = match raw.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => raw,
    };
    general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| ApiError::BadRequest(format!("invalid base64 image: {}", e)))
}

async fn estimate(
    state: &SharedState,
    image_data: &[u8],
    params: EstimateParams,
) -> Result<EstimateResponse, ApiError> {
    let image = image::load_from_memory(image_data)
        .map_err(|e| ApiError::BadRequest(format!("cannot decode image: {}", e)))?
        .to_rgb8();

    let defaults = &state.pipeline_defaults;
    let threshold = params
        .confidence_threshold
        .unwrap_or(defaults.confidence_threshold);
    if !(0.0..=1.0).contains(&threshold) {
        return Err(ApiError::BadRequest(format!(
            "confidence_threshold must be within [0, 1], got {}",
            threshold
        )));
    }
    let classes = match params.target_classes {
        Some(raw) => parse_classes(&raw)?,
        None => defaults.target_classes.clone(),
    };
    let conservative = params.conservative.unwrap_or(defaults.conservative);

    let frame = Arc::new(Frame::new(image, UPLOAD_CAMERA_ID, 0));
    let result = state
        .inference
        .detect(frame, threshold, classes.map(Arc::from))
        .await?;

    let detections = result
        .detections
        .into_iter()
        .map(|detection| {
            match state
                .estimator
                .estimate(&detection, result.frame_shape, conservative)
            {
                Ok(weight) => EstimatedDetection {
                    detection,
                    weight: Some(weight),
                    error: None,
                },
                Err(e) => EstimatedDetection {
                    detection,
                    weight: None,
                    error: Some(e.to_string()),
                },
            }
        })
        .collect();

    Ok(EstimateResponse {
        model_name: result.model_name,
        inference_time_ms: result.inference_time.as_secs_f64() * 1000.0,
        frame_shape: result.frame_shape,
        detections,
    })
}

pub async fn detection_health(State(state): State<SharedState>) -> Json<DetectionHealth> {
    Json(state.inference.model_info().into())
}

pub async fn model_info(State(state): State<SharedState>) -> Json<ModelInfoResponse> {
    Json(ModelInfoResponse {
        model: state.inference.model_info(),
        supported_species: state.estimator.supported_species(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn png_bytes() -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        RgbImage::from_pixel(8, 6, Rgb([140, 95, 55]))
            .write_to(&mut buffer, ImageFormat::Png)
            .unwrap();
        buffer.into_inner()
    }

    #[test]
    fn test_decode_base64_image() {
        let png = png_bytes();
        let encoded = general_purpose::STANDARD.encode(&png);

        assert_eq!(decode_base64_image(&encoded).unwrap(), png);

        let data_url = format!("data:image/png;base64,{}", encoded);
        let decoded = decode_base64_image(&data_url).unwrap();
        let image = image::load_from_memory(&decoded).unwrap();
        assert_eq!((image.width(), image.height()), (8, 6));
    }

    #[test]
    fn test_decode_base64_rejects_garbage() {
        assert!(matches!(
            decode_base64_image("not base64 at all!"),
            Err(ApiError::BadRequest(_))
        ));
    }

    #[test]
    fn test_detection_health_reflects_model_state() {
        let model = ModelInfo {
            model_name: "simulated-color-segmentation".into(),
            is_loaded: true,
            workers: 2,
            available_workers: 2,
            timeout_ms: 1000,
        };
        let health = DetectionHealth::from(model.clone());
        assert_eq!(health.status, "healthy");
        assert!(health.model_loaded);
        assert_eq!(health.model_name, "simulated-color-segmentation");

        let unloaded = DetectionHealth::from(ModelInfo {
            is_loaded: false,
            ..model
        });
        assert_eq!(unloaded.status, "unhealthy");
    }
}
