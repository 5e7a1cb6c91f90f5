//! Weight estimation from a single bounding box.
//!
//! Each supported class carries a calibration record mapping normalized box
//! geometry to an expected weight. The model is purely geometric: box area is
//! scaled to a volume with an `area^1.5` law, pulled toward the species
//! average in proportion to detector uncertainty, and clamped to the species'
//! admissible range. Without depth data the reported confidence never exceeds
//! [`MAX_CONFIDENCE`].

use crate::detection::Detection;
use crate::frame::FrameShape;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

pub const MIN_CONFIDENCE: f64 = 0.3;
pub const MAX_CONFIDENCE: f64 = 0.95;

/// Correction applied in conservative mode for the overestimation bias of 2-D boxes.
pub const CONSERVATIVE_FACTOR: f64 = 0.92;

/// Width/height of an animal seen from the side.
const IDEAL_ASPECT_RATIO: f64 = 1.4;

const DETECTOR_WEIGHT: f64 = 0.3;
const AREA_WEIGHT: f64 = 0.4;
const ASPECT_WEIGHT: f64 = 0.3;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EstimatorError {
    #[error("Weight estimation not supported for class_id {class_id} ({class_name})")]
    UnsupportedSpecies { class_id: u32, class_name: String },
    #[error("Invalid calibration for class_id {class_id}: {reason}")]
    InvalidCalibration { class_id: u32, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Calibration {
    pub name: String,
    pub base_weight: f64,
    pub scale_factor: f64,
    pub min_weight: f64,
    pub max_weight: f64,
    pub typical_box_area: f64,
}

impl Calibration {
    fn validate(&self) -> Result<(), String> {
        let positive = [
            ("base_weight", self.base_weight),
            ("min_weight", self.min_weight),
            ("max_weight", self.max_weight),
            ("typical_box_area", self.typical_box_area),
        ];
        for (field, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(format!("{} must be finite and positive, got {}", field, value));
            }
        }
        if self.min_weight > self.max_weight {
            return Err(format!(
                "min_weight {} exceeds max_weight {}",
                self.min_weight, self.max_weight
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WeightEstimate {
    pub weight_kg: f64,
    pub estimation_confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpeciesInfo {
    pub class_id: u32,
    pub name: String,
    pub base_weight: f64,
    pub weight_range: (f64, f64),
}

/// Stateless estimator; share it behind an `Arc` and call it from any task.
#[derive(Debug, Clone)]
pub struct WeightEstimator {
    calibrations: BTreeMap<u32, Calibration>,
}

impl Default for WeightEstimator {
    fn default() -> Self {
        Self {
            calibrations: default_calibrations(),
        }
    }
}

pub fn default_calibrations() -> BTreeMap<u32, Calibration> {
    BTreeMap::from([
        (
            19,
            Calibration {
                name: "cattle".into(),
                base_weight: 500.0,
                scale_factor: 1200.0,
                min_weight: 200.0,
                max_weight: 900.0,
                typical_box_area: 0.15,
            },
        ),
        (
            20,
            Calibration {
                name: "sheep".into(),
                base_weight: 70.0,
                scale_factor: 180.0,
                min_weight: 30.0,
                max_weight: 120.0,
                typical_box_area: 0.08,
            },
        ),
    ])
}

impl WeightEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_calibrations(
        calibrations: BTreeMap<u32, Calibration>,
    ) -> Result<Self, EstimatorError> {
        for (class_id, calibration) in &calibrations {
            calibration
                .validate()
                .map_err(|reason| EstimatorError::InvalidCalibration {
                    class_id: *class_id,
                    reason,
                })?;
        }
        Ok(Self { calibrations })
    }

    pub fn calibration(&self, class_id: u32) -> Option<&Calibration> {
        self.calibrations.get(&class_id)
    }

    pub fn supported_species(&self) -> Vec<SpeciesInfo> {
        self.calibrations
            .iter()
            .map(|(class_id, calibration)| SpeciesInfo {
                class_id: *class_id,
                name: calibration.name.clone(),
                base_weight: calibration.base_weight,
                weight_range: (calibration.min_weight, calibration.max_weight),
            })
            .collect()
    }

    /// Estimates weight and estimation confidence for one detection.
    ///
    /// `conservative` applies [`CONSERVATIVE_FACTOR`] before clamping.
    pub fn estimate(
        &self,
        detection: &Detection,
        frame_shape: FrameShape,
        conservative: bool,
    ) -> Result<WeightEstimate, EstimatorError> {
        let calibration = self.calibrations.get(&detection.class_id).ok_or_else(|| {
            EstimatorError::UnsupportedSpecies {
                class_id: detection.class_id,
                class_name: detection.class_name.clone(),
            }
        })?;

        let bbox = &detection.bounding_box;
        let width = f64::from(bbox.width);
        let height = f64::from(bbox.height);
        let box_area = f64::from(bbox.area());
        let detector_confidence = f64::from(detection.confidence).clamp(0.0, 1.0);

        let mut weight_kg = blended_weight(box_area, calibration, detector_confidence);
        if conservative {
            weight_kg *= CONSERVATIVE_FACTOR;
        }
        let weight_kg = weight_kg.clamp(calibration.min_weight, calibration.max_weight);

        let estimation_confidence = estimation_confidence(
            width,
            height,
            detector_confidence,
            calibration.typical_box_area,
        );

        tracing::debug!(
            class_id = detection.class_id,
            frame_width = frame_shape.width,
            frame_height = frame_shape.height,
            box_area,
            "Weight estimated: {:.1}kg (confidence: {:.2})",
            weight_kg,
            estimation_confidence
        );

        Ok(WeightEstimate {
            weight_kg,
            estimation_confidence,
        })
    }
}

fn blended_weight(box_area: f64, calibration: &Calibration, detector_confidence: f64) -> f64 {
    let area_ratio = box_area / calibration.typical_box_area;
    let raw = calibration.base_weight * area_ratio.powf(1.5);

    // Low-confidence boxes drift toward the species average.
    let confidence_factor = 0.7 + 0.3 * detector_confidence;
    raw * confidence_factor + calibration.base_weight * (1.0 - confidence_factor)
}

fn closeness(actual: f64, expected: f64) -> f64 {
    (1.0 - (actual - expected).abs() / expected).max(0.0)
}

fn estimation_confidence(width: f64, height: f64, detector_confidence: f64, typical_area: f64) -> f64 {
    let aspect_ratio = if height > 0.0 { width / height } else { 0.0 };

    let total = detector_confidence * DETECTOR_WEIGHT
        + closeness(width * height, typical_area) * AREA_WEIGHT
        + closeness(aspect_ratio, IDEAL_ASPECT_RATIO) * ASPECT_WEIGHT;

    total.clamp(MIN_CONFIDENCE, MAX_CONFIDENCE)
}
