use crate::detection::BoundingBox;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::RwLock;

/// Timestamps further ahead than this are treated as clock errors.
const MAX_CLOCK_SKEW_SECS: i64 = 5;

const LOW_CONFIDENCE_WARNING: f64 = 0.5;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Invalid measurement: {0}")]
    Validation(String),
    #[error("Measurement store failed: {0}")]
    Backend(String),
    #[error("Measurement store timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Detector output kept alongside a measurement for later re-analysis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawDetection {
    pub bounding_box: BoundingBox,
    pub class_id: u32,
    pub class_name: String,
    pub model_confidence: f32,
    pub frame_sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewMeasurement {
    pub animal_id: u64,
    pub timestamp: DateTime<Utc>,
    pub weight_kg: f64,
    pub confidence_score: f64,
    pub camera_id: String,
    pub raw: RawDetection,
}

impl NewMeasurement {
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), PersistenceError> {
        if !self.weight_kg.is_finite() || self.weight_kg <= 0.0 {
            return Err(PersistenceError::Validation(format!(
                "weight_kg must be positive, got {}",
                self.weight_kg
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence_score) {
            return Err(PersistenceError::Validation(format!(
                "confidence_score must be within [0, 1], got {}",
                self.confidence_score
            )));
        }
        if self.timestamp > now + Duration::seconds(MAX_CLOCK_SKEW_SECS) {
            return Err(PersistenceError::Validation(format!(
                "timestamp {} is in the future",
                self.timestamp
            )));
        }
        if self.camera_id.is_empty() {
            return Err(PersistenceError::Validation("camera_id is empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    pub id: u64,
    pub animal_id: u64,
    pub timestamp: DateTime<Utc>,
    pub weight_kg: f64,
    pub confidence_score: f64,
    pub camera_id: String,
    pub raw: RawDetection,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait MeasurementStore: Send + Sync {
    /// Persists one measurement as a plain insert.
    async fn save(&self, measurement: NewMeasurement) -> Result<Measurement, PersistenceError>;
}

#[derive(Default)]
pub struct InMemoryMeasurementStore {
    measurements: RwLock<Vec<Measurement>>,
    next_id: AtomicU64,
}

impl InMemoryMeasurementStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.measurements.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.measurements.read().await.is_empty()
    }

    pub async fn for_animal(&self, animal_id: u64) -> Vec<Measurement> {
        self.measurements
            .read()
            .await
            .iter()
            .filter(|m| m.animal_id == animal_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MeasurementStore for InMemoryMeasurementStore {
    async fn save(&self, new: NewMeasurement) -> Result<Measurement, PersistenceError> {
        let now = Utc::now();
        new.validate(now)?;

        if new.confidence_score < LOW_CONFIDENCE_WARNING {
            tracing::warn!(
                animal_id = new.animal_id,
                "Low confidence measurement: {:.2}",
                new.confidence_score
            );
        }

        let measurement = Measurement {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            animal_id: new.animal_id,
            timestamp: new.timestamp,
            weight_kg: new.weight_kg,
            confidence_score: new.confidence_score,
            camera_id: new.camera_id,
            raw: new.raw,
            created_at: now,
        };

        self.measurements.write().await.push(measurement.clone());
        tracing::debug!(
            measurement_id = measurement.id,
            animal_id = measurement.animal_id,
            "Measurement saved: {:.1}kg",
            measurement.weight_kg
        );
        Ok(measurement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_measurement(weight_kg: f64, confidence_score: f64) -> NewMeasurement {
        NewMeasurement {
            animal_id: 1,
            timestamp: Utc::now(),
            weight_kg,
            confidence_score,
            camera_id: "CAM-001".into(),
            raw: RawDetection {
                bounding_box: BoundingBox {
                    center_x: 0.5,
                    center_y: 0.5,
                    width: 0.4,
                    height: 0.4,
                },
                class_id: 19,
                class_name: "cow".into(),
                model_confidence: 0.9,
                frame_sequence: 5,
            },
        }
    }

    #[tokio::test]
    async fn test_save_assigns_increasing_ids() {
        let store = InMemoryMeasurementStore::new();
        let first = store.save(new_measurement(549.3, 0.86)).await.unwrap();
        let second = store.save(new_measurement(505.4, 0.3)).await.unwrap();

        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(store.len().await, 2);
        assert_eq!(store.for_animal(1).await.len(), 2);
        assert!(store.for_animal(2).await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_measurements_rejected() {
        let store = InMemoryMeasurementStore::new();
        for m in [
            new_measurement(0.0, 0.8),
            new_measurement(f64::NAN, 0.8),
            new_measurement(500.0, 1.2),
            new_measurement(500.0, -0.1),
        ] {
            assert!(matches!(
                store.save(m).await,
                Err(PersistenceError::Validation(_))
            ));
        }
        assert!(store.is_empty().await);
    }

    #[test]
    fn test_future_timestamp_rejected() {
        let now = Utc::now();
        let mut m = new_measurement(500.0, 0.8);
        m.timestamp = now + Duration::seconds(4);
        assert!(m.validate(now).is_ok());
        m.timestamp = now + Duration::seconds(30);
        assert!(m.validate(now).is_err());
    }
}
