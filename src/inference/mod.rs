//! Object detection behind a bounded worker pool.
//!
//! Engines are synchronous and CPU bound. [`InferencePool`] runs them on the
//! blocking thread pool with at most `workers` calls in flight, so the async
//! runtime is never stalled by a model call.

#[cfg(feature = "onnx")]
mod onnx;
mod simulated;

#[cfg(feature = "onnx")]
pub use onnx::OnnxEngine;
pub use simulated::SimulatedEngine;

use crate::config::{InferenceBackend, InferenceConfig};
use crate::detection::{Detection, InferenceResult};
use crate::frame::Frame;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Model not loaded")]
    ModelNotLoaded,
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
    #[error("Inference backend failed: {0}")]
    Backend(String),
    #[error("Inference timed out after {0:?}")]
    Timeout(Duration),
    #[error("Inference worker failed: {0}")]
    WorkerFailed(String),
    #[error("Inference pool closed")]
    PoolClosed,
}

/// A loaded detection model.
pub trait InferenceEngine: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn is_loaded(&self) -> bool;

    /// Runs detection on one frame and returns the detections whose confidence
    /// is at least `threshold` and, when `classes` is given, whose class is listed.
    fn detect(
        &self,
        frame: &Frame,
        threshold: f32,
        classes: Option<&[u32]>,
    ) -> Result<Vec<Detection>, InferenceError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub model_name: String,
    pub is_loaded: bool,
    pub workers: usize,
    pub available_workers: usize,
    pub timeout_ms: u64,
}

#[derive(Clone)]
pub struct InferencePool {
    engine: Arc<dyn InferenceEngine>,
    permits: Arc<Semaphore>,
    workers: usize,
    timeout: Duration,
}

impl InferencePool {
    pub fn new(engine: Arc<dyn InferenceEngine>, workers: usize, timeout: Duration) -> Self {
        let workers = workers.max(1);
        Self {
            engine,
            permits: Arc::new(Semaphore::new(workers)),
            workers,
            timeout,
        }
    }

    pub fn model_info(&self) -> ModelInfo {
        ModelInfo {
            model_name: self.engine.name().to_string(),
            is_loaded: self.engine.is_loaded(),
            workers: self.workers,
            available_workers: self.permits.available_permits(),
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }

    pub async fn detect(
        &self,
        frame: Arc<Frame>,
        threshold: f32,
        classes: Option<Arc<[u32]>>,
    ) -> Result<InferenceResult, InferenceError> {
        if !self.engine.is_loaded() {
            return Err(InferenceError::ModelNotLoaded);
        }

        let engine = Arc::clone(&self.engine);
        let permits = Arc::clone(&self.permits);
        let frame_shape = frame.shape();
        let started = Instant::now();

        // One deadline covers both waiting for a slot and the engine call. The
        // permit travels with the blocking call, so after a timeout the slot
        // stays occupied until the engine actually returns.
        let call = async move {
            let permit = permits
                .acquire_owned()
                .await
                .map_err(|_| InferenceError::PoolClosed)?;
            tokio::task::spawn_blocking(move || {
                let _permit = permit;
                engine.detect(&frame, threshold, classes.as_deref())
            })
            .await
            .map_err(|join_error| InferenceError::WorkerFailed(join_error.to_string()))?
        };

        let detections = match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result?,
            Err(_) => return Err(InferenceError::Timeout(self.timeout)),
        };

        let inference_time = started.elapsed();
        tracing::debug!(
            detections = detections.len(),
            "Inference completed in {:.1}ms",
            inference_time.as_secs_f64() * 1000.0
        );

        Ok(InferenceResult {
            detections,
            inference_time,
            model_name: self.engine.name().to_string(),
            frame_shape,
        })
    }
}

pub fn build_engine(config: &InferenceConfig) -> anyhow::Result<Arc<dyn InferenceEngine>> {
    match config.backend {
        InferenceBackend::Simulated => Ok(Arc::new(SimulatedEngine::new(
            config.simulated_class_id,
            config.simulated_class_name.clone(),
        ))),
        #[cfg(feature = "onnx")]
        InferenceBackend::Onnx => Ok(Arc::new(OnnxEngine::new(config)?)),
        #[cfg(not(feature = "onnx"))]
        InferenceBackend::Onnx => Err(anyhow::anyhow!(
            "onnx backend requested but the binary was built without the `onnx` feature"
        )),
    }
}
