//! Orchestration loop turning frames into persisted, broadcast measurements.
//!
//! Frames are pulled and processed strictly in order. Detections of one frame
//! run as concurrent units of work that are all awaited before the next frame
//! is pulled. A failure in a frame or in a single detection is logged, counted
//! in [`PipelineStats::errors`] and skipped; it never ends the loop.

use crate::broadcast::{BroadcastManager, LiveMessage, LiveWeightUpdate};
use crate::camera::{CameraError, FrameSource};
use crate::config::PipelineConfig;
use crate::detection::Detection;
use crate::estimator::{EstimatorError, WeightEstimator};
use crate::frame::{Frame, FrameShape};
use crate::inference::InferencePool;
use crate::registry::{AnimalHint, Registry, RegistryError};
use crate::store::{MeasurementStore, NewMeasurement, PersistenceError, RawDetection};
use crate::telemetry::Metrics;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, timeout};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Stopped => "stopped",
            PipelineState::Starting => "starting",
            PipelineState::Running => "running",
            PipelineState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Pipeline is already running (state: {0})")]
    AlreadyRunning(PipelineState),
    #[error("Pipeline is not running (state: {0})")]
    NotRunning(PipelineState),
    #[error("Invalid pipeline configuration: {0}")]
    InvalidConfig(String),
    #[error("Frame source failed to initialize: {0}")]
    Source(#[from] CameraError),
}

/// Failure of one detection's unit of work.
#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("weight estimation failed: {0}")]
    Estimation(#[from] EstimatorError),
    #[error("animal resolution failed: {0}")]
    Registry(#[from] RegistryError),
    #[error("persistence failed: {0}")]
    Persistence(#[from] PersistenceError),
}

impl DetectionError {
    pub fn stage(&self) -> &'static str {
        match self {
            DetectionError::Estimation(_) => "estimation",
            DetectionError::Registry(_) => "registry",
            DetectionError::Persistence(_) => "persistence",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineStats {
    pub total_frames: u64,
    pub processed_frames: u64,
    pub detections: u64,
    pub measurements_created: u64,
    pub errors: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub runtime_seconds: f64,
    pub fps: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub state: PipelineState,
    pub stats: PipelineStats,
    pub config: Option<PipelineConfig>,
}

#[derive(Default)]
struct Timing {
    started_at: Option<DateTime<Utc>>,
    started: Option<Instant>,
    finished: Option<Instant>,
}

/// Counters written by the run loop and read as snapshots by status queries.
#[derive(Default)]
struct StatsCounters {
    total_frames: AtomicU64,
    processed_frames: AtomicU64,
    detections: AtomicU64,
    measurements_created: AtomicU64,
    errors: AtomicU64,
    timing: Mutex<Timing>,
}

impl StatsCounters {
    fn reset(&self) {
        self.total_frames.store(0, Ordering::Relaxed);
        self.processed_frames.store(0, Ordering::Relaxed);
        self.detections.store(0, Ordering::Relaxed);
        self.measurements_created.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        *self.timing.lock() = Timing {
            started_at: Some(Utc::now()),
            started: Some(Instant::now()),
            finished: None,
        };
    }

    fn mark_finished(&self) {
        let mut timing = self.timing.lock();
        if timing.finished.is_none() {
            timing.finished = Some(Instant::now());
        }
    }

    fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PipelineStats {
        let (started_at, runtime) = {
            let timing = self.timing.lock();
            let runtime = timing
                .started
                .map(|started| timing.finished.unwrap_or_else(Instant::now) - started)
                .unwrap_or_default();
            (timing.started_at, runtime)
        };

        let processed_frames = self.processed_frames.load(Ordering::Relaxed);
        let runtime_seconds = runtime.as_secs_f64();
        let fps = if runtime_seconds > 0.0 {
            processed_frames as f64 / runtime_seconds
        } else {
            0.0
        };

        PipelineStats {
            total_frames: self.total_frames.load(Ordering::Relaxed),
            processed_frames,
            detections: self.detections.load(Ordering::Relaxed),
            measurements_created: self.measurements_created.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            started_at,
            runtime_seconds,
            fps,
        }
    }
}

struct RunHandle {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
    grace: Duration,
}

struct Control {
    state: PipelineState,
    run: Option<RunHandle>,
    config: Option<PipelineConfig>,
}

impl Control {
    /// A run loop that ended on its own leaves `Running` behind; report it as stopped.
    fn refresh(&mut self) {
        if self.state != PipelineState::Running {
            return;
        }
        let finished = self.run.as_ref().map_or(true, |run| run.handle.is_finished());
        if finished {
            tracing::warn!("Run loop exited on its own, marking pipeline as stopped");
            self.state = PipelineState::Stopped;
            self.run = None;
        }
    }
}

/// The collaborators one detection flows through.
#[derive(Clone)]
struct DetectionStages {
    estimator: Arc<WeightEstimator>,
    registry: Arc<dyn Registry>,
    store: Arc<dyn MeasurementStore>,
    broadcaster: Arc<BroadcastManager>,
    conservative: bool,
    persistence_timeout: Duration,
}

impl DetectionStages {
    /// Estimate, attribute, persist, then broadcast one detection.
    /// Returns the id of the persisted measurement.
    async fn process(
        self,
        frame: Arc<Frame>,
        detection: Detection,
        frame_shape: FrameShape,
    ) -> Result<u64, DetectionError> {
        let estimate = self
            .estimator
            .estimate(&detection, frame_shape, self.conservative)?;

        let animal = self
            .registry
            .resolve_or_create_animal(&AnimalHint {
                class_id: detection.class_id,
                class_name: detection.class_name.clone(),
                camera_id: frame.camera_id.clone(),
            })
            .await?;

        let new_measurement = NewMeasurement {
            animal_id: animal.id,
            timestamp: frame.captured_at,
            weight_kg: estimate.weight_kg,
            confidence_score: estimate.estimation_confidence,
            camera_id: frame.camera_id.clone(),
            raw: RawDetection {
                bounding_box: detection.bounding_box,
                class_id: detection.class_id,
                class_name: detection.class_name,
                model_confidence: detection.confidence,
                frame_sequence: frame.sequence,
            },
        };

        let measurement = timeout(self.persistence_timeout, self.store.save(new_measurement))
            .await
            .map_err(|_| PersistenceError::Timeout(self.persistence_timeout))??;

        let report = self.broadcaster.broadcast(&LiveMessage::WeightUpdate {
            data: LiveWeightUpdate {
                measurement_id: measurement.id,
                animal_id: animal.id,
                animal_tag_id: animal.tag_id.clone(),
                estimated_weight_kg: measurement.weight_kg,
                confidence_score: measurement.confidence_score,
                camera_id: measurement.camera_id.clone(),
                timestamp: measurement.timestamp,
            },
        });

        tracing::info!(
            measurement_id = measurement.id,
            animal_id = animal.id,
            sequence = frame.sequence,
            delivered = report.delivered,
            "Measurement saved: {} {:.1}kg (confidence: {:.2})",
            animal.tag_id,
            measurement.weight_kg,
            measurement.confidence_score
        );

        Ok(measurement.id)
    }
}

struct RunLoop {
    source: Arc<AsyncMutex<Box<dyn FrameSource>>>,
    inference: InferencePool,
    stages: DetectionStages,
    stats: Arc<StatsCounters>,
    metrics: Option<Arc<Metrics>>,
    frame_skip: u32,
    threshold: f32,
    classes: Option<Arc<[u32]>>,
    backoff: Duration,
}

impl RunLoop {
    async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut source = self.source.lock().await;
        tracing::info!(camera_id = %source.camera_id(), "Run loop started");

        let outcome = AssertUnwindSafe(self.drive(&mut source, &mut shutdown_rx))
            .catch_unwind()
            .await;

        if let Err(panic) = outcome {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(camera_id = %source.camera_id(), "Run loop crashed: {}", reason);
            self.stats.error();
            self.record_error("run_loop");
            source.stop().await;
            self.stats.mark_finished();
        }

        tracing::info!("Run loop stopped");
    }

    async fn drive(
        &self,
        source: &mut Box<dyn FrameSource>,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) {
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                next = source.next_frame(self.frame_skip) => next,
            };

            let frame = match next {
                Ok(frame) => Arc::new(frame),
                Err(CameraError::Exhausted) => {
                    tracing::info!("Frame source exhausted, run loop ending");
                    source.stop().await;
                    self.stats.mark_finished();
                    break;
                }
                Err(e) => {
                    tracing::warn!(camera_id = %source.camera_id(), "Frame acquisition failed: {}", e);
                    self.stats.error();
                    self.record_error("acquisition");
                    let shutdown = tokio::select! {
                        biased;
                        _ = shutdown_rx.recv() => true,
                        _ = sleep(self.backoff) => false,
                    };
                    if shutdown {
                        break;
                    }
                    continue;
                }
            };

            self.process_frame(frame).await;
        }
    }

    async fn process_frame(&self, frame: Arc<Frame>) {
        self.stats.total_frames.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.record_frame(&frame.camera_id);
        }

        let result = match self
            .inference
            .detect(Arc::clone(&frame), self.threshold, self.classes.clone())
            .await
        {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(
                    sequence = frame.sequence,
                    camera_id = %frame.camera_id,
                    "Inference failed: {}",
                    e
                );
                self.stats.error();
                self.record_error("inference");
                return;
            }
        };

        self.stats.processed_frames.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.record_inference_duration(result.inference_time.as_millis() as u64, &result.model_name);
            metrics.record_pipeline_fps(self.stats.snapshot().fps);
        }

        if !result.has_detections() {
            tracing::debug!(sequence = frame.sequence, "No detections");
            return;
        }

        let count = result.detections.len();
        self.stats.detections.fetch_add(count as u64, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.record_detections(count as u64);
        }
        tracing::info!(
            sequence = frame.sequence,
            camera_id = %frame.camera_id,
            "Frame {}: {} detections in {:.1}ms",
            frame.sequence,
            count,
            result.inference_time_ms()
        );

        let mut units = JoinSet::new();
        for detection in result.detections {
            let stages = self.stages.clone();
            units.spawn(stages.process(Arc::clone(&frame), detection, result.frame_shape));
        }

        while let Some(joined) = units.join_next().await {
            match joined {
                Ok(Ok(_)) => {
                    self.stats.measurements_created.fetch_add(1, Ordering::Relaxed);
                    if let Some(metrics) = &self.metrics {
                        metrics.record_measurement();
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!(
                        sequence = frame.sequence,
                        stage = e.stage(),
                        "Detection processing failed: {}",
                        e
                    );
                    self.stats.error();
                    self.record_error(e.stage());
                }
                Err(e) => {
                    tracing::error!(sequence = frame.sequence, "Detection task failed: {}", e);
                    self.stats.error();
                    self.record_error("task");
                }
            }
        }
    }

    fn record_error(&self, stage: &'static str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_error(stage);
        }
    }
}

pub struct DetectionPipeline {
    source: Arc<AsyncMutex<Box<dyn FrameSource>>>,
    inference: InferencePool,
    estimator: Arc<WeightEstimator>,
    registry: Arc<dyn Registry>,
    store: Arc<dyn MeasurementStore>,
    broadcaster: Arc<BroadcastManager>,
    metrics: Option<Arc<Metrics>>,
    stats: Arc<StatsCounters>,
    control: Mutex<Control>,
}

impl DetectionPipeline {
    pub fn new(
        source: Box<dyn FrameSource>,
        inference: InferencePool,
        estimator: Arc<WeightEstimator>,
        registry: Arc<dyn Registry>,
        store: Arc<dyn MeasurementStore>,
        broadcaster: Arc<BroadcastManager>,
    ) -> Self {
        Self {
            source: Arc::new(AsyncMutex::new(source)),
            inference,
            estimator,
            registry,
            store,
            broadcaster,
            metrics: None,
            stats: Arc::new(StatsCounters::default()),
            control: Mutex::new(Control {
                state: PipelineState::Stopped,
                run: None,
                config: None,
            }),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn state(&self) -> PipelineState {
        let mut control = self.control.lock();
        control.refresh();
        control.state
    }

    pub fn status(&self) -> PipelineStatus {
        let (state, config) = {
            let mut control = self.control.lock();
            control.refresh();
            (control.state, control.config.clone())
        };
        PipelineStatus {
            state,
            stats: self.stats.snapshot(),
            config,
        }
    }

    /// Initializes the frame source and launches the run loop in the background.
    pub async fn start(&self, config: PipelineConfig) -> Result<(), PipelineError> {
        config.validate().map_err(PipelineError::InvalidConfig)?;

        {
            let mut control = self.control.lock();
            control.refresh();
            if control.state != PipelineState::Stopped {
                return Err(PipelineError::AlreadyRunning(control.state));
            }
            control.state = PipelineState::Starting;
        }

        tracing::info!(
            frame_skip = config.frame_skip,
            confidence_threshold = config.confidence_threshold,
            "Starting detection pipeline"
        );

        let initialized = {
            let mut source = self.source.lock().await;
            match source.initialize().await {
                Ok(()) => {
                    tracing::info!(source = ?source.info(), "Frame source initialized");
                    Ok(())
                }
                Err(e) => {
                    source.stop().await;
                    Err(e)
                }
            }
        };

        if let Err(e) = initialized {
            tracing::error!("Failed to initialize frame source: {}", e);
            self.control.lock().state = PipelineState::Stopped;
            return Err(PipelineError::Source(e));
        }

        self.stats.reset();

        let run_loop = RunLoop {
            source: Arc::clone(&self.source),
            inference: self.inference.clone(),
            stages: DetectionStages {
                estimator: Arc::clone(&self.estimator),
                registry: Arc::clone(&self.registry),
                store: Arc::clone(&self.store),
                broadcaster: Arc::clone(&self.broadcaster),
                conservative: config.conservative,
                persistence_timeout: config.persistence_timeout(),
            },
            stats: Arc::clone(&self.stats),
            metrics: self.metrics.clone(),
            frame_skip: config.frame_skip,
            threshold: config.confidence_threshold,
            classes: config.target_classes.clone().map(Arc::from),
            backoff: config.acquisition_backoff(),
        };

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(run_loop.run(shutdown_rx));

        let mut control = self.control.lock();
        control.state = PipelineState::Running;
        control.run = Some(RunHandle {
            shutdown_tx,
            handle,
            grace: config.stop_grace(),
        });
        control.config = Some(config);
        tracing::info!("Detection pipeline started");
        Ok(())
    }

    /// Signals the run loop, waits up to the grace period, cancels it if it is
    /// still busy, then releases the frame source.
    pub async fn stop(&self) -> Result<PipelineStats, PipelineError> {
        let run = {
            let mut control = self.control.lock();
            control.refresh();
            if control.state != PipelineState::Running {
                return Err(PipelineError::NotRunning(control.state));
            }
            control.state = PipelineState::Stopping;
            control.run.take()
        };

        tracing::info!("Stopping detection pipeline");

        if let Some(run) = run {
            let _ = run.shutdown_tx.send(());
            let mut handle = run.handle;
            if timeout(run.grace, &mut handle).await.is_err() {
                tracing::warn!("Run loop still busy after {:?}, cancelling", run.grace);
                handle.abort();
                let _ = handle.await;
            }
        }

        self.source.lock().await.stop().await;
        self.stats.mark_finished();
        self.control.lock().state = PipelineState::Stopped;

        let stats = self.stats.snapshot();
        log_final_stats(&stats);
        Ok(stats)
    }
}

fn log_final_stats(stats: &PipelineStats) {
    tracing::info!(
        runtime_seconds = stats.runtime_seconds,
        total_frames = stats.total_frames,
        processed_frames = stats.processed_frames,
        fps = stats.fps,
        detections = stats.detections,
        measurements_created = stats.measurements_created,
        errors = stats.errors,
        "Detection pipeline stopped after {:.1}s: {} frames processed, {} measurements, {} errors",
        stats.runtime_seconds,
        stats.processed_frames,
        stats.measurements_created,
        stats.errors
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::ChannelSubscriber;
    use crate::camera::CameraInfo;
    use crate::detection::{passes_filters, BoundingBox};
    use crate::frame::Resolution;
    use crate::inference::{InferenceEngine, InferenceError};
    use crate::registry::InMemoryRegistry;
    use crate::store::{InMemoryMeasurementStore, Measurement};
    use async_trait::async_trait;
    use image::RgbImage;
    use std::collections::{HashSet, VecDeque};
    use std::sync::atomic::AtomicUsize;

    #[derive(Clone, Copy)]
    enum Drained {
        Exhaust,
        Pend,
        Panic,
    }

    #[derive(Default)]
    struct SourceProbe {
        stops: AtomicUsize,
    }

    struct ScriptedSource {
        script: VecDeque<Result<(), CameraError>>,
        drained: Drained,
        fail_init: bool,
        sequence: u64,
        probe: Arc<SourceProbe>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<(), CameraError>>, drained: Drained) -> Self {
            Self {
                script: script.into(),
                drained,
                fail_init: false,
                sequence: 0,
                probe: Arc::new(SourceProbe::default()),
            }
        }

        fn frames(count: usize, drained: Drained) -> Self {
            Self::new((0..count).map(|_| Ok(())).collect(), drained)
        }
    }

    #[async_trait]
    impl FrameSource for ScriptedSource {
        fn camera_id(&self) -> &str {
            "TEST-CAM"
        }

        fn info(&self) -> CameraInfo {
            CameraInfo {
                camera_id: "TEST-CAM".into(),
                name: "Scripted".into(),
                kind: "test",
                resolution: Resolution {
                    width: 64,
                    height: 48,
                },
                fps: 0,
                is_active: true,
            }
        }

        async fn initialize(&mut self) -> Result<(), CameraError> {
            if self.fail_init {
                return Err(CameraError::OpenCameraFailed("no device".into()));
            }
            Ok(())
        }

        async fn next_frame(&mut self, skip_stride: u32) -> Result<Frame, CameraError> {
            match self.script.pop_front() {
                Some(Ok(())) => {
                    self.sequence += u64::from(skip_stride);
                    Ok(Frame::new(RgbImage::new(64, 48), "TEST-CAM", self.sequence))
                }
                Some(Err(e)) => Err(e),
                None => match self.drained {
                    Drained::Exhaust => Err(CameraError::Exhausted),
                    Drained::Pend => std::future::pending().await,
                    Drained::Panic => panic!("frame source crashed"),
                },
            }
        }

        async fn stop(&mut self) {
            self.probe.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct ScriptedEngine {
        detections: Vec<Detection>,
        fail_on: HashSet<u64>,
    }

    impl InferenceEngine for ScriptedEngine {
        fn name(&self) -> &str {
            "scripted"
        }

        fn is_loaded(&self) -> bool {
            true
        }

        fn detect(
            &self,
            frame: &Frame,
            threshold: f32,
            classes: Option<&[u32]>,
        ) -> Result<Vec<Detection>, InferenceError> {
            if self.fail_on.contains(&frame.sequence) {
                return Err(InferenceError::Backend(format!("frame {} corrupt", frame.sequence)));
            }
            Ok(self
                .detections
                .iter()
                .filter(|d| passes_filters(d, threshold, classes))
                .cloned()
                .collect())
        }
    }

    /// Engine whose calls outlast any reasonable inference timeout.
    struct WedgedEngine {
        delay: Duration,
    }

    impl InferenceEngine for WedgedEngine {
        fn name(&self) -> &str {
            "wedged"
        }

        fn is_loaded(&self) -> bool {
            true
        }

        fn detect(
            &self,
            _frame: &Frame,
            _threshold: f32,
            _classes: Option<&[u32]>,
        ) -> Result<Vec<Detection>, InferenceError> {
            std::thread::sleep(self.delay);
            Ok(Vec::new())
        }
    }

    /// Delegates to an in-memory store after a fixed delay.
    struct SlowStore {
        delay: Duration,
        inner: Arc<InMemoryMeasurementStore>,
    }

    #[async_trait]
    impl MeasurementStore for SlowStore {
        async fn save(&self, measurement: NewMeasurement) -> Result<Measurement, PersistenceError> {
            sleep(self.delay).await;
            self.inner.save(measurement).await
        }
    }

    struct HangingStore;

    #[async_trait]
    impl MeasurementStore for HangingStore {
        async fn save(&self, _measurement: NewMeasurement) -> Result<Measurement, PersistenceError> {
            std::future::pending().await
        }
    }

    fn detection(class_id: u32) -> Detection {
        Detection {
            class_id,
            class_name: if class_id == 19 { "cow" } else { "person" }.into(),
            confidence: 0.9,
            bounding_box: BoundingBox {
                center_x: 0.5,
                center_y: 0.5,
                width: 0.4,
                height: 0.4,
            },
        }
    }

    fn engine(detections: Vec<Detection>, fail_on: &[u64]) -> ScriptedEngine {
        ScriptedEngine {
            detections,
            fail_on: fail_on.iter().copied().collect(),
        }
    }

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            frame_skip: 1,
            confidence_threshold: 0.5,
            target_classes: None,
            conservative: true,
            stop_grace_ms: 1_000,
            persistence_timeout_ms: 1_000,
            acquisition_backoff_ms: 1,
        }
    }

    struct Harness {
        pipeline: DetectionPipeline,
        store: Arc<InMemoryMeasurementStore>,
        broadcaster: Arc<BroadcastManager>,
        probe: Arc<SourceProbe>,
    }

    fn harness(source: ScriptedSource, engine: ScriptedEngine) -> Harness {
        let store = Arc::new(InMemoryMeasurementStore::new());
        harness_with_store(source, engine, store.clone(), store)
    }

    fn harness_with_store(
        source: ScriptedSource,
        engine: ScriptedEngine,
        store: Arc<dyn MeasurementStore>,
        memory: Arc<InMemoryMeasurementStore>,
    ) -> Harness {
        let pool = InferencePool::new(Arc::new(engine), 2, Duration::from_secs(1));
        harness_with_pool(source, pool, store, memory)
    }

    fn harness_with_pool(
        source: ScriptedSource,
        pool: InferencePool,
        store: Arc<dyn MeasurementStore>,
        memory: Arc<InMemoryMeasurementStore>,
    ) -> Harness {
        let probe = Arc::clone(&source.probe);
        let broadcaster = Arc::new(BroadcastManager::new());
        let pipeline = DetectionPipeline::new(
            Box::new(source),
            pool,
            Arc::new(WeightEstimator::new()),
            Arc::new(InMemoryRegistry::new()),
            store,
            Arc::clone(&broadcaster),
        );
        Harness {
            pipeline,
            store: memory,
            broadcaster,
            probe,
        }
    }

    async fn wait_for_state(pipeline: &DetectionPipeline, expected: PipelineState) {
        for _ in 0..300 {
            if pipeline.state() == expected {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("pipeline never reached {}", expected);
    }

    #[tokio::test]
    async fn test_lifecycle_guards() {
        let h = harness(ScriptedSource::frames(0, Drained::Pend), engine(vec![], &[]));
        assert_eq!(h.pipeline.state(), PipelineState::Stopped);

        assert!(matches!(
            h.pipeline.stop().await,
            Err(PipelineError::NotRunning(PipelineState::Stopped))
        ));

        h.pipeline.start(test_config()).await.unwrap();
        assert_eq!(h.pipeline.state(), PipelineState::Running);

        assert!(matches!(
            h.pipeline.start(test_config()).await,
            Err(PipelineError::AlreadyRunning(PipelineState::Running))
        ));
        assert_eq!(h.pipeline.state(), PipelineState::Running);

        h.pipeline.stop().await.unwrap();
        assert_eq!(h.pipeline.state(), PipelineState::Stopped);
        assert!(h.pipeline.stop().await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_config_leaves_state_untouched() {
        let h = harness(ScriptedSource::frames(0, Drained::Pend), engine(vec![], &[]));
        let config = PipelineConfig {
            frame_skip: 0,
            ..test_config()
        };

        assert!(matches!(
            h.pipeline.start(config).await,
            Err(PipelineError::InvalidConfig(_))
        ));
        assert_eq!(h.pipeline.state(), PipelineState::Stopped);
        assert_eq!(h.probe.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_inference_failure_skips_only_that_frame() {
        let h = harness(
            ScriptedSource::frames(3, Drained::Exhaust),
            engine(vec![detection(19)], &[2]),
        );
        h.pipeline.start(test_config()).await.unwrap();
        wait_for_state(&h.pipeline, PipelineState::Stopped).await;

        let stats = h.pipeline.status().stats;
        assert_eq!(stats.total_frames, 3);
        assert_eq!(stats.processed_frames, 2);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.detections, 2);
        assert_eq!(stats.measurements_created, 2);

        let sequences: Vec<u64> = h
            .store
            .for_animal(1)
            .await
            .iter()
            .map(|m| m.raw.frame_sequence)
            .collect();
        assert_eq!(sequences, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_failed_detection_does_not_cancel_siblings() {
        let h = harness(
            ScriptedSource::frames(1, Drained::Exhaust),
            engine(vec![detection(19), detection(0), detection(19)], &[]),
        );
        h.pipeline.start(test_config()).await.unwrap();
        wait_for_state(&h.pipeline, PipelineState::Stopped).await;

        let stats = h.pipeline.status().stats;
        assert_eq!(stats.processed_frames, 1);
        assert_eq!(stats.detections, 3);
        assert_eq!(stats.measurements_created, 2);
        assert_eq!(stats.errors, 1);
        assert_eq!(h.store.len().await, 2);
    }

    #[tokio::test]
    async fn test_acquisition_error_is_counted_and_skipped() {
        let source = ScriptedSource::new(
            vec![
                Err(CameraError::ReadFrameFailed("usb reset".into())),
                Ok(()),
            ],
            Drained::Exhaust,
        );
        let h = harness(source, engine(vec![detection(19)], &[]));
        h.pipeline.start(test_config()).await.unwrap();
        wait_for_state(&h.pipeline, PipelineState::Stopped).await;

        let stats = h.pipeline.status().stats;
        assert_eq!(stats.total_frames, 1);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.measurements_created, 1);
    }

    #[tokio::test]
    async fn test_frame_skip_forwarded_to_source() {
        let h = harness(
            ScriptedSource::frames(2, Drained::Exhaust),
            engine(vec![detection(19)], &[]),
        );
        let config = PipelineConfig {
            frame_skip: 3,
            ..test_config()
        };
        h.pipeline.start(config).await.unwrap();
        wait_for_state(&h.pipeline, PipelineState::Stopped).await;

        let sequences: Vec<u64> = h
            .store
            .for_animal(1)
            .await
            .iter()
            .map(|m| m.raw.frame_sequence)
            .collect();
        assert_eq!(sequences, vec![3, 6]);
    }

    #[tokio::test]
    async fn test_measurement_is_broadcast() {
        let h = harness(
            ScriptedSource::frames(1, Drained::Exhaust),
            engine(vec![detection(19)], &[]),
        );
        let (subscriber, mut rx) = ChannelSubscriber::new(16);
        h.broadcaster.connect(Arc::new(subscriber));

        h.pipeline.start(test_config()).await.unwrap();
        wait_for_state(&h.pipeline, PipelineState::Stopped).await;

        let welcome: serde_json::Value = serde_json::from_slice(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(welcome["type"], "connection");

        let update: serde_json::Value = serde_json::from_slice(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(update["type"], "weight_update");
        assert_eq!(update["data"]["measurement_id"], 1);
        assert_eq!(update["data"]["animal_tag_id"], "AUTO-COW-001");
        assert_eq!(update["data"]["camera_id"], "TEST-CAM");

        let weight = update["data"]["estimated_weight_kg"].as_f64().unwrap();
        assert!((weight - 505.4).abs() < 0.5);
    }

    #[tokio::test]
    async fn test_source_init_failure() {
        let mut source = ScriptedSource::frames(0, Drained::Pend);
        source.fail_init = true;
        let h = harness(source, engine(vec![], &[]));

        assert!(matches!(
            h.pipeline.start(test_config()).await,
            Err(PipelineError::Source(_))
        ));
        assert_eq!(h.pipeline.state(), PipelineState::Stopped);
        assert_eq!(h.probe.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_while_waiting_for_frames() {
        let h = harness(ScriptedSource::frames(0, Drained::Pend), engine(vec![], &[]));
        h.pipeline.start(test_config()).await.unwrap();
        sleep(Duration::from_millis(20)).await;

        let started = Instant::now();
        let stats = h.pipeline.stop().await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(stats.total_frames, 0);
        assert_eq!(h.probe.stops.load(Ordering::SeqCst), 1);
        assert_eq!(h.pipeline.state(), PipelineState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_cancels_after_grace_period() {
        let memory = Arc::new(InMemoryMeasurementStore::new());
        let h = harness_with_store(
            ScriptedSource::frames(1, Drained::Pend),
            engine(vec![detection(19)], &[]),
            Arc::new(HangingStore),
            memory,
        );
        let config = PipelineConfig {
            stop_grace_ms: 50,
            persistence_timeout_ms: 60_000,
            ..test_config()
        };
        h.pipeline.start(config).await.unwrap();

        for _ in 0..100 {
            if h.pipeline.status().stats.detections == 1 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }

        let started = Instant::now();
        let stats = h.pipeline.stop().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(stats.detections, 1);
        assert_eq!(stats.measurements_created, 0);
        assert_eq!(h.pipeline.state(), PipelineState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_lets_in_flight_detections_finish() {
        let memory = Arc::new(InMemoryMeasurementStore::new());
        let store = Arc::new(SlowStore {
            delay: Duration::from_millis(100),
            inner: Arc::clone(&memory),
        });
        let h = harness_with_store(
            ScriptedSource::frames(1, Drained::Pend),
            engine(vec![detection(19)], &[]),
            store,
            memory,
        );
        h.pipeline.start(test_config()).await.unwrap();

        for _ in 0..100 {
            if h.pipeline.status().stats.detections == 1 {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.pipeline.status().stats.measurements_created, 0);

        let stats = h.pipeline.stop().await.unwrap();
        assert_eq!(stats.measurements_created, 1);
        assert_eq!(stats.errors, 0);
        assert_eq!(h.store.len().await, 1);
        assert_eq!(h.pipeline.state(), PipelineState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_wedged_engine_keeps_loop_moving() {
        let pool = InferencePool::new(
            Arc::new(WedgedEngine {
                delay: Duration::from_millis(800),
            }),
            1,
            Duration::from_millis(20),
        );
        let memory = Arc::new(InMemoryMeasurementStore::new());
        let h = harness_with_pool(
            ScriptedSource::frames(5, Drained::Exhaust),
            pool,
            memory.clone(),
            memory,
        );

        let started = Instant::now();
        h.pipeline.start(test_config()).await.unwrap();
        wait_for_state(&h.pipeline, PipelineState::Stopped).await;
        assert!(started.elapsed() < Duration::from_millis(600));

        let stats = h.pipeline.status().stats;
        assert_eq!(stats.total_frames, 5);
        assert_eq!(stats.processed_frames, 0);
        assert_eq!(stats.errors, 5);
    }

    #[tokio::test]
    async fn test_crashed_run_loop_reports_stopped() {
        let h = harness(ScriptedSource::frames(1, Drained::Panic), engine(vec![], &[]));
        h.pipeline.start(test_config()).await.unwrap();
        wait_for_state(&h.pipeline, PipelineState::Stopped).await;

        let stats = h.pipeline.status().stats;
        assert_eq!(stats.total_frames, 1);
        assert_eq!(stats.errors, 1);
        assert_eq!(h.probe.stops.load(Ordering::SeqCst), 1);
        h.pipeline.start(test_config()).await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_resets_stats() {
        let h = harness(
            ScriptedSource::frames(2, Drained::Pend),
            engine(vec![detection(19)], &[]),
        );
        h.pipeline.start(test_config()).await.unwrap();
        for _ in 0..100 {
            if h.pipeline.status().stats.measurements_created == 2 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        let stats = h.pipeline.stop().await.unwrap();
        assert_eq!(stats.measurements_created, 2);

        h.pipeline.start(test_config()).await.unwrap();
        let status = h.pipeline.status();
        assert_eq!(status.state, PipelineState::Running);
        assert_eq!(status.stats.measurements_created, 0);
        assert_eq!(status.config, Some(test_config()));
        h.pipeline.stop().await.unwrap();
    }
}
