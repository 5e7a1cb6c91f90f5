use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Histogram, MeterProvider},
    KeyValue,
};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::{Encoder, Registry, TextEncoder};
use std::collections::HashSet;

pub struct Metrics {
    frames: Counter<u64>,
    detections: Counter<u64>,
    measurements: Counter<u64>,
    pipeline_errors: Counter<u64>,
    inference_duration: Histogram<u64>,
    pipeline_fps: Gauge<f64>,
    live_connections: Gauge<u64>,
    _provider: SdkMeterProvider,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()?;

        let provider = SdkMeterProvider::builder().with_reader(exporter).build();

        let meter = provider.meter("livestock_pipeline");
        global::set_meter_provider(provider.clone());

        let frames = meter
            .u64_counter("pipeline_frames_total")
            .with_description("Frames pulled from the frame source")
            .build();

        let detections = meter
            .u64_counter("pipeline_detections_total")
            .with_description("Detections returned by the inference engine")
            .build();

        let measurements = meter
            .u64_counter("pipeline_measurements_total")
            .with_description("Measurements persisted by the pipeline")
            .build();

        let pipeline_errors = meter
            .u64_counter("pipeline_errors_total")
            .with_description("Per-frame and per-detection failures by stage")
            .build();

        let boundaries = generate_boundaries((5, 25, 45, 505, 1505));

        let inference_duration = meter
            .u64_histogram("inference_duration_ms")
            .with_boundaries(boundaries)
            .with_description("Duration of inference calls in milliseconds")
            .build();

        let pipeline_fps = meter
            .f64_gauge("pipeline_fps")
            .with_description("Processed frames per second since the pipeline started")
            .build();

        let live_connections = meter
            .u64_gauge("live_connections")
            .with_description("Active live feed subscribers")
            .build();

        Ok(Metrics {
            frames,
            detections,
            measurements,
            pipeline_errors,
            inference_duration,
            pipeline_fps,
            live_connections,
            _provider: provider,
            registry,
        })
    }

    pub fn record_frame(&self, camera_id: &str) {
        let attributes = vec![KeyValue::new("camera_id", camera_id.to_string())];
        self.frames.add(1, &attributes);
    }

    pub fn record_detections(&self, count: u64) {
        self.detections.add(count, &[]);
    }

    pub fn record_measurement(&self) {
        self.measurements.add(1, &[]);
    }

    pub fn record_error(&self, stage: &'static str) {
        let attributes = vec![KeyValue::new("stage", stage)];
        self.pipeline_errors.add(1, &attributes);
    }

    pub fn record_inference_duration(&self, duration_ms: u64, model: &str) {
        let attributes = vec![KeyValue::new("model", model.to_string())];
        self.inference_duration.record(duration_ms, &attributes);
    }

    pub fn record_pipeline_fps(&self, fps: f64) {
        self.pipeline_fps.record(fps, &[]);
    }

    pub fn record_live_connections(&self, active: usize) {
        self.live_connections.record(active as u64, &[]);
    }

    /// Renders the registry in the Prometheus text exposition format.
    pub fn render(&self) -> anyhow::Result<String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

fn generate_boundaries(parts: (i32, i32, i32, i32, i32)) -> Vec<f64> {
    let first_step: usize = 5;
    let middle_step: usize = 10;
    let end_step: usize = 50;
    let tail_step: usize = 250;
    let first_part = (parts.0..=parts.1).step_by(first_step);
    let middle_part = (parts.1..=parts.2).step_by(middle_step);
    let end_part = (parts.2..=parts.3).step_by(end_step);
    let tail_part = (parts.3..=parts.4).step_by(tail_step);

    let mut seen = HashSet::new();
    first_part
        .chain(middle_part)
        .chain(end_part)
        .chain(tail_part)
        .filter(|&x| seen.insert(x))
        .map(|x| x as f64)
        .collect()
}
