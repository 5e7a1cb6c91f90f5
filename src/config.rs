use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub camera: CameraConfig,
    pub inference: InferenceConfig,
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub autostart: bool,
    #[serde(default)]
    pub live_feed: LiveFeedConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CameraMode {
    Random,
    Images,
}

#[derive(Clone, Deserialize, Debug)]
pub struct CameraConfig {
    #[serde(default = "default_camera_id")]
    pub camera_id: String,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_camera_fps")]
    pub fps: u64,
    #[serde(default = "default_camera_mode")]
    pub mode: CameraMode,
    #[serde(default)]
    pub images_dir: Option<PathBuf>,
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_camera_id() -> String {
    "SIM-MAIN-001".into()
}

fn default_width() -> u32 {
    640
}

fn default_height() -> u32 {
    480
}

fn default_camera_fps() -> u64 {
    10
}

fn default_camera_mode() -> CameraMode {
    CameraMode::Random
}

fn fps_to_delay_ms(fps: u64) -> u64 {
    (1000.0 / fps.max(1) as f64).round() as u64
}

impl CameraConfig {
    pub fn get_frame_delay_ms(&self) -> u64 {
        fps_to_delay_ms(self.fps)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    Simulated,
    Onnx,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InferenceConfig {
    #[serde(default = "default_backend")]
    pub backend: InferenceBackend,
    #[serde(default = "default_inference_workers")]
    pub workers: usize,
    #[serde(default = "default_inference_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_simulated_class_id")]
    pub simulated_class_id: u32,
    #[serde(default = "default_simulated_class_name")]
    pub simulated_class_name: String,
    #[serde(default)]
    pub model_path: Option<PathBuf>,
    #[serde(default)]
    pub labels_path: Option<PathBuf>,
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,
}

fn default_backend() -> InferenceBackend {
    InferenceBackend::Simulated
}

fn default_inference_workers() -> usize {
    2
}

fn default_inference_timeout_ms() -> u64 {
    2_000
}

fn default_simulated_class_id() -> u32 {
    19
}

fn default_simulated_class_name() -> String {
    "cow".into()
}

fn default_input_size() -> u32 {
    640
}

fn default_iou_threshold() -> f32 {
    0.7
}

impl InferenceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Run parameters handed to the pipeline on every `start`.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct PipelineConfig {
    #[serde(default = "default_frame_skip")]
    pub frame_skip: u32,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default)]
    pub target_classes: Option<Vec<u32>>,
    #[serde(default = "default_conservative")]
    pub conservative: bool,
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    #[serde(default = "default_persistence_timeout_ms")]
    pub persistence_timeout_ms: u64,
    #[serde(default = "default_acquisition_backoff_ms")]
    pub acquisition_backoff_ms: u64,
}

fn default_frame_skip() -> u32 {
    5
}

fn default_confidence_threshold() -> f32 {
    0.5
}

fn default_conservative() -> bool {
    true
}

fn default_stop_grace_ms() -> u64 {
    5_000
}

fn default_persistence_timeout_ms() -> u64 {
    2_000
}

fn default_acquisition_backoff_ms() -> u64 {
    100
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_skip: default_frame_skip(),
            confidence_threshold: default_confidence_threshold(),
            target_classes: None,
            conservative: default_conservative(),
            stop_grace_ms: default_stop_grace_ms(),
            persistence_timeout_ms: default_persistence_timeout_ms(),
            acquisition_backoff_ms: default_acquisition_backoff_ms(),
        }
    }
}

impl PipelineConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn persistence_timeout(&self) -> Duration {
        Duration::from_millis(self.persistence_timeout_ms)
    }

    pub fn acquisition_backoff(&self) -> Duration {
        Duration::from_millis(self.acquisition_backoff_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.frame_skip == 0 {
            return Err("frame_skip must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(format!(
                "confidence_threshold must be within [0, 1], got {}",
                self.confidence_threshold
            ));
        }
        if self.stop_grace_ms == 0 || self.persistence_timeout_ms == 0 {
            return Err("stop_grace_ms and persistence_timeout_ms must be positive".into());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LiveFeedConfig {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_subscriber_buffer() -> usize {
    64
}

impl Default for LiveFeedConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir()
        .map_err(|e| config::ConfigError::Message(format!("cannot read current dir: {}", e)))?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(
            config::File::from(
                configuration_directory.join(format!("{}.yaml", environment.as_str())),
            )
            .required(false),
        )
        .add_source(
            config::Environment::with_prefix("LP")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config: Config = config.try_deserialize::<Config>()?;

    if let Err(e) = config.pipeline.validate() {
        tracing::error!("Configuration validation failed: {}", e);
        return Err(config::ConfigError::Message(e));
    }

    Ok(config)
}
