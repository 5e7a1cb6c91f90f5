use crate::config::{CameraConfig, CameraMode};
use crate::frame::{Frame, Resolution};
use async_trait::async_trait;
use image::{imageops::FilterType, Rgb, RgbImage};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("Failed to open camera: {0}")]
    OpenCameraFailed(String),
    #[error("Camera not initialized. Call initialize() first.")]
    NotInitialized,
    #[error("Failed to read frame: {0}")]
    ReadFrameFailed(String),
    #[error("Frame source exhausted")]
    Exhausted,
}

#[derive(Debug, Clone, Serialize)]
pub struct CameraInfo {
    pub camera_id: String,
    pub name: String,
    pub kind: &'static str,
    pub resolution: Resolution,
    pub fps: u64,
    pub is_active: bool,
}

/// A camera-like source of timestamped frames.
///
/// `stop` must be safe to call at any point, including after a failed
/// `initialize` and more than once.
#[async_trait]
pub trait FrameSource: Send {
    fn camera_id(&self) -> &str;

    fn info(&self) -> CameraInfo;

    async fn initialize(&mut self) -> Result<(), CameraError>;

    /// Returns the next frame whose sequence number is a multiple of `skip_stride`.
    /// Frames in between are consumed without being rendered.
    async fn next_frame(&mut self, skip_stride: u32) -> Result<Frame, CameraError>;

    async fn stop(&mut self);
}

/// Camera used for development and tests: renders synthetic paddock scenes or
/// cycles through a directory of still images.
pub struct SimulatedCamera {
    config: CameraConfig,
    mode: CameraMode,
    rng: StdRng,
    images: Vec<RgbImage>,
    next_image: usize,
    sequence: u64,
    is_active: bool,
}

/// Colour range used for rendered animals; the simulated detector keys on it.
pub(crate) fn is_hide_colour(pixel: &Rgb<u8>) -> bool {
    let [r, g, b] = pixel.0;
    i16::from(r) - i16::from(b) > 40 && r > g
}

impl SimulatedCamera {
    pub fn new(config: CameraConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            mode: config.mode,
            config,
            rng,
            images: Vec::new(),
            next_image: 0,
            sequence: 0,
            is_active: false,
        }
    }

    fn resolution(&self) -> Resolution {
        Resolution {
            width: self.config.width,
            height: self.config.height,
        }
    }

    /// Grey noise with zero to two filled animal-coloured rectangles.
    fn render_scene(&mut self) -> RgbImage {
        let (width, height) = (self.config.width, self.config.height);
        let rng = &mut self.rng;

        let mut img = RgbImage::from_fn(width, height, |_, _| {
            let base: u8 = rng.random_range(60..140);
            Rgb([
                base.saturating_add(rng.random_range(0..6)),
                base.saturating_add(rng.random_range(0..6)),
                base.saturating_add(rng.random_range(0..6)),
            ])
        });

        let objects = rng.random_range(0..=2);
        for _ in 0..objects {
            let box_w = (width as f32 * rng.random_range(0.2..0.45)) as u32;
            let box_h = (height as f32 * rng.random_range(0.25..0.5)) as u32;
            let x1 = rng.random_range(0..width.saturating_sub(box_w).max(1));
            let y1 = rng.random_range(0..height.saturating_sub(box_h).max(1));
            let colour = Rgb([
                rng.random_range(120..160),
                rng.random_range(80..110),
                rng.random_range(40..70),
            ]);
            fill_rect(&mut img, x1, y1, box_w, box_h, colour);
        }

        img
    }

    fn next_image(&mut self) -> RgbImage {
        if self.mode == CameraMode::Images && !self.images.is_empty() {
            let img = self.images[self.next_image].clone();
            self.next_image = (self.next_image + 1) % self.images.len();
            return img;
        }
        self.render_scene()
    }
}

/// Reads and resizes every image in `dir`, sorted by file name. Blocking.
fn load_images(dir: &Path, width: u32, height: u32) -> Vec<RgbImage> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("Test images directory not readable {:?}: {}", dir, e);
            return Vec::new();
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| matches!(ext.to_lowercase().as_str(), "jpg" | "jpeg" | "png" | "bmp"))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();

    let mut images = Vec::with_capacity(paths.len());
    for path in paths {
        match image::open(&path) {
            Ok(img) => images.push(
                img.resize_exact(width, height, FilterType::Triangle)
                    .to_rgb8(),
            ),
            Err(e) => tracing::warn!("Skipping unreadable image {:?}: {}", path, e),
        }
    }
    tracing::info!("Loaded {} test images", images.len());
    images
}

pub(crate) fn fill_rect(img: &mut RgbImage, x1: u32, y1: u32, w: u32, h: u32, colour: Rgb<u8>) {
    let x2 = (x1 + w).min(img.width());
    let y2 = (y1 + h).min(img.height());
    for y in y1..y2 {
        for x in x1..x2 {
            img.put_pixel(x, y, colour);
        }
    }
}

#[async_trait]
impl FrameSource for SimulatedCamera {
    fn camera_id(&self) -> &str {
        &self.config.camera_id
    }

    fn info(&self) -> CameraInfo {
        CameraInfo {
            camera_id: self.config.camera_id.clone(),
            name: format!("Simulated Camera {}", self.config.camera_id),
            kind: "simulated",
            resolution: self.resolution(),
            fps: self.config.fps,
            is_active: self.is_active,
        }
    }

    async fn initialize(&mut self) -> Result<(), CameraError> {
        tracing::info!("Initializing simulated camera: {}", self.config.camera_id);

        if self.config.width == 0 || self.config.height == 0 {
            return Err(CameraError::OpenCameraFailed(format!(
                "invalid resolution {}x{}",
                self.config.width, self.config.height
            )));
        }

        self.mode = self.config.mode;
        if self.mode == CameraMode::Images && self.images.is_empty() {
            if let Some(dir) = self.config.images_dir.clone() {
                let (width, height) = (self.config.width, self.config.height);
                self.images =
                    tokio::task::spawn_blocking(move || load_images(&dir, width, height))
                        .await
                        .map_err(|e| CameraError::OpenCameraFailed(e.to_string()))?;
                self.next_image = 0;
            }
            if self.images.is_empty() {
                tracing::info!("Falling back to random frame generation");
                self.mode = CameraMode::Random;
            }
        }

        self.sequence = 0;
        self.is_active = true;
        Ok(())
    }

    async fn next_frame(&mut self, skip_stride: u32) -> Result<Frame, CameraError> {
        if !self.is_active {
            return Err(CameraError::NotInitialized);
        }

        let stride = u64::from(skip_stride.max(1));
        let frame_delay = Duration::from_millis(self.config.get_frame_delay_ms());
        loop {
            sleep(frame_delay).await;
            self.sequence += 1;
            if self.sequence % stride == 0 {
                break;
            }
        }

        let image = self.next_image();
        Ok(Frame::new(image, self.config.camera_id.clone(), self.sequence))
    }

    async fn stop(&mut self) {
        if self.is_active {
            tracing::info!("Stopping simulated camera: {}", self.config.camera_id);
        }
        self.is_active = false;
        self.sequence = 0;
    }
}
