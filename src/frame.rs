use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Frame geometry as (height, width, channels).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameShape {
    pub height: u32,
    pub width: u32,
    pub channels: u32,
}

/// One capture handed from a frame source to the pipeline.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub captured_at: DateTime<Utc>,
    pub camera_id: String,
    pub sequence: u64,
    pub resolution: Resolution,
}

impl Frame {
    pub fn new(image: RgbImage, camera_id: impl Into<String>, sequence: u64) -> Self {
        let resolution = Resolution {
            width: image.width(),
            height: image.height(),
        };
        Self {
            image,
            captured_at: Utc::now(),
            camera_id: camera_id.into(),
            sequence,
            resolution,
        }
    }

    pub fn shape(&self) -> FrameShape {
        FrameShape {
            height: self.resolution.height,
            width: self.resolution.width,
            channels: 3,
        }
    }
}
