use crate::frame::FrameShape;
use serde::Serialize;
use std::time::Duration;

/// Axis-aligned box normalized to the frame, given as center point and size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub center_x: f32,
    pub center_y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    /// Builds a normalized box from pixel corners, clamping it into the frame.
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32, frame_w: f32, frame_h: f32) -> Self {
        let x1 = (x1 / frame_w).clamp(0.0, 1.0);
        let x2 = (x2 / frame_w).clamp(0.0, 1.0);
        let y1 = (y1 / frame_h).clamp(0.0, 1.0);
        let y2 = (y2 / frame_h).clamp(0.0, 1.0);
        Self {
            center_x: (x1 + x2) / 2.0,
            center_y: (y1 + y2) / 2.0,
            width: (x2 - x1).abs(),
            height: (y2 - y1).abs(),
        }
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub class_id: u32,
    pub class_name: String,
    pub confidence: f32,
    pub bounding_box: BoundingBox,
}

/// Detections for one frame plus the bookkeeping of the call that produced them.
#[derive(Debug, Clone)]
pub struct InferenceResult {
    pub detections: Vec<Detection>,
    pub inference_time: Duration,
    pub model_name: String,
    pub frame_shape: FrameShape,
}

impl InferenceResult {
    pub fn has_detections(&self) -> bool {
        !self.detections.is_empty()
    }

    pub fn inference_time_ms(&self) -> f64 {
        self.inference_time.as_secs_f64() * 1000.0
    }
}

pub fn passes_filters(detection: &Detection, threshold: f32, classes: Option<&[u32]>) -> bool {
    detection.confidence >= threshold
        && classes.map_or(true, |classes| classes.contains(&detection.class_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_corners_normalizes_and_clamps() {
        let bbox = BoundingBox::from_corners(-10.0, 120.0, 320.0, 360.0, 640.0, 480.0);
        assert_eq!(bbox.width, 0.5);
        assert_eq!(bbox.height, 0.5);
        assert_eq!(bbox.center_x, 0.25);
        assert_eq!(bbox.center_y, 0.5);
    }

    #[test]
    fn test_passes_filters() {
        let detection = Detection {
            class_id: 19,
            class_name: "cow".into(),
            confidence: 0.6,
            bounding_box: BoundingBox {
                center_x: 0.5,
                center_y: 0.5,
                width: 0.2,
                height: 0.2,
            },
        };

        assert!(passes_filters(&detection, 0.5, None));
        assert!(passes_filters(&detection, 0.5, Some(&[19, 20])));
        assert!(!passes_filters(&detection, 0.7, None));
        assert!(!passes_filters(&detection, 0.5, Some(&[20])));
    }
}
