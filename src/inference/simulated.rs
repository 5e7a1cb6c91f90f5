use super::{InferenceEngine, InferenceError};
use crate::camera::is_hide_colour;
use crate::detection::{passes_filters, BoundingBox, Detection};
use crate::frame::Frame;

/// Sampling step in pixels for the colour mask.
const GRID_STEP: u32 = 4;

/// Blobs covering fewer grid cells than this are treated as noise.
const MIN_CELLS: usize = 12;

/// Colour-segmentation detector for simulated frames.
///
/// Every connected region of animal-coloured pixels becomes one detection of
/// the configured class. Confidence grows with how well the region fills its
/// bounding box.
pub struct SimulatedEngine {
    class_id: u32,
    class_name: String,
}

impl SimulatedEngine {
    pub fn new(class_id: u32, class_name: impl Into<String>) -> Self {
        Self {
            class_id,
            class_name: class_name.into(),
        }
    }
}

struct Blob {
    cells: usize,
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
}

fn find_blobs(frame: &Frame) -> Vec<Blob> {
    let cols = frame.image.width().div_ceil(GRID_STEP) as usize;
    let rows = frame.image.height().div_ceil(GRID_STEP) as usize;

    let mask: Vec<bool> = (0..rows * cols)
        .map(|i| {
            let x = (i % cols) as u32 * GRID_STEP;
            let y = (i / cols) as u32 * GRID_STEP;
            is_hide_colour(frame.image.get_pixel(x, y))
        })
        .collect();

    let mut visited = vec![false; mask.len()];
    let mut blobs = Vec::new();
    let mut stack = Vec::new();

    for start in 0..mask.len() {
        if !mask[start] || visited[start] {
            continue;
        }
        visited[start] = true;
        stack.push(start);

        let mut blob = Blob {
            cells: 0,
            min_x: u32::MAX,
            min_y: u32::MAX,
            max_x: 0,
            max_y: 0,
        };

        while let Some(i) = stack.pop() {
            let (cx, cy) = (i % cols, i / cols);
            blob.cells += 1;
            blob.min_x = blob.min_x.min(cx as u32);
            blob.max_x = blob.max_x.max(cx as u32);
            blob.min_y = blob.min_y.min(cy as u32);
            blob.max_y = blob.max_y.max(cy as u32);

            let neighbours = [
                (cx > 0).then(|| i - 1),
                (cx + 1 < cols).then(|| i + 1),
                (cy > 0).then(|| i - cols),
                (cy + 1 < rows).then(|| i + cols),
            ];
            for n in neighbours.into_iter().flatten() {
                if mask[n] && !visited[n] {
                    visited[n] = true;
                    stack.push(n);
                }
            }
        }

        if blob.cells >= MIN_CELLS {
            blobs.push(blob);
        }
    }

    blobs
}

impl InferenceEngine for SimulatedEngine {
    fn name(&self) -> &str {
        "simulated-color-segmentation"
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
        let (width, height) = frame.image.dimensions();
        if width == 0 || height == 0 {
            return Err(InferenceError::InvalidFrame(format!(
                "empty frame {}x{}",
                width, height
            )));
        }

        let detections = find_blobs(frame)
            .into_iter()
            .map(|blob| {
                let cols = blob.max_x - blob.min_x + 1;
                let rows = blob.max_y - blob.min_y + 1;
                let fill = blob.cells as f32 / (cols * rows) as f32;

                let bounding_box = BoundingBox::from_corners(
                    (blob.min_x * GRID_STEP) as f32,
                    (blob.min_y * GRID_STEP) as f32,
                    ((blob.max_x + 1) * GRID_STEP) as f32,
                    ((blob.max_y + 1) * GRID_STEP) as f32,
                    width as f32,
                    height as f32,
                );

                Detection {
                    class_id: self.class_id,
                    class_name: self.class_name.clone(),
                    confidence: (0.5 + 0.45 * fill).min(0.95),
                    bounding_box,
                }
            })
            .filter(|detection| passes_filters(detection, threshold, classes))
            .collect();

        Ok(detections)
    }
}
