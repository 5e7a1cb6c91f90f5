use super::{InferenceEngine, InferenceError};
use crate::config::InferenceConfig;
use crate::detection::{passes_filters, BoundingBox, Detection};
use crate::frame::Frame;
use image::{imageops::FilterType, DynamicImage, GenericImageView};
use ndarray::{s, Array, Axis, Ix4};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Corner-form box in model input pixels, used during suppression.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    class_id: usize,
    confidence: f32,
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
}

fn intersection(a: &Candidate, b: &Candidate) -> f32 {
    let w = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let h = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    w * h
}

fn union(a: &Candidate, b: &Candidate) -> f32 {
    (a.x2 - a.x1) * (a.y2 - a.y1) + (b.x2 - b.x1) * (b.y2 - b.y1) - intersection(a, b)
}

fn non_max_suppression(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept = Vec::new();
    while let Some(best) = candidates.first().copied() {
        kept.push(best);
        candidates.retain(|c| {
            let u = union(&best, c);
            u > 0.0 && intersection(&best, c) / u < iou_threshold
        });
    }
    kept
}

fn load_labels(path: &Path) -> std::io::Result<Vec<String>> {
    let reader = BufReader::new(File::open(path)?);
    let mut labels = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if let Some(label) = line.split(',').next().map(str::trim) {
            if !label.is_empty() {
                labels.push(label.to_string());
            }
        }
    }
    Ok(labels)
}

fn frame_to_input(frame: &Frame, input_size: u32) -> Array<f32, Ix4> {
    let size = input_size as usize;
    let img = DynamicImage::ImageRgb8(frame.image.clone()).resize_exact(
        input_size,
        input_size,
        FilterType::CatmullRom,
    );

    let mut input = Array::zeros((1, 3, size, size));
    for (x, y, pixel) in img.pixels() {
        let (x, y) = (x as usize, y as usize);
        let [r, g, b, _] = pixel.0;
        input[[0, 0, y, x]] = (r as f32) / 255.;
        input[[0, 1, y, x]] = (g as f32) / 255.;
        input[[0, 2, y, x]] = (b as f32) / 255.;
    }
    input
}

/// YOLOv8-style detector served by ONNX Runtime, one session per worker.
pub struct OnnxEngine {
    sessions: Vec<Mutex<Session>>,
    counter: AtomicUsize,
    labels: Vec<String>,
    input_size: u32,
    iou_threshold: f32,
    name: String,
}

impl OnnxEngine {
    pub fn new(config: &InferenceConfig) -> anyhow::Result<Self> {
        let model_path = config
            .model_path
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("inference.model_path is required for the onnx backend"))?;

        let labels = match &config.labels_path {
            Some(path) => load_labels(path)?,
            None => Vec::new(),
        };

        let sessions = (0..config.workers.max(1))
            .map(|_| {
                let session = Session::builder()?
                    .with_optimization_level(GraphOptimizationLevel::Level3)?
                    .commit_from_file(model_path)?;
                Ok(Mutex::new(session))
            })
            .collect::<Result<Vec<_>, ort::Error>>()?;

        tracing::info!(
            "Created {} ONNX sessions for {:?} ({} labels)",
            sessions.len(),
            model_path,
            labels.len()
        );

        let name = model_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("onnx")
            .to_string();

        Ok(Self {
            sessions,
            counter: AtomicUsize::new(0),
            labels,
            input_size: config.input_size,
            iou_threshold: config.iou_threshold,
            name,
        })
    }

    fn run_inference(&self, input: &Array<f32, Ix4>) -> Result<ndarray::ArrayD<f32>, InferenceError> {
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % self.sessions.len();
        let mut session = self.sessions[index].lock();
        tracing::debug!("Handling frame with session {}", index);

        let tensor_ref = TensorRef::from_array_view(input.view())
            .map_err(|e| InferenceError::Backend(format!("failed to build tensor: {}", e)))?;

        let outputs = session
            .run(ort::inputs![tensor_ref])
            .map_err(|e| InferenceError::Backend(format!("inference failed: {}", e)))?;

        let (shape, data) = outputs["output0"]
            .try_extract_tensor::<f32>()
            .map_err(|e| InferenceError::Backend(format!("failed to extract tensor: {}", e)))?;

        ndarray::ArrayD::from_shape_vec(shape.to_ixdyn(), data.to_vec())
            .map_err(|e| InferenceError::Backend(format!("invalid tensor shape: {}", e)))
    }

    fn label(&self, class_id: usize) -> String {
        self.labels
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", class_id))
    }
}

impl InferenceEngine for OnnxEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_loaded(&self) -> bool {
        !self.sessions.is_empty()
    }

    fn detect(
        &self,
        frame: &Frame,
        threshold: f32,
        classes: Option<&[u32]>,
    ) -> Result<Vec<Detection>, InferenceError> {
        let input = frame_to_input(frame, self.input_size);
        let outputs = self.run_inference(&input)?;

        // [1, 4 + classes, anchors] -> [anchors, 4 + classes]
        let outputs = outputs.t();
        let output = outputs.slice(s![.., .., 0]);
        let size = self.input_size as f32;

        let mut candidates = Vec::new();
        for row in output.axis_iter(Axis(0)) {
            let row: Vec<f32> = row.iter().copied().collect();
            let best = row
                .iter()
                .skip(4)
                .copied()
                .enumerate()
                .reduce(|best, next| if next.1 > best.1 { next } else { best });
            let Some((class_id, confidence)) = best else {
                continue;
            };
            if confidence < threshold {
                continue;
            }

            let (xc, yc, w, h) = (row[0], row[1], row[2], row[3]);
            candidates.push(Candidate {
                class_id,
                confidence,
                x1: xc - w / 2.,
                y1: yc - h / 2.,
                x2: xc + w / 2.,
                y2: yc + h / 2.,
            });
        }

        let detections = non_max_suppression(candidates, self.iou_threshold)
            .into_iter()
            .map(|c| Detection {
                class_id: c.class_id as u32,
                class_name: self.label(c.class_id),
                confidence: c.confidence,
                bounding_box: BoundingBox::from_corners(c.x1, c.y1, c.x2, c.y2, size, size),
            })
            .filter(|d| passes_filters(d, threshold, classes))
            .collect();

        Ok(detections)
    }
}
