//! Face detection capability and its SCRFD backend.
//!
//! The pipeline only depends on [`FaceDetector`]; [`ScrfdDetector`] runs the
//! SCRFD model (3-stride anchor-free decoding + NMS) through ONNX Runtime.

use crate::types::FaceBox;
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (expected det_10g.onnx in the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// "Find every face in this grayscale image."
///
/// Boxes smaller than `min_size` in either dimension are dropped. Order is
/// backend-defined but stable for a given input.
pub trait FaceDetector: Send + Sync {
    fn detect(&self, gray: &GrayImage, min_size: u32) -> Result<Vec<FaceBox>, DetectorError>;
}

/// The box with the largest area, first one winning ties.
pub fn largest_face(faces: &[FaceBox]) -> Option<&FaceBox> {
    faces.iter().fold(None, |best: Option<&FaceBox>, f| match best {
        Some(b) if b.area() >= f.area() => Some(b),
        _ => Some(f),
    })
}

/// Detection in letterboxed model space, before clamping to the frame.
#[derive(Debug, Clone, Copy)]
struct RawDetection {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type StrideOutputIndices = (usize, usize);

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    session: Mutex<Session>,
    stride_indices: [StrideOutputIndices; 3],
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        tracing::info!(path = %model_path.display(), outputs = ?output_names, "loaded SCRFD model");

        // Score + bbox per stride; keypoint heads may be present but are unused.
        if output_names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires at least 6 outputs (3 strides × score/bbox), got {}",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session: Mutex::new(session),
            stride_indices,
        })
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(&self, gray: &GrayImage, min_size: u32) -> Result<Vec<FaceBox>, DetectorError> {
        let (width, height) = gray.dimensions();
        if width == 0 || height == 0 {
            return Ok(Vec::new());
        }
        let (input, letterbox) = preprocess(gray);

        let mut session = self
            .session
            .lock()
            .map_err(|_| DetectorError::InferenceFailed("detector session poisoned".into()))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut all = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_indices[pos];
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;
            all.extend(decode_stride(scores, bboxes, stride, &letterbox, SCRFD_CONFIDENCE_THRESHOLD));
        }

        let faces: Vec<FaceBox> = nms(all, SCRFD_NMS_THRESHOLD)
            .into_iter()
            .filter_map(|d| to_face_box(&d, width, height))
            .filter(|f| f.width >= min_size && f.height >= min_size)
            .collect();

        tracing::trace!(count = faces.len(), min_size, "SCRFD detections");
        Ok(faces)
    }
}

/// Letterbox a grayscale frame into a 640×640 NCHW tensor, replicating the
/// single channel into all three.
fn preprocess(gray: &GrayImage) -> (Array4<f32>, LetterboxInfo) {
    let (width, height) = gray.dimensions();
    let size = SCRFD_INPUT_SIZE as f32;
    let scale = (size / width as f32).min(size / height as f32);

    let new_w = ((width as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE as u32);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE as u32);
    let pad_x = (size - new_w as f32) / 2.0;
    let pad_y = (size - new_h as f32) / 2.0;

    let resized = imageops::resize(gray, new_w, new_h, FilterType::Triangle);
    let x0 = pad_x.floor() as usize;
    let y0 = pad_y.floor() as usize;

    // Padding uses the mean so it normalizes to 0.0.
    let mut tensor = Array4::<f32>::zeros((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE));
    for (x, y, px) in resized.enumerate_pixels() {
        let ty = y0 + y as usize;
        let tx = x0 + x as usize;
        let v = (px[0] as f32 - SCRFD_MEAN) / SCRFD_STD;
        tensor[[0, 0, ty, tx]] = v;
        tensor[[0, 1, ty, tx]] = v;
        tensor[[0, 2, ty, tx]] = v;
    }

    (tensor, LetterboxInfo { scale, pad_x, pad_y })
}

/// Map tensor names (`score_8`, `bbox_16`, ...) to stride slots, falling back
/// to the standard positional order `[scores 8/16/32, bboxes 8/16/32, ...]`.
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let mut named = [(0usize, 0usize); 3];
    for (slot, &stride) in named.iter_mut().zip(SCRFD_STRIDES.iter()) {
        match (find("score", stride), find("bbox", stride)) {
            (Some(s), Some(b)) => *slot = (s, b),
            _ => {
                tracing::info!(?names, "SCRFD: output names not recognized, using positional mapping");
                return [(0, 3), (1, 4), (2, 5)];
            }
        }
    }
    named
}

/// Decode detections for a single stride level into letterbox-free coordinates.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<RawDetection> {
    let grid = SCRFD_INPUT_SIZE / stride;
    let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    let mut detections = Vec::new();
    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }
        let off = idx * 4;
        if off + 3 >= bboxes.len() {
            continue;
        }

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let ax = (cell % grid) as f32 * s;
        let ay = (cell / grid) as f32 * s;

        let unletterbox = |v: f32, pad: f32| (v - pad) / letterbox.scale;
        detections.push(RawDetection {
            x1: unletterbox(ax - bboxes[off] * s, letterbox.pad_x),
            y1: unletterbox(ay - bboxes[off + 1] * s, letterbox.pad_y),
            x2: unletterbox(ax + bboxes[off + 2] * s, letterbox.pad_x),
            y2: unletterbox(ay + bboxes[off + 3] * s, letterbox.pad_y),
            score,
        });
    }
    detections
}

/// Clamp a raw detection to the frame; `None` if nothing is left.
fn to_face_box(d: &RawDetection, width: u32, height: u32) -> Option<FaceBox> {
    let x1 = d.x1.max(0.0).round() as u32;
    let y1 = d.y1.max(0.0).round() as u32;
    let x2 = (d.x2.max(0.0).round() as u32).min(width);
    let y2 = (d.y2.max(0.0).round() as u32).min(height);
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some(FaceBox {
        x: x1,
        y: y1,
        width: x2 - x1,
        height: y2 - y1,
        confidence: d.score,
    })
}

/// Non-Maximum Suppression; output is sorted by descending score.
fn nms(mut detections: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
    detections.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let mut keep: Vec<RawDetection> = Vec::new();
    for d in detections {
        if keep.iter().all(|k| iou(k, &d) <= iou_threshold) {
            keep.push(d);
        }
    }
    keep
}

fn iou(a: &RawDetection, b: &RawDetection) -> f32 {
    let inter_w = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let inter_h = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter = inter_w * inter_h;
    let union = (a.x2 - a.x1) * (a.y2 - a.y1) + (b.x2 - b.x1) * (b.y2 - b.y1) - inter;
    if union > 0.0 { inter / union } else { 0.0 }
}
