use serde::{Deserialize, Serialize};

/// Name emitted for a face whose best distance does not clear the threshold.
pub const UNKNOWN_NAME: &str = "Unknown";

/// Axis-aligned face bounding box in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Detector score; backends without a score report 1.0.
    pub confidence: f32,
}

impl FaceBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height, confidence: 1.0 }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Convert to the `(top, right, bottom, left)` convention used in results.
    pub fn location(&self) -> FaceLocation {
        FaceLocation {
            top: self.y,
            right: self.x + self.width,
            bottom: self.y + self.height,
            left: self.x,
        }
    }
}

/// Face position as `(top, right, bottom, left)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceLocation {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
}

/// Per-face outcome of one recognition call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recognition {
    pub location: FaceLocation,
    pub name: String,
    /// Raw classifier distance. Lower = more similar.
    pub distance: f32,
    /// Display confidence, `max(0, 100 - distance)`.
    pub confidence: f32,
}

impl Recognition {
    pub fn is_known(&self) -> bool {
        self.name != UNKNOWN_NAME
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Scale to unit length. Zero vectors are left untouched.
    pub fn normalized(mut self) -> Self {
        let norm: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in self.values.iter_mut() {
                *v /= norm;
            }
        }
        self
    }
}
