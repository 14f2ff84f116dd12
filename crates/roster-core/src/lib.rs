//! roster-core: face enrollment and recognition pipeline.
//!
//! Builds a model from a directory of labeled photos (augmenting each face
//! region), then names every face found in new images. Detection and
//! classification are capabilities behind traits; the shipped backends run
//! SCRFD and ArcFace through ONNX Runtime.

pub mod augmentation;
pub mod dataset;
pub mod detector;
pub mod imaging;
pub mod pipeline;
pub mod recognizer;
pub mod registry;
pub mod settings;
pub mod stats;
pub mod types;

pub use detector::{FaceDetector, ScrfdDetector};
pub use pipeline::{FacePipeline, ModelInfo, RecognizeError, TrainError};
pub use recognizer::{ArcFaceEmbedder, ClassifierFactory, EmbeddingClassifier, FaceClassifier};
pub use registry::{PersonRecord, PersonRegistry};
pub use settings::{Settings, SettingsUpdate};
pub use types::{FaceBox, FaceLocation, Recognition, UNKNOWN_NAME};

use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

/// `$XDG_DATA_HOME/roster/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    data_dir().join("models")
}

/// `$XDG_DATA_HOME/roster`, falling back to `~/.local/share/roster`.
pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("roster")
}

#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    #[error("detector: {0}")]
    Detector(#[from] detector::DetectorError),
    #[error("classifier: {0}")]
    Classifier(#[from] recognizer::ClassifierError),
}

/// Build a pipeline backed by the ONNX models in `model_dir`.
pub fn load_onnx_pipeline(model_dir: &Path, settings: Settings) -> Result<FacePipeline, LoadError> {
    let detector = ScrfdDetector::load(&model_dir.join(SCRFD_MODEL_FILE))?;
    let embedder = Arc::new(ArcFaceEmbedder::load(&model_dir.join(ARCFACE_MODEL_FILE))?);
    let classifiers = move || -> Box<dyn FaceClassifier> {
        Box::new(EmbeddingClassifier::new(Arc::clone(&embedder)))
    };
    Ok(FacePipeline::new(Arc::new(detector), Box::new(classifiers), settings))
}
