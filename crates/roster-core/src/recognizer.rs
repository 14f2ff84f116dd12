//! Face classification capability and its embedding-gallery backend.
//!
//! [`FaceClassifier`] is what the pipeline trains and queries. The shipped
//! backend, [`EmbeddingClassifier`], embeds every training region with ArcFace
//! (w600k_r50 via ONNX Runtime) and answers queries with the nearest gallery
//! entry.

use crate::types::Embedding;
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
const ARCFACE_EMBEDDING_DIM: usize = 512;

/// Gallery distances are Euclidean distances between unit embeddings (0..=2)
/// scaled by this factor, so a threshold of 100 means cosine similarity 0.5.
pub const DISTANCE_SCALE: f32 = 100.0;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("model file not found: {0} (expected w600k_r50.onnx in the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("training set rejected: {0}")]
    InvalidTrainingSet(String),
    #[error("classifier has not been trained")]
    NotTrained,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Best label for a region and how far it is from that label's samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub label: usize,
    /// Lower = more similar.
    pub distance: f32,
}

/// "Learn these labeled regions; tell me who this region looks like."
pub trait FaceClassifier: Send + Sync {
    fn train(&mut self, regions: &[GrayImage], labels: &[usize]) -> Result<(), ClassifierError>;
    fn predict(&self, region: &GrayImage) -> Result<Prediction, ClassifierError>;
}

/// Builds fresh, untrained classifiers so a retrain never touches the one
/// currently serving.
pub trait ClassifierFactory: Send + Sync {
    fn create(&self) -> Box<dyn FaceClassifier>;
}

impl<F> ClassifierFactory for F
where
    F: Fn() -> Box<dyn FaceClassifier> + Send + Sync,
{
    fn create(&self) -> Box<dyn FaceClassifier> {
        self()
    }
}

/// Turns a normalized face region into an embedding.
pub trait Embedder: Send + Sync {
    fn embed(&self, region: &GrayImage) -> Result<Embedding, ClassifierError>;
}

/// ArcFace embedding extractor.
pub struct ArcFaceEmbedder {
    session: Mutex<Session>,
}

impl ArcFaceEmbedder {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, ClassifierError> {
        if !model_path.exists() {
            return Err(ClassifierError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session: Mutex::new(session) })
    }

    /// Resize to 112×112 and build a normalized NCHW tensor with the gray
    /// channel replicated into R, G and B.
    fn preprocess(region: &GrayImage) -> Array4<f32> {
        let size = ARCFACE_INPUT_SIZE;
        let resized = if region.dimensions() == (size, size) {
            region.clone()
        } else {
            imageops::resize(region, size, size, FilterType::Triangle)
        };

        let n = size as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, n, n));
        for (x, y, px) in resized.enumerate_pixels() {
            let v = (px[0] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
            let (x, y) = (x as usize, y as usize);
            tensor[[0, 0, y, x]] = v;
            tensor[[0, 1, y, x]] = v;
            tensor[[0, 2, y, x]] = v;
        }
        tensor
    }
}

impl Embedder for ArcFaceEmbedder {
    fn embed(&self, region: &GrayImage) -> Result<Embedding, ClassifierError> {
        let input = Self::preprocess(region);

        let mut session = self
            .session
            .lock()
            .map_err(|_| ClassifierError::InferenceFailed("embedder session poisoned".into()))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ClassifierError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(ClassifierError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding { values: raw.to_vec() }.normalized())
    }
}

/// Labeled embeddings with nearest-neighbour lookup.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    entries: Vec<(usize, Embedding)>,
}

impl Gallery {
    pub fn push(&mut self, label: usize, embedding: Embedding) {
        self.entries.push((label, embedding));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Closest entry to `query`. Every entry is visited; ties keep the
    /// earlier one.
    pub fn nearest(&self, query: &Embedding) -> Option<Prediction> {
        let mut best: Option<Prediction> = None;
        for (label, emb) in &self.entries {
            let distance = query.euclidean_distance(emb) * DISTANCE_SCALE;
            if best.map_or(true, |b| distance < b.distance) {
                best = Some(Prediction { label: *label, distance });
            }
        }
        best
    }
}

/// Nearest-neighbour classifier over embeddings from a shared [`Embedder`].
pub struct EmbeddingClassifier<E: Embedder> {
    embedder: Arc<E>,
    gallery: Gallery,
}

impl<E: Embedder> EmbeddingClassifier<E> {
    pub fn new(embedder: Arc<E>) -> Self {
        Self { embedder, gallery: Gallery::default() }
    }

    pub fn gallery(&self) -> &Gallery {
        &self.gallery
    }
}

impl<E: Embedder> FaceClassifier for EmbeddingClassifier<E> {
    fn train(&mut self, regions: &[GrayImage], labels: &[usize]) -> Result<(), ClassifierError> {
        if regions.is_empty() {
            return Err(ClassifierError::InvalidTrainingSet("no samples".into()));
        }
        if regions.len() != labels.len() {
            return Err(ClassifierError::InvalidTrainingSet(format!(
                "{} regions but {} labels",
                regions.len(),
                labels.len()
            )));
        }

        let mut gallery = Gallery::default();
        for (region, &label) in regions.iter().zip(labels) {
            gallery.push(label, self.embedder.embed(region)?);
        }
        tracing::debug!(entries = gallery.len(), "embedding gallery built");
        self.gallery = gallery;
        Ok(())
    }

    fn predict(&self, region: &GrayImage) -> Result<Prediction, ClassifierError> {
        if self.gallery.is_empty() {
            return Err(ClassifierError::NotTrained);
        }
        let query = self.embedder.embed(region)?;
        self.gallery.nearest(&query).ok_or(ClassifierError::NotTrained)
    }
}
