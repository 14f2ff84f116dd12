//! The train/recognize pipeline with a double-buffered model.
//!
//! A retrain builds a complete [`ModelState`] off to the side and only swaps
//! the active `Arc` once the classifier accepted the samples. Recognition
//! clones the active `Arc` under a short read lock, so it never observes a
//! half-trained model and never waits on training.

use crate::dataset::DatasetLoader;
use crate::detector::{DetectorError, FaceDetector};
use crate::imaging;
use crate::recognizer::{ClassifierError, ClassifierFactory, FaceClassifier};
use crate::settings::{ConfigError, Settings, SettingsUpdate};
use crate::stats::{LoadReport, TrainingStatistics, TrainingSummary};
use crate::types::{Recognition, UNKNOWN_NAME};
use image::DynamicImage;
use rand::Rng;
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("no training data found in {path}")]
    NoTrainingData { path: String, report: LoadReport },
    #[error("classifier rejected the training set: {0}")]
    Classifier(#[from] ClassifierError),
}

#[derive(Error, Debug)]
pub enum RecognizeError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("classifier error: {0}")]
    Classifier(#[from] ClassifierError),
}

/// One published model: names, the classifier that maps regions to their
/// indices, and the statistics of the run that produced it.
#[derive(Clone, Default)]
pub struct ModelState {
    pub is_trained: bool,
    pub known_names: Vec<String>,
    pub classifier: Option<Arc<dyn FaceClassifier>>,
    pub statistics: Option<TrainingStatistics>,
}

/// Snapshot returned by [`FacePipeline::model_info`].
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub is_trained: bool,
    pub known_faces: Vec<String>,
    pub total_people: usize,
    pub confidence_threshold: f32,
    pub use_augmentation: bool,
    pub augmentation_factor: u32,
    pub min_face_size: u32,
    pub face_size_normalized: u32,
    pub training_stats: Option<TrainingStatistics>,
}

pub struct FacePipeline {
    detector: Arc<dyn FaceDetector>,
    classifiers: Box<dyn ClassifierFactory>,
    settings: RwLock<Settings>,
    active: RwLock<Arc<ModelState>>,
    train_lock: Mutex<()>,
}

impl FacePipeline {
    pub fn new(
        detector: Arc<dyn FaceDetector>,
        classifiers: Box<dyn ClassifierFactory>,
        settings: Settings,
    ) -> Self {
        Self {
            detector,
            classifiers,
            settings: RwLock::new(settings),
            active: RwLock::new(Arc::new(ModelState::default())),
            train_lock: Mutex::new(()),
        }
    }

    fn current(&self) -> Arc<ModelState> {
        self.active.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn publish(&self, state: ModelState) {
        *self.active.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(state);
    }

    pub fn settings(&self) -> Settings {
        self.settings.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Validate and apply a partial update. Takes effect on the next
    /// recognition or training run; the serving model is not retrained.
    pub fn update_config(&self, update: &SettingsUpdate) -> Result<Settings, ConfigError> {
        let mut settings = self.settings.write().unwrap_or_else(PoisonError::into_inner);
        settings.apply(update)?;
        tracing::info!(
            confidence_threshold = settings.confidence_threshold,
            use_augmentation = settings.use_augmentation,
            augmentation_factor = settings.augmentation_factor,
            "settings updated"
        );
        Ok(settings.clone())
    }

    pub fn train(&self, root: &Path) -> Result<TrainingStatistics, TrainError> {
        self.train_with(root, &mut rand::thread_rng())
    }

    /// Rebuild the model from `root`. Concurrent calls are serialized.
    ///
    /// With no usable samples the pipeline reports itself untrained. If the
    /// classifier rejects the samples, the previous model keeps serving.
    pub fn train_with<R: Rng + ?Sized>(
        &self,
        root: &Path,
        rng: &mut R,
    ) -> Result<TrainingStatistics, TrainError> {
        let _guard = self.train_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let settings = self.settings();

        tracing::info!(path = %root.display(), "training started");
        let dataset = DatasetLoader::new(self.detector.as_ref(), &settings).load(root, rng);

        if dataset.is_empty() {
            tracing::error!(path = %root.display(), "no training data found");
            let previous = self.current();
            self.publish(ModelState { is_trained: false, ..(*previous).clone() });
            return Err(TrainError::NoTrainingData {
                path: root.display().to_string(),
                report: dataset.report,
            });
        }

        let mut classifier = self.classifiers.create();
        if let Err(e) = classifier.train(&dataset.samples, &dataset.labels) {
            tracing::error!(error = %e, "classifier training failed; keeping previous model");
            return Err(e.into());
        }

        let statistics = TrainingStatistics::compile(
            &dataset.counts,
            settings.use_augmentation,
            settings.augmentation_factor,
            dataset.report,
        );

        tracing::info!(
            faces = statistics.total_faces,
            people = statistics.total_people,
            originals = statistics.original_count,
            augmented = statistics.augmented_count,
            "training complete"
        );
        for (name, p) in &statistics.quality_assessment {
            tracing::info!(
                person = %name,
                original = p.original_images,
                total = p.total_images,
                quality = %p.quality,
                "person trained"
            );
        }

        self.publish(ModelState {
            is_trained: true,
            known_names: dataset.counts.keys().cloned().collect(),
            classifier: Some(Arc::from(classifier)),
            statistics: Some(statistics.clone()),
        });
        Ok(statistics)
    }

    /// Locate and name every face in `image`, in detector order.
    ///
    /// Untrained pipelines return an empty list without running detection.
    pub fn recognize(&self, image: &DynamicImage) -> Result<Vec<Recognition>, RecognizeError> {
        let state = self.current();
        let (true, Some(classifier)) = (state.is_trained, state.classifier.as_ref()) else {
            return Ok(Vec::new());
        };
        let settings = self.settings();

        let gray = imaging::to_grayscale(image);
        let faces = self.detector.detect(&gray, settings.detect_min_face)?;

        let mut results = Vec::with_capacity(faces.len());
        for face in &faces {
            let region = imaging::crop_region(&gray, face, settings.region_size);
            let prediction = classifier.predict(&region)?;

            let name = match state.known_names.get(prediction.label) {
                Some(name) if prediction.distance < settings.confidence_threshold => name.clone(),
                _ => UNKNOWN_NAME.to_string(),
            };
            let confidence = (100.0 - prediction.distance).max(0.0);
            tracing::debug!(
                name = %name,
                distance = prediction.distance,
                confidence,
                "face classified"
            );

            results.push(Recognition {
                location: face.location(),
                name,
                distance: prediction.distance,
                confidence,
            });
        }
        Ok(results)
    }

    pub fn is_trained(&self) -> bool {
        self.current().is_trained
    }

    pub fn known_faces(&self) -> Vec<String> {
        self.current().known_names.clone()
    }

    pub fn model_info(&self) -> ModelInfo {
        let state = self.current();
        let settings = self.settings();
        ModelInfo {
            is_trained: state.is_trained,
            known_faces: state.known_names.clone(),
            total_people: state.known_names.len(),
            confidence_threshold: settings.confidence_threshold,
            use_augmentation: settings.use_augmentation,
            augmentation_factor: settings.augmentation_factor,
            min_face_size: settings.train_min_face,
            face_size_normalized: settings.region_size,
            training_stats: state.statistics.clone(),
        }
    }

    /// `None` while untrained.
    pub fn training_summary(&self) -> Option<TrainingSummary> {
        let state = self.current();
        if !state.is_trained {
            return None;
        }
        state.statistics.as_ref().map(TrainingSummary::from_statistics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognizer::Prediction;
    use crate::stats::QualityTier;
    use crate::types::FaceBox;
    use image::{GrayImage, Luma};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    /// Faces are marked by 40×40 bright squares drawn on a black canvas;
    /// one face per square, in left-to-right order.
    struct SquareDetector;

    impl FaceDetector for SquareDetector {
        fn detect(&self, gray: &GrayImage, _min_size: u32) -> Result<Vec<FaceBox>, DetectorError> {
            let (w, h) = gray.dimensions();
            let mut faces = Vec::new();
            let mut x = 0;
            while x < w {
                let hit = (0..h).find(|&y| gray.get_pixel(x, y)[0] > 0);
                match hit {
                    Some(y) => {
                        faces.push(FaceBox::new(x, y, 40.min(w - x), 40.min(h - y)));
                        x += 40;
                    }
                    None => x += 1,
                }
            }
            Ok(faces)
        }
    }

    /// Distance is the region's mean brightness, label is always 0.
    struct BrightnessClassifier;

    impl FaceClassifier for BrightnessClassifier {
        fn train(&mut self, regions: &[GrayImage], _labels: &[usize]) -> Result<(), ClassifierError> {
            if regions.is_empty() {
                return Err(ClassifierError::InvalidTrainingSet("no samples".into()));
            }
            Ok(())
        }

        fn predict(&self, region: &GrayImage) -> Result<Prediction, ClassifierError> {
            let n = region.len().max(1) as f32;
            let mean = region.pixels().map(|p| p[0] as f32).sum::<f32>() / n;
            Ok(Prediction { label: 0, distance: mean })
        }
    }

    struct RejectingClassifier;

    impl FaceClassifier for RejectingClassifier {
        fn train(&mut self, _: &[GrayImage], _: &[usize]) -> Result<(), ClassifierError> {
            Err(ClassifierError::InvalidTrainingSet("rejected".into()))
        }

        fn predict(&self, _: &GrayImage) -> Result<Prediction, ClassifierError> {
            Err(ClassifierError::NotTrained)
        }
    }

    /// Like `BrightnessClassifier`, but `train` parks until the test lets it go.
    struct GatedClassifier {
        entered: Arc<Barrier>,
        release: Arc<Barrier>,
    }

    impl FaceClassifier for GatedClassifier {
        fn train(&mut self, _: &[GrayImage], _: &[usize]) -> Result<(), ClassifierError> {
            self.entered.wait();
            self.release.wait();
            Ok(())
        }

        fn predict(&self, region: &GrayImage) -> Result<Prediction, ClassifierError> {
            BrightnessClassifier.predict(region)
        }
    }

    fn pipeline() -> FacePipeline {
        let factory = || -> Box<dyn FaceClassifier> { Box::new(BrightnessClassifier) };
        FacePipeline::new(Arc::new(SquareDetector), Box::new(factory), Settings::default())
    }

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("roster-pipeline-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// 120×120 photo with one 60×60 face-like square in the middle.
    fn write_photo(path: &Path, value: u8) {
        let mut img = GrayImage::new(120, 120);
        for y in 30..90 {
            for x in 30..90 {
                img.put_pixel(x, y, Luma([value]));
            }
        }
        img.save(path).unwrap();
    }

    /// Frame with one square per value, spaced 60 px apart.
    fn frame(values: &[u8]) -> DynamicImage {
        let mut img = GrayImage::new(60 * values.len() as u32 + 20, 80);
        for (i, &v) in values.iter().enumerate() {
            let x0 = 10 + 60 * i as u32;
            for y in 20..60 {
                for x in x0..x0 + 40 {
                    img.put_pixel(x, y, Luma([v]));
                }
            }
        }
        DynamicImage::ImageLuma8(img)
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(5)
    }

    fn trained_pipeline(root: &Path) -> FacePipeline {
        let p = pipeline();
        std::fs::create_dir_all(root.join("person_name")).unwrap();
        write_photo(&root.join("person_name").join("1.png"), 200);
        p.train_with(root, &mut rng()).unwrap();
        p
    }

    #[test]
    fn test_untrained_recognize_is_empty() {
        let p = pipeline();
        assert!(!p.is_trained());
        assert!(p.recognize(&frame(&[50])).unwrap().is_empty());
        assert!(p.training_summary().is_none());
    }

    #[test]
    fn test_train_single_folder() {
        let root = scratch_dir();
        std::fs::create_dir(root.join("person_name")).unwrap();
        write_photo(&root.join("person_name").join("a.png"), 200);
        write_photo(&root.join("person_name").join("b.png"), 180);

        let p = pipeline();
        let stats = p.train_with(&root, &mut rng()).unwrap();

        assert!(p.is_trained());
        assert_eq!(p.known_faces(), vec!["Person Name"]);
        assert_eq!(stats.total_faces, 6);
        assert_eq!(stats.original_count, 2);
        assert_eq!(stats.augmented_count, 4);
        assert_eq!(stats.quality_assessment["Person Name"].quality, QualityTier::Good);

        let summary = p.training_summary().unwrap();
        assert_eq!(summary.quality_assessment["Person Name"].augmentation_factor, 3);

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_missing_root_fails_untrained() {
        let p = pipeline();
        let err = p.train_with(Path::new("/no/such/dataset"), &mut rng()).unwrap_err();
        assert!(matches!(err, TrainError::NoTrainingData { .. }));
        assert!(!p.is_trained());
    }

    #[test]
    fn test_empty_retrain_marks_untrained() {
        let root = scratch_dir();
        let p = trained_pipeline(&root);
        assert!(p.is_trained());

        let empty = scratch_dir();
        assert!(p.train_with(&empty, &mut rng()).is_err());
        assert!(!p.is_trained());
        assert!(p.recognize(&frame(&[10])).unwrap().is_empty());

        std::fs::remove_dir_all(&root).unwrap();
        std::fs::remove_dir_all(&empty).unwrap();
    }

    #[test]
    fn test_known_and_unknown_in_detection_order() {
        let root = scratch_dir();
        let p = trained_pipeline(&root);

        // Brightness doubles as distance: 50 clears the threshold, 150 does not.
        let results = p.recognize(&frame(&[50, 150])).unwrap();
        let names: Vec<&str> = results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Person Name", UNKNOWN_NAME]);
        assert!(results[0].location.left < results[1].location.left);
        assert_eq!(results[0].location.top, 20);
        assert_eq!(results[0].location.right - results[0].location.left, 40);
        assert!((results[0].confidence - 50.0).abs() < 1.0);
        assert_eq!(results[1].confidence, 0.0);

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_distance_equal_to_threshold_is_unknown() {
        let root = scratch_dir();
        let p = trained_pipeline(&root);

        let results = p.recognize(&frame(&[100])).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].distance, 100.0);
        assert_eq!(results[0].name, UNKNOWN_NAME);

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_threshold_update_applies_to_next_recognition() {
        let root = scratch_dir();
        let p = trained_pipeline(&root);

        let update = SettingsUpdate { confidence_threshold: Some(160.0), ..Default::default() };
        p.update_config(&update).unwrap();
        let results = p.recognize(&frame(&[150])).unwrap();
        assert_eq!(results[0].name, "Person Name");

        let bad = SettingsUpdate { confidence_threshold: Some(-1.0), ..Default::default() };
        assert!(p.update_config(&bad).is_err());
        assert_eq!(p.settings().confidence_threshold, 160.0);

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_classifier_failure_keeps_previous_model() {
        let root = scratch_dir();
        let trained = trained_pipeline(&root);
        let stats_before = trained.model_info().training_stats;

        // Same published state, but every later retrain is rejected.
        let p = FacePipeline::new(
            Arc::new(SquareDetector),
            Box::new(|| -> Box<dyn FaceClassifier> { Box::new(RejectingClassifier) }),
            Settings::default(),
        );
        p.publish((*trained.current()).clone());

        std::fs::create_dir(root.join("other")).unwrap();
        write_photo(&root.join("other").join("1.png"), 90);
        let err = p.train_with(&root, &mut rng()).unwrap_err();
        assert!(matches!(err, TrainError::Classifier(_)));

        assert!(p.is_trained());
        assert_eq!(p.known_faces(), vec!["Person Name"]);
        assert_eq!(p.model_info().training_stats, stats_before);
        assert_eq!(p.recognize(&frame(&[30])).unwrap()[0].name, "Person Name");

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_recognize_serves_previous_model_during_retrain() {
        let root = scratch_dir();
        std::fs::create_dir(root.join("person_name")).unwrap();
        write_photo(&root.join("person_name").join("1.png"), 200);

        // The first run trains straight through; every later run blocks.
        let entered = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));
        let created = AtomicUsize::new(0);
        let (e, r) = (Arc::clone(&entered), Arc::clone(&release));
        let factory = move || -> Box<dyn FaceClassifier> {
            if created.fetch_add(1, Ordering::SeqCst) == 0 {
                Box::new(BrightnessClassifier)
            } else {
                Box::new(GatedClassifier { entered: Arc::clone(&e), release: Arc::clone(&r) })
            }
        };
        let p = Arc::new(FacePipeline::new(
            Arc::new(SquareDetector),
            Box::new(factory),
            Settings::default(),
        ));
        p.train_with(&root, &mut rng()).unwrap();

        let second = scratch_dir();
        write_photo(&second.join("zoe_1.png"), 120);
        let trainer = {
            let p = Arc::clone(&p);
            let second = second.clone();
            std::thread::spawn(move || p.train_with(&second, &mut rng()).map(|s| s.total_people))
        };

        entered.wait();
        assert!(p.is_trained());
        assert_eq!(p.known_faces(), vec!["Person Name"]);
        assert_eq!(p.recognize(&frame(&[50])).unwrap()[0].name, "Person Name");

        release.wait();
        assert_eq!(trainer.join().unwrap().unwrap(), 1);
        assert_eq!(p.known_faces(), vec!["Zoe"]);
        assert_eq!(p.recognize(&frame(&[50])).unwrap()[0].name, "Zoe");

        std::fs::remove_dir_all(&root).unwrap();
        std::fs::remove_dir_all(&second).unwrap();
    }

    #[test]
    fn test_retrain_replaces_names() {
        let root = scratch_dir();
        let p = trained_pipeline(&root);

        let second = scratch_dir();
        write_photo(&second.join("zoe_1.png"), 120);
        write_photo(&second.join("adam_1.png"), 120);
        let stats = p.train_with(&second, &mut rng()).unwrap();

        assert_eq!(p.known_faces(), vec!["Adam", "Zoe"]);
        assert_eq!(stats.total_people, 2);
        assert!(!stats.quality_assessment.contains_key("Person Name"));

        std::fs::remove_dir_all(&root).unwrap();
        std::fs::remove_dir_all(&second).unwrap();
    }

    #[test]
    fn test_model_info_reflects_settings() {
        let p = pipeline();
        p.update_config(&SettingsUpdate { use_augmentation: Some(false), ..Default::default() })
            .unwrap();
        let info = p.model_info();
        assert!(!info.is_trained);
        assert_eq!(info.total_people, 0);
        assert!(!info.use_augmentation);
        assert_eq!(info.face_size_normalized, 100);
        assert!(info.training_stats.is_none());

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["confidence_threshold"], 100.0);
    }

    #[test]
    fn test_labels_stable_across_identical_runs() {
        let root = scratch_dir();
        for name in ["carol", "alice", "bob"] {
            std::fs::create_dir(root.join(name)).unwrap();
            write_photo(&root.join(name).join("1.png"), 100);
        }
        let a = pipeline();
        let b = pipeline();
        a.train_with(&root, &mut rng()).unwrap();
        b.train_with(&root, &mut StdRng::seed_from_u64(99)).unwrap();
        assert_eq!(a.known_faces(), vec!["Alice", "Bob", "Carol"]);
        assert_eq!(a.known_faces(), b.known_faces());

        std::fs::remove_dir_all(&root).unwrap();
    }
}
