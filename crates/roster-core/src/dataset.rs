//! Dataset discovery: turn a directory of photos into labeled face regions.
//!
//! Two layouts are read from the same root and may be mixed:
//!
//! ```text
//! root/alice_smith/1.jpg      folder layout  → "Alice Smith"
//! root/bob_02.png             flat layout    → "Bob"
//! ```
//!
//! Entries are visited in sorted order, folders before loose files, so
//! labels are reproducible for an unchanged dataset.

use crate::augmentation::Augmenter;
use crate::detector::{largest_face, FaceDetector};
use crate::imaging::{self, Rejection};
use crate::settings::Settings;
use crate::stats::{LoadReport, PersonCounts};
use image::GrayImage;
use indexmap::IndexMap;
use rand::Rng;
use std::path::{Path, PathBuf};

/// Directory names that never denote a person.
const IGNORED_ENTRIES: [&str; 2] = ["readme.md", "__pycache__"];

/// Labeled training material gathered from one dataset root.
///
/// A person's label is their index in `counts`; people only appear once at
/// least one region was collected for them.
#[derive(Debug, Default)]
pub struct Dataset {
    pub samples: Vec<GrayImage>,
    pub labels: Vec<usize>,
    pub counts: IndexMap<String, PersonCounts>,
    pub report: LoadReport,
}

impl Dataset {
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Display names in label order.
    pub fn names(&self) -> Vec<String> {
        self.counts.keys().cloned().collect()
    }

    fn push_person_regions(&mut self, name: &str, regions: Vec<GrayImage>) {
        let entry = self.counts.entry(name.to_string());
        let label = entry.index();
        let counts = entry.or_default();
        counts.original_images += 1;
        counts.total_images += regions.len();
        self.labels.extend(std::iter::repeat(label).take(regions.len()));
        self.samples.extend(regions);
    }
}

/// Python-style title case: the first letter of each alphabetic run is
/// upper-cased, the rest lower-cased.
pub fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_alpha = false;
    for c in s.chars() {
        if c.is_alphabetic() {
            if prev_alpha {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            prev_alpha = true;
        } else {
            out.push(c);
            prev_alpha = false;
        }
    }
    out
}

/// Display name for a person folder: underscores become spaces, then title case.
pub fn person_name_from_dir(dir_name: &str) -> String {
    title_case(&dir_name.replace('_', " "))
}

/// Display name for a loose file: the stem up to the first underscore.
pub fn person_name_from_file(file_name: &str) -> String {
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_name);
    let person = stem.split('_').next().unwrap_or(stem);
    title_case(person)
}

pub struct DatasetLoader<'a> {
    detector: &'a dyn FaceDetector,
    settings: &'a Settings,
    augmenter: Augmenter,
}

impl<'a> DatasetLoader<'a> {
    pub fn new(detector: &'a dyn FaceDetector, settings: &'a Settings) -> Self {
        Self {
            detector,
            settings,
            augmenter: Augmenter::new(settings.augmentation.clone()),
        }
    }

    /// Walk `root` and collect every usable face region.
    ///
    /// Never fails: a missing root yields an empty dataset, and each bad file
    /// is logged and tallied in [`Dataset::report`].
    pub fn load<R: Rng + ?Sized>(&self, root: &Path, rng: &mut R) -> Dataset {
        let mut dataset = Dataset::default();

        if !root.is_dir() {
            tracing::warn!(path = %root.display(), "dataset path does not exist");
            return dataset;
        }

        let (dirs, files) = match list_entries(root) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(path = %root.display(), error = %e, "cannot read dataset directory");
                return dataset;
            }
        };

        for (dir_name, dir_path) in dirs {
            let person = person_name_from_dir(&dir_name);
            let images = match list_entries(&dir_path) {
                Ok((_, images)) => images,
                Err(e) => {
                    tracing::error!(folder = %dir_name, error = %e, "cannot read person folder");
                    continue;
                }
            };
            for (_, path) in images {
                self.load_image(&mut dataset, &person, &path, rng);
            }
        }

        // Group loose files by person first so each person's photos stay together.
        let mut flat: IndexMap<String, Vec<PathBuf>> = IndexMap::new();
        for (file_name, path) in files {
            flat.entry(person_name_from_file(&file_name)).or_default().push(path);
        }
        for (person, paths) in flat {
            for path in paths {
                self.load_image(&mut dataset, &person, &path, rng);
            }
        }

        tracing::info!(
            faces = dataset.samples.len(),
            people = dataset.counts.len(),
            skipped = dataset.report.skipped(),
            "dataset loaded"
        );
        dataset
    }

    fn load_image<R: Rng + ?Sized>(&self, dataset: &mut Dataset, person: &str, path: &Path, rng: &mut R) {
        dataset.report.images_seen += 1;
        let file = path.file_name().map(|f| f.to_string_lossy()).unwrap_or_default();

        let Some(region) = self.extract_face(dataset, path) else {
            return;
        };

        let regions = self
            .augmenter
            .augment_with(&region, self.settings.effective_factor() as usize, rng);

        tracing::info!(
            person,
            file = %file,
            augmented = regions.len() - 1,
            "loaded face"
        );
        dataset.report.faces_loaded += 1;
        dataset.push_person_regions(person, regions);
    }

    /// Load, gate, and detect; returns the normalized region of the largest face.
    fn extract_face(&self, dataset: &mut Dataset, path: &Path) -> Option<GrayImage> {
        let image = match imaging::load(path) {
            Ok(img) => img,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable image");
                dataset.report.unreadable += 1;
                return None;
            }
        };

        // Oversized photos still train; only images too small to hold a face are dropped.
        match imaging::validate(Some(&image)) {
            Ok(()) | Err(Rejection::TooLarge { .. }) => {}
            Err(reason) => {
                tracing::warn!(path = %path.display(), %reason, "skipping image");
                dataset.report.invalid += 1;
                return None;
            }
        }

        let gray = imaging::to_grayscale(&image);
        let faces = match self.detector.detect(&gray, self.settings.train_min_face) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "face detection failed");
                dataset.report.detection_failed += 1;
                return None;
            }
        };

        let Some(face) = largest_face(&faces) else {
            tracing::warn!(path = %path.display(), "no face found");
            dataset.report.no_face += 1;
            return None;
        };

        Some(imaging::extract_region(
            &gray,
            face,
            self.settings.padding,
            self.settings.region_size,
        ))
    }
}

type Entries = Vec<(String, PathBuf)>;

/// Sorted person directories and supported image files directly under `dir`.
fn list_entries(dir: &Path) -> std::io::Result<(Entries, Entries)> {
    let mut dirs = Vec::new();
    let mut files = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();

        if path.is_dir() {
            let lower = name.to_lowercase();
            if name.starts_with('.') || IGNORED_ENTRIES.contains(&lower.as_str()) {
                continue;
            }
            dirs.push((name, path));
        } else if imaging::is_supported_image(&name) {
            files.push((name, path));
        }
    }

    dirs.sort();
    files.sort();
    Ok((dirs, files))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::DetectorError;
    use crate::types::FaceBox;
    use image::Luma;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Reports one centred face, or none for all-black images.
    struct CentreDetector;

    impl FaceDetector for CentreDetector {
        fn detect(&self, gray: &GrayImage, min_size: u32) -> Result<Vec<FaceBox>, DetectorError> {
            if gray.pixels().all(|p| p[0] == 0) {
                return Ok(vec![]);
            }
            let (w, h) = gray.dimensions();
            let side = w.min(h) / 2;
            let faces = vec![
                FaceBox::new(0, 0, min_size / 2, min_size / 2),
                FaceBox::new((w - side) / 2, (h - side) / 2, side, side),
            ];
            Ok(faces.into_iter().filter(|f| f.width >= min_size).collect())
        }
    }

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("roster-dataset-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_face(path: &Path, value: u8) {
        GrayImage::from_pixel(120, 120, Luma([value])).save(path).unwrap();
    }

    fn load(root: &Path, settings: &Settings) -> Dataset {
        DatasetLoader::new(&CentreDetector, settings).load(root, &mut StdRng::seed_from_u64(11))
    }

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("john doe"), "John Doe");
        assert_eq!(title_case("MARY ann"), "Mary Ann");
        assert_eq!(title_case("o'neil"), "O'Neil");
        assert_eq!(title_case("nguyễn văn"), "Nguyễn Văn");
        assert_eq!(title_case("agent007x"), "Agent007X");
    }

    #[test]
    fn test_person_names() {
        assert_eq!(person_name_from_dir("john_doe"), "John Doe");
        assert_eq!(person_name_from_file("alice_1.jpg"), "Alice");
        assert_eq!(person_name_from_file("alice_smith_2.png"), "Alice");
        assert_eq!(person_name_from_file("bob.png"), "Bob");
        assert_eq!(person_name_from_file("carol.v2.jpeg"), "Carol.V2");
    }

    #[test]
    fn test_missing_root_is_empty() {
        let ds = load(Path::new("/definitely/not/here"), &Settings::default());
        assert!(ds.is_empty());
        assert!(ds.counts.is_empty());
        assert_eq!(ds.report, LoadReport::default());
    }

    #[test]
    fn test_folder_layout_with_augmentation() {
        let root = scratch_dir();
        let person = root.join("person_name");
        std::fs::create_dir(&person).unwrap();
        write_face(&person.join("a.png"), 120);
        write_face(&person.join("b.png"), 140);
        std::fs::write(person.join("notes.txt"), "ignored").unwrap();

        let ds = load(&root, &Settings::default());
        assert_eq!(ds.names(), vec!["Person Name"]);
        assert_eq!(ds.samples.len(), 6);
        assert_eq!(ds.labels, vec![0; 6]);
        assert_eq!(ds.counts["Person Name"], PersonCounts { original_images: 2, total_images: 6 });
        assert!(ds.samples.iter().all(|s| s.dimensions() == (100, 100)));
        assert_eq!(ds.report.images_seen, 2);
        assert_eq!(ds.report.faces_loaded, 2);

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_mixed_layouts_share_labels() {
        let root = scratch_dir();
        std::fs::create_dir(root.join("bob")).unwrap();
        write_face(&root.join("bob").join("1.png"), 90);
        write_face(&root.join("alice_1.png"), 200);
        write_face(&root.join("bob_2.png"), 100);
        write_face(&root.join("alice_2.jpg"), 210);

        let settings = Settings { use_augmentation: false, ..Settings::default() };
        let ds = load(&root, &settings);

        // Folders first, then loose files grouped by person in sorted order.
        assert_eq!(ds.names(), vec!["Bob", "Alice"]);
        assert_eq!(ds.labels, vec![0, 1, 1, 0]);
        assert_eq!(ds.counts["Bob"].original_images, 2);
        assert_eq!(ds.counts["Alice"].total_images, 2);

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_bad_images_are_skipped_and_counted() {
        let root = scratch_dir();
        let dir = root.join("dana");
        std::fs::create_dir(&dir).unwrap();
        write_face(&dir.join("good.png"), 150);
        write_face(&dir.join("dark.png"), 0);
        std::fs::write(dir.join("corrupt.jpg"), b"\xff\xd8garbage").unwrap();
        GrayImage::from_pixel(20, 20, Luma([128])).save(dir.join("tiny.png")).unwrap();

        let ds = load(&root, &Settings { use_augmentation: false, ..Settings::default() });
        assert_eq!(ds.samples.len(), 1);
        assert_eq!(ds.report.images_seen, 4);
        assert_eq!(ds.report.faces_loaded, 1);
        assert_eq!(ds.report.no_face, 1);
        assert_eq!(ds.report.unreadable, 1);
        assert_eq!(ds.report.invalid, 1);

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_oversized_photo_still_trains() {
        let root = scratch_dir();
        GrayImage::from_pixel(4100, 120, Luma([160])).save(root.join("wide_1.png")).unwrap();

        let ds = load(&root, &Settings::default());
        assert_eq!(ds.names(), vec!["Wide"]);
        assert_eq!(ds.samples.len(), 3);
        assert_eq!(ds.report.invalid, 0);
        assert_eq!(ds.report.faces_loaded, 1);

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_person_without_faces_is_not_registered() {
        let root = scratch_dir();
        std::fs::create_dir(root.join("ghost")).unwrap();
        write_face(&root.join("ghost").join("x.png"), 0);
        std::fs::create_dir(root.join("README.md")).unwrap();
        std::fs::create_dir(root.join("__pycache__")).unwrap();
        write_face(&root.join("__pycache__").join("y.png"), 77);

        let ds = load(&root, &Settings::default());
        assert!(ds.is_empty());
        assert!(ds.counts.is_empty());
        assert_eq!(ds.report.no_face, 1);

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_largest_face_is_used() {
        // CentreDetector also reports a tiny corner box below min size; only
        // the centred box survives, so the region is uniformly bright.
        let root = scratch_dir();
        write_face(&root.join("eve.png"), 180);
        let ds = load(&root, &Settings { use_augmentation: false, ..Settings::default() });
        assert_eq!(ds.samples.len(), 1);
        assert!(ds.samples[0].pixels().all(|p| p[0] == 180));
        std::fs::remove_dir_all(&root).unwrap();
    }
}
