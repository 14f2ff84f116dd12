//! Training statistics and per-person quality tiers.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Coarse summary of how many real photos back a person.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityTier {
    #[serde(rename = "⭐")]
    Basic,
    #[serde(rename = "⭐⭐")]
    Good,
    #[serde(rename = "⭐⭐⭐")]
    Excellent,
}

impl QualityTier {
    pub fn from_originals(original_images: usize) -> Self {
        match original_images {
            n if n >= 3 => QualityTier::Excellent,
            2 => QualityTier::Good,
            _ => QualityTier::Basic,
        }
    }

    pub fn stars(self) -> &'static str {
        match self {
            QualityTier::Basic => "⭐",
            QualityTier::Good => "⭐⭐",
            QualityTier::Excellent => "⭐⭐⭐",
        }
    }
}

impl std::fmt::Display for QualityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.stars())
    }
}

/// Real photos that yielded a face vs. all regions fed to the classifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonCounts {
    pub original_images: usize,
    pub total_images: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonStats {
    pub original_images: usize,
    pub total_images: usize,
    pub quality: QualityTier,
}

/// Outcome counts for every file looked at during dataset loading.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadReport {
    pub images_seen: usize,
    pub faces_loaded: usize,
    pub no_face: usize,
    pub unreadable: usize,
    /// Decoded but failed the size/shape gate.
    pub invalid: usize,
    pub detection_failed: usize,
}

impl LoadReport {
    pub fn skipped(&self) -> usize {
        self.no_face + self.unreadable + self.invalid + self.detection_failed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingStatistics {
    pub total_faces: usize,
    pub total_people: usize,
    pub original_count: usize,
    pub augmented_count: usize,
    pub augmentation_enabled: bool,
    pub augmentation_factor: u32,
    pub quality_assessment: IndexMap<String, PersonStats>,
    pub load_report: LoadReport,
}

/// Recover the number of real photos from an augmented total.
///
/// Integer division: totals that are not a multiple of `factor + 1` round
/// down.
pub fn derive_original_count(total_images: usize, augmentation_enabled: bool, factor: u32) -> usize {
    if augmentation_enabled {
        total_images / (factor as usize + 1)
    } else {
        total_images
    }
}

impl TrainingStatistics {
    /// Compile statistics from per-person counts recorded during loading.
    ///
    /// Originals are taken as recorded; the division-based estimate is only
    /// cross-checked, and a mismatch is logged.
    pub fn compile(
        counts: &IndexMap<String, PersonCounts>,
        augmentation_enabled: bool,
        augmentation_factor: u32,
        load_report: LoadReport,
    ) -> Self {
        let mut quality_assessment = IndexMap::with_capacity(counts.len());
        let mut total_faces = 0;
        let mut original_count = 0;

        for (name, c) in counts {
            let derived = derive_original_count(c.total_images, augmentation_enabled, augmentation_factor);
            if derived != c.original_images {
                tracing::warn!(
                    person = %name,
                    recorded = c.original_images,
                    derived,
                    total = c.total_images,
                    "original image count does not match augmented total"
                );
            }
            total_faces += c.total_images;
            original_count += c.original_images;
            quality_assessment.insert(
                name.clone(),
                PersonStats {
                    original_images: c.original_images,
                    total_images: c.total_images,
                    quality: QualityTier::from_originals(c.original_images),
                },
            );
        }

        Self {
            total_faces,
            total_people: counts.len(),
            original_count,
            augmented_count: total_faces - original_count,
            augmentation_enabled,
            augmentation_factor,
            quality_assessment,
            load_report,
        }
    }
}

/// Per-person view used by status displays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonSummary {
    pub total_images: usize,
    pub original_images: usize,
    /// Observed multiplier `total / original`; 0 when there are no originals.
    pub augmentation_factor: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub total_faces: usize,
    pub total_people: usize,
    pub original_count: usize,
    pub augmented_count: usize,
    pub quality_assessment: IndexMap<String, PersonSummary>,
}

impl TrainingSummary {
    pub fn from_statistics(stats: &TrainingStatistics) -> Self {
        let mut summary = TrainingSummary {
            total_faces: 0,
            total_people: stats.total_people,
            original_count: 0,
            augmented_count: 0,
            quality_assessment: IndexMap::new(),
        };
        for (name, p) in &stats.quality_assessment {
            summary.total_faces += p.total_images;
            summary.original_count += p.original_images;
            summary.augmented_count += p.total_images - p.original_images;
            summary.quality_assessment.insert(
                name.clone(),
                PersonSummary {
                    total_images: p.total_images,
                    original_images: p.original_images,
                    augmentation_factor: p.total_images.checked_div(p.original_images).unwrap_or(0),
                },
            );
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(entries: &[(&str, usize, usize)]) -> IndexMap<String, PersonCounts> {
        entries
            .iter()
            .map(|&(n, o, t)| (n.to_string(), PersonCounts { original_images: o, total_images: t }))
            .collect()
    }

    #[test]
    fn test_tiers_with_factor_two() {
        let factor = 2u32;
        let expected = [
            QualityTier::Basic,
            QualityTier::Good,
            QualityTier::Excellent,
            QualityTier::Excellent,
        ];
        for (originals, tier) in (1..=4).zip(expected) {
            let total = originals * (factor as usize + 1);
            assert_eq!(total, originals * 3);
            let derived = derive_original_count(total, true, factor);
            assert_eq!(derived, originals);
            assert_eq!(QualityTier::from_originals(derived), tier);
        }
    }

    #[test]
    fn test_tier_serializes_as_stars() {
        assert_eq!(serde_json::to_string(&QualityTier::Good).unwrap(), "\"⭐⭐\"");
    }

    #[test]
    fn test_tier_stars() {
        assert_eq!(QualityTier::Basic.to_string(), "⭐");
        assert_eq!(QualityTier::Good.to_string(), "⭐⭐");
        assert_eq!(QualityTier::Excellent.to_string(), "⭐⭐⭐");
        assert_eq!(QualityTier::from_originals(0), QualityTier::Basic);
    }

    #[test]
    fn test_derive_original_count_quantizes() {
        // 7 is not a multiple of 3: one partial group is lost.
        assert_eq!(derive_original_count(7, true, 2), 2);
        assert_eq!(derive_original_count(8, true, 2), 2);
        assert_eq!(derive_original_count(9, true, 2), 3);
        assert_eq!(derive_original_count(2, true, 2), 0);
        assert_eq!(derive_original_count(7, false, 2), 7);
        assert_eq!(derive_original_count(5, true, 0), 5);
    }

    #[test]
    fn test_compile_totals() {
        let c = counts(&[("Alice", 2, 6), ("Bob", 1, 3)]);
        let stats = TrainingStatistics::compile(&c, true, 2, LoadReport::default());
        assert_eq!(stats.total_faces, 9);
        assert_eq!(stats.total_people, 2);
        assert_eq!(stats.original_count, 3);
        assert_eq!(stats.augmented_count, 6);
        assert_eq!(stats.quality_assessment["Alice"].quality, QualityTier::Good);
        assert_eq!(stats.quality_assessment["Bob"].quality, QualityTier::Basic);
        let names: Vec<&str> = stats.quality_assessment.keys().map(|s| s.as_str()).collect();
        assert_eq!(names, vec!["Alice", "Bob"]);
    }

    #[test]
    fn test_compile_without_augmentation() {
        let c = counts(&[("Carol", 3, 3)]);
        let stats = TrainingStatistics::compile(&c, false, 2, LoadReport::default());
        assert_eq!(stats.augmented_count, 0);
        assert_eq!(stats.original_count, 3);
        assert_eq!(stats.quality_assessment["Carol"].quality, QualityTier::Excellent);
    }

    #[test]
    fn test_compile_trusts_recorded_originals() {
        // A total that is not a clean multiple keeps its recorded originals.
        let c = counts(&[("Dan", 3, 7)]);
        let stats = TrainingStatistics::compile(&c, true, 2, LoadReport::default());
        assert_eq!(stats.quality_assessment["Dan"].original_images, 3);
        assert_eq!(stats.quality_assessment["Dan"].quality, QualityTier::Excellent);
    }

    #[test]
    fn test_summary_multiplier() {
        let c = counts(&[("Alice", 2, 6), ("Eve", 0, 0)]);
        let stats = TrainingStatistics::compile(&c, true, 2, LoadReport::default());
        let summary = TrainingSummary::from_statistics(&stats);
        assert_eq!(summary.quality_assessment["Alice"].augmentation_factor, 3);
        assert_eq!(summary.quality_assessment["Eve"].augmentation_factor, 0);
        assert_eq!(summary.total_faces, 6);
        assert_eq!(summary.augmented_count, 4);
    }

    #[test]
    fn test_load_report_skipped() {
        let r = LoadReport {
            images_seen: 11,
            faces_loaded: 6,
            no_face: 2,
            unreadable: 1,
            invalid: 1,
            detection_failed: 1,
        };
        assert_eq!(r.skipped(), 5);
        assert_eq!(r.faces_loaded + r.skipped(), r.images_seen);
    }
}
