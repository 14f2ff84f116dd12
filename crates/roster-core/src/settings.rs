//! Recognition settings and validated partial updates.

use crate::augmentation::AugmentationParams;
use crate::imaging::{DEFAULT_PADDING, NORMALIZED_SIZE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound for synthetic variants per real image.
pub const MAX_AUGMENTATION_FACTOR: u32 = 20;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("confidence_threshold must be a finite number > 0, got {0}")]
    InvalidThreshold(f32),
    #[error("augmentation_factor must be at most {max}, got {got}")]
    InvalidFactor { got: u32, max: u32 },
    #[error("malformed settings update: {0}")]
    Malformed(String),
}

/// Everything the pipeline reads at train or recognize time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Distances strictly below this resolve to a known name.
    pub confidence_threshold: f32,
    pub use_augmentation: bool,
    pub augmentation_factor: u32,
    /// Minimum face side when picking the subject of a dataset photo.
    pub train_min_face: u32,
    /// Minimum face side at inference; looser so every face in a frame counts.
    pub detect_min_face: u32,
    pub region_size: u32,
    pub padding: u32,
    pub augmentation: AugmentationParams,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            confidence_threshold: 100.0,
            use_augmentation: true,
            augmentation_factor: 2,
            train_min_face: 50,
            detect_min_face: 30,
            region_size: NORMALIZED_SIZE,
            padding: DEFAULT_PADDING,
            augmentation: AugmentationParams::default(),
        }
    }
}

/// A partial update. Only these three fields may change at runtime; any other
/// key is rejected when parsing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsUpdate {
    #[serde(default, alias = "confidenceThreshold", skip_serializing_if = "Option::is_none")]
    pub confidence_threshold: Option<f32>,
    #[serde(default, alias = "useAugmentation", skip_serializing_if = "Option::is_none")]
    pub use_augmentation: Option<bool>,
    #[serde(default, alias = "augmentationFactor", skip_serializing_if = "Option::is_none")]
    pub augmentation_factor: Option<u32>,
}

impl SettingsUpdate {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Malformed(e.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.confidence_threshold.is_none()
            && self.use_augmentation.is_none()
            && self.augmentation_factor.is_none()
    }

    /// Check every present field without touching any state.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(t) = self.confidence_threshold {
            if !t.is_finite() || t <= 0.0 {
                return Err(ConfigError::InvalidThreshold(t));
            }
        }
        if let Some(f) = self.augmentation_factor {
            if f > MAX_AUGMENTATION_FACTOR {
                return Err(ConfigError::InvalidFactor { got: f, max: MAX_AUGMENTATION_FACTOR });
            }
        }
        Ok(())
    }
}

impl Settings {
    /// Validate `update` as a whole, then apply it. On error nothing changes.
    pub fn apply(&mut self, update: &SettingsUpdate) -> Result<(), ConfigError> {
        update.validate()?;
        if let Some(t) = update.confidence_threshold {
            self.confidence_threshold = t;
        }
        if let Some(u) = update.use_augmentation {
            self.use_augmentation = u;
        }
        if let Some(f) = update.augmentation_factor {
            self.augmentation_factor = f;
        }
        Ok(())
    }

    /// Synthetic variants generated per real image under these settings.
    pub fn effective_factor(&self) -> u32 {
        if self.use_augmentation { self.augmentation_factor } else { 0 }
    }
}
