use roster_core::{Settings, SettingsUpdate};
use std::path::PathBuf;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Dataset trained from at startup and when `Train` is called with an empty path.
    pub dataset_dir: PathBuf,
    /// JSON person registry used to enrich recognition results.
    pub people_file: PathBuf,
    pub confidence_threshold: f32,
    pub use_augmentation: bool,
    pub augmentation_factor: u32,
    /// Train from `dataset_dir` once the models are loaded.
    pub train_on_start: bool,
    /// Register on the system bus instead of the session bus.
    pub system_bus: bool,
}

impl Config {
    /// Load configuration from `ROSTER_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = roster_core::data_dir();

        let model_dir = std::env::var("ROSTER_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| roster_core::default_model_dir());

        let dataset_dir = std::env::var("ROSTER_DATASET_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("dataset"));

        let people_file = std::env::var("ROSTER_PEOPLE_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("people_info.json"));

        let defaults = Settings::default();
        Self {
            model_dir,
            dataset_dir,
            people_file,
            confidence_threshold: env_f32("ROSTER_CONFIDENCE_THRESHOLD", defaults.confidence_threshold),
            use_augmentation: env_flag("ROSTER_USE_AUGMENTATION", defaults.use_augmentation),
            augmentation_factor: env_u32("ROSTER_AUGMENTATION_FACTOR", defaults.augmentation_factor),
            train_on_start: env_flag("ROSTER_TRAIN_ON_START", true),
            system_bus: env_flag("ROSTER_SYSTEM_BUS", false),
        }
    }

    /// Initial pipeline settings. Each out-of-range value falls back to its
    /// default on its own.
    pub fn settings(&self) -> Settings {
        let mut settings = Settings::default();
        let updates = [
            SettingsUpdate {
                confidence_threshold: Some(self.confidence_threshold),
                ..SettingsUpdate::default()
            },
            SettingsUpdate {
                use_augmentation: Some(self.use_augmentation),
                ..SettingsUpdate::default()
            },
            SettingsUpdate {
                augmentation_factor: Some(self.augmentation_factor),
                ..SettingsUpdate::default()
            },
        ];
        for update in &updates {
            if let Err(e) = settings.apply(update) {
                tracing::warn!(error = %e, "ignoring invalid setting from environment");
            }
        }
        settings
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key).map(|v| v != "0").unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: f32, factor: u32) -> Config {
        Config {
            model_dir: PathBuf::from("/models"),
            dataset_dir: PathBuf::from("/dataset"),
            people_file: PathBuf::from("/people.json"),
            confidence_threshold: threshold,
            use_augmentation: false,
            augmentation_factor: factor,
            train_on_start: false,
            system_bus: false,
        }
    }

    #[test]
    fn test_settings_from_config() {
        let s = config(80.0, 4).settings();
        assert_eq!(s.confidence_threshold, 80.0);
        assert_eq!(s.augmentation_factor, 4);
        assert!(!s.use_augmentation);
    }

    #[test]
    fn test_invalid_value_falls_back_alone() {
        let s = config(-5.0, 4).settings();
        assert_eq!(s.confidence_threshold, Settings::default().confidence_threshold);
        assert_eq!(s.augmentation_factor, 4);
        assert!(!s.use_augmentation);

        let s = config(80.0, 500).settings();
        assert_eq!(s.confidence_threshold, 80.0);
        assert_eq!(s.augmentation_factor, Settings::default().augmentation_factor);
    }
}
