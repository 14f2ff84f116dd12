use crate::engine::EngineHandle;
use roster_core::{PersonRegistry, Recognition, SettingsUpdate};
use serde_json::{json, Value};
use std::path::PathBuf;
use zbus::interface;

pub const BUS_NAME: &str = "org.roster.Roster1";
pub const OBJECT_PATH: &str = "/org/roster/Roster1";

/// D-Bus interface for the roster recognition daemon.
///
/// Bus name: org.roster.Roster1
/// Object path: /org/roster/Roster1
///
/// Query methods answer with a JSON document carrying a `success` flag so
/// clients can tell a failed request from a transport error.
pub struct RosterService {
    engine: EngineHandle,
    registry: PersonRegistry,
    default_dataset: PathBuf,
}

impl RosterService {
    pub fn new(engine: EngineHandle, registry: PersonRegistry, default_dataset: PathBuf) -> Self {
        Self { engine, registry, default_dataset }
    }

    fn describe(&self, r: &Recognition) -> Value {
        let mut face = json!({
            "name": r.name,
            "location": r.location,
            "distance": r.distance,
            "confidence": r.confidence,
        });
        if r.is_known() {
            face["info"] = json!(self.registry.get_info(&r.name));
        }
        face
    }
}

fn failure(error: impl std::fmt::Display) -> String {
    json!({ "success": false, "error": error.to_string() }).to_string()
}

#[interface(name = "org.roster.Roster1")]
impl RosterService {
    /// Queue a training run. An empty path trains from the configured dataset.
    /// Returns once queued; poll `Status` for the outcome.
    async fn train(&self, dataset: &str) -> zbus::fdo::Result<bool> {
        let dataset = if dataset.is_empty() {
            self.default_dataset.clone()
        } else {
            PathBuf::from(dataset)
        };
        tracing::info!(dataset = %dataset.display(), "train requested");
        self.engine
            .queue_train(dataset)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        Ok(true)
    }

    /// Recognize every face in the image at `image_path`.
    async fn recognize(&self, image_path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(image_path, "recognize requested");
        match self.engine.recognize(PathBuf::from(image_path)).await {
            Ok(results) => {
                let faces: Vec<Value> = results.iter().map(|r| self.describe(r)).collect();
                Ok(json!({ "success": true, "faces": faces }).to_string())
            }
            Err(e) => {
                tracing::warn!(image_path, error = %e, "recognize failed");
                Ok(failure(e))
            }
        }
    }

    async fn known_faces(&self) -> zbus::fdo::Result<String> {
        Ok(json!(self.engine.pipeline().known_faces()).to_string())
    }

    async fn model_info(&self) -> zbus::fdo::Result<String> {
        Ok(json!(self.engine.pipeline().model_info()).to_string())
    }

    async fn training_summary(&self) -> zbus::fdo::Result<String> {
        Ok(match self.engine.pipeline().training_summary() {
            Some(summary) => json!({ "success": true, "summary": summary }).to_string(),
            None => failure("Model is not trained yet"),
        })
    }

    /// Apply a partial settings update given as a JSON object.
    async fn update_config(&self, update: &str) -> zbus::fdo::Result<String> {
        let result = SettingsUpdate::from_json(update)
            .and_then(|u| self.engine.pipeline().update_config(&u));
        Ok(match result {
            Ok(settings) => json!({
                "success": true,
                "settings": {
                    "confidence_threshold": settings.confidence_threshold,
                    "use_augmentation": settings.use_augmentation,
                    "augmentation_factor": settings.augmentation_factor,
                },
            })
            .to_string(),
            Err(e) => {
                tracing::warn!(error = %e, "settings update rejected");
                failure(e)
            }
        })
    }

    async fn person_info(&self, name: &str) -> zbus::fdo::Result<String> {
        Ok(json!(self.registry.get_info(name)).to_string())
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let pipeline = self.engine.pipeline();
        Ok(json!({
            "version": env!("CARGO_PKG_VERSION"),
            "is_trained": pipeline.is_trained(),
            "known_people": pipeline.known_faces().len(),
            "training": self.engine.train_status(),
            "registry_entries": self.registry.all().len(),
        })
        .to_string())
    }
}
