use anyhow::{Context, Result};
use roster_core::PersonRegistry;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rosterd starting");

    let config = config::Config::from_env();
    let settings = config.settings();

    let pipeline = roster_core::load_onnx_pipeline(&config.model_dir, settings)
        .with_context(|| format!("loading models from {}", config.model_dir.display()))?;
    tracing::info!(model_dir = %config.model_dir.display(), "models loaded");

    let engine = engine::spawn_engine(Arc::new(pipeline))?;
    let registry = PersonRegistry::load(&config.people_file);

    if config.train_on_start {
        if config.dataset_dir.is_dir() {
            let startup = engine.clone();
            let dataset = config.dataset_dir.clone();
            tokio::spawn(async move {
                match startup.train(dataset).await {
                    Ok(stats) => tracing::info!(
                        people = stats.total_people,
                        faces = stats.total_faces,
                        "initial training complete"
                    ),
                    Err(e) => tracing::warn!(error = %e, "initial training failed; starting untrained"),
                }
            });
        } else {
            tracing::warn!(
                dataset = %config.dataset_dir.display(),
                "dataset directory not found; starting untrained"
            );
        }
    }

    let service = dbus_interface::RosterService::new(engine, registry, config.dataset_dir.clone());
    let builder = if config.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let _conn = builder
        .name(dbus_interface::BUS_NAME)?
        .serve_at(dbus_interface::OBJECT_PATH, service)?
        .build()
        .await
        .context("registering D-Bus service")?;

    tracing::info!(bus_name = dbus_interface::BUS_NAME, "rosterd ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("rosterd shutting down");

    Ok(())
}
