//! ModelServe Engine - Main Entry Point
//!
//! Starts a single serving replica: opens the model registry, registers and
//! loads the configured models, and runs the batch loop until interrupted.

use anyhow::Context;
use modelserve_common::{ServeConfig, METRICS};
use modelserve_engine::InferenceEngine;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("MODELSERVE_CONFIG")
        .unwrap_or_else(|_| "configs/engine.yaml".to_string());

    let config = ServeConfig::from_file(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path))?;
    let observability = config.observability();

    // Initialize logging; RUST_LOG wins over the configured level
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                observability
                    .filter_directive(&["modelserve_engine", "modelserve_common"])
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting ModelServe Engine with {}", config_path);
    let engine_config = config.engine()?;

    info!(
        "Engine configuration loaded: replica={}, device={}, max_batch_size={}",
        engine_config.replica_id, engine_config.device, engine_config.batching.max_batch_size
    );

    let engine = Arc::new(
        InferenceEngine::from_config(engine_config).context("initializing engine replica")?,
    );

    for model in engine.list_models().models {
        info!("Model {}:{} [{}]", model.name, model.version, model.status);
    }

    engine.start();
    info!("ModelServe Engine running");

    signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("Received shutdown signal");

    engine.shutdown().await;

    if observability.enable_metrics {
        match METRICS.gather() {
            Ok(snapshot) => info!("Final metrics:\n{}", snapshot),
            Err(e) => warn!("Failed to gather metrics: {}", e),
        }
    }

    info!("ModelServe Engine shutdown complete");
    Ok(())
}
