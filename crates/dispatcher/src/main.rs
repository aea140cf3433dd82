//! ModelServe Dispatcher - Main Entry Point
//!
//! Builds the configured number of in-process engine replicas over one shared
//! registry, then routes requests across them and monitors their health.

use anyhow::Context;
use modelserve_common::{ServeConfig, METRICS};
use modelserve_dispatcher::{LocalReplica, Replica, RequestDispatcher};
use modelserve_engine::{open_registry, preload, InferenceEngine};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("MODELSERVE_CONFIG")
        .unwrap_or_else(|_| "configs/dispatcher.yaml".to_string());

    let config = ServeConfig::from_file(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path))?;
    let observability = config.observability();

    // Initialize logging; RUST_LOG wins over the configured level
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                observability
                    .filter_directive(&["modelserve_dispatcher", "modelserve_engine"])
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting ModelServe Dispatcher with {}", config_path);
    let dispatcher_config = config.dispatcher()?;
    let engine_config = config.engine()?;

    info!(
        "Dispatcher configuration loaded: bind={}:{}, replicas={}",
        config.bind_address, config.port, dispatcher_config.replicas
    );

    // Replicas share one registry and governor
    let registry = open_registry(engine_config).context("opening model registry")?;
    preload(&registry, engine_config).context("preloading models")?;

    let mut engines = Vec::with_capacity(dispatcher_config.replicas);
    let mut replicas: Vec<Arc<dyn Replica>> = Vec::with_capacity(dispatcher_config.replicas);
    for index in 0..dispatcher_config.replicas {
        let engine = Arc::new(
            InferenceEngine::new(engine_config, registry.clone())?
                .with_replica_id(format!("{}-{}", engine_config.replica_id, index)),
        );
        engine.start();
        replicas.push(Arc::new(LocalReplica::new(engine.clone())));
        engines.push(engine);
    }

    let dispatcher = Arc::new(RequestDispatcher::new(replicas, dispatcher_config)?);
    let health_check_handle = dispatcher.clone().start_health_checks();

    info!("ModelServe Dispatcher running");

    // Wait for shutdown signal
    tokio::select! {
        result = signal::ctrl_c() => {
            result.context("waiting for shutdown signal")?;
            info!("Received shutdown signal");
        }
        result = health_check_handle => {
            if let Err(e) = result {
                error!("Health check task failed: {}", e);
            }
        }
    }

    for engine in engines {
        engine.shutdown().await;
    }

    if observability.enable_metrics {
        match METRICS.gather() {
            Ok(snapshot) => info!("Final metrics:\n{}", snapshot),
            Err(e) => warn!("Failed to gather metrics: {}", e),
        }
    }

    info!("ModelServe Dispatcher shutdown complete");
    Ok(())
}
