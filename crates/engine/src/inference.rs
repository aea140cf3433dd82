//! Engine replica
//!
//! An [`InferenceEngine`] is one serving replica. It owns a batch scheduler
//! and response cache, and shares the model registry and memory governor with
//! any other replicas in the process. Background work (the batch loop and the
//! periodic maintenance pass) is started explicitly and stopped on shutdown.

use crate::batching::BatchScheduler;
use crate::cache::{CacheStats, ResponseCache};
use crate::memory::MemoryGovernor;
use crate::model::{ArtifactLoader, Device};
use crate::registry::ModelRegistry;
use crate::request::GenerationRequest;
use modelserve_common::config::EngineConfig;
use modelserve_common::{Result, METRICS};
use modelserve_proto::{GenerateRequest, GenerateResponse, HealthResponse, ListModelsResponse};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Result of one maintenance pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub under_pressure: bool,
    pub reclaimed_bytes: u64,
    pub purged_entries: usize,
}

/// Open the registry described by `config` with the artifact backend
pub fn open_registry(config: &EngineConfig) -> Result<Arc<ModelRegistry>> {
    let governor = Arc::new(MemoryGovernor::from_config(&config.memory));
    let registry = ModelRegistry::open(
        config.registry.clone(),
        Arc::new(ArtifactLoader::new()),
        governor,
    )?;
    Ok(Arc::new(registry))
}

/// Register and load the models listed under `preload`
pub fn preload(registry: &ModelRegistry, config: &EngineConfig) -> Result<()> {
    let device: Device = config.device.parse()?;
    for model in &config.preload {
        registry.register(
            &model.name,
            &model.version,
            &model.artifact_path,
            model.metadata.clone(),
        )?;
        registry.load(&model.name, Some(&model.version), device)?;
    }
    Ok(())
}

/// One serving replica
pub struct InferenceEngine {
    replica_id: String,
    device: Device,
    default_model: Option<String>,
    default_version: Option<String>,
    registry: Arc<ModelRegistry>,
    governor: Arc<MemoryGovernor>,
    cache: Arc<ResponseCache>,
    scheduler: Arc<BatchScheduler>,
    maintenance_interval: Duration,
    shutdown: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl InferenceEngine {
    /// Create a replica over a shared registry
    pub fn new(config: &EngineConfig, registry: Arc<ModelRegistry>) -> Result<Self> {
        let device: Device = config.device.parse()?;
        let governor = registry.governor().clone();
        let cache = Arc::new(ResponseCache::from_config(&config.cache, governor.clone()));
        let scheduler = BatchScheduler::new(
            config.batching.clone(),
            device,
            registry.clone(),
            cache.clone(),
        )
        .with_default_model(config.default_model.clone(), config.default_version.clone());
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            replica_id: config.replica_id.clone(),
            device,
            default_model: config.default_model.clone(),
            default_version: config.default_version.clone(),
            registry,
            governor,
            cache,
            scheduler: Arc::new(scheduler),
            maintenance_interval: config.memory.maintenance_interval(),
            shutdown,
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Create a standalone replica: open the registry and run preloads
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let registry = open_registry(config)?;
        preload(&registry, config)?;
        Self::new(config, registry)
    }

    /// Override the replica identifier
    pub fn with_replica_id(mut self, replica_id: impl Into<String>) -> Self {
        self.replica_id = replica_id.into();
        self
    }

    /// Generate text for a gateway request
    pub async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse> {
        let request = GenerationRequest::from(request);
        let result = self.scheduler.submit(request).await?;
        Ok(result.into())
    }

    /// Summaries of every registered model version
    pub fn list_models(&self) -> ListModelsResponse {
        ListModelsResponse {
            models: self.registry.list(),
            default_model: self.default_model.clone(),
            default_version: self.default_version.clone(),
        }
    }

    pub fn health(&self) -> HealthResponse {
        let status = if self.scheduler.is_healthy() {
            "healthy"
        } else {
            "unhealthy"
        };

        HealthResponse {
            status: status.to_string(),
            device: self.device.to_string(),
            loaded_models: self
                .registry
                .loaded_models()
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }

    /// Spawn the batch loop and the maintenance task
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            warn!("Replica {} already started", self.replica_id);
            return;
        }

        tasks.push(tokio::spawn(self.scheduler.clone().run()));

        let engine = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(engine.maintenance_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        engine.maintain().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Maintenance task for {} stopped", engine.replica_id);
        }));

        info!(
            "Replica {} started on {} (maintenance every {:?})",
            self.replica_id, self.device, self.maintenance_interval
        );
    }

    /// Sample memory, reclaim and purge the cache on pressure, refresh gauges
    pub async fn maintain(&self) -> MaintenanceReport {
        let sample = self.governor.sample();
        let under_pressure = self.governor.is_under_pressure(&sample);

        let mut report = MaintenanceReport {
            under_pressure,
            reclaimed_bytes: 0,
            purged_entries: 0,
        };

        if under_pressure {
            let governor = self.governor.clone();
            let device = self.device;
            match tokio::task::spawn_blocking(move || governor.reclaim(device)).await {
                Ok(released) => report.reclaimed_bytes = released,
                Err(e) => warn!("Reclaim task failed: {}", e),
            }
            report.purged_entries = self.cache.purge_expired();
        }

        METRICS
            .engine
            .queue_depth
            .set(self.scheduler.queue_depth() as i64);
        METRICS
            .engine
            .models_loaded
            .set(self.registry.loaded_models().len() as i64);

        debug!("Maintenance on {}: {:?}", self.replica_id, report);
        report
    }

    /// Stop background tasks and fail queued requests
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.scheduler.shutdown().await;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Replica task ended abnormally: {}", e);
            }
        }

        info!("Replica {} shut down", self.replica_id);
    }

    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn queue_depth(&self) -> usize {
        self.scheduler.queue_depth()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{DeviceAccounting, FixedMemorySource};
    use crate::registry::{Metadata, ModelStatus};
    use crate::test_support::{write_artifact, StubLoader};
    use modelserve_common::config::RegistryConfig;

    fn engine_config(models_dir: &std::path::Path) -> EngineConfig {
        EngineConfig {
            default_model: Some("demo".to_string()),
            registry: RegistryConfig {
                models_dir: models_dir.to_path_buf(),
                ..RegistryConfig::default()
            },
            ..EngineConfig::default()
        }
    }

    fn engine(
        config: &EngineConfig,
        source: Arc<FixedMemorySource>,
    ) -> (Arc<InferenceEngine>, tempfile::TempDir) {
        let artifact = tempfile::tempdir().unwrap();
        write_artifact(artifact.path());

        let governor = Arc::new(MemoryGovernor::new(
            source,
            Arc::new(DeviceAccounting::new(1 << 30)),
            0.9,
        ));
        let registry = ModelRegistry::open(
            config.registry.clone(),
            Arc::new(StubLoader::default()),
            governor,
        )
        .unwrap();
        registry
            .register("demo", "1.0", artifact.path(), Metadata::new())
            .unwrap();

        let engine = InferenceEngine::new(config, Arc::new(registry)).unwrap();
        (Arc::new(engine), artifact)
    }

    #[tokio::test]
    async fn test_generate_and_health() {
        let models = tempfile::tempdir().unwrap();
        let config = engine_config(models.path());
        let (engine, _artifact) = engine(&config, Arc::new(FixedMemorySource::default()));
        engine.start();

        let response = engine.generate(GenerateRequest::new("hello")).await.unwrap();
        assert_eq!(response.generated_text, vec!["hello out".to_string()]);
        assert_eq!(response.model_name, "demo");
        assert_eq!(response.version, "1.0");

        let health = engine.health();
        assert!(health.is_healthy());
        assert_eq!(health.device, "cpu");
        assert_eq!(health.loaded_models, vec!["demo:1.0".to_string()]);

        let models = engine.list_models();
        assert_eq!(models.models.len(), 1);
        assert_eq!(models.default_model.as_deref(), Some("demo"));

        engine.shutdown().await;
        assert!(!engine.health().is_healthy());
    }

    #[tokio::test]
    async fn test_maintenance_reclaims_under_pressure() {
        let models = tempfile::tempdir().unwrap();
        let config = engine_config(models.path());
        let source = Arc::new(FixedMemorySource::new(10.0, 95, 100));
        source.set_transient(30);
        let (engine, _artifact) = engine(&config, source.clone());

        let report = engine.maintain().await;
        assert!(report.under_pressure);
        assert_eq!(report.reclaimed_bytes, 30);

        let report = engine.maintain().await;
        assert!(!report.under_pressure);
        assert_eq!(report.reclaimed_bytes, 0);
    }

    #[tokio::test]
    async fn test_health_answers_during_blocked_load() {
        let models = tempfile::tempdir().unwrap();
        let config = engine_config(models.path());
        let source = Arc::new(FixedMemorySource::default());
        let (engine, artifact) = engine(&config, source.clone());
        let registry = engine.registry().clone();
        registry
            .register("other", "1.0", artifact.path(), Metadata::new())
            .unwrap();
        registry.load("demo", None, Device::Cpu).unwrap();

        // Reclaim before the load waits on a batch holding the device
        source.set_host_percent(95.0);
        let device_lock = engine.governor.device_lock(Device::Cpu);
        let generating = device_lock.lock();

        let loading = {
            let registry = registry.clone();
            tokio::task::spawn_blocking(move || registry.load("other", None, Device::Cpu))
        };
        while registry.resolve("other", None).unwrap().status != ModelStatus::Loading {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let health = tokio::time::timeout(Duration::from_millis(100), async { engine.health() })
            .await
            .expect("health answered while a load was blocked");
        assert_eq!(health.loaded_models, vec!["demo:1.0".to_string()]);

        drop(generating);
        loading.await.unwrap().unwrap();
        assert_eq!(engine.health().loaded_models.len(), 2);
    }

    #[test]
    fn test_invalid_device_rejected() {
        let models = tempfile::tempdir().unwrap();
        let mut config = engine_config(models.path());
        config.device = "tpu".to_string();

        let governor = crate::test_support::governor(Default::default());
        let registry = ModelRegistry::open(
            config.registry.clone(),
            Arc::new(StubLoader::default()),
            governor,
        )
        .unwrap();
        assert!(InferenceEngine::new(&config, Arc::new(registry)).is_err());
    }
}
