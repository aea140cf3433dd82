//! Model registry
//!
//! The registry keeps a persistent catalog of model descriptors keyed by
//! `(name, version)` and an in-memory cache of loaded model handles. The
//! catalog is stored as a JSON document (`name -> versions -> descriptor`)
//! and reloaded at startup.
//!
//! Loads and unloads of one key are serialized by a per-key lock, so at most
//! one handle per key exists at a time. The handle map itself is only
//! write-locked to insert or remove an entry; materialization and reclaim run
//! outside it, so lookups never wait on a slow load. Handles are immutable
//! once built and shared by `Arc`; callers keep using a handle they already
//! hold even if it is unloaded concurrently.

use crate::artifact::{content_hash, validate_artifact};
use crate::memory::MemoryGovernor;
use crate::model::{Device, GenerativeModel, ModelLoader, Tokenizer};
use chrono::{DateTime, Utc};
use modelserve_common::config::RegistryConfig;
use modelserve_common::{Result, ServeError, METRICS};
use modelserve_proto::ModelSummary;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Free-form descriptor metadata
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Lifecycle status of a registered model version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Registered,
    Loading,
    Active,
    Unloading,
    Unloaded,
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModelStatus::Registered => "registered",
            ModelStatus::Loading => "loading",
            ModelStatus::Active => "active",
            ModelStatus::Unloading => "unloading",
            ModelStatus::Unloaded => "unloaded",
        };
        f.write_str(name)
    }
}

/// Identity of a model version
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelKey {
    pub name: String,
    pub version: String,
}

impl ModelKey {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}

/// Catalog record for one model version
///
/// Only `status` changes after registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub version: String,
    pub artifact_path: PathBuf,
    pub content_hash: String,
    pub registered_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
    pub status: ModelStatus,
}

impl ModelDescriptor {
    pub fn key(&self) -> ModelKey {
        ModelKey::new(self.name.clone(), self.version.clone())
    }

    pub fn summary(&self) -> ModelSummary {
        ModelSummary {
            name: self.name.clone(),
            version: self.version.clone(),
            registered_at: self.registered_at.to_rfc3339(),
            status: self.status.to_string(),
            content_hash: self.content_hash.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

/// A model materialized on a device and ready to serve
pub struct LoadedModelHandle {
    descriptor: ModelDescriptor,
    model: Box<dyn GenerativeModel>,
    tokenizer: Arc<dyn Tokenizer>,
    device: Device,
    loaded_at: DateTime<Utc>,
    optimized: bool,
}

impl LoadedModelHandle {
    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    pub fn key(&self) -> ModelKey {
        self.descriptor.key()
    }

    pub fn model(&self) -> &dyn GenerativeModel {
        self.model.as_ref()
    }

    pub fn tokenizer(&self) -> &dyn Tokenizer {
        self.tokenizer.as_ref()
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// Whether the one-time inference preparation pass has run
    pub fn is_optimized(&self) -> bool {
        self.optimized
    }
}

impl fmt::Debug for LoadedModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModelHandle")
            .field("model", &self.descriptor.key().to_string())
            .field("device", &self.device)
            .field("loaded_at", &self.loaded_at)
            .field("optimized", &self.optimized)
            .finish()
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct CatalogEntry {
    versions: BTreeMap<String, ModelDescriptor>,
}

type Catalog = BTreeMap<String, CatalogEntry>;

/// Compare version strings segment by segment
///
/// Numeric segments compare numerically and rank below textual ones, so
/// `10.0 > 2.0` and `1.0 < 1.0-rc`. Ties fall back to plain string order.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    fn segments(version: &str) -> Vec<&str> {
        version
            .trim_start_matches(['v', 'V'])
            .split(['.', '-', '+', '_'])
            .collect()
    }

    let (left, right) = (segments(a), segments(b));
    for (l, r) in left.iter().zip(right.iter()) {
        let ordering = match (l.parse::<u64>(), r.parse::<u64>()) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            (Ok(_), Err(_)) => Ordering::Less,
            (Err(_), Ok(_)) => Ordering::Greater,
            (Err(_), Err(_)) => l.cmp(r),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }

    left.len().cmp(&right.len()).then_with(|| a.cmp(b))
}

/// Registry of model versions and loaded handles
pub struct ModelRegistry {
    config: RegistryConfig,
    catalog: RwLock<Catalog>,
    active: RwLock<HashMap<ModelKey, Arc<LoadedModelHandle>>>,
    /// Per-key lock held across load and unload
    slots: Mutex<HashMap<ModelKey, Arc<Mutex<()>>>>,
    loader: Arc<dyn ModelLoader>,
    governor: Arc<MemoryGovernor>,
    optimize_on_load: bool,
}

impl ModelRegistry {
    /// Open the registry, reloading any persisted catalog
    pub fn open(
        config: RegistryConfig,
        loader: Arc<dyn ModelLoader>,
        governor: Arc<MemoryGovernor>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.models_dir).map_err(|e| {
            ServeError::registry(format!(
                "Failed to create {}: {}",
                config.models_dir.display(),
                e
            ))
        })?;

        let catalog = load_catalog(&config.catalog_path())?;
        let versions: usize = catalog.values().map(|entry| entry.versions.len()).sum();
        info!(
            "Model registry opened at {}: {} models, {} versions",
            config.catalog_path().display(),
            catalog.len(),
            versions
        );

        Ok(Self {
            optimize_on_load: config.optimize_on_load,
            config,
            catalog: RwLock::new(catalog),
            active: RwLock::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
            loader,
            governor,
        })
    }

    /// Register a model version from an artifact directory
    ///
    /// Re-registering an existing `(name, version)` replaces its hash and
    /// metadata.
    pub fn register(
        &self,
        name: &str,
        version: &str,
        artifact_path: &Path,
        metadata: Metadata,
    ) -> Result<ModelDescriptor> {
        if name.is_empty() || version.is_empty() {
            return Err(ServeError::validation("model name and version must be non-empty"));
        }

        validate_artifact(artifact_path, &self.config.required_files).map_err(|e| {
            error!("Rejected artifact for {}:{}: {}", name, version, e);
            e
        })?;
        let hash = content_hash(artifact_path)
            .map_err(|e| ServeError::artifact_invalid(format!("Failed to hash artifact: {}", e)))?;

        let key = ModelKey::new(name, version);
        let status = if self.is_loaded(&key) {
            ModelStatus::Active
        } else {
            ModelStatus::Registered
        };

        let descriptor = ModelDescriptor {
            name: name.to_string(),
            version: version.to_string(),
            artifact_path: artifact_path.to_path_buf(),
            content_hash: hash,
            registered_at: Utc::now(),
            metadata,
            status,
        };

        {
            let mut catalog = self.catalog.write();
            let previous = catalog
                .entry(name.to_string())
                .or_default()
                .versions
                .insert(version.to_string(), descriptor.clone());

            if let Err(e) = self.persist(&catalog) {
                error!("Failed to persist registration of {}: {}", key, e);
                // Roll back so memory matches disk
                let entry = catalog.entry(name.to_string()).or_default();
                match previous {
                    Some(previous) => {
                        entry.versions.insert(version.to_string(), previous);
                    }
                    None => {
                        entry.versions.remove(version);
                        if entry.versions.is_empty() {
                            catalog.remove(name);
                        }
                    }
                }
                return Err(e);
            }
        }

        info!(
            "Registered model {} (hash {})",
            key,
            &descriptor.content_hash[..12]
        );
        Ok(descriptor)
    }

    /// Look up a descriptor; `None` selects the latest registered version
    pub fn resolve(&self, name: &str, version: Option<&str>) -> Result<ModelDescriptor> {
        let catalog = self.catalog.read();
        let entry = catalog
            .get(name)
            .ok_or_else(|| ServeError::not_found(format!("model {} is not registered", name)))?;

        let version = match version {
            Some(version) => version,
            None => entry
                .versions
                .keys()
                .max_by(|a, b| compare_versions(a, b))
                .map(String::as_str)
                .ok_or_else(|| ServeError::not_found(format!("model {} has no versions", name)))?,
        };

        entry.versions.get(version).cloned().ok_or_else(|| {
            ServeError::not_found(format!("version {} of model {} is not registered", version, name))
        })
    }

    /// Load a model onto `device`, returning the cached handle if present
    pub fn load(
        &self,
        name: &str,
        version: Option<&str>,
        device: Device,
    ) -> Result<Arc<LoadedModelHandle>> {
        let descriptor = self.resolve(name, version)?;
        let key = descriptor.key();

        if let Some(handle) = self.cached(&key) {
            return Ok(handle);
        }

        let slot = self.slot(&key);
        let _slot = slot.lock();
        // Another caller may have finished loading while we waited
        if let Some(handle) = self.cached(&key) {
            return Ok(handle);
        }

        let previous_status = descriptor.status;
        self.set_status(&key, ModelStatus::Loading);

        self.governor.relieve_pressure(device);

        let mut loaded = match self.loader.load(&descriptor, device) {
            Ok(loaded) => loaded,
            Err(e) => {
                self.set_status(&key, previous_status);
                error!("Failed to load {}: {}", key, e);
                return Err(match e {
                    ServeError::LoadFailed(_) => e,
                    other => ServeError::load_failed(format!("{}: {}", key, other)),
                });
            }
        };

        let optimized = self.optimize_on_load
            && match loaded.model.optimize() {
                Ok(()) => true,
                Err(e) => {
                    warn!("Optimization of {} failed, serving unoptimized: {}", key, e);
                    false
                }
            };

        let bytes = loaded.model.memory_bytes();
        self.governor.accounting().allocate_resident(bytes);

        let mut descriptor = descriptor;
        descriptor.status = ModelStatus::Active;
        let handle = Arc::new(LoadedModelHandle {
            descriptor,
            model: loaded.model,
            tokenizer: loaded.tokenizer,
            device,
            loaded_at: Utc::now(),
            optimized,
        });

        let loaded_count = {
            let mut active = self.active.write();
            active.insert(key.clone(), handle.clone());
            active.len()
        };
        self.set_status(&key, ModelStatus::Active);
        METRICS.engine.models_loaded.set(loaded_count as i64);

        info!(
            "Loaded model {} on {} ({} bytes, optimized={})",
            key, device, bytes, optimized
        );
        Ok(handle)
    }

    /// Unload a model version; unloading an inactive model is a no-op
    pub fn unload(&self, name: &str, version: Option<&str>) -> Result<()> {
        let descriptor = self.resolve(name, version)?;
        let key = descriptor.key();

        let slot = self.slot(&key);
        let _slot = slot.lock();
        let (handle, loaded_count) = {
            let mut active = self.active.write();
            let handle = active.remove(&key);
            (handle, active.len())
        };
        let Some(handle) = handle else {
            debug!("Model {} is not loaded", key);
            return Ok(());
        };

        self.set_status(&key, ModelStatus::Unloading);
        self.governor
            .accounting()
            .release_resident(handle.model().memory_bytes());
        drop(handle);
        self.set_status(&key, ModelStatus::Unloaded);
        METRICS.engine.models_loaded.set(loaded_count as i64);

        info!("Unloaded model {}", key);
        Ok(())
    }

    /// Summaries of every registered version
    pub fn list(&self) -> Vec<ModelSummary> {
        let catalog = self.catalog.read();
        catalog
            .values()
            .flat_map(|entry| entry.versions.values().map(ModelDescriptor::summary))
            .collect()
    }

    /// Keys of the models currently loaded
    pub fn loaded_models(&self) -> Vec<ModelKey> {
        let mut keys: Vec<ModelKey> = self.active.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn is_loaded(&self, key: &ModelKey) -> bool {
        self.active.read().contains_key(key)
    }

    pub fn governor(&self) -> &Arc<MemoryGovernor> {
        &self.governor
    }

    fn cached(&self, key: &ModelKey) -> Option<Arc<LoadedModelHandle>> {
        let handle = self.active.read().get(key).cloned();
        if handle.is_some() {
            debug!("Model cache hit for {}", key);
        }
        handle
    }

    fn slot(&self, key: &ModelKey) -> Arc<Mutex<()>> {
        self.slots
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn set_status(&self, key: &ModelKey, status: ModelStatus) {
        let mut catalog = self.catalog.write();
        if let Some(descriptor) = catalog
            .get_mut(&key.name)
            .and_then(|entry| entry.versions.get_mut(&key.version))
        {
            descriptor.status = status;
        }
    }

    fn persist(&self, catalog: &Catalog) -> Result<()> {
        let path = self.config.catalog_path();
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(catalog)?;

        std::fs::write(&tmp, body)
            .and_then(|_| std::fs::rename(&tmp, &path))
            .map_err(|e| ServeError::registry(format!("Failed to write {}: {}", path.display(), e)))
    }
}

fn load_catalog(path: &Path) -> Result<Catalog> {
    if !path.exists() {
        return Ok(Catalog::new());
    }

    let content = std::fs::read_to_string(path).map_err(|e| {
        error!("Failed to read catalog {}: {}", path.display(), e);
        ServeError::registry(format!("Failed to read {}: {}", path.display(), e))
    })?;
    let mut catalog: Catalog = serde_json::from_str(&content).map_err(|e| {
        error!("Failed to parse catalog {}: {}", path.display(), e);
        ServeError::registry(format!("Failed to parse {}: {}", path.display(), e))
    })?;

    // Nothing is resident in a fresh process
    for descriptor in catalog.values_mut().flat_map(|entry| entry.versions.values_mut()) {
        if matches!(
            descriptor.status,
            ModelStatus::Loading | ModelStatus::Active | ModelStatus::Unloading
        ) {
            descriptor.status = ModelStatus::Unloaded;
        }
    }

    Ok(catalog)
}
