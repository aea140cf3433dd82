//! Configuration structures for ModelServe
//!
//! This module defines all configuration types used by engine replicas and the
//! dispatcher. Configurations are loaded from YAML files and can be overridden
//! by environment variables prefixed with `MODELSERVE` (nested keys separated
//! by `__`, e.g. `MODELSERVE__ENGINE__BATCHING__MAX_BATCH_SIZE=8`).

use crate::error::{Result, ServeError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "MODELSERVE";

/// Top-level configuration for ModelServe components
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServeConfig {
    /// Mode: either "engine" or "dispatcher"
    pub mode: String,

    /// Server binding address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Engine replica configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineConfig>,

    /// Dispatcher configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatcher: Option<DispatcherConfig>,

    /// Observability configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

/// Engine replica configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Replica identifier
    #[serde(default = "default_replica_id")]
    pub replica_id: String,

    /// Device models are materialized on ("cpu", "cuda:0", ...)
    #[serde(default = "default_device")]
    pub device: String,

    /// Model used when a request does not name one
    #[serde(default)]
    pub default_model: Option<String>,

    /// Version used when a request does not name one (None = latest)
    #[serde(default)]
    pub default_version: Option<String>,

    /// Model registry configuration
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Batching configuration
    #[serde(default)]
    pub batching: BatchingConfig,

    /// Memory governor configuration
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Response cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Models registered and loaded at startup
    #[serde(default)]
    pub preload: Vec<PreloadConfig>,
}

/// Model registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Directory holding the persisted catalog
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,

    /// Catalog file name inside `models_dir`
    #[serde(default = "default_catalog_file")]
    pub catalog_file: String,

    /// Files every artifact directory must contain
    #[serde(default = "default_required_files")]
    pub required_files: Vec<String>,

    /// Run the one-time inference preparation pass when a model loads
    #[serde(default = "default_optimize_on_load")]
    pub optimize_on_load: bool,
}

/// Batching configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchingConfig {
    /// Minimum batch size the sizer may choose
    #[serde(default = "default_min_batch_size")]
    pub min_batch_size: usize,

    /// Maximum batch size
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Accumulation window in milliseconds
    #[serde(default = "default_batching_window_ms")]
    pub batching_window_ms: u64,

    /// Maximum number of queued requests
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Fraction of estimated headroom the sizer is allowed to use
    #[serde(default = "default_safety_margin")]
    pub safety_margin: f64,
}

/// Memory governor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Pressure threshold as a fraction of capacity
    #[serde(default = "default_memory_threshold")]
    pub threshold: f64,

    /// Device memory capacity in bytes
    #[serde(default = "default_device_capacity")]
    pub device_capacity_bytes: u64,

    /// Interval between maintenance passes in seconds
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
}

/// Response cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Enable the response cache
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,

    /// Maximum number of cached responses
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,

    /// Entry time-to-live in seconds (None = no expiry)
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

/// Model registered at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreloadConfig {
    /// Model name
    pub name: String,

    /// Model version
    pub version: String,

    /// Artifact directory
    pub artifact_path: PathBuf,

    /// Free-form metadata stored with the descriptor
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Number of in-process engine replicas
    #[serde(default = "default_replicas")]
    pub replicas: usize,

    /// Health check interval in seconds
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,

    /// Per-replica probe timeout in milliseconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Skip replicas last seen unhealthy when routing
    #[serde(default)]
    pub skip_unhealthy: bool,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable Prometheus metrics
    #[serde(default = "default_metrics")]
    pub enable_metrics: bool,
}

/// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_replica_id() -> String {
    "replica-0".to_string()
}

fn default_device() -> String {
    "cpu".to_string()
}

fn default_models_dir() -> PathBuf {
    PathBuf::from("models")
}

fn default_catalog_file() -> String {
    "registry.json".to_string()
}

fn default_required_files() -> Vec<String> {
    vec![
        "config.json".to_string(),
        "pytorch_model.bin".to_string(),
        "tokenizer.json".to_string(),
    ]
}

fn default_optimize_on_load() -> bool {
    true
}

fn default_min_batch_size() -> usize {
    1
}

fn default_max_batch_size() -> usize {
    32
}

fn default_batching_window_ms() -> u64 {
    5
}

fn default_max_queue_size() -> usize {
    1024
}

fn default_safety_margin() -> f64 {
    0.8
}

fn default_memory_threshold() -> f64 {
    0.9
}

fn default_device_capacity() -> u64 {
    16 * 1024 * 1024 * 1024 // 16 GiB
}

fn default_maintenance_interval() -> u64 {
    30
}

fn default_cache_enabled() -> bool {
    true
}

fn default_cache_capacity() -> usize {
    1024
}

fn default_replicas() -> usize {
    2
}

fn default_health_check_interval() -> u64 {
    5
}

fn default_probe_timeout() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics() -> bool {
    true
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            models_dir: default_models_dir(),
            catalog_file: default_catalog_file(),
            required_files: default_required_files(),
            optimize_on_load: default_optimize_on_load(),
        }
    }
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            min_batch_size: default_min_batch_size(),
            max_batch_size: default_max_batch_size(),
            batching_window_ms: default_batching_window_ms(),
            max_queue_size: default_max_queue_size(),
            safety_margin: default_safety_margin(),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            threshold: default_memory_threshold(),
            device_capacity_bytes: default_device_capacity(),
            maintenance_interval_secs: default_maintenance_interval(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            capacity: default_cache_capacity(),
            ttl_secs: None,
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            enable_metrics: default_metrics(),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            replicas: default_replicas(),
            health_check_interval_secs: default_health_check_interval(),
            probe_timeout_ms: default_probe_timeout(),
            skip_unhealthy: false,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            replica_id: default_replica_id(),
            device: default_device(),
            default_model: None,
            default_version: None,
            registry: RegistryConfig::default(),
            batching: BatchingConfig::default(),
            memory: MemoryConfig::default(),
            cache: CacheConfig::default(),
            preload: Vec::new(),
        }
    }
}

impl RegistryConfig {
    /// Full path of the persisted catalog
    pub fn catalog_path(&self) -> PathBuf {
        self.models_dir.join(&self.catalog_file)
    }
}

impl BatchingConfig {
    /// Validate batch bounds
    pub fn validate(&self) -> Result<()> {
        if self.min_batch_size == 0 {
            return Err(ServeError::config("min_batch_size must be at least 1"));
        }
        if self.min_batch_size > self.max_batch_size {
            return Err(ServeError::config(format!(
                "min_batch_size {} exceeds max_batch_size {}",
                self.min_batch_size, self.max_batch_size
            )));
        }
        if !(self.safety_margin > 0.0 && self.safety_margin <= 1.0) {
            return Err(ServeError::config(format!(
                "safety_margin must be in (0, 1], got {}",
                self.safety_margin
            )));
        }
        if self.max_queue_size == 0 {
            return Err(ServeError::config("max_queue_size must be at least 1"));
        }
        Ok(())
    }

    /// Get the accumulation window as Duration
    pub fn batching_window(&self) -> Duration {
        Duration::from_millis(self.batching_window_ms)
    }
}

impl MemoryConfig {
    /// Validate governor settings
    pub fn validate(&self) -> Result<()> {
        if !(self.threshold > 0.0 && self.threshold <= 1.0) {
            return Err(ServeError::config(format!(
                "memory threshold must be in (0, 1], got {}",
                self.threshold
            )));
        }
        if self.device_capacity_bytes == 0 {
            return Err(ServeError::config("device_capacity_bytes must be positive"));
        }
        Ok(())
    }

    /// Get the maintenance interval as Duration
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs.max(1))
    }
}

impl CacheConfig {
    /// Get the entry time-to-live as Duration
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }
}

impl EngineConfig {
    /// Validate all nested sections
    pub fn validate(&self) -> Result<()> {
        self.batching.validate()?;
        self.memory.validate()?;
        if self.cache.enabled && self.cache.capacity == 0 {
            return Err(ServeError::config("cache capacity must be positive when enabled"));
        }
        if self.registry.required_files.is_empty() {
            return Err(ServeError::config("registry.required_files must not be empty"));
        }
        Ok(())
    }
}

impl DispatcherConfig {
    /// Get the health check interval as Duration
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }

    /// Get the probe timeout as Duration
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl ObservabilityConfig {
    /// Validate the log level
    pub fn validate(&self) -> Result<()> {
        match self.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
            other => Err(ServeError::config(format!("Invalid log level: {}", other))),
        }
    }

    /// Default tracing filter enabling `log_level` for each target
    pub fn filter_directive(&self, targets: &[&str]) -> String {
        targets
            .iter()
            .map(|target| format!("{}={}", target, self.log_level))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl ServeConfig {
    /// Load configuration from a YAML file, applying environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ServeError::config(format!(
                "Config file {} does not exist",
                path.display()
            )));
        }

        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Yaml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| {
                ServeError::config(format!("Failed to read config file {}: {}", path.display(), e))
            })?;

        let config: ServeConfig = settings.try_deserialize().map_err(|e| {
            ServeError::config(format!("Failed to parse config file {}: {}", path.display(), e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string (no environment overrides)
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: ServeConfig = serde_yaml::from_str(content)
            .map_err(|e| ServeError::config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Render the effective configuration as YAML
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| ServeError::config(format!("Failed to render config: {}", e)))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(observability) = &self.observability {
            observability.validate()?;
        }

        match self.mode.as_str() {
            "engine" => {
                let engine = self
                    .engine
                    .as_ref()
                    .ok_or_else(|| ServeError::config("Engine config required for engine mode"))?;
                engine.validate()?;
            }
            "dispatcher" => {
                let dispatcher = self.dispatcher.as_ref().ok_or_else(|| {
                    ServeError::config("Dispatcher config required for dispatcher mode")
                })?;
                if dispatcher.replicas == 0 {
                    return Err(ServeError::config("dispatcher.replicas must be at least 1"));
                }
                // Local replicas are built from the engine section
                self.engine
                    .as_ref()
                    .ok_or_else(|| ServeError::config("Engine config required for dispatcher mode"))?
                    .validate()?;
            }
            _ => {
                return Err(ServeError::config(format!("Invalid mode: {}", self.mode)));
            }
        }
        Ok(())
    }

    /// Get the engine section
    pub fn engine(&self) -> Result<&EngineConfig> {
        self.engine
            .as_ref()
            .ok_or_else(|| ServeError::config("Engine config not found"))
    }

    /// Get the dispatcher section
    pub fn dispatcher(&self) -> Result<&DispatcherConfig> {
        self.dispatcher
            .as_ref()
            .ok_or_else(|| ServeError::config("Dispatcher config not found"))
    }

    /// Observability section, or its defaults when absent
    pub fn observability(&self) -> ObservabilityConfig {
        self.observability.clone().unwrap_or_default()
    }
}
