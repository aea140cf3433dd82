//! ModelServe Engine
//!
//! Inference serving replica: a persistent model registry, a memory-pressure
//! governor, a dynamic batch scheduler and a response cache.

pub mod artifact;
pub mod batching;
pub mod cache;
pub mod inference;
pub mod memory;
pub mod model;
pub mod registry;
pub mod request;

pub use batching::{BatchReport, BatchScheduler, BatchSizer};
pub use cache::{CacheKey, CacheStats, ResponseCache};
pub use inference::{open_registry, preload, InferenceEngine, MaintenanceReport};
pub use memory::{DeviceAccounting, FixedMemorySource, MemoryGovernor, MemorySample, MemorySource};
pub use model::{ArtifactLoader, Device, GenerativeModel, ModelLoader, Tokenizer};
pub use registry::{LoadedModelHandle, ModelDescriptor, ModelKey, ModelRegistry, ModelStatus};
pub use request::{GenerationRequest, GenerationResult, SamplingParams};
