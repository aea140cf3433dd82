//! Replica clients used by the dispatcher

use async_trait::async_trait;
use modelserve_common::Result;
use modelserve_engine::InferenceEngine;
use modelserve_proto::{GenerateRequest, GenerateResponse, HealthResponse};
use std::sync::Arc;

/// A serving replica reachable by the dispatcher
#[async_trait]
pub trait Replica: Send + Sync {
    /// Stable replica identifier
    fn id(&self) -> &str;

    /// Forward a generation request
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse>;

    /// Probe replica health
    async fn health(&self) -> Result<HealthResponse>;
}

/// In-process replica backed by an [`InferenceEngine`]
#[derive(Clone)]
pub struct LocalReplica {
    engine: Arc<InferenceEngine>,
}

impl LocalReplica {
    pub fn new(engine: Arc<InferenceEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<InferenceEngine> {
        &self.engine
    }
}

#[async_trait]
impl Replica for LocalReplica {
    fn id(&self) -> &str {
        self.engine.replica_id()
    }

    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse> {
        self.engine.generate(request).await
    }

    async fn health(&self) -> Result<HealthResponse> {
        Ok(self.engine.health())
    }
}
