//! Dynamic batch scheduling
//!
//! Requests are admitted through a lock-free queue, grouped per model, and
//! executed in batches whose size adapts to device headroom. The cache is
//! consulted before a request is admitted, and a request whose model cannot
//! be loaded is rejected before it reaches the queue.

use crate::cache::{CacheKey, CachedGeneration, ResponseCache};
use crate::memory::{MemoryGovernor, MemorySample};
use crate::model::{Device, GenerationInput};
use crate::registry::{LoadedModelHandle, ModelKey, ModelRegistry};
use crate::request::{GenerationRequest, GenerationResult};
use crossbeam::queue::SegQueue;
use modelserve_common::config::BatchingConfig;
use modelserve_common::metrics::LatencyTimer;
use modelserve_common::{Result, ServeError, METRICS};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

/// A request admitted to the queue, with its model already loaded
pub struct PendingRequest {
    request: GenerationRequest,
    key: ModelKey,
    handle: Arc<LoadedModelHandle>,
    cache_key: CacheKey,
    reply: oneshot::Sender<Result<GenerationResult>>,
}

/// Requests executed together against one model
pub struct BatchJob {
    pub requests: Vec<PendingRequest>,
    pub assigned_size: usize,
    pub handle: Arc<LoadedModelHandle>,
}

/// Outcome of one scheduling cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub model: ModelKey,
    /// Requests in the batch
    pub size: usize,
    /// Size chosen by the sizer
    pub assigned_size: usize,
    pub succeeded: bool,
}

/// Adaptive batch sizing from device headroom
#[derive(Debug, Clone)]
pub struct BatchSizer {
    min_batch_size: usize,
    max_batch_size: usize,
    safety_margin: f64,
    last_batch_size: Option<usize>,
}

impl BatchSizer {
    pub fn new(config: &BatchingConfig) -> Self {
        Self {
            min_batch_size: config.min_batch_size,
            max_batch_size: config.max_batch_size,
            safety_margin: config.safety_margin,
            last_batch_size: None,
        }
    }

    /// Size for the next batch
    ///
    /// Without history this is `max_batch_size`. Otherwise the per-request
    /// cost is estimated from the last batch and the free bytes are divided
    /// by it, scaled by the safety margin and clamped to the configured bounds.
    pub fn next_size(&self, sample: &MemorySample) -> usize {
        let Some(previous) = self.last_batch_size.filter(|&size| size > 0) else {
            return self.max_batch_size;
        };

        let per_request = sample.device_bytes_used as f64 / previous as f64;
        if per_request <= 0.0 {
            return self.max_batch_size;
        }

        let candidate =
            (sample.free_device_bytes() as f64 / per_request * self.safety_margin).floor();
        (candidate as usize).clamp(self.min_batch_size, self.max_batch_size)
    }

    /// Remember the size of a completed batch
    pub fn record(&mut self, size: usize) {
        self.last_batch_size = Some(size);
    }

    pub fn last_batch_size(&self) -> Option<usize> {
        self.last_batch_size
    }
}

struct LoopState {
    backlog: VecDeque<PendingRequest>,
    sizer: BatchSizer,
}

/// Per-replica batch scheduler
pub struct BatchScheduler {
    config: BatchingConfig,
    device: Device,
    default_model: Option<String>,
    default_version: Option<String>,
    registry: Arc<ModelRegistry>,
    governor: Arc<MemoryGovernor>,
    cache: Arc<ResponseCache>,

    /// Intake queue (lock-free)
    queue: SegQueue<PendingRequest>,

    /// Requests admitted but not yet batched
    queue_depth: AtomicUsize,

    shutdown: AtomicBool,
    /// Pushes hold it shared; shutdown takes it exclusively before draining
    intake: RwLock<()>,
    notify: Notify,

    /// Owned by whichever task is running a scheduling cycle
    state: Mutex<LoopState>,
}

impl BatchScheduler {
    pub fn new(
        config: BatchingConfig,
        device: Device,
        registry: Arc<ModelRegistry>,
        cache: Arc<ResponseCache>,
    ) -> Self {
        let governor = registry.governor().clone();
        let sizer = BatchSizer::new(&config);
        Self {
            config,
            device,
            default_model: None,
            default_version: None,
            registry,
            governor,
            cache,
            queue: SegQueue::new(),
            queue_depth: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            intake: RwLock::new(()),
            notify: Notify::new(),
            state: Mutex::new(LoopState {
                backlog: VecDeque::new(),
                sizer,
            }),
        }
    }

    /// Model served when a request does not name one
    pub fn with_default_model(mut self, name: Option<String>, version: Option<String>) -> Self {
        self.default_model = name;
        self.default_version = version;
        self
    }

    /// Submit a request and wait for its result
    pub async fn submit(&self, request: GenerationRequest) -> Result<GenerationResult> {
        METRICS.inference.requests_total.inc();
        METRICS.inference.active_requests.inc();
        let timer = METRICS.inference.request_duration.start_timer();

        let request_id = request.request_id.clone();
        let result = self.admit(request).await;

        METRICS.inference.active_requests.dec();
        timer.observe_duration();
        match &result {
            Ok(generated) => {
                METRICS.inference.requests_success.inc();
                METRICS.inference.tokens_generated_total.inc_by(generated.token_count);
            }
            Err(e) => {
                METRICS.inference.requests_failed.inc();
                debug!("Request {} failed: {}", request_id, e);
            }
        }
        result
    }

    async fn admit(&self, request: GenerationRequest) -> Result<GenerationResult> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(ServeError::replica_unavailable("scheduler is shutting down"));
        }

        request.validate()?;

        let (name, version) = match &request.model_name {
            Some(name) => (name.clone(), request.version.clone()),
            None => {
                let name = self.default_model.clone().ok_or_else(|| {
                    ServeError::validation("no model requested and no default model configured")
                })?;
                (name, request.version.clone().or_else(|| self.default_version.clone()))
            }
        };

        let descriptor = self
            .registry
            .resolve(&name, version.as_deref())
            .map_err(|e| unavailable(&name, e))?;

        let cache_key = CacheKey::for_request(&request, &descriptor.name, &descriptor.version);
        if let Some(hit) = self.cache.get(&cache_key) {
            return Ok(GenerationResult {
                texts: hit.texts,
                model_name: descriptor.name,
                version: descriptor.version,
                latency: request.submitted_at.elapsed(),
                token_count: hit.token_count,
                cached: true,
            });
        }

        let handle = {
            let registry = self.registry.clone();
            let device = self.device;
            let (name, version) = (descriptor.name.clone(), descriptor.version.clone());
            tokio::task::spawn_blocking(move || registry.load(&name, Some(&version), device))
                .await
                .map_err(|e| ServeError::internal(format!("load task failed: {}", e)))?
                .map_err(|e| unavailable(&descriptor.name, e))?
        };

        let receiver = {
            // Shutdown may have started while the model was loading
            let _intake = self.intake.read();
            if self.shutdown.load(Ordering::Acquire) {
                return Err(ServeError::replica_unavailable("scheduler is shutting down"));
            }

            if self.queue_depth.load(Ordering::Relaxed) >= self.config.max_queue_size {
                return Err(ServeError::queue_full(
                    "Request queue is full, rejecting new request",
                ));
            }

            let (reply, receiver) = oneshot::channel();
            self.queue.push(PendingRequest {
                key: descriptor.key(),
                request,
                handle,
                cache_key,
                reply,
            });
            let depth = self.queue_depth.fetch_add(1, Ordering::Relaxed) + 1;
            METRICS.engine.queue_depth.set(depth as i64);
            trace!("Request queued, queue depth: {}", depth);
            receiver
        };
        self.notify.notify_one();

        receiver
            .await
            .map_err(|_| ServeError::replica_unavailable("request dropped by scheduler"))?
    }

    /// Run one scheduling cycle
    ///
    /// Waits up to one batching window for work; returns `None` if none
    /// arrived.
    pub async fn step(&self) -> Option<BatchReport> {
        let mut state = self.state.lock().await;
        let window = self.config.batching_window();

        self.drain_queue(&mut state.backlog);
        if state.backlog.is_empty() {
            if self.shutdown.load(Ordering::Acquire) {
                return None;
            }
            let _ = timeout(window, self.notify.notified()).await;
            self.drain_queue(&mut state.backlog);
        }
        let key = state.backlog.front()?.key.clone();

        self.relieve_pressure().await;

        let sample = self.governor.sample();
        let assigned_size = state.sizer.next_size(&sample).max(1);

        // Accumulate until enough same-model requests or the window closes
        let started = Instant::now();
        loop {
            let matching = state.backlog.iter().filter(|p| p.key == key).count();
            if matching >= assigned_size || self.shutdown.load(Ordering::Acquire) {
                break;
            }
            let remaining = window.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                break;
            }
            let _ = timeout(remaining, self.notify.notified()).await;
            self.drain_queue(&mut state.backlog);
        }

        let mut requests = Vec::with_capacity(assigned_size);
        let mut rest = VecDeque::with_capacity(state.backlog.len());
        for pending in state.backlog.drain(..) {
            if requests.len() < assigned_size && pending.key == key {
                requests.push(pending);
            } else {
                rest.push_back(pending);
            }
        }
        state.backlog = rest;

        let depth = self
            .queue_depth
            .fetch_sub(requests.len(), Ordering::Relaxed)
            .saturating_sub(requests.len());
        METRICS.engine.queue_depth.set(depth as i64);

        let handle = requests[0].handle.clone();
        let report = self
            .execute(BatchJob {
                requests,
                assigned_size,
                handle,
            })
            .await;

        state.sizer.record(report.size);
        Some(report)
    }

    /// Run scheduling cycles until shutdown
    pub async fn run(self: Arc<Self>) {
        info!(
            "Batch scheduler started on {} (batch size {}..={}, window {:?})",
            self.device,
            self.config.min_batch_size,
            self.config.max_batch_size,
            self.config.batching_window()
        );

        while !self.shutdown.load(Ordering::Acquire) {
            self.step().await;
        }

        info!("Batch scheduler stopped");
    }

    /// Stop accepting work and fail everything still queued
    pub async fn shutdown(&self) {
        {
            let _intake = self.intake.write();
            self.shutdown.store(true, Ordering::Release);
        }
        self.notify.notify_waiters();

        let mut state = self.state.lock().await;
        self.drain_queue(&mut state.backlog);
        let pending = state.backlog.len();
        for request in state.backlog.drain(..) {
            let _ = request
                .reply
                .send(Err(ServeError::replica_unavailable("scheduler shut down")));
        }
        self.queue_depth.store(0, Ordering::Relaxed);
        METRICS.engine.queue_depth.set(0);

        if pending > 0 {
            warn!("Failed {} queued requests on shutdown", pending);
        }
    }

    /// Requests admitted but not yet batched
    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }

    /// Check if the queue is healthy (not saturated)
    pub fn is_healthy(&self) -> bool {
        let depth = self.queue_depth.load(Ordering::Relaxed);
        !self.shutdown.load(Ordering::Acquire)
            && depth.saturating_mul(10) < self.config.max_queue_size.saturating_mul(9)
    }

    fn drain_queue(&self, backlog: &mut VecDeque<PendingRequest>) {
        while let Some(pending) = self.queue.pop() {
            backlog.push_back(pending);
        }
    }

    async fn relieve_pressure(&self) {
        if !self.governor.should_evict() {
            return;
        }

        let governor = self.governor.clone();
        let device = self.device;
        if let Err(e) = tokio::task::spawn_blocking(move || governor.reclaim(device)).await {
            warn!("Reclaim task failed: {}", e);
        }
    }

    async fn execute(&self, job: BatchJob) -> BatchReport {
        let BatchJob {
            requests,
            assigned_size,
            handle,
        } = job;
        let size = requests.len();
        let model = handle.key();

        let inputs: Vec<GenerationInput> = requests
            .iter()
            .map(|pending| GenerationInput {
                prompts: pending.request.prompts.clone(),
                params: pending.request.params.clone(),
            })
            .collect();

        debug!("Executing batch of {} for {} (assigned {})", size, model, assigned_size);

        let started = Instant::now();
        let lock = self.governor.device_lock(handle.device());
        let accounting = self.governor.accounting().clone();
        let worker = handle.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let _guard = lock.lock();
            accounting.reserve_transient(worker.model().workspace_bytes(&inputs));
            METRICS
                .inference
                .generation_duration
                .time(|| worker.model().generate(&inputs))
        })
        .await
        .unwrap_or_else(|e| Err(ServeError::generation(format!("generation task failed: {}", e))))
        .and_then(|outputs| {
            if outputs.len() == size {
                Ok(outputs)
            } else {
                Err(ServeError::generation(format!(
                    "model returned {} outputs for {} requests",
                    outputs.len(),
                    size
                )))
            }
        });

        METRICS.engine.batch_size.observe(size as f64);
        METRICS.engine.batches_total.inc();

        let outputs = match outcome {
            Ok(outputs) => outputs,
            Err(e) => {
                METRICS.engine.batch_failures.inc();
                let reason = match e {
                    ServeError::Generation(reason) => reason,
                    other => other.to_string(),
                };
                error!("Batch of {} for {} failed: {}", size, model, reason);
                for pending in requests {
                    let _ = pending.reply.send(Err(ServeError::generation(reason.clone())));
                }
                return BatchReport {
                    model,
                    size,
                    assigned_size,
                    succeeded: false,
                };
            }
        };

        // One pressure reading covers every insert from this batch
        let under_pressure = self.cache.under_pressure();

        for (pending, output) in requests.into_iter().zip(outputs) {
            let token_count: u64 = output
                .texts
                .iter()
                .map(|text| handle.tokenizer().count_tokens(text) as u64)
                .sum();

            self.cache.put_unless(
                under_pressure,
                pending.cache_key,
                CachedGeneration {
                    texts: output.texts.clone(),
                    token_count,
                },
            );

            let result = GenerationResult {
                texts: output.texts,
                model_name: pending.key.name,
                version: pending.key.version,
                latency: pending.request.submitted_at.elapsed(),
                token_count,
                cached: false,
            };
            if pending.reply.send(Ok(result)).is_err() {
                trace!("Request {} was abandoned", pending.request.request_id);
            }
        }

        debug!(
            "Batch of {} for {} completed in {:?}",
            size,
            model,
            started.elapsed()
        );

        BatchReport {
            model,
            size,
            assigned_size,
            succeeded: true,
        }
    }
}

fn unavailable(name: &str, cause: ServeError) -> ServeError {
    warn!("Rejecting request for {}: {}", name, cause);
    ServeError::model_unavailable(format!("{}: {}", name, cause))
}
