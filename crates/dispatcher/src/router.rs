//! Request routing and replica health
//!
//! Requests are routed strictly round robin. Health probes run concurrently
//! with an independent timeout per replica; their results are retained for
//! reporting and, when `skip_unhealthy` is set, consulted by routing.

use crate::replica::Replica;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use modelserve_common::config::DispatcherConfig;
use modelserve_common::{Result, ServeError, METRICS};
use modelserve_proto::{GenerateRequest, GenerateResponse};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Health of a replica as of its last probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Last known health of one replica
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaHealth {
    pub replica_id: String,
    pub status: HealthStatus,
    /// None until the first probe completes
    pub last_checked: Option<DateTime<Utc>>,
    /// Failure reason for unhealthy replicas
    pub detail: Option<String>,
}

impl ReplicaHealth {
    fn unknown(replica_id: &str) -> Self {
        Self {
            replica_id: replica_id.to_string(),
            status: HealthStatus::Unknown,
            last_checked: None,
            detail: None,
        }
    }
}

/// Round-robin dispatcher over a fixed replica list
pub struct RequestDispatcher {
    replicas: Vec<Arc<dyn Replica>>,
    next: AtomicUsize,
    health: RwLock<HashMap<String, ReplicaHealth>>,
    health_check_interval: Duration,
    probe_timeout: Duration,
    skip_unhealthy: bool,
}

impl RequestDispatcher {
    pub fn new(replicas: Vec<Arc<dyn Replica>>, config: &DispatcherConfig) -> Result<Self> {
        if replicas.is_empty() {
            return Err(ServeError::config("dispatcher needs at least one replica"));
        }

        let health = replicas
            .iter()
            .map(|replica| (replica.id().to_string(), ReplicaHealth::unknown(replica.id())))
            .collect();

        info!(
            "Dispatcher created with {} replicas (skip_unhealthy={})",
            replicas.len(),
            config.skip_unhealthy
        );

        Ok(Self {
            replicas,
            next: AtomicUsize::new(0),
            health: RwLock::new(health),
            health_check_interval: config.health_check_interval(),
            probe_timeout: config.probe_timeout(),
            skip_unhealthy: config.skip_unhealthy,
        })
    }

    /// Next replica in rotation, wrapping at the end of the list
    pub fn next_replica(&self) -> Arc<dyn Replica> {
        let count = self.replicas.len();

        if self.skip_unhealthy {
            let health = self.health.read();
            for _ in 0..count {
                let replica = &self.replicas[self.next.fetch_add(1, Ordering::Relaxed) % count];
                let unhealthy = health
                    .get(replica.id())
                    .map(|h| h.status == HealthStatus::Unhealthy)
                    .unwrap_or(false);
                if !unhealthy {
                    return replica.clone();
                }
            }
            debug!("No healthy replica, falling back to plain rotation");
        }

        self.replicas[self.next.fetch_add(1, Ordering::Relaxed) % count].clone()
    }

    /// Route a request to the next replica
    pub async fn dispatch(&self, request: GenerateRequest) -> Result<GenerateResponse> {
        let replica = self.next_replica();
        METRICS.dispatcher.requests_routed.inc();
        debug!("Routing request to {}", replica.id());
        replica.generate(request).await
    }

    /// Probe every replica concurrently and record the results
    pub async fn health_check(&self) -> HashMap<String, ReplicaHealth> {
        let probes = self.replicas.iter().map(|replica| self.probe(replica.clone()));
        let results = join_all(probes).await;

        let healthy = results
            .iter()
            .filter(|h| h.status == HealthStatus::Healthy)
            .count();
        METRICS.dispatcher.healthy_replicas.set(healthy as i64);
        METRICS
            .dispatcher
            .unhealthy_replicas
            .set((results.len() - healthy) as i64);

        let mut health = self.health.write();
        for result in &results {
            health.insert(result.replica_id.clone(), result.clone());
        }

        results
            .into_iter()
            .map(|result| (result.replica_id.clone(), result))
            .collect()
    }

    async fn probe(&self, replica: Arc<dyn Replica>) -> ReplicaHealth {
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.probe_timeout, replica.health()).await;
        METRICS
            .dispatcher
            .probe_duration
            .observe(started.elapsed().as_secs_f64());

        let (status, detail) = match outcome {
            Ok(Ok(response)) if response.is_healthy() => (HealthStatus::Healthy, None),
            Ok(Ok(response)) => (
                HealthStatus::Unhealthy,
                Some(format!("replica reported {}", response.status)),
            ),
            Ok(Err(e)) => (HealthStatus::Unhealthy, Some(e.to_string())),
            Err(_) => (
                HealthStatus::Unhealthy,
                Some(format!("probe timed out after {:?}", self.probe_timeout)),
            ),
        };

        if let Some(reason) = &detail {
            warn!("Replica {} is unhealthy: {}", replica.id(), reason);
        }

        ReplicaHealth {
            replica_id: replica.id().to_string(),
            status,
            last_checked: Some(Utc::now()),
            detail,
        }
    }

    /// Latest recorded health of every replica
    pub fn health_snapshot(&self) -> HashMap<String, ReplicaHealth> {
        self.health.read().clone()
    }

    pub fn healthy_count(&self) -> usize {
        self.health
            .read()
            .values()
            .filter(|h| h.status == HealthStatus::Healthy)
            .count()
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    /// Start background health check task
    pub fn start_health_checks(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.health_check_interval);

            loop {
                interval.tick().await;
                let results = self.health_check().await;
                debug!(
                    "Health check: {}/{} replicas healthy",
                    results
                        .values()
                        .filter(|h| h.status == HealthStatus::Healthy)
                        .count(),
                    results.len()
                );
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use modelserve_proto::HealthResponse;

    #[derive(Clone, Copy)]
    enum Behavior {
        Healthy,
        Degraded,
        Failing,
        Hanging,
    }

    struct MockReplica {
        id: String,
        behavior: Behavior,
        calls: AtomicUsize,
    }

    impl MockReplica {
        fn new(id: &str, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                behavior,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Replica for MockReplica {
        fn id(&self) -> &str {
            &self.id
        }

        async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(GenerateResponse {
                generated_text: request.prompt.into_vec(),
                model_name: self.id.clone(),
                version: "1.0".to_string(),
                generation_time: 0.0,
                token_count: 0,
                cached: false,
            })
        }

        async fn health(&self) -> Result<HealthResponse> {
            let status = match self.behavior {
                Behavior::Healthy => "healthy",
                Behavior::Degraded => "unhealthy",
                Behavior::Failing => return Err(ServeError::internal("probe refused")),
                Behavior::Hanging => futures::future::pending().await,
            };
            Ok(HealthResponse {
                status: status.to_string(),
                device: "cpu".to_string(),
                loaded_models: Vec::new(),
            })
        }
    }

    fn config(skip_unhealthy: bool) -> DispatcherConfig {
        DispatcherConfig {
            probe_timeout_ms: 50,
            skip_unhealthy,
            ..DispatcherConfig::default()
        }
    }

    fn dispatcher(replicas: &[Arc<MockReplica>], skip_unhealthy: bool) -> RequestDispatcher {
        let replicas = replicas
            .iter()
            .map(|r| r.clone() as Arc<dyn Replica>)
            .collect();
        RequestDispatcher::new(replicas, &config(skip_unhealthy)).unwrap()
    }

    #[test]
    fn test_round_robin_fairness() {
        let replicas: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|id| MockReplica::new(id, Behavior::Healthy))
            .collect();
        let dispatcher = dispatcher(&replicas, false);

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..10 {
            *counts
                .entry(dispatcher.next_replica().id().to_string())
                .or_default() += 1;
        }

        for id in ["a", "b", "c"] {
            assert!((3..=4).contains(&counts[id]), "{} visited {} times", id, counts[id]);
        }
        assert_eq!(counts.values().sum::<usize>(), 10);
    }

    #[test]
    fn test_rotation_wraps() {
        let replicas: Vec<_> = ["a", "b"]
            .iter()
            .map(|id| MockReplica::new(id, Behavior::Healthy))
            .collect();
        let dispatcher = dispatcher(&replicas, false);

        let order: Vec<String> = (0..5)
            .map(|_| dispatcher.next_replica().id().to_string())
            .collect();
        assert_eq!(order, vec!["a", "b", "a", "b", "a"]);
    }

    #[test]
    fn test_empty_replica_list_rejected() {
        let result = RequestDispatcher::new(Vec::new(), &config(false));
        assert!(matches!(result, Err(ServeError::Config(_))));
    }

    #[tokio::test]
    async fn test_health_check_isolates_failures() {
        let replicas = vec![
            MockReplica::new("ok", Behavior::Healthy),
            MockReplica::new("degraded", Behavior::Degraded),
            MockReplica::new("failing", Behavior::Failing),
            MockReplica::new("hanging", Behavior::Hanging),
        ];
        let dispatcher = dispatcher(&replicas, false);

        let snapshot = dispatcher.health_snapshot();
        assert!(snapshot.values().all(|h| h.status == HealthStatus::Unknown));
        assert_eq!(dispatcher.healthy_count(), 0);

        let results = dispatcher.health_check().await;
        assert_eq!(results.len(), 4);
        assert_eq!(results["ok"].status, HealthStatus::Healthy);
        assert_eq!(results["degraded"].status, HealthStatus::Unhealthy);
        assert_eq!(results["failing"].status, HealthStatus::Unhealthy);
        assert_eq!(results["hanging"].status, HealthStatus::Unhealthy);
        assert!(results["hanging"]
            .detail
            .as_deref()
            .unwrap()
            .contains("timed out"));
        assert!(results.values().all(|h| h.last_checked.is_some()));

        assert_eq!(dispatcher.healthy_count(), 1);
        assert_eq!(dispatcher.health_snapshot(), results);
    }

    #[tokio::test]
    async fn test_unhealthy_replicas_stay_in_rotation_by_default() {
        let replicas = vec![
            MockReplica::new("ok", Behavior::Healthy),
            MockReplica::new("failing", Behavior::Failing),
        ];
        let dispatcher = dispatcher(&replicas, false);
        dispatcher.health_check().await;

        let visited: Vec<String> = (0..4)
            .map(|_| dispatcher.next_replica().id().to_string())
            .collect();
        assert_eq!(visited, vec!["ok", "failing", "ok", "failing"]);
    }

    #[tokio::test]
    async fn test_skip_unhealthy_policy() {
        let replicas = vec![
            MockReplica::new("a", Behavior::Healthy),
            MockReplica::new("b", Behavior::Failing),
            MockReplica::new("c", Behavior::Healthy),
        ];
        let dispatcher = dispatcher(&replicas, true);
        dispatcher.health_check().await;

        for _ in 0..6 {
            assert_ne!(dispatcher.next_replica().id(), "b");
        }
    }

    #[tokio::test]
    async fn test_skip_unhealthy_falls_back_when_none_healthy() {
        let replicas = vec![
            MockReplica::new("a", Behavior::Failing),
            MockReplica::new("b", Behavior::Failing),
        ];
        let dispatcher = dispatcher(&replicas, true);
        dispatcher.health_check().await;

        let ids: Vec<String> = (0..4)
            .map(|_| dispatcher.next_replica().id().to_string())
            .collect();
        assert!(ids.contains(&"a".to_string()));
        assert!(ids.contains(&"b".to_string()));
    }

    #[tokio::test]
    async fn test_dispatch_routes_round_robin() {
        let replicas = vec![
            MockReplica::new("a", Behavior::Healthy),
            MockReplica::new("b", Behavior::Healthy),
        ];
        let dispatcher = dispatcher(&replicas, false);

        for _ in 0..4 {
            let response = dispatcher.dispatch(GenerateRequest::new("hi")).await.unwrap();
            assert_eq!(response.generated_text, vec!["hi".to_string()]);
        }

        assert_eq!(replicas[0].calls.load(Ordering::SeqCst), 2);
        assert_eq!(replicas[1].calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_background_health_checks() {
        let replicas = vec![MockReplica::new("a", Behavior::Healthy)];
        let dispatcher = Arc::new(dispatcher(&replicas, false));

        let handle = dispatcher.clone().start_health_checks();
        while dispatcher.healthy_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.abort();

        assert_eq!(dispatcher.health_snapshot()["a"].status, HealthStatus::Healthy);
    }
}
