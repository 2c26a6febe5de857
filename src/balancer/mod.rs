//! Backend Load Balancer
//!
//! Picks a healthy backend per request with a pluggable [`RoutingPolicy`].
//! Backend statistics live in atomics, so metric updates only take the
//! registry's read lock and never block selection.

pub mod health;

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{BackendConfig, RoutingStrategy, RoutingWeights};
use crate::error::{Result, ServeError};

pub use health::{HealthMonitor, HealthProbe, HttpProbe};

/// Weight of the newest sample in the rolling response time
const RESPONSE_TIME_ALPHA: f64 = 0.3;

/// One backend executor
pub struct BackendInstance {
    id: usize,
    endpoint: String,
    capacity: u32,
    categories: Vec<String>,
    connections: AtomicU64,
    response_time_bits: AtomicU64,
    samples: AtomicU64,
    healthy: AtomicBool,
}

impl BackendInstance {
    fn new(id: usize, config: BackendConfig) -> Self {
        Self {
            id,
            endpoint: config.endpoint,
            capacity: config.capacity,
            categories: config.categories,
            connections: AtomicU64::new(0),
            response_time_bits: AtomicU64::new(0f64.to_bits()),
            samples: AtomicU64::new(0),
            healthy: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    /// Rolling response time in milliseconds (0 until the first sample)
    pub fn response_time_ms(&self) -> f64 {
        f64::from_bits(self.response_time_bits.load(Ordering::Relaxed))
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn serves_category(&self, category: &str) -> bool {
        self.categories.iter().any(|c| c == category)
    }

    /// Fraction of capacity in use, clamped to `[0, 1]`
    pub fn load_ratio(&self) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        (self.connections() as f64 / self.capacity as f64).min(1.0)
    }

    fn apply(&self, delta: MetricsDelta) {
        match delta {
            MetricsDelta::ConnectionOpened => {
                self.connections.fetch_add(1, Ordering::Relaxed);
            }
            MetricsDelta::ConnectionClosed => {
                let _ = self
                    .connections
                    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
                        Some(c.saturating_sub(1))
                    });
            }
            MetricsDelta::ResponseTime(ms) => {
                let first = self.samples.fetch_add(1, Ordering::Relaxed) == 0;
                let _ = self.response_time_bits.fetch_update(
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    |bits| {
                        let current = f64::from_bits(bits);
                        let next = if first {
                            ms
                        } else {
                            current + RESPONSE_TIME_ALPHA * (ms - current)
                        };
                        Some(next.to_bits())
                    },
                );
            }
            MetricsDelta::HealthCheck(pass) => {
                let was = self.healthy.swap(pass, Ordering::AcqRel);
                if was != pass {
                    if pass {
                        info!("Backend {} recovered", self.endpoint);
                    } else {
                        warn!("Backend {} marked unhealthy", self.endpoint);
                    }
                }
            }
        }
    }

    pub fn snapshot(&self) -> BackendSnapshot {
        BackendSnapshot {
            id: self.id,
            endpoint: self.endpoint.clone(),
            healthy: self.is_healthy(),
            connections: self.connections(),
            capacity: self.capacity,
            response_time_ms: self.response_time_ms(),
        }
    }
}

impl std::fmt::Debug for BackendInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendInstance")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("healthy", &self.is_healthy())
            .field("connections", &self.connections())
            .finish()
    }
}

/// Point-in-time view of a backend
#[derive(Debug, Clone, Serialize)]
pub struct BackendSnapshot {
    pub id: usize,
    pub endpoint: String,
    pub healthy: bool,
    pub connections: u64,
    pub capacity: u32,
    pub response_time_ms: f64,
}

/// Metric update for one backend
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricsDelta {
    ConnectionOpened,
    ConnectionClosed,
    ResponseTime(f64),
    /// Result of a health check; the only thing that flips health
    HealthCheck(bool),
}

/// Chooses one backend among healthy candidates (given in registration order)
pub trait RoutingPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn select(&self, candidates: &[Arc<BackendInstance>], category: Option<&str>) -> Option<usize>;
}

/// Cycles through the healthy set
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl RoutingPolicy for RoundRobin {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn select(
        &self,
        candidates: &[Arc<BackendInstance>],
        _category: Option<&str>,
    ) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(self.next.fetch_add(1, Ordering::Relaxed) % candidates.len())
    }
}

/// Fewest current connections; ties go to the first registered
#[derive(Debug, Default)]
pub struct LeastConnections;

impl RoutingPolicy for LeastConnections {
    fn name(&self) -> &'static str {
        "least-connections"
    }

    fn select(
        &self,
        candidates: &[Arc<BackendInstance>],
        _category: Option<&str>,
    ) -> Option<usize> {
        // min_by_key returns the first of equal minima
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, b)| b.connections())
            .map(|(i, _)| i)
    }
}

/// Lowest rolling response time; ties go to the first registered
#[derive(Debug, Default)]
pub struct FastestResponse;

impl RoutingPolicy for FastestResponse {
    fn name(&self) -> &'static str {
        "response-time"
    }

    fn select(
        &self,
        candidates: &[Arc<BackendInstance>],
        _category: Option<&str>,
    ) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.response_time_ms().total_cmp(&b.response_time_ms()))
            .map(|(i, _)| i)
    }
}

/// Highest blended score of spare capacity, speed and category affinity
#[derive(Debug, Default)]
pub struct Weighted {
    pub weights: RoutingWeights,
}

impl Weighted {
    pub fn score(&self, backend: &BackendInstance, category: Option<&str>) -> f64 {
        let affinity = match category {
            Some(c) if backend.serves_category(c) => 1.0,
            _ => 0.0,
        };
        self.weights.load * (1.0 - backend.load_ratio())
            + self.weights.response_time * (1.0 / (backend.response_time_ms() + 1.0))
            + self.weights.affinity * affinity
    }
}

impl RoutingPolicy for Weighted {
    fn name(&self) -> &'static str {
        "weighted"
    }

    fn select(&self, candidates: &[Arc<BackendInstance>], category: Option<&str>) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (i, backend) in candidates.iter().enumerate() {
            let score = self.score(backend, category);
            // Strictly greater keeps the earliest registration on equal scores
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((i, score));
            }
        }
        best.map(|(i, _)| i)
    }
}

/// Build the policy for a configured strategy
pub fn policy_for(strategy: RoutingStrategy, weights: RoutingWeights) -> Box<dyn RoutingPolicy> {
    match strategy {
        RoutingStrategy::RoundRobin => Box::new(RoundRobin::default()),
        RoutingStrategy::LeastConnections => Box::new(LeastConnections),
        RoutingStrategy::ResponseTime => Box::new(FastestResponse),
        RoutingStrategy::Weighted => Box::new(Weighted { weights }),
    }
}

/// Backend registry plus routing policy
pub struct LoadBalancer {
    policy: Box<dyn RoutingPolicy>,
    backends: RwLock<Vec<Arc<BackendInstance>>>,
}

impl LoadBalancer {
    pub fn new(strategy: RoutingStrategy, weights: RoutingWeights) -> Self {
        Self::with_policy(policy_for(strategy, weights))
    }

    pub fn with_policy(policy: Box<dyn RoutingPolicy>) -> Self {
        Self {
            policy,
            backends: RwLock::new(Vec::new()),
        }
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Register a backend; registration order is the tie-break order
    pub fn register(&self, config: BackendConfig) -> usize {
        let mut backends = self.backends.write();
        let id = backends.len();
        info!("Registered backend #{}: {}", id, config.endpoint);
        backends.push(Arc::new(BackendInstance::new(id, config)));
        id
    }

    pub fn select_backend(&self, category: Option<&str>) -> Result<Arc<BackendInstance>> {
        self.select_backend_excluding(category, &[])
    }

    /// Select among healthy backends not in `exclude` (used for failover)
    pub fn select_backend_excluding(
        &self,
        category: Option<&str>,
        exclude: &[usize],
    ) -> Result<Arc<BackendInstance>> {
        let candidates: Vec<Arc<BackendInstance>> = self
            .backends
            .read()
            .iter()
            .filter(|b| b.is_healthy() && !exclude.contains(&b.id))
            .cloned()
            .collect();

        let chosen = self
            .policy
            .select(&candidates, category)
            .and_then(|i| candidates.get(i))
            .cloned()
            .ok_or(ServeError::BackendUnavailable)?;

        debug!(
            "Selected backend {} via {} ({} candidates)",
            chosen.endpoint,
            self.policy.name(),
            candidates.len()
        );
        Ok(chosen)
    }

    /// Apply a metric update; unknown ids are ignored
    pub fn update_metrics(&self, id: usize, delta: MetricsDelta) {
        if let Some(backend) = self.backends.read().get(id) {
            backend.apply(delta);
        }
    }

    pub fn get(&self, id: usize) -> Option<Arc<BackendInstance>> {
        self.backends.read().get(id).cloned()
    }

    pub fn backends(&self) -> Vec<Arc<BackendInstance>> {
        self.backends.read().clone()
    }

    pub fn healthy_count(&self) -> usize {
        self.backends.read().iter().filter(|b| b.is_healthy()).count()
    }

    pub fn snapshot(&self) -> Vec<BackendSnapshot> {
        self.backends.read().iter().map(|b| b.snapshot()).collect()
    }
}
