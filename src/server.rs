//! Request-serving façade
//!
//! Per request: cache lookup, tool resolution, backend selection, session
//! lease, transport send, then the result is recorded into the cache, the
//! metrics and the tool/backend statistics. `PoolExhausted` and transport
//! failures fail over to the next healthy backend; every other error is
//! returned as is.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::balancer::{
    policy_for, BackendInstance, HealthMonitor, HealthProbe, HttpProbe, LoadBalancer,
    MetricsDelta, RoutingPolicy,
};
use crate::cache::{Tier, TieredCache};
use crate::config::ServeConfig;
use crate::error::{Result, ServeError};
use crate::index::{Tool, ToolDefinition, ToolIndex};
use crate::metrics::{HealthReport, LatencyTimer, MetricsCollector};
use crate::pool::{PoolConfig, ReleaseOutcome, SessionPool};
use crate::transport::{
    DefaultSendPolicy, Frame, HttpWire, Priority, SendPolicy, Transport, TransportConfig, Wire,
};

/// An incoming tool invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolRequest {
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default)]
    pub priority: Priority,
    /// Routing hint; defaults to the tool's own category
    #[serde(default)]
    pub category: Option<String>,
}

impl ToolRequest {
    pub fn new(tool_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            arguments,
            priority: Priority::Normal,
            category: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }
}

/// Outcome of one request
#[derive(Debug, Clone)]
pub struct ToolResponse {
    pub result: Result<Value>,
    pub latency_ms: f64,
    /// Cache tier that answered, if any
    pub cache_tier: Option<Tier>,
}

impl ToolResponse {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    /// `{ result | error, latencyMs }`
    pub fn to_json(&self) -> Value {
        match &self.result {
            Ok(value) => json!({
                "result": value,
                "latencyMs": self.latency_ms,
                "cacheTier": self.cache_tier,
            }),
            Err(e) => json!({
                "error": { "code": e.code(), "kind": e.kind(), "message": e.to_string() },
                "latencyMs": self.latency_ms,
            }),
        }
    }
}

/// Wires explicit component instances into a [`Server`]
pub struct ServerBuilder {
    config: ServeConfig,
    index: Option<ToolIndex>,
    wire: Option<Arc<dyn Wire>>,
    send_policy: Option<Arc<dyn SendPolicy>>,
    routing: Option<Box<dyn RoutingPolicy>>,
    probe: Option<Arc<dyn HealthProbe>>,
    cache: Option<TieredCache>,
}

impl ServerBuilder {
    /// Use a prebuilt index instead of `config.tools` with passthrough handlers
    pub fn index(mut self, index: ToolIndex) -> Self {
        self.index = Some(index);
        self
    }

    pub fn wire(mut self, wire: Arc<dyn Wire>) -> Self {
        self.wire = Some(wire);
        self
    }

    pub fn send_policy(mut self, policy: Arc<dyn SendPolicy>) -> Self {
        self.send_policy = Some(policy);
        self
    }

    pub fn routing_policy(mut self, policy: Box<dyn RoutingPolicy>) -> Self {
        self.routing = Some(policy);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn cache(mut self, cache: TieredCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn build(self) -> Result<Server> {
        let config = self.config;
        config.validate()?;

        let index = match self.index {
            Some(index) => index,
            None => ToolIndex::from_specs(config.tools.clone())?,
        };

        let wire: Arc<dyn Wire> = match self.wire {
            Some(wire) => wire,
            None => Arc::new(
                HttpWire::new(config.request_timeout())
                    .map_err(|e| ServeError::Transport(format!("HTTP client: {}", e)))?,
            ),
        };
        let send_policy = self.send_policy.unwrap_or_else(|| {
            Arc::new(DefaultSendPolicy {
                compression_enabled: config.compression_enabled,
                compression_threshold_bytes: config.compression_threshold_bytes,
            })
        });
        let transport = Transport::new(wire, send_policy, TransportConfig::from(&config));

        let routing = self
            .routing
            .unwrap_or_else(|| policy_for(config.routing_strategy, config.routing_weights));
        let balancer = LoadBalancer::with_policy(routing);
        for backend in &config.backends {
            balancer.register(backend.clone());
        }

        let cache = self.cache.unwrap_or_else(|| TieredCache::from_config(&config));

        info!(
            "Server ready: {} tools, {} backends, routing={}",
            index.len(),
            config.backends.len(),
            balancer.policy_name()
        );

        Ok(Server {
            pool: SessionPool::new(PoolConfig::from(&config)),
            metrics: Arc::new(MetricsCollector::new(config.latency_sample_size)),
            index: Arc::new(index),
            balancer: Arc::new(balancer),
            transport,
            cache: Arc::new(cache),
            probe: self.probe,
            monitor: parking_lot::Mutex::new(None),
            config,
        })
    }
}

/// The serving core
pub struct Server {
    config: ServeConfig,
    index: Arc<ToolIndex>,
    pool: SessionPool,
    balancer: Arc<LoadBalancer>,
    transport: Transport,
    cache: Arc<TieredCache>,
    metrics: Arc<MetricsCollector>,
    probe: Option<Arc<dyn HealthProbe>>,
    monitor: parking_lot::Mutex<Option<HealthMonitor>>,
}

impl Server {
    pub fn builder(config: ServeConfig) -> ServerBuilder {
        ServerBuilder {
            config,
            index: None,
            wire: None,
            send_policy: None,
            routing: None,
            probe: None,
            cache: None,
        }
    }

    /// Server with HTTP wire and HTTP health probes
    pub fn new(config: ServeConfig) -> Result<Self> {
        let probe = HttpProbe::new(config.request_timeout())
            .map_err(|e| ServeError::Transport(format!("HTTP client: {}", e)))?;
        Self::builder(config).probe(Arc::new(probe)).build()
    }

    /// Serve one request end to end
    pub async fn handle(&self, request: ToolRequest) -> ToolResponse {
        let timer = LatencyTimer::new("tool_request");
        let (result, cache_tier) = match self.dispatch(&request).await {
            Ok((value, tier)) => (Ok(value), tier),
            Err(e) => (Err(e), None),
        };
        let latency_ms = timer.finish();

        self.metrics.record_request(latency_ms);
        if let Err(e) = &result {
            self.metrics.record_error();
            debug!("Request for {} failed: {}", request.tool_name, e);
        }

        ToolResponse {
            result,
            latency_ms,
            cache_tier,
        }
    }

    async fn dispatch(&self, request: &ToolRequest) -> Result<(Value, Option<Tier>)> {
        let key = TieredCache::compute_key(&request.tool_name, &request.arguments);
        if let Some((value, tier)) = self.cache.get_with_tier(&key) {
            self.metrics.record_cache_hit();
            return Ok((value, Some(tier)));
        }
        self.metrics.record_cache_miss();

        let lookup = LatencyTimer::new("tool_lookup");
        let found = self.index.find(&request.tool_name);
        self.metrics.record_tool_lookup(lookup.finish());
        let tool = found?;

        let category = request.category.as_deref().unwrap_or_else(|| tool.category());
        let mut tried: Vec<usize> = Vec::new();
        let mut last_error: Option<ServeError> = None;

        loop {
            let backend = match self.balancer.select_backend_excluding(Some(category), &tried) {
                Ok(backend) => backend,
                Err(e) => return Err(last_error.unwrap_or(e)),
            };
            tried.push(backend.id());

            match self.call_backend(&tool, &backend, request).await {
                Ok(value) => {
                    if tool.spec().cacheable {
                        self.cache.set(&key, value.clone(), tool.spec().persist);
                    }
                    return Ok((value, None));
                }
                Err(e) if e.is_failover() => {
                    warn!(
                        "Backend {} failed for {}, failing over: {}",
                        backend.endpoint(),
                        tool.name(),
                        e
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn call_backend(
        &self,
        tool: &Tool,
        backend: &BackendInstance,
        request: &ToolRequest,
    ) -> Result<Value> {
        let lease = self.pool.acquire(backend.endpoint())?;
        if lease.reused() {
            self.metrics.record_pool_hit();
        } else {
            self.metrics.record_pool_miss();
        }

        let params = tool.handler().encode(tool.name(), &request.arguments);
        let frame = Frame::request(
            backend.endpoint(),
            Some(lease.id()),
            "tools/call",
            params,
            request.priority,
        );

        self.balancer
            .update_metrics(backend.id(), MetricsDelta::ConnectionOpened);
        let started = Instant::now();
        let timeout = self.config.request_timeout();
        let outcome = tokio::time::timeout(timeout, self.transport.submit(frame).wait()).await;
        self.balancer
            .update_metrics(backend.id(), MetricsDelta::ConnectionClosed);

        match outcome {
            Ok(Ok(reply)) => {
                let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                lease.release(ReleaseOutcome::Success);
                self.balancer
                    .update_metrics(backend.id(), MetricsDelta::ResponseTime(elapsed_ms));
                self.index.record_usage(tool.name(), elapsed_ms);
                tool.handler().decode(reply)
            }
            Ok(Err(e)) => {
                lease.release(ReleaseOutcome::Failure);
                Err(e)
            }
            Err(_) => {
                lease.release(ReleaseOutcome::Timeout);
                Err(ServeError::Timeout {
                    endpoint: backend.endpoint().to_string(),
                    after_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    pub fn health(&self) -> HealthReport {
        self.metrics.health_report()
    }

    /// Health plus component statistics
    pub fn status(&self) -> Value {
        json!({
            "health": self.health(),
            "pool": self.pool.stats(),
            "backends": self.balancer.snapshot(),
            "cache": self.cache.stats(),
            "transport": self.transport.stats(),
        })
    }

    pub fn list_tools(&self) -> Vec<ToolDefinition> {
        self.index.list()
    }

    /// Create `minConnections` idle sessions per registered backend
    pub fn pre_warm(&self) -> usize {
        let per_backend = self.config.min_connections;
        let created: usize = self
            .balancer
            .backends()
            .iter()
            .map(|b| self.pool.pre_warm(b.endpoint(), per_backend))
            .sum();
        info!("Pre-warmed {} sessions", created);
        created
    }

    /// Start background health checks if a probe was configured
    pub fn start_health_monitor(&self) -> bool {
        let Some(probe) = self.probe.clone() else {
            return false;
        };
        let mut monitor = self.monitor.lock();
        if monitor.is_none() {
            *monitor = Some(HealthMonitor::start(
                Arc::clone(&self.balancer),
                probe,
                self.config.health_check_interval(),
            ));
        }
        true
    }

    /// Stop health checks and flush buffered frames
    pub async fn shutdown(&self) {
        let monitor = self.monitor.lock().take();
        if let Some(mut monitor) = monitor {
            monitor.stop().await;
        }
        self.transport.flush_all().await;
        info!("Server shut down");
    }

    pub fn config(&self) -> &ServeConfig {
        &self.config
    }

    pub fn index(&self) -> &ToolIndex {
        &self.index
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    pub fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    pub fn cache(&self) -> &TieredCache {
        &self.cache
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }
}
