//! Backend Health Monitor
//!
//! Periodically probes every registered backend and feeds the result into
//! the balancer as `HealthCheck` deltas. Probes run without holding the
//! registry lock.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{LoadBalancer, MetricsDelta};

/// Floor for the probe period; `tokio::time::interval` rejects zero
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Liveness check for one backend endpoint
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self, endpoint: &str) -> bool;
}

/// `GET {endpoint}/health`, healthy on any 2xx
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn check(&self, endpoint: &str) -> bool {
        let url = format!("{}/health", endpoint.trim_end_matches('/'));
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Health probe to {} failed: {}", url, e);
                false
            }
        }
    }
}

/// Background health-check loop
pub struct HealthMonitor {
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    /// Probe every backend once
    pub async fn run_once(balancer: &LoadBalancer, probe: &dyn HealthProbe) {
        for backend in balancer.backends() {
            let pass = probe.check(backend.endpoint()).await;
            balancer.update_metrics(backend.id(), MetricsDelta::HealthCheck(pass));
        }
    }

    /// Spawn the monitor on the current runtime
    pub fn start(
        balancer: Arc<LoadBalancer>,
        probe: Arc<dyn HealthProbe>,
        interval: Duration,
    ) -> Self {
        let interval = interval.max(MIN_INTERVAL);
        let (tx, mut rx) = mpsc::channel::<()>(1);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        Self::run_once(&balancer, probe.as_ref()).await;
                    }
                    _ = rx.recv() => {
                        info!("Health monitor shutting down");
                        break;
                    }
                }
            }
        });

        info!("Health monitor started (interval {}ms)", interval.as_millis());
        Self {
            shutdown_tx: Some(tx),
            handle: Some(handle),
        }
    }

    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("Health monitor task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
