//! Configuration management
//!
//! Options come from an optional TOML file (`TOOLSERVE_CONFIG`) and are then
//! overridden by `TOOLSERVE_*` environment variables.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::ServeError;
use crate::index::ToolSpec;

/// Backend selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingStrategy {
    RoundRobin,
    LeastConnections,
    ResponseTime,
    #[default]
    Weighted,
}

impl RoutingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round-robin",
            Self::LeastConnections => "least-connections",
            Self::ResponseTime => "response-time",
            Self::Weighted => "weighted",
        }
    }
}

impl FromStr for RoutingStrategy {
    type Err = ServeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "round-robin" | "round_robin" | "roundrobin" => Ok(Self::RoundRobin),
            "least-connections" | "least_connections" => Ok(Self::LeastConnections),
            "response-time" | "response_time" => Ok(Self::ResponseTime),
            "weighted" => Ok(Self::Weighted),
            other => Err(ServeError::Config(format!("unknown routing strategy: {}", other))),
        }
    }
}

/// Weights for the weighted routing score
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RoutingWeights {
    pub load: f64,
    pub response_time: f64,
    pub affinity: f64,
}

impl Default for RoutingWeights {
    fn default() -> Self {
        Self {
            load: 0.4,
            response_time: 0.4,
            affinity: 0.2,
        }
    }
}

/// A backend executor declared in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    pub endpoint: String,
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    /// Tool categories this backend prefers to serve
    #[serde(default)]
    pub categories: Vec<String>,
}

fn default_capacity() -> u32 {
    100
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServeConfig {
    /// Maximum live sessions per endpoint
    pub max_connections: usize,
    /// Sessions created per endpoint at startup
    pub min_connections: usize,
    pub idle_timeout_ms: u64,
    /// Uses before a session is retired
    pub max_usage_count: u64,
    pub batch_timeout_ms: u64,
    pub max_batch_size: usize,
    pub compression_enabled: bool,
    pub l1_max_entries: usize,
    pub l2_ttl_ms: u64,
    pub routing_strategy: RoutingStrategy,

    /// Pool-wide session capacity (defaults to 4 x maxConnections)
    pub max_total_sessions: Option<usize>,
    pub compression_threshold_bytes: usize,
    pub l2_max_entries: usize,
    /// SQLite file for the persistent cache tier (disabled when unset)
    pub persistent_cache_path: Option<PathBuf>,
    pub persistent_max_entries: usize,
    pub request_timeout_ms: u64,
    /// Consecutive timeouts before a session is flagged unhealthy
    pub unhealthy_after_timeouts: u32,
    pub transport_retries: u32,
    pub health_check_interval_ms: u64,
    pub routing_weights: RoutingWeights,
    pub latency_sample_size: usize,

    pub backends: Vec<BackendConfig>,
    pub tools: Vec<ToolSpec>,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 2,
            idle_timeout_ms: 300_000,
            max_usage_count: 1000,
            batch_timeout_ms: 10,
            max_batch_size: 100,
            compression_enabled: true,
            l1_max_entries: 1000,
            l2_ttl_ms: 300_000,
            routing_strategy: RoutingStrategy::default(),
            max_total_sessions: None,
            compression_threshold_bytes: 1024,
            l2_max_entries: 10_000,
            persistent_cache_path: None,
            persistent_max_entries: 50_000,
            request_timeout_ms: 30_000,
            unhealthy_after_timeouts: 3,
            transport_retries: 2,
            health_check_interval_ms: 10_000,
            routing_weights: RoutingWeights::default(),
            latency_sample_size: 1000,
            backends: Vec::new(),
            tools: Vec::new(),
        }
    }
}

impl ServeConfig {
    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse config TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// Load configuration from the optional config file and environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("TOOLSERVE_CONFIG") {
            Ok(path) => Self::load(Path::new(&path))?,
            Err(_) => Self::default(),
        };

        if let Some(v) = env_parse("TOOLSERVE_MAX_CONNECTIONS") {
            config.max_connections = v;
        }
        if let Some(v) = env_parse("TOOLSERVE_MIN_CONNECTIONS") {
            config.min_connections = v;
        }
        if let Some(v) = env_parse("TOOLSERVE_IDLE_TIMEOUT_MS") {
            config.idle_timeout_ms = v;
        }
        if let Some(v) = env_parse("TOOLSERVE_MAX_USAGE_COUNT") {
            config.max_usage_count = v;
        }
        if let Some(v) = env_parse("TOOLSERVE_BATCH_TIMEOUT_MS") {
            config.batch_timeout_ms = v;
        }
        if let Some(v) = env_parse("TOOLSERVE_MAX_BATCH_SIZE") {
            config.max_batch_size = v;
        }
        if let Ok(v) = std::env::var("TOOLSERVE_COMPRESSION_ENABLED") {
            config.compression_enabled = v == "true" || v == "1";
        }
        if let Some(v) = env_parse("TOOLSERVE_L1_MAX_ENTRIES") {
            config.l1_max_entries = v;
        }
        if let Some(v) = env_parse("TOOLSERVE_L2_TTL_MS") {
            config.l2_ttl_ms = v;
        }
        if let Ok(v) = std::env::var("TOOLSERVE_ROUTING_STRATEGY") {
            config.routing_strategy = v.parse()?;
        }
        if let Some(v) = env_parse("TOOLSERVE_REQUEST_TIMEOUT_MS") {
            config.request_timeout_ms = v;
        }
        if let Ok(v) = std::env::var("TOOLSERVE_CACHE_PATH") {
            config.persistent_cache_path = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("TOOLSERVE_BACKENDS") {
            config.backends = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|endpoint| BackendConfig {
                    endpoint: endpoint.to_string(),
                    capacity: default_capacity(),
                    categories: Vec::new(),
                })
                .collect();
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot honor
    pub fn validate(&self) -> std::result::Result<(), ServeError> {
        if self.max_connections == 0 {
            return Err(ServeError::Config("maxConnections must be greater than 0".into()));
        }
        if self.min_connections > self.max_connections {
            return Err(ServeError::Config(format!(
                "minConnections ({}) exceeds maxConnections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if self.max_batch_size == 0 {
            return Err(ServeError::Config("maxBatchSize must be greater than 0".into()));
        }
        if self.l1_max_entries == 0 || self.l2_max_entries == 0 {
            return Err(ServeError::Config("cache tier capacities must be greater than 0".into()));
        }
        if self.health_check_interval_ms == 0 {
            return Err(ServeError::Config(
                "healthCheckIntervalMs must be greater than 0".into(),
            ));
        }
        if self.pool_capacity() < self.max_connections {
            return Err(ServeError::Config(
                "maxTotalSessions must be at least maxConnections".into(),
            ));
        }
        Ok(())
    }

    pub fn pool_capacity(&self) -> usize {
        self.max_total_sessions
            .unwrap_or(self.max_connections.saturating_mul(4))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn l2_ttl(&self) -> Duration {
        Duration::from_millis(self.l2_ttl_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pool_capacity(), 40);
        assert_eq!(config.batch_timeout(), Duration::from_millis(10));
        assert_eq!(config.routing_strategy, RoutingStrategy::Weighted);
    }

    #[test]
    fn test_parse_toml() {
        let config = ServeConfig::from_toml_str(
            r#"
            maxConnections = 2
            minConnections = 1
            routingStrategy = "least-connections"
            l1MaxEntries = 1
            compressionEnabled = false

            [[backends]]
            endpoint = "http://a:9000"
            categories = ["search"]

            [[backends]]
            endpoint = "http://b:9000"
            capacity = 20

            [[tools]]
            name = "web_search"
            category = "search"
            "#,
        )
        .unwrap();

        assert_eq!(config.max_connections, 2);
        assert_eq!(config.routing_strategy, RoutingStrategy::LeastConnections);
        assert!(!config.compression_enabled);
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.backends[0].capacity, 100);
        assert_eq!(config.backends[1].capacity, 20);
        assert_eq!(config.tools[0].name, "web_search");
        assert!(config.tools[0].cacheable);
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!(
            "round-robin".parse::<RoutingStrategy>().unwrap(),
            RoutingStrategy::RoundRobin
        );
        assert_eq!(
            "Response_Time".parse::<RoutingStrategy>().unwrap(),
            RoutingStrategy::ResponseTime
        );
        assert!("random".parse::<RoutingStrategy>().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_bounds() {
        let config = ServeConfig {
            min_connections: 5,
            max_connections: 2,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ServeConfig {
            max_batch_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_health_interval() {
        let config = ServeConfig {
            health_check_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ServeError::Config("healthCheckIntervalMs must be greater than 0".into()))
        );
    }
}
