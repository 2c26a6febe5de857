//! Toolserve MCP
//!
//! Request-serving core for a Model Context Protocol tool server: resolves
//! tool calls, routes them to backend executors and keeps per-request
//! latency low under load.
//!
//! # Architecture
//!
//! ```text
//! client ──► MCP (stdio) ──► Server ──► Cache (L1 FIFO / L2 LRU+TTL / SQLite)
//!                              │
//!                              ├── ToolIndex (exact + approximate lookup)
//!                              ├── LoadBalancer (+ HealthMonitor)
//!                              ├── SessionPool (per-endpoint LRU)
//!                              ├── Transport (batching + gzip) ──► backends
//!                              └── MetricsCollector (health verdict)
//! ```

pub mod balancer;
pub mod cache;
pub mod config;
pub mod error;
pub mod index;
pub mod mcp;
pub mod metrics;
pub mod pool;
pub mod server;
pub mod transport;

pub use balancer::{BackendInstance, HealthMonitor, HealthProbe, LoadBalancer, MetricsDelta};
pub use cache::{Tier, TieredCache};
pub use config::{BackendConfig, RoutingStrategy, ServeConfig};
pub use error::{Result, ServeError};
pub use index::{Tool, ToolHandler, ToolIndex, ToolSpec};
pub use mcp::{McpRequest, McpResponse, McpServer};
pub use metrics::{HealthReport, HealthStatus, MetricsCollector};
pub use pool::{ReleaseOutcome, SessionLease, SessionPool};
pub use server::{Server, ToolRequest, ToolResponse};
pub use transport::{Frame, Priority, Transport, Wire};
