//! Error taxonomy for the serving core
//!
//! A cache miss is not an error here: the cache returns `None` and the server
//! computes and stores the value.

use thiserror::Error;

/// Errors surfaced by the serving pipeline
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ServeError {
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("No healthy backend available")]
    BackendUnavailable,

    #[error("Session pool exhausted for endpoint {0}")]
    PoolExhausted(String),

    #[error("Backend call to {endpoint} timed out after {after_ms}ms")]
    Timeout { endpoint: String, after_ms: u64 },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, ServeError>;

impl ServeError {
    /// JSON-RPC error code for the MCP front end
    pub fn code(&self) -> i32 {
        match self {
            Self::ToolNotFound(_) => -32000,
            Self::Backend(_) => -32001,
            Self::BackendUnavailable => -32010,
            Self::PoolExhausted(_) => -32011,
            Self::Timeout { .. } => -32012,
            Self::Transport(_) => -32013,
            Self::Config(_) => -32603,
        }
    }

    /// Short machine-readable kind, used in responses and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ToolNotFound(_) => "tool_not_found",
            Self::BackendUnavailable => "backend_unavailable",
            Self::PoolExhausted(_) => "pool_exhausted",
            Self::Timeout { .. } => "timeout",
            Self::Transport(_) => "transport_error",
            Self::Backend(_) => "backend_error",
            Self::Config(_) => "config_error",
        }
    }

    /// Whether the server may retry the request on another backend
    pub fn is_failover(&self) -> bool {
        matches!(self, Self::PoolExhausted(_) | Self::Transport(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct() {
        let errors = [
            ServeError::ToolNotFound("x".into()),
            ServeError::BackendUnavailable,
            ServeError::PoolExhausted("e".into()),
            ServeError::Timeout { endpoint: "e".into(), after_ms: 5 },
            ServeError::Transport("boom".into()),
            ServeError::Backend("bad".into()),
            ServeError::Config("cfg".into()),
        ];
        let mut codes: Vec<i32> = errors.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_failover_classification() {
        assert!(ServeError::PoolExhausted("e".into()).is_failover());
        assert!(ServeError::Transport("x".into()).is_failover());
        assert!(!ServeError::Timeout { endpoint: "e".into(), after_ms: 1 }.is_failover());
        assert!(!ServeError::ToolNotFound("t".into()).is_failover());
    }
}
