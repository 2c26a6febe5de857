//! Wire: moves an encoded envelope to a backend and returns its replies

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, ServeError};

/// One transmission unit: a single frame or a whole batch
#[derive(Debug, Clone)]
pub struct Envelope {
    pub endpoint: String,
    /// JSON object (single) or JSON array (batch), gzip'd when `compressed`
    pub body: Vec<u8>,
    pub compressed: bool,
    pub batched: bool,
    pub frame_count: usize,
}

/// Transmits envelopes. Replies are matched to frames by JSON-RPC id, so
/// a wire may return them in any order and may omit notification replies.
#[async_trait]
pub trait Wire: Send + Sync {
    async fn transmit(&self, envelope: &Envelope) -> Result<Vec<Value>>;
}

/// JSON-RPC over HTTP POST; batches travel as JSON-RPC batch arrays
pub struct HttpWire {
    client: reqwest::Client,
}

impl HttpWire {
    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Wire for HttpWire {
    async fn transmit(&self, envelope: &Envelope) -> Result<Vec<Value>> {
        let mut request = self
            .client
            .post(&envelope.endpoint)
            .header("Content-Type", "application/json")
            .body(envelope.body.clone());
        if envelope.compressed {
            request = request.header("Content-Encoding", "gzip");
        }

        let response = request
            .send()
            .await
            .map_err(|e| ServeError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ServeError::Transport(format!("HTTP {}", response.status())));
        }

        if response.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ServeError::Transport(e.to_string()))?;
        let replies = parse_replies(&bytes)?;
        debug!("← {} replies from {}", replies.len(), envelope.endpoint);
        Ok(replies)
    }
}

/// Decode a JSON-RPC reply body. An empty body is what a server sends back
/// for a batch of notifications.
fn parse_replies(bytes: &[u8]) -> Result<Vec<Value>> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let body: Value = serde_json::from_slice(bytes)
        .map_err(|e| ServeError::Transport(format!("invalid reply body: {}", e)))?;
    match body {
        Value::Array(replies) => Ok(replies),
        single => Ok(vec![single]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_body_has_no_replies() {
        assert_eq!(parse_replies(b"").unwrap(), Vec::<Value>::new());
        assert_eq!(parse_replies(b" \r\n").unwrap(), Vec::<Value>::new());
    }

    #[test]
    fn test_parse_single_and_batch_replies() {
        let single = parse_replies(br#"{"jsonrpc":"2.0","id":"a","result":1}"#).unwrap();
        assert_eq!(single, vec![json!({"jsonrpc": "2.0", "id": "a", "result": 1})]);

        let batch = parse_replies(br#"[{"id":"a","result":1},{"id":"b","result":2}]"#).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1]["id"], "b");

        assert!(matches!(parse_replies(b"<html>"), Err(ServeError::Transport(_))));
    }
}
