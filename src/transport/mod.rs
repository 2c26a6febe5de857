//! Transport
//!
//! Frames outbound messages, batches the eligible ones per endpoint, and
//! compresses large bodies. A batch flushes when it reaches `max_batch_size`
//! or `batch_timeout` after its first frame, whichever comes first; that wait
//! is the only deliberate suspension in the pipeline.
//!
//! Callers get a [`ReplyHandle`]. Dropping it does not retract a frame that
//! is already buffered: the batch still goes out and the reply is discarded.

pub mod policy;
pub mod wire;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ServeConfig;
use crate::error::{Result, ServeError};

pub use policy::{DefaultSendPolicy, ImmediatePolicy, SendPolicy};
pub use wire::{Envelope, HttpWire, Wire};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Request,
    Notification,
    Response,
    Error,
}

/// One outbound JSON-RPC message
#[derive(Debug, Clone)]
pub struct Frame {
    pub id: Uuid,
    pub endpoint: String,
    pub session_id: Option<Uuid>,
    pub kind: FrameKind,
    pub priority: Priority,
    pub message: Value,
}

impl Frame {
    pub fn request(
        endpoint: &str,
        session_id: Option<Uuid>,
        method: &str,
        params: Value,
        priority: Priority,
    ) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            endpoint: endpoint.to_string(),
            session_id,
            kind: FrameKind::Request,
            priority,
            message: json!({
                "jsonrpc": "2.0",
                "id": id.to_string(),
                "method": method,
                "params": params,
            }),
        }
    }

    pub fn notification(endpoint: &str, method: &str, params: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            endpoint: endpoint.to_string(),
            session_id: None,
            kind: FrameKind::Notification,
            priority: Priority::Normal,
            message: json!({ "jsonrpc": "2.0", "method": method, "params": params }),
        }
    }

    fn expects_reply(&self) -> bool {
        self.kind == FrameKind::Request
    }
}

/// Batching and retry settings
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub batch_timeout: Duration,
    pub max_batch_size: usize,
    /// Extra attempts after the first failed transmission
    pub retries: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::from(&ServeConfig::default())
    }
}

impl From<&ServeConfig> for TransportConfig {
    fn from(config: &ServeConfig) -> Self {
        Self {
            batch_timeout: config.batch_timeout(),
            max_batch_size: config.max_batch_size.max(1),
            retries: config.transport_retries,
        }
    }
}

/// Pending reply for one submitted frame
#[derive(Debug)]
pub struct ReplyHandle {
    rx: oneshot::Receiver<Result<Value>>,
}

impl ReplyHandle {
    pub async fn wait(self) -> Result<Value> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(ServeError::Transport("reply channel closed".into())))
    }
}

/// Transport counters
#[derive(Debug, Default)]
struct Counters {
    frames: AtomicU64,
    immediate: AtomicU64,
    batches: AtomicU64,
    compressed: AtomicU64,
    bytes_raw: AtomicU64,
    bytes_sent: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransportStats {
    pub frames_sent: u64,
    pub immediate_sends: u64,
    pub batches_flushed: u64,
    pub compressed_bodies: u64,
    pub bytes_raw: u64,
    pub bytes_sent: u64,
    pub failed_transmissions: u64,
}

struct PendingBatch {
    generation: u64,
    frames: Vec<Frame>,
    waiters: Vec<oneshot::Sender<Result<Value>>>,
}

#[derive(Default)]
struct BatchTable {
    pending: HashMap<String, PendingBatch>,
    next_generation: u64,
}

struct TransportInner {
    wire: Arc<dyn Wire>,
    policy: Arc<dyn SendPolicy>,
    config: TransportConfig,
    batches: Mutex<BatchTable>,
    counters: Counters,
}

/// Batching, compressing transport
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl Transport {
    pub fn new(wire: Arc<dyn Wire>, policy: Arc<dyn SendPolicy>, config: TransportConfig) -> Self {
        Self {
            inner: Arc::new(TransportInner {
                wire,
                policy,
                config,
                batches: Mutex::new(BatchTable::default()),
                counters: Counters::default(),
            }),
        }
    }

    /// Send a frame and wait for its reply
    pub async fn send(&self, frame: Frame) -> Result<Value> {
        self.submit(frame).wait().await
    }

    /// Hand a frame to the transport; batchable frames are buffered,
    /// everything else is transmitted right away.
    pub fn submit(&self, frame: Frame) -> ReplyHandle {
        let (tx, rx) = oneshot::channel();
        self.inner.counters.frames.fetch_add(1, Ordering::Relaxed);

        if self.inner.policy.should_batch(&frame) {
            self.enqueue(frame, tx);
        } else {
            self.inner.counters.immediate.fetch_add(1, Ordering::Relaxed);
            let inner = Arc::clone(&self.inner);
            let endpoint = frame.endpoint.clone();
            tokio::spawn(async move {
                inner.transmit(endpoint, vec![frame], vec![tx], false).await;
            });
        }
        ReplyHandle { rx }
    }

    fn enqueue(&self, frame: Frame, tx: oneshot::Sender<Result<Value>>) {
        let endpoint = frame.endpoint.clone();
        let mut start_timer = None;
        let mut full = None;
        {
            let mut table = self.inner.batches.lock();
            let BatchTable {
                pending,
                next_generation,
            } = &mut *table;

            let batch = pending.entry(endpoint.clone()).or_insert_with(|| {
                *next_generation += 1;
                start_timer = Some(*next_generation);
                PendingBatch {
                    generation: *next_generation,
                    frames: Vec::new(),
                    waiters: Vec::new(),
                }
            });
            batch.frames.push(frame);
            batch.waiters.push(tx);

            if batch.frames.len() >= self.inner.config.max_batch_size {
                full = pending.remove(&endpoint);
            }
        }

        if let Some(batch) = full {
            debug!("Batch for {} full ({} frames)", endpoint, batch.frames.len());
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                inner
                    .transmit(endpoint, batch.frames, batch.waiters, true)
                    .await;
            });
        } else if let Some(generation) = start_timer {
            let inner = Arc::clone(&self.inner);
            let timeout = self.inner.config.batch_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let batch = inner.take_batch(&endpoint, Some(generation));
                if let Some(batch) = batch {
                    debug!("Batch timer fired for {} ({} frames)", endpoint, batch.frames.len());
                    inner
                        .transmit(endpoint, batch.frames, batch.waiters, true)
                        .await;
                }
            });
        }
    }

    /// Transmit whatever is buffered for `endpoint` now
    pub async fn flush_batch(&self, endpoint: &str) {
        if let Some(batch) = self.inner.take_batch(endpoint, None) {
            self.inner
                .transmit(endpoint.to_string(), batch.frames, batch.waiters, true)
                .await;
        }
    }

    /// Flush every endpoint's buffer (used at shutdown)
    pub async fn flush_all(&self) {
        let endpoints: Vec<String> = self.inner.batches.lock().pending.keys().cloned().collect();
        for endpoint in endpoints {
            self.flush_batch(&endpoint).await;
        }
    }

    pub fn pending(&self, endpoint: &str) -> usize {
        self.inner
            .batches
            .lock()
            .pending
            .get(endpoint)
            .map_or(0, |b| b.frames.len())
    }

    pub fn stats(&self) -> TransportStats {
        let c = &self.inner.counters;
        TransportStats {
            frames_sent: c.frames.load(Ordering::Relaxed),
            immediate_sends: c.immediate.load(Ordering::Relaxed),
            batches_flushed: c.batches.load(Ordering::Relaxed),
            compressed_bodies: c.compressed.load(Ordering::Relaxed),
            bytes_raw: c.bytes_raw.load(Ordering::Relaxed),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            failed_transmissions: c.failures.load(Ordering::Relaxed),
        }
    }
}

impl TransportInner {
    /// Remove the buffered batch, optionally only if it is still `generation`
    fn take_batch(&self, endpoint: &str, generation: Option<u64>) -> Option<PendingBatch> {
        let mut table = self.batches.lock();
        match (table.pending.get(endpoint), generation) {
            (Some(batch), Some(g)) if batch.generation != g => None,
            (Some(_), _) => table.pending.remove(endpoint),
            (None, _) => None,
        }
    }

    fn encode(&self, endpoint: &str, frames: &[Frame], batched: bool) -> Result<Envelope> {
        let raw = if batched {
            let messages: Vec<&Value> = frames.iter().map(|f| &f.message).collect();
            serde_json::to_vec(&messages)
        } else {
            serde_json::to_vec(&frames[0].message)
        }
        .map_err(|e| ServeError::Transport(format!("encode failed: {}", e)))?;

        self.counters
            .bytes_raw
            .fetch_add(raw.len() as u64, Ordering::Relaxed);

        let (body, compressed) = if self.policy.should_compress(raw.len()) {
            let packed = policy::gzip(&raw)
                .map_err(|e| ServeError::Transport(format!("compression failed: {}", e)))?;
            self.counters.compressed.fetch_add(1, Ordering::Relaxed);
            (packed, true)
        } else {
            (raw, false)
        };

        Ok(Envelope {
            endpoint: endpoint.to_string(),
            body,
            compressed,
            batched,
            frame_count: frames.len(),
        })
    }

    /// All-or-nothing transmission with bounded retries
    async fn transmit(
        &self,
        endpoint: String,
        frames: Vec<Frame>,
        waiters: Vec<oneshot::Sender<Result<Value>>>,
        batched: bool,
    ) {
        if batched {
            self.counters.batches.fetch_add(1, Ordering::Relaxed);
        }

        let result = match self.encode(&endpoint, &frames, batched) {
            Ok(envelope) => self.transmit_with_retry(&envelope, &frames).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(replies) => {
                for (waiter, reply) in waiters.into_iter().zip(replies) {
                    // Receiver gone means the caller gave up; the reply is dropped
                    let _ = waiter.send(Ok(reply));
                }
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Transmission of {} frames to {} failed: {}",
                    frames.len(),
                    endpoint,
                    e
                );
                for waiter in waiters {
                    let _ = waiter.send(Err(e.clone()));
                }
            }
        }
    }

    async fn transmit_with_retry(
        &self,
        envelope: &Envelope,
        frames: &[Frame],
    ) -> Result<Vec<Value>> {
        let mut attempt = 0;
        loop {
            let outcome = self
                .wire
                .transmit(envelope)
                .await
                .and_then(|replies| align_replies(frames, replies));

            match outcome {
                Ok(replies) => {
                    self.counters
                        .bytes_sent
                        .fetch_add(envelope.body.len() as u64, Ordering::Relaxed);
                    return Ok(replies);
                }
                Err(e) if attempt < self.config.retries => {
                    attempt += 1;
                    debug!(
                        "Retrying transmission to {} (attempt {}): {}",
                        envelope.endpoint, attempt, e
                    );
                }
                Err(e) => {
                    let message = match e {
                        ServeError::Transport(m) => m,
                        other => other.to_string(),
                    };
                    return Err(ServeError::Transport(format!(
                        "{} frame(s) to {} failed after {} attempt(s): {}",
                        frames.len(),
                        envelope.endpoint,
                        attempt + 1,
                        message
                    )));
                }
            }
        }
    }
}

/// Match replies to frames by JSON-RPC id, falling back to position.
///
/// A request without a reply fails the whole set.
fn align_replies(frames: &[Frame], replies: Vec<Value>) -> Result<Vec<Value>> {
    let mut by_id: HashMap<String, Value> = HashMap::with_capacity(replies.len());
    let mut positional = Vec::new();
    for reply in replies {
        match reply.get("id").and_then(|v| v.as_str()) {
            Some(id) => {
                by_id.insert(id.to_string(), reply);
            }
            None => positional.push(reply),
        }
    }

    if by_id.is_empty() && positional.len() == frames.len() {
        return Ok(positional);
    }

    frames
        .iter()
        .map(|frame| {
            if !frame.expects_reply() {
                return Ok(Value::Null);
            }
            by_id.remove(&frame.id.to_string()).ok_or_else(|| {
                ServeError::Transport(format!("missing reply for frame {}", frame.id))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::time::Instant;

    /// Echoes every request and records envelopes
    #[derive(Default)]
    struct EchoWire {
        envelopes: Mutex<Vec<Envelope>>,
        fail: bool,
    }

    #[async_trait]
    impl Wire for EchoWire {
        async fn transmit(&self, envelope: &Envelope) -> Result<Vec<Value>> {
            self.envelopes.lock().push(envelope.clone());
            if self.fail {
                return Err(ServeError::Transport("connection refused".into()));
            }
            let raw = if envelope.compressed {
                policy::gunzip(&envelope.body).unwrap()
            } else {
                envelope.body.clone()
            };
            let body: Value = serde_json::from_slice(&raw).unwrap();
            let messages = match body {
                Value::Array(items) => items,
                single => vec![single],
            };
            Ok(messages
                .into_iter()
                .filter(|m| m.get("id").is_some())
                .map(|m| json!({"jsonrpc": "2.0", "id": m["id"], "result": m["params"]}))
                .collect())
        }
    }

    fn transport(wire: Arc<EchoWire>, timeout_ms: u64, max: usize) -> Transport {
        Transport::new(
            wire,
            Arc::new(DefaultSendPolicy::default()),
            TransportConfig {
                batch_timeout: Duration::from_millis(timeout_ms),
                max_batch_size: max,
                retries: 2,
            },
        )
    }

    fn request(n: u64, priority: Priority) -> Frame {
        Frame::request("http://e", None, "tools/call", json!({ "n": n }), priority)
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_message_flushes_at_timeout() {
        let wire = Arc::new(EchoWire::default());
        let transport = transport(Arc::clone(&wire), 10, 100);

        let start = Instant::now();
        let handle = transport.submit(request(1, Priority::Normal));
        assert_eq!(transport.pending("http://e"), 1);

        let reply = handle.wait().await.unwrap();
        let elapsed = start.elapsed();
        assert_eq!(reply["result"]["n"], 1);
        assert!(elapsed >= Duration::from_millis(10), "flushed early: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(12), "flushed late: {:?}", elapsed);
        assert!(wire.envelopes.lock()[0].batched);
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_threshold_flushes_immediately_in_order() {
        let wire = Arc::new(EchoWire::default());
        let transport = transport(Arc::clone(&wire), 1_000, 3);

        let start = Instant::now();
        let handles: Vec<ReplyHandle> = (0..3)
            .map(|n| transport.submit(request(n, Priority::Normal)))
            .collect();
        for (n, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.wait().await.unwrap()["result"]["n"], n as u64);
        }
        assert!(start.elapsed() < Duration::from_millis(1));

        let envelopes = wire.envelopes.lock();
        assert_eq!(envelopes.len(), 1);
        let body: Value = serde_json::from_slice(&envelopes[0].body).unwrap();
        let order: Vec<u64> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["params"]["n"].as_u64().unwrap())
            .collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_high_priority_bypasses_batch() {
        let wire = Arc::new(EchoWire::default());
        let transport = transport(Arc::clone(&wire), 1_000, 100);

        let start = Instant::now();
        let reply = transport.send(request(7, Priority::High)).await.unwrap();
        assert_eq!(reply["result"]["n"], 7);
        assert!(start.elapsed() < Duration::from_millis(1));
        assert!(!wire.envelopes.lock()[0].batched);
        assert_eq!(transport.stats().immediate_sends, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_failure_is_all_or_nothing() {
        let wire = Arc::new(EchoWire {
            fail: true,
            ..Default::default()
        });
        let transport = transport(Arc::clone(&wire), 5, 100);

        let a = transport.submit(request(1, Priority::Normal));
        let b = transport.submit(request(2, Priority::Normal));
        let ea = a.wait().await.unwrap_err();
        let eb = b.wait().await.unwrap_err();
        assert!(matches!(ea, ServeError::Transport(_)));
        assert_eq!(ea, eb);
        // One attempt plus two retries
        assert_eq!(wire.envelopes.lock().len(), 3);
        assert_eq!(transport.stats().failed_transmissions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_handle_still_sends() {
        let wire = Arc::new(EchoWire::default());
        let transport = transport(Arc::clone(&wire), 10, 100);

        drop(transport.submit(request(1, Priority::Normal)));
        let kept = transport.submit(request(2, Priority::Normal));
        kept.wait().await.unwrap();

        let body: Value = serde_json::from_slice(&wire.envelopes.lock()[0].body).unwrap();
        assert_eq!(body.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_large_body_is_compressed() {
        let wire = Arc::new(EchoWire::default());
        let transport = Transport::new(
            Arc::clone(&wire) as Arc<dyn Wire>,
            Arc::new(DefaultSendPolicy {
                compression_enabled: true,
                compression_threshold_bytes: 256,
            }),
            TransportConfig::default(),
        );

        let big = "x".repeat(4096);
        let frame = Frame::request(
            "http://e",
            None,
            "tools/call",
            json!({ "blob": big }),
            Priority::High,
        );
        let reply = transport.send(frame).await.unwrap();
        assert_eq!(reply["result"]["blob"].as_str().unwrap().len(), 4096);

        let envelope = &wire.envelopes.lock()[0];
        assert!(envelope.compressed);
        let stats = transport.stats();
        assert!(stats.bytes_sent < stats.bytes_raw);
    }

    #[tokio::test]
    async fn test_explicit_flush() {
        let wire = Arc::new(EchoWire::default());
        let transport = transport(Arc::clone(&wire), 60_000, 100);

        let handle = transport.submit(request(1, Priority::Normal));
        let notice = transport.submit(Frame::notification(
            "http://e",
            "notifications/progress",
            json!({}),
        ));
        transport.flush_batch("http://e").await;

        assert_eq!(handle.wait().await.unwrap()["result"]["n"], 1);
        assert_eq!(notice.wait().await.unwrap(), Value::Null);
        assert_eq!(transport.pending("http://e"), 0);
    }

    #[test]
    fn test_align_replies_missing_request_fails() {
        let frames = vec![request(1, Priority::Normal), request(2, Priority::Normal)];
        let replies = vec![json!({"id": frames[0].id.to_string(), "result": 1})];
        assert!(align_replies(&frames, replies).is_err());
    }

    #[test]
    fn test_align_replies_out_of_order() {
        let frames = vec![request(1, Priority::Normal), request(2, Priority::Normal)];
        let replies = vec![
            json!({"id": frames[1].id.to_string(), "result": 2}),
            json!({"id": frames[0].id.to_string(), "result": 1}),
        ];
        let aligned = align_replies(&frames, replies).unwrap();
        assert_eq!(aligned[0]["result"], 1);
        assert_eq!(aligned[1]["result"], 2);
    }
}
