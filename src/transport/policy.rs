//! Send policy: which frames are batched and which bodies are compressed

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

use super::{Frame, FrameKind, Priority};

/// Decides how an outbound frame travels
pub trait SendPolicy: Send + Sync {
    /// Whether the frame may wait in a batch buffer
    fn should_batch(&self, frame: &Frame) -> bool;

    /// Whether a transmission body of `len` bytes is compressed
    fn should_compress(&self, len: usize) -> bool;
}

/// Batch normal-priority requests and notifications; compress large bodies
#[derive(Debug, Clone)]
pub struct DefaultSendPolicy {
    pub compression_enabled: bool,
    pub compression_threshold_bytes: usize,
}

impl Default for DefaultSendPolicy {
    fn default() -> Self {
        Self {
            compression_enabled: true,
            compression_threshold_bytes: 1024,
        }
    }
}

impl SendPolicy for DefaultSendPolicy {
    fn should_batch(&self, frame: &Frame) -> bool {
        frame.priority != Priority::High
            && !matches!(frame.kind, FrameKind::Response | FrameKind::Error)
    }

    fn should_compress(&self, len: usize) -> bool {
        self.compression_enabled && len > self.compression_threshold_bytes
    }
}

/// Never batch; useful for latency-critical deployments and tests
#[derive(Debug, Clone, Default)]
pub struct ImmediatePolicy;

impl SendPolicy for ImmediatePolicy {
    fn should_batch(&self, _frame: &Frame) -> bool {
        false
    }

    fn should_compress(&self, _len: usize) -> bool {
        false
    }
}

pub fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::fast());
    encoder.write_all(data)?;
    encoder.finish()
}

pub fn gunzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::with_capacity(data.len() * 2);
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(kind: FrameKind, priority: Priority) -> Frame {
        let mut frame = Frame::request("http://e", None, "tools/call", json!({}), priority);
        frame.kind = kind;
        frame
    }

    #[test]
    fn test_batch_eligibility() {
        let policy = DefaultSendPolicy::default();
        assert!(policy.should_batch(&frame(FrameKind::Request, Priority::Normal)));
        assert!(policy.should_batch(&frame(FrameKind::Notification, Priority::Normal)));
        assert!(!policy.should_batch(&frame(FrameKind::Request, Priority::High)));
        assert!(!policy.should_batch(&frame(FrameKind::Response, Priority::Normal)));
        assert!(!policy.should_batch(&frame(FrameKind::Error, Priority::Normal)));
    }

    #[test]
    fn test_compression_threshold() {
        let policy = DefaultSendPolicy {
            compression_enabled: true,
            compression_threshold_bytes: 100,
        };
        assert!(!policy.should_compress(100));
        assert!(policy.should_compress(101));

        let disabled = DefaultSendPolicy {
            compression_enabled: false,
            compression_threshold_bytes: 0,
        };
        assert!(!disabled.should_compress(1_000_000));
    }

    #[test]
    fn test_gzip_shrinks_repetitive_payloads() {
        let data = "abc".repeat(1000).into_bytes();
        let packed = gzip(&data).unwrap();
        assert!(packed.len() < data.len() / 10);
        assert_eq!(gunzip(&packed).unwrap(), data);
    }
}
