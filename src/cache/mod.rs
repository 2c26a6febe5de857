//! Tiered Result Cache
//!
//! Three levels, fastest first:
//! - L1: bounded FIFO
//! - L2: LRU with a TTL
//! - Persistent: optional SQLite tier, written only when asked
//!
//! A hit below L1 is copied upward through every tier above it. Lower tiers
//! keep their copy until their own eviction policy drops it, so an upper
//! tier may briefly lack a value that is still valid further down.
//!
//! The persistent tier fails open: its errors are logged and treated as misses.

pub mod persistent;

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::ServeConfig;

pub use persistent::{PersistentTier, SqliteTier};

/// Where a cached value was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    L1,
    L2,
    Persistent,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub l1_max_entries: usize,
    pub l2_max_entries: usize,
    pub l2_ttl: Duration,
}

impl From<&ServeConfig> for CacheConfig {
    fn from(config: &ServeConfig) -> Self {
        Self {
            l1_max_entries: config.l1_max_entries,
            l2_max_entries: config.l2_max_entries,
            l2_ttl: config.l2_ttl(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::from(&ServeConfig::default())
    }
}

/// Cache statistics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub l1_entries: usize,
    pub l2_entries: usize,
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub persistent_hits: u64,
    pub misses: u64,
    pub persistent_errors: u64,
    pub hit_rate_percent: f64,
}

/// Insertion-ordered tier; the oldest insertion leaves first
struct FifoTier {
    entries: HashMap<String, Value>,
    order: VecDeque<String>,
    capacity: usize,
}

impl FifoTier {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: &str, value: Value) {
        if let Some(slot) = self.entries.get_mut(key) {
            *slot = value;
            return;
        }
        while self.entries.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
        self.order.push_back(key.to_string());
        self.entries.insert(key.to_string(), value);
    }

    fn remove(&mut self, key: &str) {
        if self.entries.remove(key).is_some() {
            self.order.retain(|k| k != key);
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

struct TimedEntry {
    value: Value,
    expires_at: Instant,
}

#[derive(Default)]
struct Counters {
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    persistent_hits: AtomicU64,
    misses: AtomicU64,
    persistent_errors: AtomicU64,
}

/// Multi-tier result cache
pub struct TieredCache {
    l1: Mutex<FifoTier>,
    l2: Mutex<LruCache<String, TimedEntry>>,
    persistent: Option<Arc<dyn PersistentTier>>,
    ttl: Duration,
    counters: Counters,
}

impl TieredCache {
    pub fn new(config: CacheConfig) -> Self {
        let l2_cap = NonZeroUsize::new(config.l2_max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            l1: Mutex::new(FifoTier::new(config.l1_max_entries)),
            l2: Mutex::new(LruCache::new(l2_cap)),
            persistent: None,
            ttl: config.l2_ttl,
            counters: Counters::default(),
        }
    }

    pub fn with_persistent(mut self, tier: Arc<dyn PersistentTier>) -> Self {
        self.persistent = Some(tier);
        self
    }

    /// Build from server config, opening the SQLite tier when a path is set.
    /// An unopenable database disables the tier instead of failing startup.
    pub fn from_config(config: &ServeConfig) -> Self {
        let cache = Self::new(CacheConfig::from(config));
        match &config.persistent_cache_path {
            Some(path) => match SqliteTier::open(path, config.persistent_max_entries) {
                Ok(tier) => cache.with_persistent(Arc::new(tier)),
                Err(e) => {
                    warn!("Persistent cache unavailable ({}): {}", path.display(), e);
                    cache
                }
            },
            None => cache,
        }
    }

    /// Cache key for a tool invocation: SHA256(tool name + canonical arguments)
    pub fn compute_key(tool: &str, arguments: &Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(tool.as_bytes());
        hasher.update([0u8]);
        // serde_json maps are sorted, so equal arguments serialize identically
        hasher.update(arguments.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.get_with_tier(key).map(|(value, _)| value)
    }

    /// Look a key up and report which tier answered
    pub fn get_with_tier(&self, key: &str) -> Option<(Value, Tier)> {
        if let Some(value) = self.l1.lock().get(key) {
            self.counters.l1_hits.fetch_add(1, Ordering::Relaxed);
            return Some((value, Tier::L1));
        }

        let from_l2 = {
            let mut l2 = self.l2.lock();
            let now = Instant::now();
            let (value, expired) = match l2.get(key) {
                Some(entry) if entry.expires_at > now => (Some(entry.value.clone()), false),
                Some(_) => (None, true),
                None => (None, false),
            };
            if expired {
                l2.pop(key);
            }
            value
        };
        if let Some(value) = from_l2 {
            self.counters.l2_hits.fetch_add(1, Ordering::Relaxed);
            self.l1.lock().insert(key, value.clone());
            debug!("Cache L2 hit, promoted: {}", short(key));
            return Some((value, Tier::L2));
        }

        if let Some(value) = self.persistent_get(key) {
            self.counters.persistent_hits.fetch_add(1, Ordering::Relaxed);
            self.insert_l2(key, value.clone());
            self.l1.lock().insert(key, value.clone());
            debug!("Cache persistent hit, promoted: {}", short(key));
            return Some((value, Tier::Persistent));
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Write both in-memory tiers, and the persistent tier when `persist`
    pub fn set(&self, key: &str, value: Value, persist: bool) {
        if persist {
            if let Some(tier) = &self.persistent {
                if let Err(e) = tier.put(key, &value) {
                    self.persistent_failed("write", e);
                }
            }
        }
        self.insert_l2(key, value.clone());
        self.l1.lock().insert(key, value);
    }

    pub fn invalidate(&self, key: &str) {
        self.l1.lock().remove(key);
        self.l2.lock().pop(key);
        if let Some(tier) = &self.persistent {
            if let Err(e) = tier.remove(key) {
                self.persistent_failed("remove", e);
            }
        }
    }

    /// Drop every entry and reset counters
    pub fn clear(&self) {
        self.l1.lock().clear();
        self.l2.lock().clear();
        if let Some(tier) = &self.persistent {
            if let Err(e) = tier.clear() {
                self.persistent_failed("clear", e);
            }
        }
        for counter in [
            &self.counters.l1_hits,
            &self.counters.l2_hits,
            &self.counters.persistent_hits,
            &self.counters.misses,
            &self.counters.persistent_errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> CacheStats {
        let l1_hits = self.counters.l1_hits.load(Ordering::Relaxed);
        let l2_hits = self.counters.l2_hits.load(Ordering::Relaxed);
        let persistent_hits = self.counters.persistent_hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let hits = l1_hits + l2_hits + persistent_hits;
        let total = hits + misses;

        CacheStats {
            l1_entries: self.l1.lock().entries.len(),
            l2_entries: self.l2.lock().len(),
            l1_hits,
            l2_hits,
            persistent_hits,
            misses,
            persistent_errors: self.counters.persistent_errors.load(Ordering::Relaxed),
            hit_rate_percent: if total > 0 {
                (hits as f64 / total as f64) * 100.0
            } else {
                0.0
            },
        }
    }

    fn insert_l2(&self, key: &str, value: Value) {
        self.l2.lock().put(
            key.to_string(),
            TimedEntry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    fn persistent_get(&self, key: &str) -> Option<Value> {
        let tier = self.persistent.as_ref()?;
        match tier.get(key) {
            Ok(found) => found,
            Err(e) => {
                self.persistent_failed("read", e);
                None
            }
        }
    }

    fn persistent_failed(&self, op: &str, e: anyhow::Error) {
        self.counters.persistent_errors.fetch_add(1, Ordering::Relaxed);
        warn!("Persistent cache {} failed: {}", op, e);
    }
}

fn short(key: &str) -> &str {
    &key[..key.len().min(16)]
}
