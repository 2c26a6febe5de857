//! Session Pool
//!
//! Reusable sessions to backend executors, bounded per endpoint and pool-wide.
//! Idle sessions sit in two `LruCache`s (intrusive list + table): one per
//! endpoint for reuse and one pool-wide for capacity eviction, so both paths
//! are O(1). The pool lock is never held across backend I/O.
//!
//! Lifecycle: `Idle -> InUse -> Idle`, or `-> Retired` on idle timeout, usage
//! cap, or repeated timeouts. Retired is terminal.

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ServeConfig;
use crate::error::{Result, ServeError};

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Live (idle + in-use) sessions allowed per endpoint
    pub max_connections: usize,
    /// Sessions allowed across all endpoints
    pub max_total_sessions: usize,
    pub idle_timeout: Duration,
    pub max_usage_count: u64,
    pub unhealthy_after_timeouts: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from(&ServeConfig::default())
    }
}

impl From<&ServeConfig> for PoolConfig {
    fn from(config: &ServeConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            max_total_sessions: config.pool_capacity(),
            idle_timeout: config.idle_timeout(),
            max_usage_count: config.max_usage_count,
            unhealthy_after_timeouts: config.unhealthy_after_timeouts.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Idle,
    InUse,
    Retired,
}

/// A reusable channel to one backend endpoint
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub endpoint: String,
    pub created_at: Instant,
    pub last_used: Instant,
    pub usage_count: u64,
    pub healthy: bool,
    pub state: SessionState,
    consecutive_timeouts: u32,
}

impl Session {
    fn new(endpoint: &str) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            endpoint: endpoint.to_string(),
            created_at: now,
            last_used: now,
            usage_count: 0,
            healthy: true,
            state: SessionState::Idle,
            consecutive_timeouts: 0,
        }
    }

    fn is_reusable(&self, config: &PoolConfig, now: Instant) -> bool {
        self.healthy
            && self.usage_count < config.max_usage_count
            && now.saturating_duration_since(self.last_used) < config.idle_timeout
    }
}

/// How a leased session's call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Success,
    Failure,
    Timeout,
}

struct EndpointSlot {
    idle: LruCache<Uuid, Session>,
    in_use: usize,
}

impl EndpointSlot {
    fn new() -> Self {
        Self {
            idle: LruCache::unbounded(),
            in_use: 0,
        }
    }

    fn live(&self) -> usize {
        self.in_use + self.idle.len()
    }
}

struct PoolState {
    endpoints: HashMap<String, EndpointSlot>,
    /// Pool-wide idle ordering, least recently released first
    idle_order: LruCache<Uuid, String>,
    total: usize,
}

struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
    created: AtomicU64,
    reused: AtomicU64,
    retired: AtomicU64,
}

impl PoolInner {
    fn retire(&self, session: &Session, reason: &str) {
        self.retired.fetch_add(1, Ordering::Relaxed);
        info!(
            "Retired session {} for {} ({}, uses={})",
            session.id, session.endpoint, reason, session.usage_count
        );
    }

    fn release(&self, mut session: Session, outcome: ReleaseOutcome) {
        let now = Instant::now();
        session.last_used = now;
        match outcome {
            ReleaseOutcome::Success => session.consecutive_timeouts = 0,
            ReleaseOutcome::Timeout => {
                session.consecutive_timeouts += 1;
                if session.consecutive_timeouts >= self.config.unhealthy_after_timeouts {
                    warn!(
                        "Session {} flagged unhealthy after {} consecutive timeouts",
                        session.id, session.consecutive_timeouts
                    );
                    session.healthy = false;
                }
            }
            ReleaseOutcome::Failure => {}
        }

        let mut state = self.state.lock();
        let PoolState {
            endpoints,
            idle_order,
            total,
        } = &mut *state;

        if let Some(slot) = endpoints.get_mut(&session.endpoint) {
            slot.in_use = slot.in_use.saturating_sub(1);

            if session.usage_count >= self.config.max_usage_count {
                *total = total.saturating_sub(1);
                session.state = SessionState::Retired;
                self.retire(&session, "usage cap");
            } else if !session.healthy {
                *total = total.saturating_sub(1);
                session.state = SessionState::Retired;
                self.retire(&session, "unhealthy");
            } else {
                session.state = SessionState::Idle;
                idle_order.put(session.id, session.endpoint.clone());
                slot.idle.put(session.id, session);
            }
        }
    }
}

/// Exclusive use of one session; returned to the pool on release or drop
pub struct SessionLease {
    session: Option<Session>,
    reused: bool,
    pool: Arc<PoolInner>,
}

impl SessionLease {
    pub fn session(&self) -> &Session {
        // Only `release` takes the session, and it consumes the lease
        self.session.as_ref().expect("lease holds a session until released")
    }

    pub fn id(&self) -> Uuid {
        self.session().id
    }

    pub fn endpoint(&self) -> &str {
        &self.session().endpoint
    }

    /// Whether the session came from the idle set rather than being created
    pub fn reused(&self) -> bool {
        self.reused
    }

    pub fn release(mut self, outcome: ReleaseOutcome) {
        if let Some(session) = self.session.take() {
            self.pool.release(session, outcome);
        }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        // Dropped without release (e.g. cancelled request)
        if let Some(session) = self.session.take() {
            self.pool.release(session, ReleaseOutcome::Failure);
        }
    }
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("session", &self.session)
            .field("reused", &self.reused)
            .finish()
    }
}

/// Per-endpoint counts
#[derive(Debug, Clone, Serialize)]
pub struct EndpointPoolStats {
    pub endpoint: String,
    pub idle: usize,
    pub in_use: usize,
}

/// Pool statistics
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total_sessions: usize,
    pub created: u64,
    pub reused: u64,
    pub retired: u64,
    pub endpoints: Vec<EndpointPoolStats>,
}

/// Session pool shared by all in-flight requests
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                state: Mutex::new(PoolState {
                    endpoints: HashMap::new(),
                    idle_order: LruCache::unbounded(),
                    total: 0,
                }),
                created: AtomicU64::new(0),
                reused: AtomicU64::new(0),
                retired: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Lease a session for `endpoint`, reusing an idle one when possible.
    ///
    /// On exhaustion the pool sweeps expired idle sessions once and retries
    /// before failing with `PoolExhausted`.
    pub fn acquire(&self, endpoint: &str) -> Result<SessionLease> {
        match self.try_acquire(endpoint) {
            Err(ServeError::PoolExhausted(_)) => {
                let swept = self.retire_expired();
                debug!("Pool exhausted for {}, swept {} expired sessions", endpoint, swept);
                self.try_acquire(endpoint)
            }
            other => other,
        }
    }

    fn try_acquire(&self, endpoint: &str) -> Result<SessionLease> {
        let config = &self.inner.config;
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        let PoolState {
            endpoints,
            idle_order,
            total,
        } = &mut *state;

        let slot = endpoints
            .entry(endpoint.to_string())
            .or_insert_with(EndpointSlot::new);

        // Reuse: stale sessions found on the way are retired for good
        while let Some((id, mut session)) = slot.idle.pop_lru() {
            idle_order.pop(&id);
            if session.is_reusable(config, now) {
                session.state = SessionState::InUse;
                session.usage_count += 1;
                slot.in_use += 1;
                self.inner.reused.fetch_add(1, Ordering::Relaxed);
                debug!("Reusing session {} for {}", id, endpoint);
                return Ok(self.lease(session, true));
            }
            *total = total.saturating_sub(1);
            session.state = SessionState::Retired;
            let reason = if session.healthy { "expired" } else { "unhealthy" };
            self.inner.retire(&session, reason);
        }

        if slot.live() >= config.max_connections {
            return Err(ServeError::PoolExhausted(endpoint.to_string()));
        }

        if *total >= config.max_total_sessions {
            // This endpoint has no idle sessions left, so the victim belongs to another
            match idle_order.pop_lru() {
                Some((victim_id, victim_endpoint)) => {
                    if let Some(victim) = endpoints
                        .get_mut(&victim_endpoint)
                        .and_then(|s| s.idle.pop(&victim_id))
                    {
                        self.inner.retire(&victim, "evicted");
                    }
                    *total = total.saturating_sub(1);
                }
                None => return Err(ServeError::PoolExhausted(endpoint.to_string())),
            }
        }

        let mut session = Session::new(endpoint);
        session.state = SessionState::InUse;
        session.usage_count = 1;
        *total += 1;
        if let Some(slot) = endpoints.get_mut(endpoint) {
            slot.in_use += 1;
        }
        self.inner.created.fetch_add(1, Ordering::Relaxed);
        debug!("Created session {} for {}", session.id, endpoint);

        Ok(self.lease(session, false))
    }

    fn lease(&self, session: Session, reused: bool) -> SessionLease {
        SessionLease {
            session: Some(session),
            reused,
            pool: Arc::clone(&self.inner),
        }
    }

    /// Return a leased session; it is retired instead if it hit the usage cap
    pub fn release(&self, lease: SessionLease, outcome: ReleaseOutcome) {
        lease.release(outcome);
    }

    /// Eagerly create up to `n` idle sessions for `endpoint`
    pub fn pre_warm(&self, endpoint: &str, n: usize) -> usize {
        let config = &self.inner.config;
        let mut state = self.inner.state.lock();
        let PoolState {
            endpoints,
            idle_order,
            total,
        } = &mut *state;
        let slot = endpoints
            .entry(endpoint.to_string())
            .or_insert_with(EndpointSlot::new);

        let mut created = 0;
        while created < n
            && slot.live() < config.max_connections
            && *total < config.max_total_sessions
        {
            let session = Session::new(endpoint);
            idle_order.put(session.id, endpoint.to_string());
            slot.idle.put(session.id, session);
            *total += 1;
            created += 1;
        }
        self.inner
            .created
            .fetch_add(created as u64, Ordering::Relaxed);

        if created > 0 {
            info!("Pre-warmed {} sessions for {}", created, endpoint);
        }
        created
    }

    /// Retire idle sessions past the idle timeout, oldest first
    pub fn retire_expired(&self) -> usize {
        let config = &self.inner.config;
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        let PoolState {
            endpoints,
            idle_order,
            total,
        } = &mut *state;

        let mut retired = 0;
        loop {
            let expired = match idle_order.peek_lru() {
                Some((id, endpoint)) => endpoints
                    .get(endpoint)
                    .and_then(|slot| slot.idle.peek(id))
                    .map_or(true, |s| {
                        now.saturating_duration_since(s.last_used) >= config.idle_timeout
                    }),
                None => false,
            };
            if !expired {
                break;
            }
            if let Some((id, endpoint)) = idle_order.pop_lru() {
                if let Some(session) = endpoints.get_mut(&endpoint).and_then(|s| s.idle.pop(&id)) {
                    self.inner.retire(&session, "expired");
                    *total = total.saturating_sub(1);
                    retired += 1;
                }
            }
        }
        retired
    }

    pub fn in_use(&self, endpoint: &str) -> usize {
        self.inner
            .state
            .lock()
            .endpoints
            .get(endpoint)
            .map_or(0, |s| s.in_use)
    }

    pub fn idle(&self, endpoint: &str) -> usize {
        self.inner
            .state
            .lock()
            .endpoints
            .get(endpoint)
            .map_or(0, |s| s.idle.len())
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        let mut endpoints: Vec<EndpointPoolStats> = state
            .endpoints
            .iter()
            .map(|(endpoint, slot)| EndpointPoolStats {
                endpoint: endpoint.clone(),
                idle: slot.idle.len(),
                in_use: slot.in_use,
            })
            .collect();
        endpoints.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));

        PoolStats {
            total_sessions: state.total,
            created: self.inner.created.load(Ordering::Relaxed),
            reused: self.inner.reused.load(Ordering::Relaxed),
            retired: self.inner.retired.load(Ordering::Relaxed),
            endpoints,
        }
    }
}
