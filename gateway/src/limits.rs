//! Per-user admission control: rate limiting, concurrency slots and the
//! bounded wait queue.
//!
//! Limits are enforced twice per request, once for the gateway-side user
//! and once for the backend cluster user, in that order. Releases happen in
//! reverse order simply by dropping the permits.
//!
//! # Queueing
//!
//! The concurrency gate is a tokio semaphore, whose wait queue is FIFO:
//! queued requests are admitted in arrival order. A separate counter bounds
//! how many requests may wait at once, and `max_queue_time` bounds how long
//! each of them waits. Cancelled waiters (client disconnects) leave the
//! queue immediately when their future is dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::config::DEFAULT_MAX_QUEUE_TIME;
use common::config;

/// Why a request was not admitted.
#[derive(Debug)]
pub enum LimitError {
    /// `requests_per_minute` exhausted for the current window.
    RateLimited { name: String, limit: u32 },
    /// All concurrency slots busy and no queue is configured, or the queue
    /// itself is full.
    TooManyQueries { name: String, limit: u32 },
    /// Timed out waiting for a concurrency slot.
    QueueTimeout { name: String, wait: Duration },
}

impl std::fmt::Display for LimitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitError::RateLimited { name, limit } => write!(
                f,
                "rate limit for user {name:?} is exceeded: requests_per_minute limit: {limit}"
            ),
            LimitError::TooManyQueries { name, limit } => write!(
                f,
                "limits for user {name:?} are exceeded: max_concurrent_queries limit: {limit}"
            ),
            LimitError::QueueTimeout { name, wait } => write!(
                f,
                "queue wait timeout for user {name:?} exceeded: {wait:?}"
            ),
        }
    }
}

impl std::error::Error for LimitError {}

/// Sliding one-minute request budget.
pub struct RateLimiter {
    requests_per_minute: u32,
    window: Mutex<RateWindow>,
}

struct RateWindow {
    started: Instant,
    remaining: u32,
}

const RATE_WINDOW: Duration = Duration::from_secs(60);

impl RateLimiter {
    pub fn new(requests_per_minute: u32) -> Self {
        Self {
            requests_per_minute,
            window: Mutex::new(RateWindow {
                started: Instant::now(),
                remaining: requests_per_minute,
            }),
        }
    }

    /// Takes one token from the current window, failing fast when the
    /// budget for this minute is spent. A zero limit disables the check.
    pub fn try_acquire(&self, name: &str) -> Result<(), LimitError> {
        if self.requests_per_minute == 0 {
            return Ok(());
        }
        let mut w = self.window.lock();
        let now = Instant::now();
        if now.duration_since(w.started) >= RATE_WINDOW {
            w.started = now;
            w.remaining = self.requests_per_minute;
        }
        if w.remaining == 0 {
            return Err(LimitError::RateLimited {
                name: name.to_string(),
                limit: self.requests_per_minute,
            });
        }
        w.remaining -= 1;
        Ok(())
    }
}

/// Concurrency gate with an optional bounded FIFO wait queue.
#[derive(Debug)]
pub struct SlotGate {
    max_concurrent: u32,
    slots: Option<Arc<Semaphore>>,
    max_queue_size: u32,
    max_queue_time: Duration,
    queued: AtomicU32,
    running: AtomicU32,
}

impl SlotGate {
    pub fn new(max_concurrent: u32, max_queue_size: u32, max_queue_time: Duration) -> Self {
        let max_queue_time = if max_queue_size > 0 && max_queue_time.is_zero() {
            DEFAULT_MAX_QUEUE_TIME
        } else {
            max_queue_time
        };
        Self {
            max_concurrent,
            slots: (max_concurrent > 0).then(|| Arc::new(Semaphore::new(max_concurrent as usize))),
            max_queue_size,
            max_queue_time,
            queued: AtomicU32::new(0),
            running: AtomicU32::new(0),
        }
    }

    /// Number of requests currently holding a slot.
    pub fn running(&self) -> u32 {
        self.running.load(Ordering::Acquire)
    }

    /// Number of requests currently waiting in the queue.
    pub fn queued(&self) -> u32 {
        self.queued.load(Ordering::Acquire)
    }

    /// Admits a request, queueing if allowed. The returned permit must be
    /// held for the full lifetime of the request.
    pub async fn acquire(self: &Arc<Self>, name: &str) -> Result<SlotPermit, LimitError> {
        let Some(slots) = self.slots.clone() else {
            return Ok(self.admitted(None));
        };

        if let Ok(permit) = slots.clone().try_acquire_owned() {
            return Ok(self.admitted(Some(permit)));
        }

        if self.max_queue_size == 0 {
            return Err(LimitError::TooManyQueries {
                name: name.to_string(),
                limit: self.max_concurrent,
            });
        }

        let _queue_slot = QueueSlot::reserve(self, name)?;
        match tokio::time::timeout(self.max_queue_time, slots.acquire_owned()).await {
            Ok(Ok(permit)) => Ok(self.admitted(Some(permit))),
            Ok(Err(_closed)) => unreachable!("slot semaphore is never closed"),
            Err(_) => Err(LimitError::QueueTimeout {
                name: name.to_string(),
                wait: self.max_queue_time,
            }),
        }
    }

    fn admitted(self: &Arc<Self>, permit: Option<OwnedSemaphorePermit>) -> SlotPermit {
        self.running.fetch_add(1, Ordering::AcqRel);
        SlotPermit {
            _permit: permit,
            gate: self.clone(),
        }
    }
}

/// Reserved position in the wait queue; dropping it frees the position
/// whether the wait succeeded, timed out or was cancelled.
struct QueueSlot<'a> {
    gate: &'a SlotGate,
}

impl<'a> QueueSlot<'a> {
    fn reserve(gate: &'a SlotGate, name: &str) -> Result<Self, LimitError> {
        let mut queued = gate.queued.load(Ordering::Acquire);
        loop {
            if queued >= gate.max_queue_size {
                return Err(LimitError::TooManyQueries {
                    name: name.to_string(),
                    limit: gate.max_concurrent,
                });
            }
            match gate.queued.compare_exchange_weak(
                queued,
                queued + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(Self { gate }),
                Err(actual) => queued = actual,
            }
        }
    }
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.gate.queued.fetch_sub(1, Ordering::AcqRel);
    }
}

/// An admitted request. Dropping the permit releases the slot and wakes the
/// next queued waiter, if any.
#[derive(Debug)]
pub struct SlotPermit {
    _permit: Option<OwnedSemaphorePermit>,
    gate: Arc<SlotGate>,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.gate.running.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Runtime state for a gateway-side user.
pub struct ProxyUser {
    pub name: String,
    pub password: String,
    pub to_cluster: String,
    pub to_user: String,
    pub deny_http: bool,
    pub deny_https: bool,
    pub allow_cors: bool,
    pub cache: Option<String>,
    pub params: Option<String>,
    pub max_execution_time: Duration,
    pub rate: RateLimiter,
    pub gate: Arc<SlotGate>,
    pub cfg: config::User,
}

impl ProxyUser {
    pub fn from_config(cfg: &config::User) -> Self {
        Self {
            name: cfg.name.clone(),
            password: cfg.password.clone(),
            to_cluster: cfg.to_cluster.clone(),
            to_user: cfg.to_user.clone(),
            deny_http: cfg.deny_http,
            deny_https: cfg.deny_https,
            allow_cors: cfg.allow_cors,
            cache: cfg.cache.clone(),
            params: cfg.params.clone(),
            max_execution_time: cfg.max_execution_time.as_std(),
            rate: RateLimiter::new(cfg.requests_per_minute),
            gate: Arc::new(SlotGate::new(
                cfg.max_concurrent_queries,
                cfg.max_queue_size,
                cfg.max_queue_time.as_std(),
            )),
            cfg: cfg.clone(),
        }
    }
}

/// Runtime state for a backend cluster user.
pub struct BackendUser {
    pub name: String,
    pub password: String,
    pub max_execution_time: Duration,
    pub rate: RateLimiter,
    pub gate: Arc<SlotGate>,
    pub cfg: config::ClusterUser,
}

impl BackendUser {
    pub fn from_config(cfg: &config::ClusterUser) -> Self {
        Self {
            name: cfg.name.clone(),
            password: cfg.password.clone(),
            max_execution_time: cfg.max_execution_time.as_std(),
            rate: RateLimiter::new(cfg.requests_per_minute),
            gate: Arc::new(SlotGate::new(
                cfg.max_concurrent_queries,
                cfg.max_queue_size,
                cfg.max_queue_time.as_std(),
            )),
            cfg: cfg.clone(),
        }
    }
}
