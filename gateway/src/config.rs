//! Compile-time constants for the gateway.
//!
//! Anything an operator may want to tune lives in the YAML configuration
//! (`common::config`); the values here are internal knobs with sensible
//! fixed defaults.

use std::time::Duration;

/// Maximum accepted request body size. Queries and INSERT payloads are
/// buffered in full so they can be fingerprinted and retried.
pub const MAX_REQUEST_BODY_SIZE: usize = 128 * 1024 * 1024;

/// Timeout for a single node availability probe.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(3);

/// Timeout for the detached KILL QUERY request sent after a cancelled or
/// timed-out query.
pub const KILL_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Queue wait bound applied when a user configures `max_queue_size` without
/// an explicit `max_queue_time`.
pub const DEFAULT_MAX_QUEUE_TIME: Duration = Duration::from_secs(10);

/// How many times a GET request is re-dispatched to another node after a
/// TCP dial failure. Non-idempotent methods are never retried.
pub const MAX_DIAL_RETRIES: u32 = 2;

/// How many times a request re-enters the cache lookup after waiting on a
/// concurrent producer that failed.
pub const CACHE_WAIT_RETRIES: u32 = 3;

/// Upper bound on the cache sweeper period. Caches with short expiry sweep
/// more often, see `sweep_interval`.
pub const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Channel depth between the upstream reader and the client response body.
pub const RESPONSE_CHANNEL_DEPTH: usize = 16;
