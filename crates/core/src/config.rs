//! Tunables for the feedback timeline engine.
//!
//! Hosts that parse environment variables (the API server) build a
//! [`TimelineConfig`] from them; embedders and tests use [`Default`].

use std::time::Duration;

use crate::annotation::DEFAULT_MAX_BODY_CHARS;
use crate::export::DEFAULT_BUCKET_MS;
use crate::session::DEFAULT_HEARTBEAT_TIMEOUT_SECS;

/// Default interval between reaper sweeps.
pub const DEFAULT_REAP_INTERVAL_SECS: u64 = 5;

/// Default bounded outbound queue size per session.
pub const DEFAULT_SESSION_QUEUE_CAPACITY: usize = 256;

/// Default upper bound on a single storage backend call.
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 2000;

/// Engine configuration shared by the store, registry and hub.
#[derive(Debug, Clone)]
pub struct TimelineConfig {
    /// A session with no heartbeat for longer than this is reaped.
    pub heartbeat_timeout: Duration,
    /// How often the reaper sweeps for silent sessions.
    pub reap_interval: Duration,
    /// Capacity of each session's outbound queue.
    pub session_queue_capacity: usize,
    /// Backend calls exceeding this fail with `StorageUnavailable`.
    pub store_timeout: Duration,
    /// Maximum annotation body length in characters.
    pub max_body_chars: usize,
    /// Width of the timestamp buckets in exported reports.
    pub report_bucket_ms: i64,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(DEFAULT_HEARTBEAT_TIMEOUT_SECS),
            reap_interval: Duration::from_secs(DEFAULT_REAP_INTERVAL_SECS),
            session_queue_capacity: DEFAULT_SESSION_QUEUE_CAPACITY,
            store_timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS),
            max_body_chars: DEFAULT_MAX_BODY_CHARS,
            report_bucket_ms: DEFAULT_BUCKET_MS,
        }
    }
}

impl TimelineConfig {
    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_timeout.is_zero() {
            return Err("heartbeat timeout must be positive".to_string());
        }
        if self.reap_interval.is_zero() {
            return Err("reap interval must be positive".to_string());
        }
        if self.session_queue_capacity == 0 {
            return Err("session queue capacity must be at least 1".to_string());
        }
        if self.store_timeout.is_zero() {
            return Err("store timeout must be positive".to_string());
        }
        if self.max_body_chars == 0 {
            return Err("max body length must be at least 1".to_string());
        }
        if self.report_bucket_ms <= 0 {
            return Err(format!(
                "report bucket width must be positive, got {}",
                self.report_bucket_ms
            ));
        }
        Ok(())
    }
}
