//! Centralized configuration for the DT-Messaging engine
//!
//! One struct per concern with protocol defaults, plus a `testing()` preset
//! with short timers so integration tests run in milliseconds instead of
//! minutes. The defaults here are protocol constants: changing them changes
//! interoperability with other nodes.

use std::path::PathBuf;
use std::time::Duration;

// ----------------------------------------------------------------------------
// Forwarding Configuration
// ----------------------------------------------------------------------------

/// Store-and-forward routing parameters.
#[derive(Debug, Clone)]
pub struct ForwardingConfig {
    /// Maximum hop count; a message at or above this is never forwarded.
    pub max_hops: u32,
    /// Time-to-live applied to newly authored messages.
    pub default_ttl: Duration,
    /// Time-to-live for acknowledgement messages.
    pub ack_ttl: Duration,
    /// Maximum message body length in Unicode code points.
    pub max_message_length: usize,
    /// Seen-set capacity; the set is purged wholesale once it grows past this.
    pub seen_set_limit: usize,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            max_hops: 5,
            default_ttl: Duration::from_secs(24 * 60 * 60),
            ack_ttl: Duration::from_secs(60),
            max_message_length: 1000,
            seen_set_limit: 1000,
        }
    }
}

// ----------------------------------------------------------------------------
// Retry Configuration
// ----------------------------------------------------------------------------

/// Exponential-backoff retry parameters for undelivered outgoing messages.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts before a message is failed.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Multiplier applied per attempt.
    pub backoff_multiplier: f64,
    /// Ceiling on the computed delay.
    pub max_delay: Duration,
    /// Delay for the immediate retry issued when a peer connects, long
    /// enough for the connection to stabilize.
    pub reconnect_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(300),
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

impl RetryConfig {
    /// Backoff delay for the given attempt number (0-based):
    /// `min(initial * multiplier^attempt, max)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64;
        let scaled = base * self.backoff_multiplier.powi(attempt as i32);
        let millis = scaled.min(self.max_delay.as_millis() as f64) as u64;
        Duration::from_millis(millis)
    }

    /// Age past which a scheduled retry is considered stale and force-failed.
    pub fn stale_after(&self) -> Duration {
        self.max_delay * 2
    }
}

// ----------------------------------------------------------------------------
// Store Configuration
// ----------------------------------------------------------------------------

/// Persistence parameters.
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    /// Database file path; `None` opens an in-memory database.
    pub path: Option<PathBuf>,
    /// Maximum concurrent writers against the store.
    pub writer_permits: usize,
}

impl StoreConfig {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            writer_permits: 4,
        }
    }

    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            writer_permits: 4,
        }
    }

    /// Writer permit count with the default applied.
    pub fn effective_writer_permits(&self) -> usize {
        if self.writer_permits == 0 {
            4
        } else {
            self.writer_permits
        }
    }
}

// ----------------------------------------------------------------------------
// Maintenance Configuration
// ----------------------------------------------------------------------------

/// Periodic maintenance cadence and shutdown budget.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Interval between cleanup sweeps (expired rows, seen set, stale retries).
    pub cleanup_interval: Duration,
    /// Interval between statistics reports.
    pub stats_interval: Duration,
    /// Interval between rediscovery attempts while no peer is connected.
    pub rediscovery_interval: Duration,
    /// Budget for draining the forwarder on shutdown before force-stopping.
    pub shutdown_drain: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(5 * 60),
            stats_interval: Duration::from_secs(2 * 60),
            rediscovery_interval: Duration::from_secs(30),
            shutdown_drain: Duration::from_secs(5),
        }
    }
}

// ----------------------------------------------------------------------------
// Engine Configuration
// ----------------------------------------------------------------------------

/// Complete engine configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub forwarding: ForwardingConfig,
    pub retry: RetryConfig,
    pub store: StoreConfig,
    pub maintenance: MaintenanceConfig,
}

impl EngineConfig {
    /// Configuration for tests: in-memory store, millisecond timers.
    pub fn testing() -> Self {
        Self {
            forwarding: ForwardingConfig::default(),
            retry: RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(50),
                backoff_multiplier: 2.0,
                max_delay: Duration::from_millis(400),
                reconnect_delay: Duration::from_millis(50),
            },
            store: StoreConfig::in_memory(),
            maintenance: MaintenanceConfig {
                cleanup_interval: Duration::from_millis(500),
                stats_interval: Duration::from_secs(60),
                rediscovery_interval: Duration::from_millis(200),
                shutdown_drain: Duration::from_secs(5),
            },
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_defaults() {
        let config = ForwardingConfig::default();
        assert_eq!(config.max_hops, 5);
        assert_eq!(config.default_ttl, Duration::from_secs(86_400));
        assert_eq!(config.ack_ttl, Duration::from_secs(60));
        assert_eq!(config.max_message_length, 1000);
        assert_eq!(config.seen_set_limit, 1000);
    }

    #[test]
    fn test_backoff_schedule() {
        let config = RetryConfig::default();
        assert_eq!(config.delay(0), Duration::from_secs(5));
        assert_eq!(config.delay(1), Duration::from_secs(10));
        assert_eq!(config.delay(2), Duration::from_secs(20));
        // Capped at the maximum delay.
        assert_eq!(config.delay(10), Duration::from_secs(300));
    }

    #[test]
    fn test_stale_threshold() {
        let config = RetryConfig::default();
        assert_eq!(config.stale_after(), Duration::from_secs(600));
    }

    #[test]
    fn test_writer_permit_default() {
        let config = StoreConfig {
            path: None,
            writer_permits: 0,
        };
        assert_eq!(config.effective_writer_permits(), 4);
        assert_eq!(StoreConfig::in_memory().effective_writer_permits(), 4);
    }
}
