//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the
//! transport core. All types derive Serde traits for deserialization
//! from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the streaming transport.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TransportConfig {
    /// Connection pool sizing and wait behavior.
    pub pool: PoolConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Size thresholds and limits.
    pub limits: LimitConfig,

    /// Supported content encodings.
    pub encodings: EncodingConfig,
}

/// Connection pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum concurrent connections.
    pub max_size: usize,

    /// Warm connections kept open from startup.
    pub min_size: usize,

    /// Maximum callers queued waiting for a free connection.
    pub wait_queue_size: usize,

    /// How long a caller waits for a free connection (ms).
    pub wait_timeout_ms: u64,

    /// Idle connections older than this are discarded (ms).
    pub idle_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 200,
            min_size: 0,
            wait_queue_size: 256,
            wait_timeout_ms: 5_000,
            idle_timeout_ms: 30_000,
        }
    }
}

impl PoolConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Time allowed between send and response headers (ms).
    pub request_ms: u64,

    /// Idle window allowed between response body chunks (ms).
    pub stream_idle_ms: u64,

    /// Grace period for in-flight connections on shutdown (ms).
    pub shutdown_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_ms: 10_000,
            stream_idle_ms: 30_000,
            shutdown_ms: 15_000,
        }
    }
}

impl TimeoutConfig {
    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }

    pub fn stream_idle(&self) -> Duration {
        Duration::from_millis(self.stream_idle_ms)
    }

    pub fn shutdown(&self) -> Duration {
        Duration::from_millis(self.shutdown_ms)
    }
}

/// Size thresholds and limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitConfig {
    /// Buffered responses larger than this fail the call (bytes).
    pub max_response_bytes: u64,

    /// GET queries at or above this length are tunneled (bytes).
    pub query_tunnel_threshold: usize,

    /// Responses at or above this size are compressed (bytes).
    pub compression_threshold: u64,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            max_response_bytes: 2 * 1024 * 1024,
            query_tunnel_threshold: 4096,
            compression_threshold: 1024,
        }
    }
}

/// Supported content encodings, in preference order.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EncodingConfig {
    /// Codings this side can produce for responses.
    pub response: Vec<String>,

    /// Codings this side can decode on incoming requests.
    pub request: Vec<String>,

    /// Coding applied to outgoing request bodies, if any.
    pub request_content_encoding: Option<String>,
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            response: vec!["gzip".to_string(), "deflate".to_string()],
            request: vec!["gzip".to_string(), "deflate".to_string()],
            request_content_encoding: None,
        }
    }
}
