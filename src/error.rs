//! Error taxonomy for streams and transport dispatch.
//!
//! # Responsibilities
//! - Distinguish protocol violations (programming errors) from
//!   per-request transport failures (timeouts, pool exhaustion, faults)
//! - Stay cheaply cloneable so one failure can be fanned out to both
//!   ends of a stream (writer abort + reader error)

use std::time::Duration;

/// Unified error type for stream and transport operations.
///
/// Protocol violations (`CreditViolation`, `AlreadyAttached`) terminate the
/// offending stream immediately. Transport failures fail only the affected
/// request; pool bookkeeping stays intact even when the underlying
/// connection is discarded.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    /// The writer wrote a chunk with no outstanding credit.
    #[error("writer exceeded granted credit")]
    CreditViolation,

    /// A second reader was attached to a stream.
    #[error("a reader is already attached to this entity stream")]
    AlreadyAttached,

    /// The reader cancelled the stream before completion.
    #[error("stream aborted: {0}")]
    Aborted(String),

    /// Response status/headers did not arrive within the request timeout.
    #[error("no response after {timeout:?} (request timeout)")]
    RequestTimeout { timeout: Duration },

    /// The response body stalled past the streaming idle timeout.
    #[error("response stream idle for {idle:?} (streaming timeout)")]
    StreamTimeout { idle: Duration },

    /// Malformed compressed data or a codec-internal failure.
    #[error("codec failure: {0}")]
    Codec(String),

    /// No mutually supported content encoding.
    #[error("no acceptable content encoding: {0}")]
    NotAcceptable(String),

    /// Synthetic fault injected by a disrupt hook.
    #[error("request disrupted: {0}")]
    Disrupted(String),

    /// The transport was shut down while the call was in flight.
    #[error("transport shut down")]
    Shutdown,

    /// Waiting for a pooled connection exceeded the pool wait timeout.
    #[error("connection pool exhausted after waiting {waited:?}")]
    PoolExhausted { waited: Duration },

    /// A buffered response exceeded the configured maximum size.
    #[error("response larger than {limit} bytes")]
    ResponseTooLarge { limit: u64 },

    /// Connection-level transport failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// Server handler failed while building a response.
    #[error("handler error: {0}")]
    Handler(String),
}

impl Error {
    /// True for errors that indicate a bug in stream usage rather than a
    /// runtime condition.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Error::CreditViolation | Error::AlreadyAttached)
    }
}
