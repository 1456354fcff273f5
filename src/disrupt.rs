//! Fault-injection hooks.
//!
//! # Responsibilities
//! - Carry a per-request disruption directive on the request context
//! - Apply it exactly once, before any network dispatch
//!
//! # Design Decisions
//! - Timeout disruption synthesizes the same error shape as a real
//!   request timeout, without touching the network
//! - Minimum-delay disruption pads the call so at least the given
//!   duration elapses since the request was issued

use std::time::Duration;

use tokio::time::Instant;

use crate::error::Error;

/// A request-scoped fault-injection directive.
///
/// Immutable once attached; consumed at most once per request by the
/// dispatch layer before pool checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisruptContext {
    /// Sleep for the duration, then proceed normally.
    Delay(Duration),
    /// Pad the call so at least this much time elapses between issue and
    /// dispatch, then proceed.
    MinimumDelay(Duration),
    /// Fail with the same shape as a real request timeout, after waiting
    /// out the configured timeout.
    Timeout,
    /// Fail immediately with a synthetic disrupted-call error.
    Error(String),
}

/// Evaluate a disruption directive.
///
/// Returns `Ok(())` when the request should proceed to the network and
/// an error when the call must fail without any I/O.
pub async fn apply(
    disrupt: &DisruptContext,
    issued_at: Instant,
    request_timeout: Duration,
) -> Result<(), Error> {
    match disrupt {
        DisruptContext::Delay(delay) => {
            tracing::debug!(?delay, "disrupt: delaying request");
            tokio::time::sleep(*delay).await;
            Ok(())
        }
        DisruptContext::MinimumDelay(min) => {
            let elapsed = issued_at.elapsed();
            if let Some(pad) = min.checked_sub(elapsed) {
                tracing::debug!(?pad, "disrupt: padding request to minimum delay");
                tokio::time::sleep(pad).await;
            }
            Ok(())
        }
        DisruptContext::Timeout => {
            tracing::debug!(?request_timeout, "disrupt: synthesizing request timeout");
            tokio::time::sleep(request_timeout).await;
            Err(Error::RequestTimeout {
                timeout: request_timeout,
            })
        }
        DisruptContext::Error(cause) => {
            tracing::debug!(%cause, "disrupt: synthesizing error");
            Err(Error::Disrupted(cause.clone()))
        }
    }
}
