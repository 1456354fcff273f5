//! Connection abstraction and lifecycle tracking.
//!
//! # Responsibilities
//! - Define the transport seam (`Connection` / `ConnectionFactory`)
//! - Generate unique connection IDs for tracing
//! - Track per-connection usage for idle expiry

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::time::Instant;

use crate::error::Error;
use crate::message::{StreamRequest, StreamResponse};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Global atomic counter for connection IDs.
/// Relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A single transport connection capable of carrying one exchange at a time.
///
/// Implementations own the wire; the pool owns the lifecycle. An exchange
/// resolves once the response head arrives; both bodies stream afterwards.
pub trait Connection: Send + Sync {
    /// Perform one request/response exchange.
    fn exchange(&self, request: StreamRequest) -> BoxFuture<'_, Result<StreamResponse, Error>>;

    /// Close the connection. Idempotent.
    fn close(&self);

    /// Whether the connection can still carry exchanges.
    fn is_open(&self) -> bool;
}

/// Factory the pool calls to establish new connections.
pub trait ConnectionFactory: Send + Sync {
    fn connect(&self) -> BoxFuture<'_, Result<Arc<dyn Connection>, Error>>;
}

/// A connection checked out of (or parked in) the pool.
#[derive(Clone)]
pub struct PooledConnection {
    pub id: ConnectionId,
    pub conn: Arc<dyn Connection>,
    /// When the connection last finished an exchange. Drives idle expiry.
    pub last_used: Instant,
}

impl PooledConnection {
    pub fn new(conn: Arc<dyn Connection>) -> Self {
        Self {
            id: ConnectionId::new(),
            conn,
            last_used: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_used = Instant::now();
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("last_used", &self.last_used)
            .finish()
    }
}
