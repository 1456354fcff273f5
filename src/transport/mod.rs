//! Transport dispatch layer.
//!
//! # Architecture
//! ```text
//! Client::send ── disrupt ── tunnel ── codec ── pool ──► Connection::exchange
//!                                                             │
//! ServerDispatcher::dispatch ◄── negotiate ── untunnel ───────┘
//! ```
//!
//! The pool hands out connections for one exchange at a time; the monitor
//! watches both bodies and returns the connection once both are terminal.

pub mod connection;
pub mod dispatcher;
pub mod monitor;
pub mod pool;
pub mod server;

pub use connection::{BoxFuture, Connection, ConnectionFactory, ConnectionId, PooledConnection};
pub use dispatcher::Client;
pub use monitor::{monitor_idle, ExchangeTracker};
pub use pool::ConnectionPool;
pub use server::{ServerDispatcher, StreamHandler};

use tokio::sync::broadcast;

/// Coordinator for graceful shutdown.
///
/// Provides a broadcast channel that in-flight dispatches subscribe to.
pub struct Shutdown {
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Trigger the shutdown signal.
    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
