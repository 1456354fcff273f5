//! Connection pool with bounded waiting.
//!
//! # Responsibilities
//! - Reuse idle connections, expiring those idle past the configured limit
//! - Create new connections up to `max_size`
//! - Queue waiters (bounded) when the pool is saturated
//! - Drain connections in order on shutdown, force-closing at the deadline
//!
//! # Design Decisions
//! - Checkout/checkin model: a connection carries at most one exchange at a time
//! - Waiters are served in FIFO order; a released connection goes to the oldest waiter
//! - A non-reusable release closes the connection and, if anyone is waiting,
//!   immediately starts a replacement connect on their behalf

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;

use crate::config::PoolConfig;
use crate::error::Error;
use crate::transport::connection::{Connection, ConnectionFactory, ConnectionId, PooledConnection};

struct PoolState {
    /// Idle connections, most recently used at the back.
    idle: VecDeque<PooledConnection>,
    /// Total live connections: idle + checked out + mid-connect.
    total: usize,
    /// Pending acquires, oldest first.
    waiters: VecDeque<(u64, oneshot::Sender<PooledConnection>)>,
    /// Live connections by id, for force-close at shutdown.
    tracked: HashMap<ConnectionId, Arc<dyn Connection>>,
}

pub struct ConnectionPool {
    factory: Arc<dyn ConnectionFactory>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    next_waiter_id: AtomicU64,
    shutting_down: AtomicBool,
    /// Signalled whenever `total` decreases, so shutdown can wait for drain.
    drained: Notify,
}

impl ConnectionPool {
    pub fn new(factory: Arc<dyn ConnectionFactory>, config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            factory,
            config,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                total: 0,
                waiters: VecDeque::new(),
                tracked: HashMap::new(),
            }),
            next_waiter_id: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
            drained: Notify::new(),
        })
    }

    /// Establish `min_size` connections up front.
    pub async fn prewarm(self: &Arc<Self>) {
        for _ in 0..self.config.min_size {
            match self.connect_one().await {
                Ok(pooled) => {
                    let mut state = self.state.lock().unwrap();
                    state.idle.push_back(pooled);
                }
                Err(error) => {
                    tracing::warn!(%error, "prewarm connect failed");
                    break;
                }
            }
        }
    }

    /// Check out a connection, creating or waiting as needed.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection, Error> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }

        let wait_rx = {
            let mut state = self.state.lock().unwrap();

            // Prefer reuse; drop connections idle past the limit or closed underneath us.
            while let Some(pooled) = state.idle.pop_back() {
                if !pooled.conn.is_open()
                    || pooled.last_used.elapsed() >= self.config.idle_timeout()
                {
                    tracing::debug!(id = %pooled.id, "discarding expired idle connection");
                    pooled.conn.close();
                    state.tracked.remove(&pooled.id);
                    state.total -= 1;
                    continue;
                }
                return Ok(pooled);
            }

            if state.total < self.config.max_size {
                // Reserve the slot before awaiting the connect.
                state.total += 1;
                None
            } else {
                if state.waiters.len() >= self.config.wait_queue_size {
                    return Err(Error::PoolExhausted {
                        waited: Duration::ZERO,
                    });
                }
                let (tx, rx) = oneshot::channel();
                let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
                state.waiters.push_back((id, tx));
                Some((id, rx))
            }
        };

        match wait_rx {
            None => match self.connect_one().await {
                Ok(pooled) => Ok(pooled),
                Err(error) => {
                    self.forget_one();
                    Err(error)
                }
            },
            Some((id, mut rx)) => {
                let started = Instant::now();
                match tokio::time::timeout(self.config.wait_timeout(), &mut rx).await {
                    Ok(Ok(pooled)) => Ok(pooled),
                    Ok(Err(_)) => Err(Error::Shutdown),
                    Err(_) => {
                        let mut state = self.state.lock().unwrap();
                        state.waiters.retain(|(wid, _)| *wid != id);
                        drop(state);
                        // A release may have raced the timeout; take it if so.
                        if let Ok(pooled) = rx.try_recv() {
                            return Ok(pooled);
                        }
                        Err(Error::PoolExhausted {
                            waited: started.elapsed(),
                        })
                    }
                }
            }
        }
    }

    /// Return a connection after an exchange. `reusable` is false when either
    /// body ended abnormally and the wire state can no longer be trusted.
    pub fn release(self: &Arc<Self>, mut pooled: PooledConnection, reusable: bool) {
        let reusable = reusable && pooled.conn.is_open() && !self.shutting_down.load(Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();

        if reusable {
            pooled.touch();
            // Waiters may have timed out or been dropped since queueing;
            // keep offering until one actually takes the connection.
            while let Some((_, waiter)) = state.waiters.pop_front() {
                match waiter.send(pooled) {
                    Ok(()) => return,
                    Err(returned) => pooled = returned,
                }
            }
            state.idle.push_back(pooled);
            return;
        }

        tracing::debug!(id = %pooled.id, "closing non-reusable connection");
        pooled.conn.close();
        state.tracked.remove(&pooled.id);
        state.total -= 1;
        self.drained.notify_waiters();

        // Someone is waiting for the slot this connection just freed.
        if !state.waiters.is_empty() && state.total < self.config.max_size {
            state.total += 1;
            drop(state);
            let pool = Arc::clone(self);
            tokio::spawn(async move {
                match pool.connect_one().await {
                    Ok(pooled) => pool.release(pooled, true),
                    Err(error) => {
                        tracing::warn!(%error, "replacement connect failed");
                        pool.forget_one();
                    }
                }
            });
        }
    }

    /// Stop handing out connections, fail waiters, and drain. Connections still
    /// checked out get until `timeout` to come back before being force-closed.
    pub async fn shutdown(self: &Arc<Self>, timeout: Duration) {
        self.shutting_down.store(true, Ordering::SeqCst);

        {
            let mut state = self.state.lock().unwrap();
            // Dropping the senders fails each pending acquire with Shutdown.
            state.waiters.clear();
            while let Some(pooled) = state.idle.pop_front() {
                pooled.conn.close();
                state.tracked.remove(&pooled.id);
                state.total -= 1;
            }
        }

        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.drained.notified();
            if self.state.lock().unwrap().total == 0 {
                return;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        let mut state = self.state.lock().unwrap();
        let remaining = state.tracked.len();
        if remaining > 0 {
            tracing::warn!(remaining, "shutdown deadline reached, force-closing connections");
        }
        for (_, conn) in state.tracked.drain() {
            conn.close();
        }
        state.total = 0;
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    async fn connect_one(self: &Arc<Self>) -> Result<PooledConnection, Error> {
        let conn = self.factory.connect().await?;
        let pooled = PooledConnection::new(conn);
        let mut state = self.state.lock().unwrap();
        state.tracked.insert(pooled.id, Arc::clone(&pooled.conn));
        tracing::debug!(id = %pooled.id, total = state.total, "established connection");
        Ok(pooled)
    }

    fn forget_one(&self) {
        let mut state = self.state.lock().unwrap();
        state.total -= 1;
        drop(state);
        self.drained.notify_waiters();
    }
}
