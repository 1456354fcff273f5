//! Exchange completion tracking and streaming idle enforcement.
//!
//! # Responsibilities
//! - Observe both bodies of an exchange and fire a completion callback once
//!   both have reached a terminal state
//! - Decide connection reusability from how each body ended
//! - Enforce the streaming idle timeout on response bodies
//!
//! # Design Decisions
//! - The idle clock only runs while the consumer has outstanding demand;
//!   a slow consumer is not a timeout, a stalled producer is
//! - `abandon` short-circuits the tracker when the exchange is given up on
//!   (request timeout, shutdown) and always releases non-reusable

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::Error;
use crate::stream::{EntityStream, Observer, ReadHandle, Reader, WriteHandle, Writer};

const DIR_PENDING: u8 = 0;
const DIR_CLEAN: u8 = 1;
const DIR_FAILED: u8 = 2;

/// Watches the request and response bodies of one exchange and fires a
/// callback exactly once when both are terminal. The callback receives
/// `true` when both directions completed cleanly.
pub struct ExchangeTracker {
    request: AtomicU8,
    response: AtomicU8,
    fired: AtomicBool,
    on_complete: Mutex<Option<Box<dyn FnOnce(bool) + Send>>>,
}

impl ExchangeTracker {
    pub fn new(on_complete: impl FnOnce(bool) + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            request: AtomicU8::new(DIR_PENDING),
            response: AtomicU8::new(DIR_PENDING),
            fired: AtomicBool::new(false),
            on_complete: Mutex::new(Some(Box::new(on_complete))),
        })
    }

    /// Observer for the request body direction.
    pub fn request_observer(self: &Arc<Self>) -> DirectionObserver {
        DirectionObserver {
            tracker: Arc::clone(self),
            is_request: true,
        }
    }

    /// Observer for the response body direction.
    pub fn response_observer(self: &Arc<Self>) -> DirectionObserver {
        DirectionObserver {
            tracker: Arc::clone(self),
            is_request: false,
        }
    }

    /// Give up on the exchange: fire the callback now, non-reusable.
    pub fn abandon(&self) {
        self.fire(false);
    }

    fn settle(&self, is_request: bool, clean: bool) {
        let slot = if is_request { &self.request } else { &self.response };
        let state = if clean { DIR_CLEAN } else { DIR_FAILED };
        // First terminal wins; later signals on the same direction are ignored.
        if slot
            .compare_exchange(DIR_PENDING, state, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let request = self.request.load(Ordering::SeqCst);
        let response = self.response.load(Ordering::SeqCst);
        if request != DIR_PENDING && response != DIR_PENDING {
            self.fire(request == DIR_CLEAN && response == DIR_CLEAN);
        }
    }

    fn fire(&self, reusable: bool) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(callback) = self.on_complete.lock().unwrap().take() {
            callback(reusable);
        }
    }
}

/// Observer attached to one body of an exchange.
pub struct DirectionObserver {
    tracker: Arc<ExchangeTracker>,
    is_request: bool,
}

impl Observer for DirectionObserver {
    fn on_done(&mut self) {
        self.tracker.settle(self.is_request, true);
    }

    fn on_error(&mut self, _err: &Error) {
        self.tracker.settle(self.is_request, false);
    }
}

/// Watchdog state for the idle forwarder.
#[derive(Clone, Copy, PartialEq)]
enum Watch {
    /// No outstanding upstream demand; the clock is stopped.
    Disarmed,
    Armed(Instant),
    Finished,
}

struct IdleInner {
    upstream: Option<ReadHandle>,
    downstream: Option<WriteHandle>,
    pending_upstream: u64,
    upstream_done: bool,
    terminal_sent: bool,
    clock: watch::Sender<Watch>,
}

impl IdleInner {
    /// Forward credit 1:1 and keep the watchdog in step with demand.
    fn pump(&mut self, idle: Duration) {
        if self.terminal_sent {
            return;
        }
        let Some(wh) = &self.downstream else { return };
        if !self.upstream_done {
            let demand = wh.remaining();
            if demand > self.pending_upstream {
                let want = demand - self.pending_upstream;
                self.pending_upstream += want;
                if let Some(rh) = &self.upstream {
                    rh.request(want);
                }
            }
        }
        self.rearm(idle);
    }

    fn rearm(&mut self, idle: Duration) {
        let next = if self.pending_upstream > 0 && !self.upstream_done {
            Watch::Armed(Instant::now() + idle)
        } else {
            Watch::Disarmed
        };
        let _ = self.clock.send(next);
    }

    fn finish(&mut self, terminal: impl FnOnce(&WriteHandle)) {
        if self.terminal_sent {
            return;
        }
        self.terminal_sent = true;
        let _ = self.clock.send(Watch::Finished);
        if let Some(wh) = &self.downstream {
            terminal(wh);
        }
    }
}

struct IdleReader {
    inner: Arc<Mutex<IdleInner>>,
    idle: Duration,
}

impl Reader for IdleReader {
    fn on_init(&mut self, handle: ReadHandle) {
        let mut inner = self.inner.lock().expect("idle monitor state poisoned");
        inner.upstream = Some(handle);
        inner.pump(self.idle);
    }

    fn on_data(&mut self, chunk: Bytes) {
        let mut inner = self.inner.lock().expect("idle monitor state poisoned");
        inner.pending_upstream = inner.pending_upstream.saturating_sub(1);
        if inner.terminal_sent {
            return;
        }
        if let Some(wh) = &inner.downstream {
            // Credit was granted 1:1, so the write slot is guaranteed.
            if wh.write(chunk).is_err() {
                return;
            }
        }
        // Progress was made; restart or stop the clock per remaining demand.
        inner.rearm(self.idle);
    }

    fn on_done(&mut self) {
        let mut inner = self.inner.lock().expect("idle monitor state poisoned");
        inner.upstream_done = true;
        inner.finish(|wh| wh.done());
    }

    fn on_error(&mut self, err: Error) {
        let mut inner = self.inner.lock().expect("idle monitor state poisoned");
        inner.upstream_done = true;
        inner.finish(|wh| wh.error(err));
    }
}

struct IdleWriter {
    inner: Arc<Mutex<IdleInner>>,
    idle: Duration,
}

impl Writer for IdleWriter {
    fn on_init(&mut self, handle: WriteHandle) {
        let mut inner = self.inner.lock().expect("idle monitor state poisoned");
        inner.downstream = Some(handle);
        inner.pump(self.idle);
    }

    fn on_write_possible(&mut self) {
        let mut inner = self.inner.lock().expect("idle monitor state poisoned");
        inner.pump(self.idle);
    }

    fn on_abort(&mut self, err: Error) {
        let mut inner = self.inner.lock().expect("idle monitor state poisoned");
        tracing::debug!(%err, "monitored stream aborted downstream, cancelling upstream");
        inner.terminal_sent = true;
        let _ = inner.clock.send(Watch::Finished);
        if let Some(rh) = &inner.upstream {
            rh.cancel();
        }
    }
}

/// Wrap a stream in a 1:1 forwarder that fails it with
/// [`Error::StreamTimeout`] if the producer stalls for `idle` while the
/// consumer has outstanding demand.
pub fn monitor_idle(input: &EntityStream, idle: Duration) -> Result<EntityStream, Error> {
    let (clock, mut ticks) = watch::channel(Watch::Disarmed);
    let inner = Arc::new(Mutex::new(IdleInner {
        upstream: None,
        downstream: None,
        pending_upstream: 0,
        upstream_done: false,
        terminal_sent: false,
        clock,
    }));

    let output = EntityStream::new(IdleWriter {
        inner: Arc::clone(&inner),
        idle,
    });
    input.set_reader(IdleReader {
        inner: Arc::clone(&inner),
        idle,
    })?;

    tokio::spawn(async move {
        loop {
            let state = *ticks.borrow_and_update();
            match state {
                Watch::Finished => return,
                Watch::Disarmed => {
                    if ticks.changed().await.is_err() {
                        return;
                    }
                }
                Watch::Armed(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => {
                            let mut inner = inner.lock().expect("idle monitor state poisoned");
                            // The deadline may have moved while we slept.
                            if *inner.clock.borrow() != Watch::Armed(at) {
                                continue;
                            }
                            tracing::warn!(idle_ms = idle.as_millis() as u64, "stream idle timeout");
                            if let Some(rh) = inner.upstream.take() {
                                rh.cancel();
                            }
                            inner.finish(|wh| wh.error(Error::StreamTimeout { idle }));
                            return;
                        }
                        changed = ticks.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    });

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_fires_once_when_both_directions_settle() {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        let tracker = ExchangeTracker::new(move |reusable| sink.lock().unwrap().push(reusable));
        tracker.request_observer().on_done();
        assert!(fired.lock().unwrap().is_empty());
        tracker.response_observer().on_done();
        assert_eq!(*fired.lock().unwrap(), vec![true]);
        tracker.abandon();
        assert_eq!(fired.lock().unwrap().len(), 1);
    }

    #[test]
    fn failed_direction_makes_exchange_non_reusable() {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        let tracker = ExchangeTracker::new(move |reusable| sink.lock().unwrap().push(reusable));
        tracker
            .request_observer()
            .on_error(&Error::Aborted("cancelled by reader".into()));
        tracker.response_observer().on_done();
        assert_eq!(*fired.lock().unwrap(), vec![false]);
    }
}
