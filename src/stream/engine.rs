//! Per-stream flow-control actor.
//!
//! # Responsibilities
//! - Serialize all credit mutations and callback dispatch for one stream
//! - Enforce the credit invariant and single-terminal-delivery
//! - Resolve races between terminal calls and cancellation by arrival
//!   order: whichever the actor observes first wins
//!
//! # Design Decisions
//! - One spawned task per stream; handles communicate via an unbounded
//!   channel, so no producer or consumer call ever blocks or reenters
//! - The actor holds no sender of its own; it parks the two handles
//!   until a reader attaches and exits when the channel closes

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use super::{Observer, ReadHandle, Reader, Shared, WriteHandle, Writer};
use crate::error::Error;

pub(super) enum Event {
    SetReader(Box<dyn Reader>),
    AddObserver(Box<dyn Observer>),
    Request(u64),
    Cancel,
    Data(Bytes),
    Done,
    Error(Error),
    Violation,
    /// Stream dropped before a reader attached; release parked handles.
    Teardown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Flowing (or waiting for a reader).
    Open,
    /// Reader cancelled; chunks are accepted and discarded until the
    /// producer quiesces.
    Cancelled,
    /// A terminal event was delivered to the reader.
    Closed,
}

pub(super) async fn run(
    mut writer: Box<dyn Writer>,
    mut events: mpsc::UnboundedReceiver<Event>,
    shared: Arc<Shared>,
    write_handle: WriteHandle,
    read_handle: ReadHandle,
) {
    let mut parked = Some((write_handle, read_handle));
    let mut reader: Option<Box<dyn Reader>> = None;
    let mut observers: Vec<Box<dyn Observer>> = Vec::new();
    let mut credit: u64 = 0;
    let mut state = State::Open;

    while let Some(event) = events.recv().await {
        match event {
            Event::AddObserver(obs) => observers.push(obs),

            Event::SetReader(mut r) => {
                let Some((wh, rh)) = parked.take() else {
                    tracing::warn!("reader attach on torn-down stream ignored");
                    continue;
                };
                // Writer first, so it holds its handle before any credit
                // can arrive; then the reader, which starts the flow.
                writer.on_init(wh);
                r.on_init(rh);
                reader = Some(r);
            }

            Event::Request(n) => {
                if state != State::Open {
                    continue;
                }
                credit += n;
                // The wakeup edge is judged from the writer's view of
                // credit (`granted - written`), not from `credit`: the
                // writer consumes grants immediately through the
                // atomics, while `credit` only falls once the data
                // events are processed here. A top-up queued behind
                // in-flight data must still wake a drained writer.
                let starved = shared.granted.load(Ordering::Acquire)
                    == shared.written.load(Ordering::Acquire);
                shared.granted.fetch_add(n, Ordering::AcqRel);
                if starved {
                    writer.on_write_possible();
                }
            }

            Event::Data(chunk) => match state {
                State::Cancelled => {
                    // Drain path: the producer may still be flushing
                    // bytes the transport already received.
                }
                State::Closed => {
                    tracing::warn!("chunk after terminal event dropped");
                }
                State::Open => {
                    if credit == 0 {
                        // Unreachable through the handles, which check
                        // the credit mirror first; treated as the same
                        // violation if it ever happens.
                        state = State::Closed;
                        shared.cancelled.store(true, Ordering::Release);
                        deliver_error(&mut observers, reader.as_mut(), Error::CreditViolation);
                        writer.on_abort(Error::CreditViolation);
                        continue;
                    }
                    credit -= 1;
                    for obs in &mut observers {
                        obs.on_data(&chunk);
                    }
                    match reader.as_mut() {
                        Some(r) => r.on_data(chunk),
                        None => tracing::warn!("chunk with no reader attached dropped"),
                    }
                }
            },

            Event::Done => {
                if state != State::Open {
                    tracing::debug!(?state, "done after terminal/cancel ignored");
                    continue;
                }
                state = State::Closed;
                for obs in &mut observers {
                    obs.on_done();
                }
                if let Some(r) = reader.as_mut() {
                    r.on_done();
                }
            }

            Event::Error(err) => {
                if state != State::Open {
                    tracing::debug!(?state, %err, "error after terminal/cancel ignored");
                    continue;
                }
                state = State::Closed;
                deliver_error(&mut observers, reader.as_mut(), err);
            }

            Event::Cancel => {
                if state != State::Open {
                    continue;
                }
                state = State::Cancelled;
                shared.cancelled.store(true, Ordering::Release);
                let err = Error::Aborted("cancelled by reader".into());
                for obs in &mut observers {
                    obs.on_error(&err);
                }
                writer.on_abort(err);
            }

            Event::Violation => {
                if state != State::Open {
                    continue;
                }
                tracing::warn!("writer exceeded granted credit, aborting stream");
                state = State::Closed;
                shared.cancelled.store(true, Ordering::Release);
                deliver_error(&mut observers, reader.as_mut(), Error::CreditViolation);
                writer.on_abort(Error::CreditViolation);
            }

            Event::Teardown => {
                if parked.take().is_some() && reader.is_none() {
                    // The stream may still be watched: anyone tracking
                    // terminal state must learn that no terminal will
                    // ever arrive.
                    if state == State::Open {
                        state = State::Closed;
                        shared.cancelled.store(true, Ordering::Release);
                        let err = Error::Aborted("stream dropped before completion".into());
                        for obs in &mut observers {
                            obs.on_error(&err);
                        }
                        writer.on_abort(err);
                    }
                    break;
                }
            }
        }
    }
}

fn deliver_error(
    observers: &mut [Box<dyn Observer>],
    reader: Option<&mut Box<dyn Reader>>,
    err: Error,
) {
    for obs in observers.iter_mut() {
        obs.on_error(&err);
    }
    if let Some(r) = reader {
        r.on_error(err);
    }
}
