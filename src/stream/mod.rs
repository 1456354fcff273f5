//! Entity streams: credit-flow-controlled chunk sequences.
//!
//! # Responsibilities
//! - Define the Writer/Reader/Observer contract and the capability
//!   handles they operate through
//! - Guarantee single-writer/single-reader wiring per stream
//! - Route every stream operation through a per-stream actor so that
//!   callbacks never run concurrently or reentrantly
//!
//! # Design Decisions
//! - Chunks are `bytes::Bytes`: immutable, cheap to clone and slice
//! - `request`/`cancel`/`write`/`done`/`error` are message sends into
//!   the stream's actor task, never direct reentrant calls
//! - Credit counters are mirrored in atomics so `WriteHandle::remaining`
//!   is a non-blocking read on the producer's own path

mod engine;

pub mod bridge;
pub mod buffered;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Error;
use engine::Event;

/// Producer side of an entity stream.
///
/// Receives its [`WriteHandle`] once, when a reader attaches. Must never
/// write more chunks than the handle's remaining credit, and makes at most
/// one terminal call (`done` or `error`).
pub trait Writer: Send + 'static {
    /// Called once when the stream is activated by a reader attaching.
    fn on_init(&mut self, handle: WriteHandle);

    /// Called whenever credit transitions from zero to positive.
    fn on_write_possible(&mut self);

    /// Called exactly once if the stream terminates from the reader side
    /// (cancellation) or by a protocol violation. The writer must stop
    /// producing and release any resources it holds.
    fn on_abort(&mut self, err: Error);
}

/// Consumer side of an entity stream.
///
/// Receives `on_init` once, then zero or more `on_data` calls (one per
/// prior `write`), then exactly one of `on_done` / `on_error`.
pub trait Reader: Send + 'static {
    fn on_init(&mut self, handle: ReadHandle);
    fn on_data(&mut self, chunk: Bytes);
    fn on_done(&mut self);
    fn on_error(&mut self, err: Error);
}

/// Passive tap on a stream's data and terminal events.
///
/// Observers see every chunk and exactly one terminal event, but hold no
/// credit and cannot influence the stream. A reader-side cancellation is
/// observed as an error. Used by the dispatch layer to learn when both
/// directions of an exchange have finished without consuming either.
pub trait Observer: Send + 'static {
    fn on_data(&mut self, _chunk: &Bytes) {}
    fn on_done(&mut self) {}
    fn on_error(&mut self, _err: &Error) {}
}

/// Counters and flags shared between the handles and the actor.
///
/// `granted` is only ever increased by the actor (while processing
/// `request`); `written` is only ever increased by the write handle. The
/// producer's view `granted - written` is therefore never an
/// overestimate of the credit the actor will accept.
#[derive(Debug, Default)]
struct Shared {
    granted: AtomicU64,
    written: AtomicU64,
    cancelled: AtomicBool,
    writer_closed: AtomicBool,
    reader_attached: AtomicBool,
}

/// A credit-flow-controlled sequence of byte chunks from one writer to
/// one reader.
///
/// Created per request and per response, never reused. Dropping an
/// `EntityStream` that never had a reader attached tears down its actor
/// without delivering any callbacks.
pub struct EntityStream {
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<Event>,
}

impl EntityStream {
    /// Create a stream owned by `writer`. The writer is initialized only
    /// once a reader attaches; until then no data flows and the writer
    /// holds no credit.
    ///
    /// Must be called within a tokio runtime: each stream is driven by
    /// its own spawned actor task.
    pub fn new(writer: impl Writer) -> Self {
        let shared = Arc::new(Shared::default());
        let (tx, rx) = mpsc::unbounded_channel();
        // Handles are minted up front and parked in the actor until a
        // reader attaches; the actor itself never holds a sender, so the
        // task exits once the stream and every handle are gone.
        let write_handle = WriteHandle {
            shared: Arc::clone(&shared),
            events: tx.clone(),
        };
        let read_handle = ReadHandle { events: tx.clone() };
        tokio::spawn(engine::run(
            Box::new(writer),
            rx,
            Arc::clone(&shared),
            write_handle,
            read_handle,
        ));
        EntityStream { shared, events: tx }
    }

    /// Add a passive observer. Observers must be added before a reader
    /// attaches.
    pub fn add_observer(&self, observer: impl Observer) -> Result<(), Error> {
        if self.shared.reader_attached.load(Ordering::Acquire) {
            return Err(Error::AlreadyAttached);
        }
        let _ = self.events.send(Event::AddObserver(Box::new(observer)));
        Ok(())
    }

    /// Attach the stream's one reader. Fails with
    /// [`Error::AlreadyAttached`] if a reader is already set; the
    /// existing wiring is untouched.
    pub fn set_reader(&self, reader: impl Reader) -> Result<(), Error> {
        if self
            .shared
            .reader_attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!("rejected second reader attach on entity stream");
            return Err(Error::AlreadyAttached);
        }
        let _ = self.events.send(Event::SetReader(Box::new(reader)));
        Ok(())
    }
}

impl Drop for EntityStream {
    fn drop(&mut self) {
        // A stream dropped before any reader attached will never flow;
        // tell the actor to release the parked handles and exit.
        if !self.shared.reader_attached.load(Ordering::Acquire) {
            let _ = self.events.send(Event::Teardown);
        }
    }
}

impl std::fmt::Debug for EntityStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityStream")
            .field("reader_attached", &self.shared.reader_attached.load(Ordering::Relaxed))
            .finish()
    }
}

/// Capability through which a [`Writer`] produces.
///
/// Obtained once via `Writer::on_init`.
pub struct WriteHandle {
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<Event>,
}

impl WriteHandle {
    /// Credit available right now: chunks the reader has authorized but
    /// the writer has not yet sent.
    pub fn remaining(&self) -> u64 {
        let granted = self.shared.granted.load(Ordering::Acquire);
        let written = self.shared.written.load(Ordering::Acquire);
        granted.saturating_sub(written)
    }

    /// Write one chunk, consuming one unit of credit.
    ///
    /// Writing with no remaining credit is a protocol violation: the
    /// stream is aborted (writer) and errored (reader), and
    /// [`Error::CreditViolation`] is returned. Writes racing a
    /// cancellation are accepted and discarded, not errors.
    pub fn write(&self, chunk: Bytes) -> Result<(), Error> {
        if self.shared.cancelled.load(Ordering::Acquire) {
            // Reader cancelled; accept and discard so the producer can
            // drain whatever is already in flight.
            return Ok(());
        }
        if self.shared.writer_closed.load(Ordering::Acquire) {
            tracing::warn!("write after terminal call ignored");
            return Ok(());
        }
        if self.remaining() == 0 {
            let _ = self.events.send(Event::Violation);
            return Err(Error::CreditViolation);
        }
        self.shared.written.fetch_add(1, Ordering::AcqRel);
        let _ = self.events.send(Event::Data(chunk));
        Ok(())
    }

    /// Signal clean end of stream. At most one terminal call is
    /// delivered; repeats are ignored and logged.
    pub fn done(&self) {
        if self.shared.writer_closed.swap(true, Ordering::AcqRel) {
            tracing::warn!("done() after terminal call ignored");
            return;
        }
        let _ = self.events.send(Event::Done);
    }

    /// Signal abnormal end of stream with a cause.
    pub fn error(&self, err: Error) {
        if self.shared.writer_closed.swap(true, Ordering::AcqRel) {
            tracing::warn!("error() after terminal call ignored");
            return;
        }
        let _ = self.events.send(Event::Error(err));
    }
}

/// Capability through which a [`Reader`] controls flow.
///
/// Obtained once via `Reader::on_init`. Cloneable so that control can be
/// exercised from a different task than the one receiving callbacks.
#[derive(Clone)]
pub struct ReadHandle {
    events: mpsc::UnboundedSender<Event>,
}

impl ReadHandle {
    /// Grant `n` additional units of credit. Credit is cumulative; its
    /// effects (more `on_data` or a terminal call) are always dispatched,
    /// never delivered synchronously within this call.
    pub fn request(&self, n: u64) {
        if n == 0 {
            tracing::warn!("request(0) ignored");
            return;
        }
        let _ = self.events.send(Event::Request(n));
    }

    /// Request early termination. Cooperative: the writer receives one
    /// `on_abort` and must stop producing; chunks already in flight are
    /// discarded. Idempotent.
    pub fn cancel(&self) {
        let _ = self.events.send(Event::Cancel);
    }
}
