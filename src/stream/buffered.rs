//! Buffered bridges between byte payloads and entity streams.
//!
//! # Responsibilities
//! - Materialize a whole stream into memory (the buffered "REST" mode)
//! - Produce a stream from an in-memory payload
//! - Buffer a stream up to a size threshold, handing back the live
//!   remainder when the threshold is reached
//!
//! The buffered mode is a convenience built on the streaming protocol,
//! not a separate protocol: it drives an entity stream to completion and
//! concatenates chunks.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use tokio::sync::oneshot;

use super::{EntityStream, ReadHandle, Reader, WriteHandle, Writer};
use crate::error::Error;

/// Chunk size used when slicing in-memory payloads onto a stream.
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// Credit window kept open while assembling a full entity.
const READ_WINDOW: u64 = 32;

/// Writer that streams an in-memory payload in fixed-size chunks.
pub struct ByteWriter {
    chunks: VecDeque<Bytes>,
    handle: Option<WriteHandle>,
}

impl ByteWriter {
    pub fn new(data: Bytes, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        let mut chunks = VecDeque::new();
        let mut rest = data;
        while rest.len() > chunk_size {
            chunks.push_back(rest.split_to(chunk_size));
        }
        if !rest.is_empty() {
            chunks.push_back(rest);
        }
        ByteWriter { chunks, handle: None }
    }

    /// A writer that replays pre-sliced chunks as-is.
    pub fn from_chunks(chunks: Vec<Bytes>) -> Self {
        ByteWriter {
            chunks: chunks.into(),
            handle: None,
        }
    }
}

impl Writer for ByteWriter {
    fn on_init(&mut self, handle: WriteHandle) {
        self.handle = Some(handle);
    }

    fn on_write_possible(&mut self) {
        let Some(handle) = &self.handle else { return };
        while handle.remaining() > 0 {
            match self.chunks.pop_front() {
                Some(chunk) => {
                    if handle.write(chunk).is_err() {
                        return;
                    }
                }
                None => break,
            }
        }
        if self.chunks.is_empty() {
            handle.done();
        }
    }

    fn on_abort(&mut self, err: Error) {
        tracing::debug!(%err, "byte writer aborted");
        self.chunks.clear();
    }
}

/// Stream a payload, sliced into [`DEFAULT_CHUNK_SIZE`] chunks.
pub fn byte_stream(data: Bytes) -> EntityStream {
    EntityStream::new(ByteWriter::new(data, DEFAULT_CHUNK_SIZE))
}

/// Stream a list of pre-sliced chunks.
pub fn chunk_stream(chunks: Vec<Bytes>) -> EntityStream {
    EntityStream::new(ByteWriter::from_chunks(chunks))
}

struct FullEntityReader {
    buf: BytesMut,
    limit: Option<u64>,
    handle: Option<ReadHandle>,
    result: Option<oneshot::Sender<Result<Bytes, Error>>>,
}

impl FullEntityReader {
    fn resolve(&mut self, outcome: Result<Bytes, Error>) {
        if let Some(tx) = self.result.take() {
            let _ = tx.send(outcome);
        }
    }
}

impl Reader for FullEntityReader {
    fn on_init(&mut self, handle: ReadHandle) {
        handle.request(READ_WINDOW);
        self.handle = Some(handle);
    }

    fn on_data(&mut self, chunk: Bytes) {
        if self.result.is_none() {
            return; // already failed on the size limit, draining
        }
        if let Some(limit) = self.limit {
            if self.buf.len() as u64 + chunk.len() as u64 > limit {
                self.resolve(Err(Error::ResponseTooLarge { limit }));
                if let Some(h) = &self.handle {
                    h.cancel();
                }
                return;
            }
        }
        self.buf.extend_from_slice(&chunk);
        if let Some(h) = &self.handle {
            h.request(1);
        }
    }

    fn on_done(&mut self) {
        let body = self.buf.split().freeze();
        self.resolve(Ok(body));
    }

    fn on_error(&mut self, err: Error) {
        self.resolve(Err(err));
    }
}

/// Drive a stream to completion and return the concatenated bytes.
///
/// With a `limit`, the stream is cancelled and
/// [`Error::ResponseTooLarge`] returned as soon as the accumulated size
/// would exceed it.
pub async fn read_full(stream: &EntityStream, limit: Option<u64>) -> Result<Bytes, Error> {
    let (tx, rx) = oneshot::channel();
    stream.set_reader(FullEntityReader {
        buf: BytesMut::new(),
        limit,
        handle: None,
        result: Some(tx),
    })?;
    rx.await
        .unwrap_or_else(|_| Err(Error::Aborted("stream dropped before completion".into())))
}

/// Outcome of [`buffer_upto`].
pub enum Buffered {
    /// The stream finished under the threshold.
    Complete(Vec<Bytes>),
    /// The threshold was reached; `rest` continues the live stream after
    /// the buffered prefix.
    Partial { prefix: Vec<Bytes>, rest: EntityStream },
}

struct PartialState {
    prefix: Vec<Bytes>,
    buffered: u64,
    threshold: u64,
    decided: bool,
    upstream: Option<ReadHandle>,
    upstream_done: bool,
    pending_upstream: u64,
    // Post-decision forwarding into the remainder stream.
    forward: VecDeque<Bytes>,
    downstream: Option<WriteHandle>,
    pending_error: Option<Error>,
    terminal_sent: bool,
    decision: Option<oneshot::Sender<Result<Buffered, Error>>>,
}

impl PartialState {
    fn pump(&mut self) {
        let Some(wh) = &self.downstream else { return };
        if self.terminal_sent {
            return;
        }
        if let Some(err) = self.pending_error.take() {
            self.terminal_sent = true;
            wh.error(err);
            return;
        }
        while wh.remaining() > 0 {
            match self.forward.pop_front() {
                Some(chunk) => {
                    if wh.write(chunk).is_err() {
                        return;
                    }
                }
                None => break,
            }
        }
        if self.upstream_done && self.forward.is_empty() {
            self.terminal_sent = true;
            wh.done();
            return;
        }
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
    }

    fn decide(&mut self, outcome: Result<Buffered, Error>) {
        self.decided = true;
        if let Some(tx) = self.decision.take() {
            let _ = tx.send(outcome);
        }
    }
}

struct PartialReader {
    state: Arc<Mutex<PartialState>>,
}

impl Reader for PartialReader {
    fn on_init(&mut self, handle: ReadHandle) {
        let mut st = self.state.lock().expect("partial buffer state poisoned");
        handle.request(READ_WINDOW);
        st.pending_upstream = READ_WINDOW;
        st.upstream = Some(handle);
    }

    fn on_data(&mut self, chunk: Bytes) {
        let mut st = self.state.lock().expect("partial buffer state poisoned");
        st.pending_upstream = st.pending_upstream.saturating_sub(1);
        if !st.decided {
            st.buffered += chunk.len() as u64;
            st.prefix.push(chunk);
            if st.buffered >= st.threshold {
                let rest = EntityStream::new(RemainderWriter {
                    state: Arc::clone(&self.state),
                });
                let prefix = std::mem::take(&mut st.prefix);
                st.decide(Ok(Buffered::Partial { prefix, rest }));
            } else {
                st.pending_upstream += 1;
                if let Some(rh) = &st.upstream {
                    rh.request(1);
                }
            }
            return;
        }
        st.forward.push_back(chunk);
        st.pump();
    }

    fn on_done(&mut self) {
        let mut st = self.state.lock().expect("partial buffer state poisoned");
        st.upstream_done = true;
        if !st.decided {
            let prefix = std::mem::take(&mut st.prefix);
            st.decide(Ok(Buffered::Complete(prefix)));
        } else {
            st.pump();
        }
    }

    fn on_error(&mut self, err: Error) {
        let mut st = self.state.lock().expect("partial buffer state poisoned");
        if !st.decided {
            st.decide(Err(err));
        } else {
            st.pending_error = Some(err);
            st.pump();
        }
    }
}

struct RemainderWriter {
    state: Arc<Mutex<PartialState>>,
}

impl Writer for RemainderWriter {
    fn on_init(&mut self, handle: WriteHandle) {
        let mut st = self.state.lock().expect("partial buffer state poisoned");
        st.downstream = Some(handle);
        st.pump();
    }

    fn on_write_possible(&mut self) {
        let mut st = self.state.lock().expect("partial buffer state poisoned");
        st.pump();
    }

    fn on_abort(&mut self, err: Error) {
        let mut st = self.state.lock().expect("partial buffer state poisoned");
        tracing::debug!(%err, "remainder stream aborted, cancelling upstream");
        st.forward.clear();
        if let Some(rh) = &st.upstream {
            rh.cancel();
        }
    }
}

/// Read a stream until `threshold` bytes have been buffered or the
/// stream ends, whichever comes first.
///
/// Used to decide whether a response is worth compressing before its
/// headers are committed: content that finishes under the threshold is
/// returned whole, content reaching it is returned as a prefix plus the
/// still-flowing remainder.
pub async fn buffer_upto(stream: &EntityStream, threshold: u64) -> Result<Buffered, Error> {
    let (tx, rx) = oneshot::channel();
    let state = Arc::new(Mutex::new(PartialState {
        prefix: Vec::new(),
        buffered: 0,
        threshold: threshold.max(1),
        decided: false,
        upstream: None,
        upstream_done: false,
        pending_upstream: 0,
        forward: VecDeque::new(),
        downstream: None,
        pending_error: None,
        terminal_sent: false,
        decision: Some(tx),
    }));
    stream.set_reader(PartialReader { state })?;
    rx.await
        .unwrap_or_else(|_| Err(Error::Aborted("stream dropped before completion".into())))
}
