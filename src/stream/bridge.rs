//! Generic stream transform adapter.
//!
//! # Responsibilities
//! - Act as Reader toward an upstream entity stream and Writer toward a
//!   downstream one, re-chunking data through a stateful transform
//! - Translate credit: upstream data is requested in proportion to
//!   unmet downstream demand, so internal buffering stays bounded by a
//!   small multiple of what the downstream reader asked for
//! - Propagate cancellation downstream-to-upstream and errors
//!   upstream-to-downstream
//!
//! Compression and decompression are instances of this bridge; identity
//! re-chunking is another.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use super::{EntityStream, ReadHandle, Reader, WriteHandle, Writer};
use crate::error::Error;

/// A stateful chunk-level data transform.
///
/// Not required to map chunks 1:1: a call may produce zero or more
/// output chunks, with partial state buffered until `finish`.
pub trait ChunkTransform: Send + 'static {
    fn transform(&mut self, chunk: Bytes) -> Result<Vec<Bytes>, Error>;

    /// Flush remaining state at clean end of input.
    fn finish(&mut self) -> Result<Vec<Bytes>, Error>;
}

/// Transform that passes chunks through unchanged.
pub struct IdentityTransform;

impl ChunkTransform for IdentityTransform {
    fn transform(&mut self, chunk: Bytes) -> Result<Vec<Bytes>, Error> {
        Ok(vec![chunk])
    }

    fn finish(&mut self) -> Result<Vec<Bytes>, Error> {
        Ok(Vec::new())
    }
}

/// Transform that emits a fixed prefix ahead of the stream's own data.
///
/// Used to recompose a stream after threshold buffering consumed its
/// head.
pub struct PrependTransform {
    prefix: Option<Vec<Bytes>>,
}

impl PrependTransform {
    pub fn new(prefix: Vec<Bytes>) -> Self {
        PrependTransform { prefix: Some(prefix) }
    }
}

impl ChunkTransform for PrependTransform {
    fn transform(&mut self, chunk: Bytes) -> Result<Vec<Bytes>, Error> {
        let mut out = self.prefix.take().unwrap_or_default();
        out.push(chunk);
        Ok(out)
    }

    fn finish(&mut self) -> Result<Vec<Bytes>, Error> {
        Ok(self.prefix.take().unwrap_or_default())
    }
}

struct BridgeInner {
    transform: Box<dyn ChunkTransform>,
    out: VecDeque<Bytes>,
    upstream: Option<ReadHandle>,
    downstream: Option<WriteHandle>,
    upstream_done: bool,
    finished: bool,
    terminal_sent: bool,
    pending_upstream: u64,
    pending_error: Option<Error>,
}

impl BridgeInner {
    /// Move output downstream while credit lasts, flush the transform at
    /// end of input, and top up upstream credit for unmet demand.
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
        if self.upstream_done && !self.finished {
            self.finished = true;
            match self.transform.finish() {
                Ok(tail) => self.out.extend(tail),
                Err(err) => {
                    self.terminal_sent = true;
                    wh.error(err);
                    return;
                }
            }
        }
        while wh.remaining() > 0 {
            match self.out.pop_front() {
                Some(chunk) => {
                    if wh.write(chunk).is_err() {
                        return;
                    }
                }
                None => break,
            }
        }
        if self.finished && self.out.is_empty() {
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

    fn fail(&mut self, err: Error) {
        self.out.clear();
        self.pending_error = Some(err);
        self.pump();
    }
}

struct BridgeReader {
    inner: Arc<Mutex<BridgeInner>>,
}

impl Reader for BridgeReader {
    fn on_init(&mut self, handle: ReadHandle) {
        let mut inner = self.inner.lock().expect("bridge state poisoned");
        inner.upstream = Some(handle);
        // No upstream request yet; credit follows downstream demand.
        inner.pump();
    }

    fn on_data(&mut self, chunk: Bytes) {
        let mut inner = self.inner.lock().expect("bridge state poisoned");
        inner.pending_upstream = inner.pending_upstream.saturating_sub(1);
        match inner.transform.transform(chunk) {
            Ok(produced) => {
                inner.out.extend(produced);
                inner.pump();
            }
            Err(err) => {
                if let Some(rh) = &inner.upstream {
                    rh.cancel();
                }
                inner.fail(err);
            }
        }
    }

    fn on_done(&mut self) {
        let mut inner = self.inner.lock().expect("bridge state poisoned");
        inner.upstream_done = true;
        inner.pump();
    }

    fn on_error(&mut self, err: Error) {
        let mut inner = self.inner.lock().expect("bridge state poisoned");
        inner.fail(err);
    }
}

struct BridgeWriter {
    inner: Arc<Mutex<BridgeInner>>,
}

impl Writer for BridgeWriter {
    fn on_init(&mut self, handle: WriteHandle) {
        let mut inner = self.inner.lock().expect("bridge state poisoned");
        inner.downstream = Some(handle);
        inner.pump();
    }

    fn on_write_possible(&mut self) {
        let mut inner = self.inner.lock().expect("bridge state poisoned");
        inner.pump();
    }

    fn on_abort(&mut self, err: Error) {
        let mut inner = self.inner.lock().expect("bridge state poisoned");
        tracing::debug!(%err, "transform output aborted, cancelling upstream");
        inner.out.clear();
        inner.terminal_sent = true;
        if let Some(rh) = &inner.upstream {
            rh.cancel();
        }
    }
}

/// Run `input` through `transform`, yielding the transformed stream.
///
/// The adapter attaches itself as `input`'s reader, so this fails with
/// [`Error::AlreadyAttached`] if `input` already has one.
pub fn transform_stream(
    input: &EntityStream,
    transform: impl ChunkTransform,
) -> Result<EntityStream, Error> {
    let inner = Arc::new(Mutex::new(BridgeInner {
        transform: Box::new(transform),
        out: VecDeque::new(),
        upstream: None,
        downstream: None,
        upstream_done: false,
        finished: false,
        terminal_sent: false,
        pending_upstream: 0,
        pending_error: None,
    }));
    let output = EntityStream::new(BridgeWriter {
        inner: Arc::clone(&inner),
    });
    input.set_reader(BridgeReader { inner })?;
    Ok(output)
}
